use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection closed by server: {0}")]
    Closed(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Outbound frame on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ChannelError> + Send>>;

/// Inbound text frames. The stream ends (or yields an error) when the
/// connection goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// An open duplex connection.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens duplex connections to the live update endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, ChannelError>;
}

/// WebSocket connector.
pub struct WsConnector {
    url: String,
    timeout: Duration,
}

impl WsConnector {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self { url, timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, ChannelError> {
        debug!(url = %self.url, "Opening live update socket");
        let (ws_stream, _) = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| ChannelError::Connect(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| ChannelError::WebSocket(e.to_string()))
            .with(|frame: Frame| async move {
                Ok::<_, ChannelError>(match frame {
                    Frame::Text(text) => Message::Text(text),
                    Frame::Ping => Message::Ping(Vec::new()),
                })
            });

        // Pings are answered by tungstenite itself; only text matters here
        let stream = read.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => Some(Err(ChannelError::Closed(
                    frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                ))),
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::WebSocket(e.to_string()))),
            }
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use futures::channel::mpsc as fmpsc;
    use serde_json::Value;
    use tokio::sync::{mpsc, Mutex};

    use super::*;

    /// Server half of an in-memory connection.
    pub struct ServerEnd {
        sent: fmpsc::UnboundedReceiver<Frame>,
        push: Option<fmpsc::UnboundedSender<Result<String, ChannelError>>>,
    }

    impl ServerEnd {
        /// Next JSON message the client sent, skipping keepalive pings.
        pub async fn next_message(&mut self) -> Option<Value> {
            loop {
                match self.sent.next().await? {
                    Frame::Text(text) => return serde_json::from_str(&text).ok(),
                    Frame::Ping => continue,
                }
            }
        }

        /// Next raw frame the client sent, pings included.
        pub async fn next_frame(&mut self) -> Option<Frame> {
            self.sent.next().await
        }

        pub fn push(&self, text: &str) {
            if let Some(push) = &self.push {
                let _ = push.unbounded_send(Ok(text.to_string()));
            }
        }

        /// Drop the connection from the server side.
        pub fn drop_connection(&mut self) {
            self.push.take();
        }
    }

    /// Connector handing out in-memory connections to the test.
    pub struct MockConnector {
        attempts: AtomicU32,
        refuse: AtomicBool,
        accepted: mpsc::UnboundedSender<ServerEnd>,
    }

    impl MockConnector {
        pub fn new() -> (Self, Mutex<mpsc::UnboundedReceiver<ServerEnd>>) {
            let (accepted, rx) = mpsc::unbounded_channel();
            (
                Self {
                    attempts: AtomicU32::new(0),
                    refuse: AtomicBool::new(false),
                    accepted,
                },
                Mutex::new(rx),
            )
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<Connection, ChannelError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ChannelError::Connect("connection refused".into()));
            }

            let (sent_tx, sent_rx) = fmpsc::unbounded();
            let (push_tx, push_rx) = fmpsc::unbounded();
            let _ = self.accepted.send(ServerEnd {
                sent: sent_rx,
                push: Some(push_tx),
            });

            Ok(Connection {
                sink: Box::pin(sent_tx.sink_map_err(|e| ChannelError::WebSocket(e.to_string()))),
                stream: Box::pin(push_rx),
            })
        }
    }

    /// Connector whose connection attempts never complete.
    pub struct PendingConnector;

    #[async_trait]
    impl Connector for PendingConnector {
        async fn connect(&self) -> Result<Connection, ChannelError> {
            futures::future::pending().await
        }
    }
}
