//! Live update channel manager.
//!
//! Owns the single long-lived connection to the update endpoint. A background
//! driver task opens the connection, authenticates, replays every registered
//! subscription and then pumps frames in both directions. When the connection
//! drops, the driver reconnects with exponential backoff until the attempt cap
//! is reached. Callers subscribe once; the manager re-sends their subscribe
//! intent after every reconnect.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, Interval};
use tracing::{debug, info, warn};

use super::connector::{Connection, Connector, Frame};
use super::protocol::{ClientMessage, ServerMessage, Topic};
use crate::api::RetryPolicy;
use crate::auth::CredentialStore;

/// How long `disconnect` waits for the driver to close the socket politely.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Callback receiving the `data` of each update on a topic.
pub type UpdateHandler = Arc<dyn Fn(Value) + Send + Sync>;

struct Subscription {
    topic: Topic,
    handler: UpdateHandler,
}

#[derive(Default)]
struct Registry {
    /// Registration order is replay order after a reconnect
    subscriptions: Vec<Subscription>,
    /// Writer of the open connection, if any
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
}

impl Registry {
    fn handler_for(&self, topic: &Topic) -> Option<UpdateHandler> {
        self.subscriptions
            .iter()
            .find(|s| &s.topic == topic)
            .map(|s| Arc::clone(&s.handler))
    }

    fn send(&self, message: ClientMessage) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(message);
        }
    }
}

struct Driver {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

enum ServeEnd {
    Shutdown,
    Dropped(String),
}

struct Inner {
    connector: Arc<dyn Connector>,
    store: Arc<CredentialStore>,
    reconnect: RetryPolicy,
    ping_interval: Duration,
    registry: Mutex<Registry>,
    state: watch::Sender<ConnectionState>,
    driver: Mutex<Option<Driver>>,
}

/// Manages the live update connection and its topic subscriptions.
///
/// Clone is cheap; clones share the connection and the registry.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl ChannelManager {
    /// `reconnect.max_attempts()` is the number of reconnect attempts made
    /// after a drop before the manager gives up. A zero `ping_interval`
    /// disables keepalive pings.
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<CredentialStore>,
        reconnect: RetryPolicy,
        ping_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            inner: Arc::new(Inner {
                connector,
                store,
                reconnect,
                ping_interval,
                registry: Mutex::new(Registry::default()),
                state,
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Start the connection. No-op while connected, connecting, or waiting
    /// to reconnect.
    pub async fn connect(&self) {
        let mut driver = self.inner.driver.lock().await;
        if driver.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            debug!("Live update connection already active");
            return;
        }

        self.inner.state.send_replace(ConnectionState::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(shutdown_rx).await });
        *driver = Some(Driver { handle, shutdown });
    }

    /// Close the connection, cancel any pending reconnect and forget every
    /// subscription. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let driver = self.inner.driver.lock().await.take();
        if let Some(driver) = driver {
            let _ = driver.shutdown.send(true);
            let mut handle = driver.handle;
            if timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                warn!("Live update driver did not stop in time, aborting");
                handle.abort();
            }
        }

        let mut registry = self.inner.registry.lock().await;
        registry.subscriptions.clear();
        registry.outbound = None;
        drop(registry);

        if self.inner.state.send_replace(ConnectionState::Closed) != ConnectionState::Closed {
            info!("Live updates disconnected");
        }
    }

    /// Register `handler` for `topic`, replacing any previous handler.
    ///
    /// While open the subscribe message goes out immediately; otherwise it is
    /// sent as part of the next successful connect.
    pub async fn subscribe<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let handler: UpdateHandler = Arc::new(handler);
        let mut registry = self.inner.registry.lock().await;
        match registry.subscriptions.iter_mut().find(|s| s.topic == topic) {
            Some(existing) => existing.handler = handler,
            None => registry.subscriptions.push(Subscription {
                topic: topic.clone(),
                handler,
            }),
        }
        debug!(topic = %topic, "Subscribed");
        registry.send(ClientMessage::subscribe(&topic));
    }

    /// Drop the handler for `topic`. Returns whether one was registered.
    pub async fn unsubscribe(&self, topic: &Topic) -> bool {
        let mut registry = self.inner.registry.lock().await;
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|s| &s.topic != topic);
        let removed = registry.subscriptions.len() != before;
        if removed {
            debug!(topic = %topic, "Unsubscribed");
            registry.send(ClientMessage::unsubscribe(topic));
        }
        removed
    }

    /// Send a fresh `authenticate` on the open connection, e.g. after the
    /// credential changed. Does nothing while not open.
    pub async fn reauthenticate(&self) {
        let Some(token) = self.inner.store.token().await else {
            return;
        };
        let registry = self.inner.registry.lock().await;
        if registry.outbound.is_some() {
            debug!("Re-authenticating live update connection");
            registry.send(ClientMessage::authenticate(token));
        }
    }

    /// Topics currently registered, in registration order.
    pub async fn topics(&self) -> Vec<Topic> {
        let registry = self.inner.registry.lock().await;
        registry.subscriptions.iter().map(|s| s.topic.clone()).collect()
    }
}

/// Next keepalive tick; never resolves when keepalive is off.
async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(ping) => {
            ping.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;

        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let connected = tokio::select! {
                result = self.connector.connect() => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(connection) => {
                    failures = 0;
                    match self.serve(connection, &mut shutdown).await {
                        ServeEnd::Shutdown => break,
                        ServeEnd::Dropped(reason) => {
                            warn!(reason = %reason, "Live update connection dropped")
                        }
                    }
                }
                Err(e) => warn!(error = %e, attempt = failures + 1, "Live update connection failed"),
            }

            self.detach().await;
            failures += 1;
            if failures > self.reconnect.max_attempts() {
                warn!(
                    attempts = failures - 1,
                    "Giving up on live updates until the next manual connect"
                );
                return;
            }

            let delay = self.reconnect.delay_for(failures);
            info!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Scheduling live update reconnect"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.detach().await;
    }

    /// Authenticate, replay subscriptions, then pump frames until the
    /// connection ends or shutdown is requested.
    async fn serve(&self, connection: Connection, shutdown: &mut watch::Receiver<bool>) -> ServeEnd {
        let Connection {
            mut sink,
            mut stream,
        } = connection;
        let (outbound, mut queue) = mpsc::unbounded_channel();

        // Queue auth and the replay before publishing the writer so nothing
        // registered concurrently can jump ahead of them
        {
            let mut registry = self.registry.lock().await;
            match self.store.token().await {
                Some(token) => {
                    let _ = outbound.send(ClientMessage::authenticate(token));
                }
                None => warn!("No credential to authenticate the live update connection"),
            }
            for subscription in &registry.subscriptions {
                let _ = outbound.send(ClientMessage::subscribe(&subscription.topic));
            }
            info!(
                subscriptions = registry.subscriptions.len(),
                "Live update connection open"
            );
            registry.outbound = Some(outbound);
            self.state.send_replace(ConnectionState::Open);
        }

        let mut ping = (!self.ping_interval.is_zero())
            .then(|| interval_at(Instant::now() + self.ping_interval, self.ping_interval));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.close().await;
                    return ServeEnd::Shutdown;
                }
                Some(message) = queue.recv() => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Dropping unencodable outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Frame::Text(text)).await {
                        return ServeEnd::Dropped(e.to_string());
                    }
                }
                _ = next_ping(&mut ping) => {
                    if let Err(e) = sink.send(Frame::Ping).await {
                        return ServeEnd::Dropped(e.to_string());
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.dispatch(&text).await,
                    Some(Err(e)) => return ServeEnd::Dropped(e.to_string()),
                    None => return ServeEnd::Dropped("stream ended".to_string()),
                },
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(ServerMessage::Update { topic, data }) => {
                let handler = self.registry.lock().await.handler_for(&topic);
                match handler {
                    Some(handler) => handler(data),
                    None => debug!(topic = %topic, "Dropping update with no subscriber"),
                }
            }
            Ok(ServerMessage::Other { kind, data }) if kind == "error" => {
                warn!(error = %data, "Live update server reported an error")
            }
            Ok(ServerMessage::Other { kind, .. }) => debug!(kind = %kind, "Live update control message"),
            Err(e) => warn!(error = %e, "Dropping malformed live update message"),
        }
    }

    async fn detach(&self) {
        self.registry.lock().await.outbound = None;
        self.state.send_replace(ConnectionState::Closed);
    }
}
