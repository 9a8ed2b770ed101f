//! Wire format of the live update channel.
//!
//! Client to server: `{ "type": "authenticate" | "subscribe" | "unsubscribe", "data": {...} }`.
//! Server to client: `{ "type": "update", "data": { "type": <kind>, "conversationId"?: <id>, "data": <any> } }`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::opt_id_string;

/// A feed the client can subscribe to.
///
/// Either a global feed (`notifications`) or a feed scoped to one resource,
/// such as the messages of a single conversation. Topics compare
/// structurally, so `("messages", "a:b")` and `("messages:a", "b")` stay
/// distinct even though their wire keys would collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    kind: String,
    scope: Option<String>,
}

impl Topic {
    pub fn global(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: None,
        }
    }

    pub fn scoped(kind: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: Some(scope.into()),
        }
    }

    /// Conversation-scoped message feed.
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self::scoped("messages", conversation_id)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    fn payload(&self) -> TopicPayload {
        TopicPayload {
            kind: self.kind.clone(),
            conversation_id: self.scope.clone(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}", self.kind, scope),
            None => f.write_str(&self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    Authenticate { token: String },
    Subscribe(TopicPayload),
    Unsubscribe(TopicPayload),
}

impl ClientMessage {
    pub fn authenticate(token: impl Into<String>) -> Self {
        Self::Authenticate {
            token: token.into(),
        }
    }

    pub fn subscribe(topic: &Topic) -> Self {
        Self::Subscribe(topic.payload())
    }

    pub fn unsubscribe(topic: &Topic) -> Self {
        Self::Unsubscribe(topic.payload())
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    conversation_id: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Payload for one topic's subscriber
    Update { topic: Topic, data: Value },
    /// Acks, errors and anything else the server chatters about
    Other { kind: String, data: Value },
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.kind != "update" {
            return Ok(Self::Other {
                kind: envelope.kind,
                data: envelope.data,
            });
        }

        let update: UpdatePayload = serde_json::from_value(envelope.data)?;
        let topic = match update.conversation_id {
            Some(id) => Topic::scoped(update.kind, id),
            None => Topic::global(update.kind),
        };
        Ok(Self::Update {
            topic,
            data: update.data,
        })
    }
}
