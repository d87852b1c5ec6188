use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire schema tag carried by every inbound turn envelope.
pub const TURN_SCHEMA: &str = "brewva.turn.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnKind {
    User,
    Agent,
}

/// A single content part of a turn. Only text today; the tag leaves room
/// for media parts without breaking old envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnPart {
    Text { text: String },
}

/// Sender identity metadata. `sender_id` stays an open JSON value because
/// channels disagree on whether user IDs are numbers or strings; the ACL
/// normalizes it at the comparison site.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Normalized record of one inbound chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEnvelope {
    pub schema: String,
    pub kind: TurnKind,
    pub session_id: String,
    pub turn_id: String,
    pub channel: String,
    pub conversation_id: String,
    pub timestamp: DateTime<Utc>,
    pub parts: Vec<TurnPart>,
    #[serde(default)]
    pub meta: TurnMeta,
}

impl TurnEnvelope {
    /// Build a user turn for a channel conversation with a fresh turn ID.
    pub fn user(channel: impl Into<String>, conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        let channel = channel.into();
        let conversation_id = conversation_id.into();
        Self {
            schema: TURN_SCHEMA.to_string(),
            kind: TurnKind::User,
            session_id: format!("{channel}:{conversation_id}"),
            turn_id: Uuid::new_v4().to_string(),
            channel,
            conversation_id,
            timestamp: Utc::now(),
            parts: vec![TurnPart::Text { text: text.into() }],
            meta: TurnMeta::default(),
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            let TurnPart::Text { text } = part;
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(text);
        }
        out
    }

    /// Key used for focus tracking, e.g. `telegram:12345`.
    pub fn conversation_key(&self) -> String {
        format!("{}:{}", self.channel, self.conversation_id)
    }
}
