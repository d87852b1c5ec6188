//! Owner authorization for inbound turn envelopes.
//!
//! Owners may be listed by numeric sender ID (any stringified form) or by
//! username, `@` optional and case-insensitive. A turn that carries no
//! sender identity is denied whenever an owner list is configured — missing
//! identity never falls through to "open".

use brewva_schema::TurnEnvelope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclMode {
    #[default]
    Open,
    Closed,
}

pub fn is_owner_authorized(turn: &TurnEnvelope, owners: &[String], mode: AclMode) -> bool {
    if owners.is_empty() {
        return matches!(mode, AclMode::Open);
    }

    let sender_id = turn.meta.sender_id.as_ref().and_then(stringify_sender_id);
    let sender_username = turn
        .meta
        .sender_username
        .as_deref()
        .map(normalize_handle)
        .filter(|u| !u.is_empty());
    if sender_id.is_none() && sender_username.is_none() {
        return false;
    }

    owners.iter().any(|owner| {
        let owner = owner.trim();
        if let Some(id) = &sender_id {
            if id == owner {
                return true;
            }
        }
        if let Some(username) = &sender_username {
            if *username == normalize_handle(owner) {
                return true;
            }
        }
        false
    })
}

fn stringify_sender_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize_handle(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}
