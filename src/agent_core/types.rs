//! Shared types for the agent core.
//!
//! Chat turns as shown to the user, and the kind of target a conversation
//! is currently backed by.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::types::{ChatMessage, Provider};

// ─── Turns ───────────────────────────────────────────────────────────────────

/// Who a turn is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
    Error,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::System => "system",
            TurnRole::Error => "error",
        }
    }
}

/// One message unit in a conversation's ordered history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: String,
    pub role: TurnRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    /// The model-facing form of this turn.
    ///
    /// Error turns are replayed as assistant text so the model sees what the
    /// user saw; empty turns are skipped.
    pub fn to_message(&self) -> Option<ChatMessage> {
        if self.text.trim().is_empty() {
            return None;
        }
        Some(match self.role {
            TurnRole::User => ChatMessage::user(&self.text),
            TurnRole::Assistant | TurnRole::Error => ChatMessage::assistant(&self.text),
            TurnRole::System => ChatMessage::system(&self.text),
        })
    }
}

// ─── Target Kind ─────────────────────────────────────────────────────────────

/// What a conversation is currently backed by.
///
/// A change of kind resets the turn history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A live tool-calling agent.
    Agent,
    /// Direct chat with a provider that has a key.
    Direct(Provider),
    /// The selected provider has no key and no agent is live.
    Unavailable(Provider),
}

impl TargetKind {
    /// The system turn announcing this target.
    pub fn announcement(&self) -> String {
        match self {
            TargetKind::Agent => "Agent with MCP tools ready. Type your message below.".to_string(),
            TargetKind::Direct(p) => format!("{p} chat ready. Type your message below."),
            TargetKind::Unavailable(p) => format!(
                "{p} API Key not provided or invalid. Please set it in API Key Management."
            ),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::Role;

    #[test]
    fn test_turn_to_message_roles() {
        assert_eq!(
            ChatTurn::new(TurnRole::User, "hi").to_message().unwrap().role,
            Role::User
        );
        assert_eq!(
            ChatTurn::new(TurnRole::Error, "Error: boom")
                .to_message()
                .unwrap()
                .role,
            Role::Assistant
        );
        assert!(ChatTurn::new(TurnRole::Assistant, "  ").to_message().is_none());
    }

    #[test]
    fn test_announcements() {
        assert_eq!(
            TargetKind::Direct(Provider::Gemini).announcement(),
            "Gemini chat ready. Type your message below."
        );
        assert_eq!(
            TargetKind::Unavailable(Provider::OpenAi).announcement(),
            "OpenAI API Key not provided or invalid. Please set it in API Key Management."
        );
        assert!(TargetKind::Agent.announcement().starts_with("Agent with MCP tools ready"));
    }

    #[test]
    fn test_turn_ids_unique() {
        let a = ChatTurn::new(TurnRole::User, "x");
        let b = ChatTurn::new(TurnRole::User, "x");
        assert_ne!(a.id, b.id);
    }
}
