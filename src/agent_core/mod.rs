//! Agent Core: agent generations and the conversation on top of them.
//!
//! Submodules:
//! - `agent`: Tool-calling agent over a model client and bound tools
//! - `lifecycle`: Builds, replaces and releases agent generations
//! - `conversation`: Turn history and reply assembly
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod agent;
pub mod conversation;
pub mod errors;
pub mod lifecycle;
pub mod types;

// Re-exports for convenience
pub use agent::{AgentSettings, ToolAgent};
pub use conversation::{ConversationSession, SendContext};
pub use errors::AgentError;
pub use lifecycle::{AgentLifecycle, AgentTrigger, LifecyclePhase};
pub use types::{ChatTurn, TargetKind, TurnRole};
