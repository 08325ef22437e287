//! ConversationSession: turn history and reply assembly.
//!
//! Responsibilities:
//! - Hold the ordered turn list and publish every change
//! - Serialize sends: a send while another is in flight is refused
//! - Route input to the live agent, a direct provider, or a local error
//! - Assemble streamed replies into one in-place assistant turn
//! - Reset history when the kind of backing target changes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::watch;

use super::agent::ToolAgent;
use super::errors::{AgentError, NO_TARGET_MESSAGE};
use super::types::{ChatTurn, TargetKind, TurnRole};
use crate::inference::{DirectModel, ModelClient, StreamingModelClient};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default number of recent turns replayed to the agent.
pub const DEFAULT_HISTORY_WINDOW: usize = 20;

/// Default agent thread identifier.
pub const DEFAULT_THREAD_ID: &str = "chat-thread";

// ─── Send Context ───────────────────────────────────────────────────────────

/// What a send may use, read from the app at the moment of sending.
#[derive(Clone, Default)]
pub struct SendContext {
    /// Keys and server list have been loaded.
    pub loaded: bool,
    pub agent: Option<Arc<ToolAgent>>,
    /// Direct capability of the selected provider, when it has a key.
    pub direct: Option<DirectModel>,
    /// At least one server is connected.
    pub any_connected: bool,
}

impl SendContext {
    fn check_ready(&self) -> Result<(), AgentError> {
        if !self.loaded {
            return Err(AgentError::NotReady {
                reason: "still loading saved keys and servers".into(),
            });
        }
        if self.agent.is_none() && self.direct.is_none() && !self.any_connected {
            return Err(AgentError::NotReady {
                reason: NO_TARGET_MESSAGE.into(),
            });
        }
        Ok(())
    }
}

// ─── ConversationSession ────────────────────────────────────────────────────

struct SessionState {
    turns: Vec<ChatTurn>,
    target: Option<TargetKind>,
    /// Bumped whenever history is reset.
    epoch: u64,
}

/// One conversation: turns plus the send pipeline.
pub struct ConversationSession {
    history_window: usize,
    thread_id: String,
    busy: AtomicBool,
    state: Mutex<SessionState>,
    turns_tx: watch::Sender<Vec<ChatTurn>>,
}

/// Clears the busy flag when a send finishes, however it finishes.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConversationSession {
    pub fn new(history_window: usize, thread_id: impl Into<String>) -> Self {
        let (turns_tx, _) = watch::channel(Vec::new());
        Self {
            history_window: history_window.max(1),
            thread_id: thread_id.into(),
            busy: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                turns: Vec::new(),
                target: None,
                epoch: 0,
            }),
            turns_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, state: &SessionState) {
        self.turns_tx.send_replace(state.turns.clone());
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatTurn>> {
        self.turns_tx.subscribe()
    }

    pub fn turns(&self) -> Vec<ChatTurn> {
        self.lock().turns.clone()
    }

    pub fn target(&self) -> Option<TargetKind> {
        self.lock().target
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Record the current target kind. A change clears history and adds one
    /// system turn announcing the new target.
    pub fn sync_target(&self, kind: TargetKind) -> bool {
        let mut state = self.lock();
        if state.target == Some(kind) {
            return false;
        }
        tracing::info!(?kind, dropped = state.turns.len(), "conversation target changed");
        state.target = Some(kind);
        state.epoch += 1;
        state.turns.clear();
        state
            .turns
            .push(ChatTurn::new(TurnRole::System, kind.announcement()));
        self.publish(&state);
        true
    }

    /// Mutate the turn with `id` in place. No-op if history was reset since.
    fn update_turn(&self, id: &str, f: impl FnOnce(&mut ChatTurn)) {
        let mut state = self.lock();
        if let Some(turn) = state.turns.iter_mut().find(|t| t.id == id) {
            f(turn);
            self.publish(&state);
        }
    }

    fn turn(&self, id: &str) -> Option<ChatTurn> {
        self.lock().turns.iter().find(|t| t.id == id).cloned()
    }

    /// Send one user message and return the reply turn.
    ///
    /// Appends exactly one user turn and one assistant or error turn.
    /// Refused (`Err`, no turns added) when blank, busy, or not ready. If the
    /// target changes while the reply is pending, the reset history keeps
    /// neither turn and the reply is only returned.
    pub async fn send(&self, text: &str, ctx: SendContext) -> Result<ChatTurn, AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::EmptyInput);
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            tracing::warn!("send refused: another send is in flight");
            return Err(AgentError::Busy);
        }
        let _guard = BusyGuard(&self.busy);

        ctx.check_ready()?;
        let epoch = {
            let mut state = self.lock();
            state.turns.push(ChatTurn::new(TurnRole::User, text));
            self.publish(&state);
            state.epoch
        };

        let reply = if let Some(agent) = ctx.agent {
            self.send_to_agent(&agent, epoch).await
        } else if let Some(direct) = ctx.direct {
            match direct {
                DirectModel::Streaming(model) => self.send_streaming(model, text, epoch).await,
                DirectModel::Blocking(model) => {
                    let provider = model.provider();
                    let outcome = model.generate(text).await;
                    tracing::info!(provider = provider.as_str(), ok = outcome.is_ok(), "direct reply");
                    self.finish(outcome.map_err(AgentError::from), epoch)
                }
            }
        } else {
            tracing::info!("send with no target, replying locally");
            self.record(ChatTurn::new(TurnRole::Error, NO_TARGET_MESSAGE), epoch)
        };
        Ok(reply)
    }

    async fn send_to_agent(&self, agent: &ToolAgent, epoch: u64) -> ChatTurn {
        let history: Vec<_> = {
            let state = self.lock();
            let start = state.turns.len().saturating_sub(self.history_window);
            state.turns[start..]
                .iter()
                .filter(|t| t.role != TurnRole::System)
                .filter_map(ChatTurn::to_message)
                .collect()
        };
        let outcome = agent
            .invoke(&history, &self.thread_id)
            .await
            .map(|message| message.text().to_string());
        if let Err(e) = &outcome {
            tracing::warn!(thread_id = %self.thread_id, error = %e, "agent send failed");
        }
        self.finish(outcome, epoch)
    }

    async fn send_streaming(
        &self,
        model: Arc<dyn StreamingModelClient>,
        prompt: &str,
        epoch: u64,
    ) -> ChatTurn {
        // Later updates find the turn by id, so after a reset they are no-ops.
        let placeholder = ChatTurn::new(TurnRole::Assistant, "");
        let id = placeholder.id.clone();
        {
            let mut state = self.lock();
            if state.epoch == epoch {
                state.turns.push(placeholder);
                self.publish(&state);
            }
        }
        let provider = model.provider();

        let mut stream = match model.generate_stream(prompt).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(provider = provider.as_str(), error = %e, "stream failed to start");
                return self.fail_turn(&id, &AgentError::from(e));
            }
        };

        let mut chunks = 0usize;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    chunks += 1;
                    self.update_turn(&id, |turn| turn.text.push_str(&chunk));
                }
                Err(e) => {
                    tracing::warn!(provider = provider.as_str(), chunks, error = %e, "stream failed");
                    return self.fail_turn(&id, &AgentError::from(e));
                }
            }
        }

        tracing::info!(provider = provider.as_str(), chunks, "stream complete");
        match self.turn(&id) {
            Some(turn) if turn.text.trim().is_empty() => self.fail_turn(
                &id,
                &AgentError::Inference {
                    reason: format!("{provider} returned an empty response"),
                },
            ),
            Some(turn) => turn,
            None => ChatTurn::new(TurnRole::Assistant, ""),
        }
    }

    /// Turn the in-progress turn into an error turn.
    fn fail_turn(&self, id: &str, error: &AgentError) -> ChatTurn {
        let text = format!("Error: {error}");
        self.update_turn(id, |turn| {
            turn.role = TurnRole::Error;
            turn.text = text.clone();
        });
        self.turn(id)
            .unwrap_or_else(|| ChatTurn::new(TurnRole::Error, text))
    }

    fn finish(&self, outcome: Result<String, AgentError>, epoch: u64) -> ChatTurn {
        let turn = match outcome {
            Ok(text) => ChatTurn::new(TurnRole::Assistant, text),
            Err(e) => ChatTurn::new(TurnRole::Error, format!("Error: {e}")),
        };
        self.record(turn, epoch)
    }

    /// Append a reply turn unless history was reset since `epoch`.
    fn record(&self, turn: ChatTurn, epoch: u64) -> ChatTurn {
        let mut state = self.lock();
        if state.epoch != epoch {
            tracing::info!(role = ?turn.role, "target changed during send, reply not recorded");
            return turn;
        }
        state.turns.push(turn.clone());
        self.publish(&state);
        turn
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::agent::AgentSettings;
    use crate::inference::types::{ModelReply, Provider, Role};
    use crate::inference::InferenceError;
    use crate::testing::FakeModel;

    fn session() -> ConversationSession {
        ConversationSession::new(DEFAULT_HISTORY_WINDOW, DEFAULT_THREAD_ID)
    }

    fn roles(session: &ConversationSession) -> Vec<TurnRole> {
        session.turns().iter().map(|t| t.role).collect()
    }

    fn streaming(model: &Arc<FakeModel>) -> SendContext {
        SendContext {
            loaded: true,
            direct: Some(DirectModel::Streaming(model.clone())),
            ..SendContext::default()
        }
    }

    #[tokio::test]
    async fn test_streaming_reply_builds_one_turn() {
        let s = session();
        let model = Arc::new(FakeModel::new(Provider::Gemini));
        model.set_stream(&["Hel", "lo", "!"], None);

        let reply = s.send("hi", streaming(&model)).await.unwrap();
        assert_eq!(reply.text, "Hello!");
        assert_eq!(roles(&s), vec![TurnRole::User, TurnRole::Assistant]);
        assert_eq!(model.prompts(), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_error_finalizes_single_error_turn() {
        let s = session();
        let model = Arc::new(FakeModel::new(Provider::Gemini));
        model.set_stream(&["a", "b", "c"], Some("connection reset"));

        let reply = s.send("hi", streaming(&model)).await.unwrap();

        let turns = s.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, TurnRole::User);
        assert_eq!(turns[1].role, TurnRole::Error);
        assert!(turns[1].text.starts_with("Error: "));
        assert!(turns[1].text.contains("connection reset"));
        assert_eq!(reply, turns[1]);
    }

    #[tokio::test]
    async fn test_blocking_direct_reply() {
        let s = session();
        let model = Arc::new(FakeModel::new(Provider::Claude));
        let ctx = SendContext {
            loaded: true,
            direct: Some(DirectModel::Blocking(model.clone())),
            ..SendContext::default()
        };
        let reply = s.send("ping", ctx).await.unwrap();
        assert_eq!(reply.role, TurnRole::Assistant);
        assert_eq!(reply.text, "echo: ping");
        assert_eq!(roles(&s), vec![TurnRole::User, TurnRole::Assistant]);
    }

    #[tokio::test]
    async fn test_blocking_direct_failure_becomes_error_turn() {
        let s = session();
        let model = Arc::new(FakeModel::new(Provider::Claude));
        model.push_error(InferenceError::HttpError {
            status: 500,
            body: "overloaded".into(),
        });
        let ctx = SendContext {
            loaded: true,
            direct: Some(DirectModel::Blocking(model.clone())),
            ..SendContext::default()
        };
        let reply = s.send("ping", ctx).await.unwrap();
        assert_eq!(reply.role, TurnRole::Error);
        assert!(reply.text.starts_with("Error: "));
        assert_eq!(roles(&s), vec![TurnRole::User, TurnRole::Error]);
    }

    #[tokio::test]
    async fn test_reply_after_target_change_is_not_recorded() {
        let s = Arc::new(session());
        s.sync_target(TargetKind::Direct(Provider::Claude));
        let model = Arc::new(FakeModel::new(Provider::Claude));
        let gate = model.hold_replies();
        let ctx = SendContext {
            loaded: true,
            direct: Some(DirectModel::Blocking(model.clone())),
            ..SendContext::default()
        };

        let pending = tokio::spawn({
            let s = s.clone();
            async move { s.send("ping", ctx).await }
        });
        while model.prompts().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(s.sync_target(TargetKind::Agent));

        gate.notify_one();
        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply.text, "echo: ping");
        assert_eq!(roles(&s), vec![TurnRole::System]);
        assert_eq!(s.turns()[0].text, TargetKind::Agent.announcement());
    }

    #[tokio::test]
    async fn test_agent_path_replays_window_without_system_turns() {
        let s = ConversationSession::new(3, "thread-x");
        s.sync_target(TargetKind::Agent);
        let model = Arc::new(FakeModel::new(Provider::OpenAi));
        model.push_reply(ModelReply::text("one"));
        model.push_reply(ModelReply::text("two"));
        let agent = Arc::new(ToolAgent::build(
            model.clone() as Arc<dyn ModelClient>,
            Vec::new(),
            AgentSettings {
                system_prompt: None,
                ..AgentSettings::default()
            },
        ));
        let ctx = SendContext {
            loaded: true,
            agent: Some(agent),
            ..SendContext::default()
        };

        s.send("first", ctx.clone()).await.unwrap();
        let reply = s.send("second", ctx).await.unwrap();
        assert_eq!(reply.text, "two");

        // The system announcement falls inside the window but is not replayed.
        let last = model.requests().pop().unwrap();
        let seen: Vec<(Role, String)> = last
            .iter()
            .map(|m| (m.role, m.text().to_string()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (Role::User, "first".to_string()),
                (Role::Assistant, "one".to_string()),
                (Role::User, "second".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_agent_failure_becomes_error_turn() {
        let s = session();
        let model = Arc::new(FakeModel::new(Provider::OpenAi));
        model.push_reply(ModelReply::default());
        let agent = Arc::new(ToolAgent::build(model, Vec::new(), AgentSettings::default()));
        let ctx = SendContext {
            loaded: true,
            agent: Some(agent),
            ..SendContext::default()
        };
        let reply = s.send("x", ctx).await.unwrap();
        assert_eq!(reply.role, TurnRole::Error);
        assert!(reply.text.contains("empty response"));
    }

    #[tokio::test]
    async fn test_connected_without_provider_replies_locally() {
        let s = session();
        let ctx = SendContext {
            loaded: true,
            any_connected: true,
            ..SendContext::default()
        };
        let reply = s.send("hello", ctx).await.unwrap();
        assert_eq!(reply.role, TurnRole::Error);
        assert_eq!(reply.text, NO_TARGET_MESSAGE);
        assert_eq!(roles(&s), vec![TurnRole::User, TurnRole::Error]);
    }

    #[tokio::test]
    async fn test_refused_sends_add_no_turns() {
        let s = session();
        let none = SendContext {
            loaded: true,
            ..SendContext::default()
        };
        assert!(matches!(
            s.send("hi", none).await,
            Err(AgentError::NotReady { .. })
        ));
        assert!(matches!(
            s.send("hi", SendContext::default()).await,
            Err(AgentError::NotReady { .. })
        ));
        let model = Arc::new(FakeModel::new(Provider::Gemini));
        assert!(matches!(
            s.send("   ", streaming(&model)).await,
            Err(AgentError::EmptyInput)
        ));
        assert!(s.turns().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_send_is_refused() {
        let s = Arc::new(session());
        let model = Arc::new(FakeModel::new(Provider::Gemini));
        let gate = model.hold_replies();

        let first = tokio::spawn({
            let s = s.clone();
            let ctx = streaming(&model);
            async move { s.send("one", ctx).await }
        });
        while !s.is_busy() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            s.send("two", streaming(&model)).await,
            Err(AgentError::Busy)
        ));

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert!(!s.is_busy());
        assert_eq!(roles(&s), vec![TurnRole::User, TurnRole::Assistant]);
    }

    #[test]
    fn test_target_change_resets_history() {
        let s = session();
        assert!(s.sync_target(TargetKind::Direct(Provider::Gemini)));
        assert!(!s.sync_target(TargetKind::Direct(Provider::Gemini)));
        assert_eq!(s.turns().len(), 1);
        assert_eq!(
            s.turns()[0].text,
            "Gemini chat ready. Type your message below."
        );

        assert!(s.sync_target(TargetKind::Agent));
        let turns = s.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, TurnRole::System);
        assert_eq!(s.target(), Some(TargetKind::Agent));
    }
}
