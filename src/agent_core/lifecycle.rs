//! Agent lifecycle: owns the live agent generation.
//!
//! Watches the trigger tuple (provider, credential, fingerprint, loaded) and
//! rebuilds the tool agent whenever it changes by value:
//! - `Empty` → `Building` → `Live`, back to `Empty` on teardown or error
//! - A monotonic generation token marks every trigger; a build commits only
//!   if its token is still current
//! - Builds are single-flight: each one holds the build gate and releases the
//!   previous generation before allocating anything

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::agent::{AgentSettings, ToolAgent};
use super::errors::AgentError;
use crate::inference::types::Provider;
use crate::inference::ModelFactory;
use crate::mcp_client::{Fingerprint, ReleaseHandle, ToolBinder};

// ─── Types ───────────────────────────────────────────────────────────────────

/// Everything a generation is built from. Compared by value.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentTrigger {
    pub provider: Provider,
    /// Key of the selected provider, `None` when unset.
    pub credential: Option<String>,
    pub fingerprint: Fingerprint,
    /// Keys and server list have both been loaded from storage.
    pub loaded: bool,
}

impl AgentTrigger {
    /// Whether this trigger can produce an agent at all.
    pub fn is_buildable(&self) -> bool {
        self.loaded
            && self.credential.as_deref().is_some_and(|c| !c.trim().is_empty())
            && !self.fingerprint.is_empty()
    }
}

impl std::fmt::Debug for AgentTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTrigger")
            .field("provider", &self.provider)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .field("fingerprint", &self.fingerprint)
            .field("loaded", &self.loaded)
            .finish()
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Empty,
    Building { generation: u64 },
    Live { generation: u64 },
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Empty => "empty",
            LifecyclePhase::Building { .. } => "building",
            LifecyclePhase::Live { .. } => "live",
        }
    }
}

/// The agent of one generation plus its teardown.
struct Generation {
    id: u64,
    agent: Arc<ToolAgent>,
    release: ReleaseHandle,
}

struct Shared {
    factory: Arc<dyn ModelFactory>,
    binder: Arc<dyn ToolBinder>,
    settings: AgentSettings,
    /// Bumped on every accepted trigger and on shutdown.
    generation: AtomicU64,
    /// Held for the whole of a build or teardown.
    gate: tokio::sync::Mutex<()>,
    live: Mutex<Option<Generation>>,
    last_trigger: Mutex<Option<AgentTrigger>>,
    phase: watch::Sender<LifecyclePhase>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn live(&self) -> MutexGuard<'_, Option<Generation>> {
        self.live.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_phase(&self, generation: u64, phase: LifecyclePhase) {
        if self.is_current(generation) {
            tracing::info!(generation, phase = phase.as_str(), "agent lifecycle transition");
            self.phase.send_replace(phase);
        }
    }

    /// Release the held generation if it is older than `generation`.
    async fn release_older(&self, generation: u64) {
        let previous = {
            let mut live = self.live();
            if live.as_ref().is_some_and(|held| held.id < generation) {
                live.take()
            } else {
                None
            }
        };
        if let Some(previous) = previous {
            tracing::info!(generation = previous.id, "releasing agent generation");
            previous.release.release().await;
        }
    }
}

// ─── AgentLifecycle ──────────────────────────────────────────────────────────

/// Owner of the current agent generation.
#[derive(Clone)]
pub struct AgentLifecycle {
    shared: Arc<Shared>,
}

impl AgentLifecycle {
    pub fn new(
        factory: Arc<dyn ModelFactory>,
        binder: Arc<dyn ToolBinder>,
        settings: AgentSettings,
    ) -> Self {
        let (phase, _) = watch::channel(LifecyclePhase::Empty);
        Self {
            shared: Arc::new(Shared {
                factory,
                binder,
                settings,
                generation: AtomicU64::new(0),
                gate: tokio::sync::Mutex::new(()),
                live: Mutex::new(None),
                last_trigger: Mutex::new(None),
                phase,
            }),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.shared.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecyclePhase> {
        self.shared.phase.subscribe()
    }

    /// The live agent, if a generation has been committed.
    pub fn current(&self) -> Option<Arc<ToolAgent>> {
        self.shared.live().as_ref().map(|g| g.agent.clone())
    }

    /// Re-evaluate with a new trigger.
    ///
    /// Returns `None` when the trigger equals the last one seen, otherwise the
    /// handle of the spawned build (or teardown) task.
    pub fn update(&self, trigger: AgentTrigger) -> Option<JoinHandle<()>> {
        {
            let mut last = self
                .shared
                .last_trigger
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if last.as_ref() == Some(&trigger) {
                return None;
            }
            *last = Some(trigger.clone());
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let buildable = trigger.is_buildable();
        tracing::debug!(
            generation,
            provider = trigger.provider.as_str(),
            servers = trigger.fingerprint.len(),
            loaded = trigger.loaded,
            buildable,
            "agent trigger changed"
        );

        if buildable {
            self.shared
                .set_phase(generation, LifecyclePhase::Building { generation });
        }

        let shared = self.shared.clone();
        Some(tokio::spawn(async move {
            build(shared, generation, trigger).await;
        }))
    }

    /// Release the current generation unconditionally.
    ///
    /// Any build still in flight is superseded and releases its own result.
    pub async fn shutdown(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared
            .last_trigger
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let _gate = self.shared.gate.lock().await;
        self.shared.release_older(generation).await;
        self.shared.set_phase(generation, LifecyclePhase::Empty);
        tracing::info!(generation, "agent lifecycle shut down");
    }
}

/// One build (or teardown) task for `generation`.
async fn build(shared: Arc<Shared>, generation: u64, trigger: AgentTrigger) {
    let _gate = shared.gate.lock().await;

    // Tasks may acquire the gate out of spawn order; a stale one must not
    // touch what a newer build committed.
    if !shared.is_current(generation) {
        tracing::debug!(generation, "build superseded before start");
        return;
    }

    // The previous generation goes first, built or not.
    shared.release_older(generation).await;

    if !trigger.is_buildable() {
        shared.set_phase(generation, LifecyclePhase::Empty);
        return;
    }

    match construct(&shared, generation, &trigger).await {
        Ok(Some(built)) => {
            let tools = built.agent.tool_names().len();
            let displaced = shared.live().replace(built);
            if let Some(displaced) = displaced {
                displaced.release.release().await;
            }
            shared.set_phase(generation, LifecyclePhase::Live { generation });
            tracing::info!(
                generation,
                provider = trigger.provider.as_str(),
                tools,
                "agent generation live"
            );
        }
        Ok(None) => {
            tracing::debug!(generation, "build superseded, result released");
        }
        Err(e) => {
            tracing::error!(generation, error = %e, "agent construction failed");
            shared.set_phase(generation, LifecyclePhase::Empty);
        }
    }
}

/// Create the model client and bind tools.
///
/// `Ok(None)` means the build was superseded and its tools already released.
async fn construct(
    shared: &Shared,
    generation: u64,
    trigger: &AgentTrigger,
) -> Result<Option<Generation>, AgentError> {
    let credential = trigger.credential.as_deref().unwrap_or_default();
    let model = shared.factory.create(trigger.provider, credential)?;

    let bound = shared.binder.bind(&trigger.fingerprint, trigger.provider).await?;

    if !shared.is_current(generation) {
        bound.release.release().await;
        return Ok(None);
    }

    let agent = ToolAgent::build(model.client, bound.tools, shared.settings.clone());
    Ok(Some(Generation {
        id: generation,
        agent: Arc::new(agent),
        release: bound.release,
    }))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::ServerConfig;
    use crate::testing::{FakeBinder, FakeModelFactory};
    use tokio::sync::Notify;

    fn fingerprint(names: &[&str]) -> Fingerprint {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    ServerConfig {
                        endpoint: format!("https://{n}/mcp"),
                        credential: None,
                    },
                )
            })
            .collect()
    }

    fn trigger(credential: Option<&str>, servers: &[&str]) -> AgentTrigger {
        AgentTrigger {
            provider: Provider::Gemini,
            credential: credential.map(str::to_string),
            fingerprint: fingerprint(servers),
            loaded: true,
        }
    }

    fn lifecycle(binder: &Arc<FakeBinder>) -> AgentLifecycle {
        AgentLifecycle::new(
            Arc::new(FakeModelFactory::new()),
            binder.clone(),
            AgentSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_building_live() {
        let binder = Arc::new(FakeBinder::new());
        let gate = Arc::new(Notify::new());
        binder.gate_next(gate.clone());
        let lc = lifecycle(&binder);
        assert_eq!(lc.phase(), LifecyclePhase::Empty);

        let task = lc.update(trigger(Some("g-key"), &["S1"])).unwrap();
        assert_eq!(lc.phase(), LifecyclePhase::Building { generation: 1 });
        assert!(lc.current().is_none());

        gate.notify_one();
        task.await.unwrap();
        assert_eq!(lc.phase(), LifecyclePhase::Live { generation: 1 });
        assert!(lc.current().is_some());
    }

    #[tokio::test]
    async fn test_same_trigger_is_ignored() {
        let binder = Arc::new(FakeBinder::new());
        let lc = lifecycle(&binder);
        lc.update(trigger(Some("k"), &["S1"])).unwrap().await.unwrap();
        assert!(lc.update(trigger(Some("k"), &["S1"])).is_none());
        assert_eq!(binder.binds(), 1);
    }

    #[tokio::test]
    async fn test_no_agent_without_servers() {
        let binder = Arc::new(FakeBinder::new());
        let lc = lifecycle(&binder);
        lc.update(trigger(Some("k"), &[])).unwrap().await.unwrap();
        assert_eq!(lc.phase(), LifecyclePhase::Empty);
        assert!(lc.current().is_none());
        assert_eq!(binder.binds(), 0);
    }

    #[tokio::test]
    async fn test_no_agent_without_credential_or_load() {
        let binder = Arc::new(FakeBinder::new());
        let lc = lifecycle(&binder);
        lc.update(trigger(None, &["S1"])).unwrap().await.unwrap();
        assert_eq!(lc.phase(), LifecyclePhase::Empty);

        let mut unloaded = trigger(Some("k"), &["S1"]);
        unloaded.loaded = false;
        lc.update(unloaded).unwrap().await.unwrap();
        assert_eq!(lc.phase(), LifecyclePhase::Empty);
        assert_eq!(binder.binds(), 0);
    }

    #[tokio::test]
    async fn test_single_flight_under_rapid_changes() {
        let binder = Arc::new(FakeBinder::new());
        let first_gate = Arc::new(Notify::new());
        binder.gate_next(first_gate.clone());
        let lc = lifecycle(&binder);

        let first = lc.update(trigger(Some("k1"), &["S1"])).unwrap();
        binder.wait_for_binds(1).await;
        let second = lc.update(trigger(Some("k2"), &["S1"])).unwrap();
        let third = lc.update(trigger(Some("k3"), &["S1"])).unwrap();

        first_gate.notify_one();
        first.await.unwrap();
        second.await.unwrap();
        third.await.unwrap();

        assert_eq!(lc.phase(), LifecyclePhase::Live { generation: 3 });
        // The superseded bind was released once; the skipped one never bound.
        assert_eq!(binder.binds(), 2);
        assert_eq!(binder.releases(), 1);
        assert!(binder.max_live() <= 1);

        lc.shutdown().await;
        assert_eq!(binder.releases(), 2);
        assert_eq!(binder.live(), 0);
        assert_eq!(lc.phase(), LifecyclePhase::Empty);
    }

    #[tokio::test]
    async fn test_rebuild_releases_previous_first() {
        let binder = Arc::new(FakeBinder::new());
        let lc = lifecycle(&binder);
        lc.update(trigger(Some("k"), &["S1"])).unwrap().await.unwrap();
        lc.update(trigger(Some("k"), &["S1", "S2"])).unwrap().await.unwrap();

        assert_eq!(binder.binds(), 2);
        assert_eq!(binder.releases(), 1);
        assert!(binder.max_live() <= 1);
        assert_eq!(lc.phase(), LifecyclePhase::Live { generation: 2 });
    }

    #[tokio::test]
    async fn test_removal_mid_build_ends_empty() {
        let binder = Arc::new(FakeBinder::new());
        let gate = Arc::new(Notify::new());
        binder.gate_next(gate.clone());
        let lc = lifecycle(&binder);

        let building = lc.update(trigger(Some("k"), &["S1"])).unwrap();
        binder.wait_for_binds(1).await;
        let removed = lc.update(trigger(Some("k"), &[])).unwrap();

        gate.notify_one();
        building.await.unwrap();
        removed.await.unwrap();

        assert_eq!(lc.phase(), LifecyclePhase::Empty);
        assert!(lc.current().is_none());
        assert_eq!(binder.releases(), 1);
        assert_eq!(binder.live(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_forces_empty() {
        let binder = Arc::new(FakeBinder::new());
        binder.fail_next("server down");
        let lc = lifecycle(&binder);
        lc.update(trigger(Some("k"), &["S1"])).unwrap().await.unwrap();
        assert_eq!(lc.phase(), LifecyclePhase::Empty);
        assert_eq!(binder.live(), 0);
    }

    #[tokio::test]
    async fn test_model_failure_forces_empty() {
        let binder = Arc::new(FakeBinder::new());
        let factory = Arc::new(FakeModelFactory::new());
        factory.fail_creates(true);
        let lc = AgentLifecycle::new(factory, binder.clone(), AgentSettings::default());
        lc.update(trigger(Some("k"), &["S1"])).unwrap().await.unwrap();
        assert_eq!(lc.phase(), LifecyclePhase::Empty);
        assert_eq!(binder.binds(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_builds_spawned_back_to_back_leave_one_live_agent() {
        let binder = Arc::new(FakeBinder::new());
        let lc = lifecycle(&binder);

        let spawner = tokio::spawn({
            let lc = lc.clone();
            async move {
                let first = lc.update(trigger(Some("k1"), &["S1"])).unwrap();
                let second = lc.update(trigger(Some("k2"), &["S1"])).unwrap();
                first.await.unwrap();
                second.await.unwrap();
            }
        });
        spawner.await.unwrap();

        assert_eq!(lc.phase(), LifecyclePhase::Live { generation: 2 });
        assert!(lc.current().is_some());
        assert_eq!(binder.live(), 1);
    }

    #[tokio::test]
    async fn test_stale_build_after_newer_commit_is_a_no_op() {
        let binder = Arc::new(FakeBinder::new());
        let lc = lifecycle(&binder);
        lc.shared.generation.store(2, Ordering::Release);

        build(lc.shared.clone(), 2, trigger(Some("k2"), &["S1"])).await;
        assert_eq!(lc.phase(), LifecyclePhase::Live { generation: 2 });

        build(lc.shared.clone(), 1, trigger(Some("k1"), &["S1"])).await;
        assert_eq!(lc.phase(), LifecyclePhase::Live { generation: 2 });
        assert!(lc.current().is_some());
        assert_eq!(binder.binds(), 1);
        assert_eq!(binder.releases(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_supersedes_inflight_build() {
        let binder = Arc::new(FakeBinder::new());
        let gate = Arc::new(Notify::new());
        binder.gate_next(gate.clone());
        let lc = lifecycle(&binder);

        let building = lc.update(trigger(Some("k"), &["S1"])).unwrap();
        binder.wait_for_binds(1).await;
        let shutdown = tokio::spawn({
            let lc = lc.clone();
            async move { lc.shutdown().await }
        });
        gate.notify_one();
        building.await.unwrap();
        shutdown.await.unwrap();

        assert_eq!(lc.phase(), LifecyclePhase::Empty);
        assert_eq!(binder.releases(), 1);
        assert_eq!(binder.live(), 0);
    }
}
