//! Runtime dispatch guard
//!
//! The controller's trigger loop runs outside the plan, but the guarantees
//! it must keep live here so every adapter shares them:
//!
//! - launches for the same runner job are serialized
//! - each unit of demand (`DispatchKey`) starts at most one runner, also
//!   across controller restarts: the key travels to the provider as the
//!   execution's idempotency token
//! - the controller is `Idle` between launches and `Triggering` during one
//!
//! A `RunnerLauncher` is the provider side: list executions by key and
//! start new ones, in batches no larger than `max_batch`.

use crate::error::{LaunchError, ProviderError};
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One unit of queued demand, e.g. a GitHub runner request id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchKey(String);

impl DispatchKey {
    /// Wrap a key
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Raw key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for DispatchKey {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A runner execution started for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchedRunner {
    /// Demand unit it serves
    pub key: DispatchKey,
    /// Provider execution id (task ARN, execution name)
    pub execution: String,
    /// False when the provider matched the key to an execution it had
    /// already started
    pub fresh: bool,
}

/// An execution the provider reports for a target, keyed by the token it
/// was started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerExecution {
    /// Demand unit the execution was started for
    pub key: DispatchKey,
    /// Provider execution id
    pub execution: String,
    /// Still running or starting
    pub running: bool,
}

/// Controller trigger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    /// No launch in progress
    Idle,
    /// Calling the provider's run-job API
    Triggering,
}

/// Provider-side runner launching.
///
/// Implementations pass each `DispatchKey` to the provider as the
/// execution's idempotency token, so a key that was already started maps
/// back to its existing execution instead of a new one.
#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    /// Executions of `target` the provider knows about, finished or not
    async fn runner_executions(&self, target: &NodeId) -> Result<Vec<RunnerExecution>, ProviderError>;

    /// Start one runner per key. Called with at most `max_batch` keys.
    ///
    /// On failure the error carries the runners that did start.
    async fn launch(&self, target: &NodeId, keys: &[DispatchKey]) -> Result<Vec<LaunchedRunner>, LaunchError>;

    /// Distinct keys of `target` with a running execution
    async fn current_runner_count(&self, target: &NodeId) -> Result<u32, ProviderError> {
        let running: BTreeSet<DispatchKey> = self
            .runner_executions(target)
            .await?
            .into_iter()
            .filter(|e| e.running)
            .map(|e| e.key)
            .collect();
        Ok(u32::try_from(running.len()).unwrap_or(u32::MAX))
    }

    /// Largest number of keys a single `launch` call accepts
    fn max_batch(&self) -> usize {
        1
    }
}

/// Result of one dispatch round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    /// Runners started in this round
    pub launched: Vec<LaunchedRunner>,
    /// Keys the provider already had an execution for
    pub existing: Vec<LaunchedRunner>,
    /// Keys skipped because they were already dispatched
    pub duplicates: Vec<DispatchKey>,
    /// Keys dropped from the dispatched set because their execution finished
    pub pruned: usize,
    /// Provider calls made
    pub batches: usize,
}

impl DispatchOutcome {
    fn record(&mut self, dispatched: &mut BTreeSet<DispatchKey>, runners: Vec<LaunchedRunner>) {
        for runner in runners {
            dispatched.insert(runner.key.clone());
            if runner.fresh {
                self.launched.push(runner);
            } else {
                self.existing.push(runner);
            }
        }
    }
}

#[derive(Debug, Default)]
struct TargetSlot {
    triggering: AtomicBool,
    dispatched: Mutex<BTreeSet<DispatchKey>>,
}

/// Serializes launches per target and deduplicates demand.
pub struct Dispatcher<L: RunnerLauncher + ?Sized> {
    launcher: Arc<L>,
    targets: DashMap<NodeId, Arc<TargetSlot>>,
}

impl<L: RunnerLauncher + ?Sized> Dispatcher<L> {
    /// Dispatcher over a launcher
    pub fn new(launcher: Arc<L>) -> Self {
        Self {
            launcher,
            targets: DashMap::new(),
        }
    }

    /// Runners to start so that `queued` demand is covered by `running`.
    #[inline]
    #[must_use]
    pub fn needed_runners(queued: u32, running: u32) -> u32 {
        queued.saturating_sub(running)
    }

    fn target(&self, target: &NodeId) -> Arc<TargetSlot> {
        self.targets.entry(target.clone()).or_default().clone()
    }

    /// Current trigger state of `target`
    #[must_use]
    pub fn state(&self, target: &NodeId) -> ControllerState {
        if self.target(target).triggering.load(Ordering::Acquire) {
            ControllerState::Triggering
        } else {
            ControllerState::Idle
        }
    }

    /// Whether `key` is in the dispatched set for `target`.
    pub async fn is_dispatched(&self, target: &NodeId, key: &DispatchKey) -> bool {
        self.target(target).dispatched.lock().await.contains(key)
    }

    /// Start runners for every not-yet-dispatched key in `demand`.
    ///
    /// Each round first syncs with the provider: keys with a running
    /// execution count as dispatched, keys whose execution finished are
    /// pruned. A failed batch marks only the keys the provider reports as
    /// started; the rest stay undispatched for a later round.
    ///
    /// # Errors
    /// Provider errors from listing executions or launching. Runners that
    /// started before the failure are recorded.
    pub async fn dispatch(
        &self,
        target: &NodeId,
        demand: impl IntoIterator<Item = DispatchKey>,
    ) -> Result<DispatchOutcome, ProviderError> {
        let slot = self.target(target);
        let mut dispatched = slot.dispatched.lock().await;

        let mut outcome = DispatchOutcome::default();
        for execution in self.launcher.runner_executions(target).await? {
            if execution.running {
                dispatched.insert(execution.key);
            } else if dispatched.remove(&execution.key) {
                outcome.pruned += 1;
            }
        }

        let mut fresh = Vec::new();
        let mut seen = BTreeSet::new();
        for key in demand {
            if dispatched.contains(&key) || !seen.insert(key.clone()) {
                outcome.duplicates.push(key);
            } else {
                fresh.push(key);
            }
        }
        if fresh.is_empty() {
            tracing::debug!(
                target_job = %target,
                duplicates = outcome.duplicates.len(),
                pruned = outcome.pruned,
                "nothing to dispatch"
            );
            return Ok(outcome);
        }

        slot.triggering.store(true, Ordering::Release);
        let batch_size = self.launcher.max_batch().max(1);
        let mut result = Ok(());
        for batch in fresh.chunks(batch_size) {
            tracing::debug!(target_job = %target, count = batch.len(), "triggering runners in batch");
            outcome.batches += 1;
            match self.launcher.launch(target, batch).await {
                Ok(runners) => outcome.record(&mut dispatched, runners),
                Err(LaunchError { launched, error }) => {
                    tracing::error!(
                        target_job = %target,
                        started = launched.len(),
                        requested = batch.len(),
                        error = %error,
                        "runner launch failed"
                    );
                    outcome.record(&mut dispatched, launched);
                    result = Err(error);
                    break;
                }
            }
        }
        slot.triggering.store(false, Ordering::Release);

        result.map(|()| {
            tracing::info!(
                target_job = %target,
                launched = outcome.launched.len(),
                existing = outcome.existing.len(),
                duplicates = outcome.duplicates.len(),
                pruned = outcome.pruned,
                "dispatch round complete"
            );
            outcome
        })
    }

    /// Bring running executions up to `queued`, one new key per missing
    /// runner, taken in order from `pending`.
    ///
    /// # Errors
    /// Provider errors from counting or launching.
    pub async fn scale_to(
        &self,
        target: &NodeId,
        queued: u32,
        pending: impl IntoIterator<Item = DispatchKey>,
    ) -> Result<DispatchOutcome, ProviderError> {
        let running = self.launcher.current_runner_count(target).await?;
        let needed = Self::needed_runners(queued, running) as usize;
        tracing::debug!(target_job = %target, running, queued, needed, "runner demand");
        if needed == 0 {
            return Ok(DispatchOutcome::default());
        }
        let mut keys = Vec::with_capacity(needed);
        for key in pending {
            if keys.len() == needed {
                break;
            }
            if !self.is_dispatched(target, &key).await {
                keys.push(key);
            }
        }
        self.dispatch(target, keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::BTreeMap;

    /// Launcher that remembers every key it started, like a provider
    /// deduplicating on the idempotency token.
    #[derive(Default)]
    struct FakeLauncher {
        batch: usize,
        calls: SyncMutex<Vec<Vec<DispatchKey>>>,
        started: SyncMutex<BTreeMap<DispatchKey, bool>>,
        fail_on_call: Option<usize>,
        capacity: SyncMutex<Option<usize>>,
    }

    impl FakeLauncher {
        fn with_batch(batch: usize) -> Self {
            Self {
                batch,
                ..Self::default()
            }
        }

        fn finish(&self, key: &DispatchKey) {
            self.started.lock().insert(key.clone(), false);
        }
    }

    fn quota(target: &NodeId) -> ProviderError {
        ProviderError::new(target.clone(), ProviderErrorKind::QuotaExceeded, "task limit")
    }

    #[async_trait]
    impl RunnerLauncher for FakeLauncher {
        async fn runner_executions(&self, _target: &NodeId) -> Result<Vec<RunnerExecution>, ProviderError> {
            Ok(self
                .started
                .lock()
                .iter()
                .map(|(key, running)| RunnerExecution {
                    key: key.clone(),
                    execution: format!("exec-{key}"),
                    running: *running,
                })
                .collect())
        }

        async fn launch(&self, target: &NodeId, keys: &[DispatchKey]) -> Result<Vec<LaunchedRunner>, LaunchError> {
            let mut calls = self.calls.lock();
            if self.fail_on_call == Some(calls.len()) {
                return Err(quota(target).into());
            }
            calls.push(keys.to_vec());

            let mut started = self.started.lock();
            let mut capacity = self.capacity.lock();
            let mut launched = Vec::new();
            for key in keys {
                let fresh = !started.contains_key(key);
                if fresh {
                    match capacity.as_mut() {
                        Some(0) => {
                            return Err(LaunchError {
                                launched,
                                error: quota(target),
                            })
                        }
                        Some(left) => *left -= 1,
                        None => {}
                    }
                    started.insert(key.clone(), true);
                }
                launched.push(LaunchedRunner {
                    key: key.clone(),
                    execution: format!("exec-{key}"),
                    fresh,
                });
            }
            Ok(launched)
        }

        fn max_batch(&self) -> usize {
            self.batch
        }
    }

    fn runner() -> NodeId {
        NodeId::new("runner").unwrap()
    }

    fn keys(range: std::ops::Range<u64>) -> Vec<DispatchKey> {
        range.map(DispatchKey::from).collect()
    }

    #[tokio::test]
    async fn same_key_dispatches_once() {
        let launcher = Arc::new(FakeLauncher::with_batch(1));
        let dispatcher = Dispatcher::new(launcher.clone());

        let first = dispatcher.dispatch(&runner(), keys(1..3)).await.unwrap();
        let second = dispatcher.dispatch(&runner(), keys(1..4)).await.unwrap();

        assert_eq!(first.launched.len(), 2);
        assert_eq!(second.launched.len(), 1);
        assert_eq!(second.duplicates, keys(1..3));
        assert_eq!(launcher.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn duplicate_within_one_round_is_skipped() {
        let dispatcher = Dispatcher::new(Arc::new(FakeLauncher::with_batch(10)));
        let outcome = dispatcher
            .dispatch(&runner(), vec![DispatchKey::new("7"), DispatchKey::new("7")])
            .await
            .unwrap();
        assert_eq!(outcome.launched.len(), 1);
        assert_eq!(outcome.duplicates, vec![DispatchKey::new("7")]);
    }

    #[tokio::test]
    async fn batches_respect_launcher_limit() {
        let launcher = Arc::new(FakeLauncher::with_batch(10));
        let dispatcher = Dispatcher::new(launcher.clone());
        let outcome = dispatcher.dispatch(&runner(), keys(0..23)).await.unwrap();
        assert_eq!(outcome.batches, 3);
        let sizes: Vec<usize> = launcher.calls.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
    }

    #[tokio::test]
    async fn failed_batch_keys_stay_undispatched() {
        let launcher = Arc::new(FakeLauncher {
            batch: 2,
            fail_on_call: Some(1),
            ..FakeLauncher::default()
        });
        let dispatcher = Dispatcher::new(launcher);
        let err = dispatcher.dispatch(&runner(), keys(0..4)).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::QuotaExceeded);
        assert!(dispatcher.is_dispatched(&runner(), &DispatchKey::from(1)).await);
        assert!(!dispatcher.is_dispatched(&runner(), &DispatchKey::from(2)).await);
        assert_eq!(dispatcher.state(&runner()), ControllerState::Idle);
    }

    #[tokio::test]
    async fn partly_started_batch_marks_only_started_keys() {
        let launcher = Arc::new(FakeLauncher::with_batch(10));
        *launcher.capacity.lock() = Some(3);
        let dispatcher = Dispatcher::new(launcher.clone());

        let err = dispatcher.dispatch(&runner(), keys(0..5)).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::QuotaExceeded);
        for key in keys(0..3) {
            assert!(dispatcher.is_dispatched(&runner(), &key).await, "{key}");
        }
        for key in keys(3..5) {
            assert!(!dispatcher.is_dispatched(&runner(), &key).await, "{key}");
        }

        *launcher.capacity.lock() = None;
        let retry = dispatcher.dispatch(&runner(), keys(0..5)).await.unwrap();
        assert_eq!(retry.duplicates, keys(0..3));
        let relaunched: Vec<_> = retry.launched.iter().map(|r| r.key.clone()).collect();
        assert_eq!(relaunched, keys(3..5));
        assert_eq!(launcher.started.lock().len(), 5);
    }

    #[tokio::test]
    async fn finished_keys_are_pruned_and_never_restarted() {
        let launcher = Arc::new(FakeLauncher::with_batch(10));
        let dispatcher = Dispatcher::new(launcher.clone());
        dispatcher.dispatch(&runner(), keys(0..3)).await.unwrap();

        launcher.finish(&DispatchKey::from(1));
        let round = dispatcher.dispatch(&runner(), Vec::new()).await.unwrap();
        assert_eq!(round.pruned, 1);
        assert!(!dispatcher.is_dispatched(&runner(), &DispatchKey::from(1)).await);
        assert!(dispatcher.is_dispatched(&runner(), &DispatchKey::from(2)).await);

        let again = dispatcher.dispatch(&runner(), keys(1..2)).await.unwrap();
        assert!(again.launched.is_empty());
        assert_eq!(again.existing.len(), 1);
        assert_eq!(launcher.current_runner_count(&runner()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn new_dispatcher_adopts_running_keys() {
        let launcher = Arc::new(FakeLauncher::with_batch(10));
        Dispatcher::new(launcher.clone())
            .dispatch(&runner(), keys(0..3))
            .await
            .unwrap();

        let restarted = Dispatcher::new(launcher.clone());
        let outcome = restarted.dispatch(&runner(), keys(0..4)).await.unwrap();
        assert_eq!(outcome.duplicates, keys(0..3));
        assert_eq!(outcome.launched.len(), 1);
        assert_eq!(launcher.started.lock().len(), 4);
    }

    #[tokio::test]
    async fn scale_to_covers_only_missing_runners() {
        let launcher = Arc::new(FakeLauncher::with_batch(10));
        launcher.started.lock().extend([(DispatchKey::new("a"), true), (DispatchKey::new("b"), true)]);
        let dispatcher = Dispatcher::new(launcher);
        let outcome = dispatcher.scale_to(&runner(), 5, keys(100..110)).await.unwrap();
        assert_eq!(outcome.launched.len(), 3);
        assert_eq!(Dispatcher::<FakeLauncher>::needed_runners(1, 4), 0);
    }

    #[tokio::test]
    async fn state_ignores_readers_of_the_dispatched_set() {
        let dispatcher = Dispatcher::new(Arc::new(FakeLauncher::with_batch(1)));
        let slot = dispatcher.target(&runner());
        let _reader = slot.dispatched.lock().await;
        assert_eq!(dispatcher.state(&runner()), ControllerState::Idle);
    }

    #[tokio::test]
    async fn concurrent_rounds_never_double_launch() {
        let launcher = Arc::new(FakeLauncher::with_batch(1));
        let dispatcher = Arc::new(Dispatcher::new(launcher.clone()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch(&runner(), keys(0..5)).await
            }));
        }
        let mut launched = 0;
        for handle in handles {
            launched += handle.await.unwrap().unwrap().launched.len();
        }
        assert_eq!(launched, 5);
        assert_eq!(launcher.calls.lock().len(), 5);
    }
}
