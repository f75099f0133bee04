//! In-memory control plane
//!
//! Backs dry runs and tests. Records live in a `DashMap` keyed by
//! `(kind, name)`; names can be reserved as if another account held them,
//! and faults can be queued per resource kind. Job executions are keyed by
//! their idempotency token and kept after they finish.

use super::{ControlPlane, Execution, PlaneError, ResourceRecord, ResourceSpec, RunFailure, RunOutcome};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use fleet_plan::{NodeId, SecretValue};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

type Key = (String, String);

fn key(kind: &str, name: &str) -> Key {
    (kind.to_string(), name.to_string())
}

#[derive(Debug)]
struct Fault {
    kind: String,
    error: PlaneError,
    remaining: u32,
}

#[derive(Debug, Default)]
struct StoredSecret {
    version: u64,
    fingerprint: String,
}

/// Control plane held entirely in memory.
///
/// Secret values are never stored; the plane keeps a version counter and
/// the fingerprint tag per secret name.
#[derive(Debug, Default)]
pub struct InMemoryControlPlane {
    records: DashMap<Key, ResourceRecord>,
    foreign: DashMap<Key, ()>,
    lookups: DashMap<String, String>,
    quotas: DashMap<String, usize>,
    faults: Mutex<Vec<Fault>>,
    executions: DashMap<Key, Vec<Execution>>,
    execution_limits: DashMap<Key, usize>,
    secrets: DashMap<String, StoredSecret>,
    sequence: AtomicU64,
}

impl InMemoryControlPlane {
    /// Empty plane
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a lookup value
    #[must_use]
    pub fn with_lookup(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.lookups.insert(key.into(), value.into());
        self
    }

    /// Seed records, e.g. from a saved snapshot
    #[must_use]
    pub fn with_records(self, records: impl IntoIterator<Item = ResourceRecord>) -> Self {
        for record in records {
            self.records.insert(key(&record.spec.kind, &record.spec.name), record);
        }
        self
    }

    /// Mark a name as held outside this plan
    pub fn reserve_foreign(&self, kind: &str, name: &str) {
        self.foreign.insert(key(kind, name), ());
    }

    /// Cap the number of resources of `kind`
    pub fn set_quota(&self, kind: &str, limit: usize) {
        self.quotas.insert(kind.to_string(), limit);
    }

    /// Fail the next `times` writes of `kind` with `error`
    pub fn fail_next(&self, kind: &str, error: PlaneError, times: u32) {
        self.faults.lock().push(Fault {
            kind: kind.to_string(),
            error,
            remaining: times,
        });
    }

    /// Mark every execution of a job as finished
    pub fn finish_executions(&self, kind: &str, name: &str) {
        if let Some(mut executions) = self.executions.get_mut(&key(kind, name)) {
            for execution in executions.iter_mut() {
                execution.running = false;
            }
        }
    }

    /// Cap the running executions of one job; further tokens in a run
    /// request fail with `QuotaExceeded`
    pub fn set_execution_limit(&self, kind: &str, name: &str, limit: usize) {
        self.execution_limits.insert(key(kind, name), limit);
    }

    /// Versions written for a secret name
    #[must_use]
    pub fn secret_versions(&self, name: &str) -> u64 {
        self.secrets.get(name).map_or(0, |s| s.version)
    }

    /// Versions written per secret name
    #[must_use]
    pub fn secret_version_counts(&self) -> BTreeMap<String, u64> {
        self.secrets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().version))
            .collect()
    }

    /// Number of stored resources
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of every record, sorted by kind then name
    #[must_use]
    pub fn records(&self) -> Vec<ResourceRecord> {
        let sorted: BTreeMap<Key, ResourceRecord> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        sorted.into_values().collect()
    }

    /// Records of one kind
    #[must_use]
    pub fn records_of(&self, kind: &str) -> Vec<ResourceRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.spec.kind == kind)
            .collect()
    }

    fn take_fault(&self, kind: &str) -> Option<PlaneError> {
        let mut faults = self.faults.lock();
        let index = faults.iter().position(|f| f.kind == kind && f.remaining > 0)?;
        let fault = &mut faults[index];
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            faults.remove(index);
        }
        Some(error)
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn upsert(&self, spec: ResourceSpec) -> Result<ResourceRecord, PlaneError> {
        if let Some(err) = self.take_fault(&spec.kind) {
            return Err(err);
        }
        let k = key(&spec.kind, &spec.name);
        if self.foreign.contains_key(&k) {
            return Err(PlaneError::NameTaken {
                kind: spec.kind,
                name: spec.name,
            });
        }

        let now = Utc::now();
        let existing = self.records.get(&k).map(|r| r.value().clone());
        let record = match existing {
            Some(current) if current.spec.owner != spec.owner => {
                return Err(PlaneError::NameTaken {
                    kind: spec.kind,
                    name: spec.name,
                });
            }
            Some(current) => ResourceRecord {
                spec,
                created_at: current.created_at,
                updated_at: now,
            },
            None => {
                if let Some(limit) = self.quotas.get(&spec.kind).map(|l| *l) {
                    let used = self.records.iter().filter(|r| r.key().0 == spec.kind).count();
                    if used >= limit {
                        return Err(PlaneError::QuotaExceeded(format!(
                            "{} limit of {limit} reached",
                            spec.kind
                        )));
                    }
                }
                ResourceRecord {
                    spec,
                    created_at: now,
                    updated_at: now,
                }
            }
        };
        self.records.insert(k, record.clone());
        Ok(record)
    }

    async fn get(&self, kind: &str, name: &str) -> Result<Option<ResourceRecord>, PlaneError> {
        Ok(self.records.get(&key(kind, name)).map(|r| r.value().clone()))
    }

    async fn owned_by(&self, owner: &NodeId) -> Result<Vec<ResourceRecord>, PlaneError> {
        let mut owned: Vec<ResourceRecord> = self
            .records
            .iter()
            .filter(|r| r.spec.owner.as_ref() == Some(owner))
            .map(|r| r.value().clone())
            .collect();
        owned.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.spec.kind.cmp(&b.spec.kind))
                .then_with(|| a.spec.name.cmp(&b.spec.name))
        });
        Ok(owned)
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<(), PlaneError> {
        if let Some(err) = self.take_fault(kind) {
            return Err(err);
        }
        let k = key(kind, name);
        self.executions.remove(&k);
        self.records
            .remove(&k)
            .map(|_| ())
            .ok_or_else(|| PlaneError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    async fn lookup(&self, key: &str) -> Result<String, PlaneError> {
        self.lookups
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| PlaneError::NotFound {
                kind: "lookup".to_string(),
                name: key.to_string(),
            })
    }

    async fn put_secret(&self, name: &str, value: &SecretValue, fingerprint: &str) -> Result<String, PlaneError> {
        if value.is_empty() {
            return Err(PlaneError::Transport(format!("secret '{name}' is empty")));
        }
        let mut stored = self.secrets.entry(name.to_string()).or_default();
        stored.version += 1;
        stored.fingerprint = fingerprint.to_string();
        Ok(stored.version.to_string())
    }

    async fn secret_fingerprint(&self, name: &str) -> Result<Option<String>, PlaneError> {
        Ok(self.secrets.get(name).map(|s| s.fingerprint.clone()))
    }

    async fn run_job(
        &self,
        kind: &str,
        name: &str,
        started_by: &str,
        tokens: &[String],
    ) -> Result<RunOutcome, PlaneError> {
        if let Some(err) = self.take_fault(kind) {
            return Err(err);
        }
        let k = key(kind, name);
        if !self.records.contains_key(&k) {
            return Err(PlaneError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
        let limit = self.execution_limits.get(&k).map(|l| *l);
        let mut executions = self.executions.entry(k).or_default();
        let mut outcome = RunOutcome::default();
        for token in tokens {
            if let Some(existing) = executions.iter().find(|e| &e.token == token) {
                outcome.existing.push(existing.clone());
                continue;
            }
            let running = executions.iter().filter(|e| e.running).count();
            if limit.is_some_and(|limit| running >= limit) {
                outcome.failures.push(RunFailure {
                    token: token.clone(),
                    reason: PlaneError::QuotaExceeded(format!("{name} is at its execution limit")),
                });
                continue;
            }
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
            let execution = Execution {
                id: format!("{name}/{started_by}/{seq:06}"),
                token: token.clone(),
                running: true,
            };
            executions.push(execution.clone());
            outcome.started.push(execution);
        }
        Ok(outcome)
    }

    async fn executions(&self, kind: &str, name: &str) -> Result<Vec<Execution>, PlaneError> {
        Ok(self
            .executions
            .get(&key(kind, name))
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn spec(kind: &str, name: &str, owner: &str) -> ResourceSpec {
        ResourceSpec::new(kind, name, format!("mem:{kind}/{name}")).owned_by(&id(owner))
    }

    #[tokio::test]
    async fn upsert_keeps_created_at() {
        let plane = InMemoryControlPlane::new();
        let first = plane.upsert(spec("job", "runner", "runner")).await.unwrap();
        let second = plane
            .upsert(spec("job", "runner", "runner").with_fingerprint("b"))
            .await
            .unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.spec.fingerprint, "b");
        assert_eq!(plane.len(), 1);
    }

    #[tokio::test]
    async fn other_owner_cannot_take_a_name() {
        let plane = InMemoryControlPlane::new();
        plane.upsert(spec("job", "runner", "runner")).await.unwrap();
        let err = plane.upsert(spec("job", "runner", "other")).await.unwrap_err();
        assert!(matches!(err, PlaneError::NameTaken { .. }));

        plane.reserve_foreign("role", "taken");
        let err = plane.upsert(spec("role", "taken", "runner")).await.unwrap_err();
        assert!(matches!(err, PlaneError::NameTaken { .. }));
    }

    #[tokio::test]
    async fn quota_applies_to_new_names_only() {
        let plane = InMemoryControlPlane::new();
        plane.set_quota("job", 1);
        plane.upsert(spec("job", "a", "a")).await.unwrap();
        plane.upsert(spec("job", "a", "a")).await.unwrap();
        let err = plane.upsert(spec("job", "b", "b")).await.unwrap_err();
        assert!(matches!(err, PlaneError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn faults_are_consumed() {
        let plane = InMemoryControlPlane::new();
        plane.fail_next("job", PlaneError::NotReady("role".into()), 2);
        assert!(plane.upsert(spec("job", "a", "a")).await.is_err());
        assert!(plane.upsert(spec("job", "a", "a")).await.is_err());
        assert!(plane.upsert(spec("job", "a", "a")).await.is_ok());
    }

    fn tokens(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn running(executions: &[Execution]) -> usize {
        executions.iter().filter(|e| e.running).count()
    }

    #[tokio::test]
    async fn executions_run_until_finished() {
        let plane = InMemoryControlPlane::new();
        assert!(plane.run_job("job", "runner", "scaler", &tokens(&["1"])).await.is_err());
        plane.upsert(spec("job", "runner", "runner")).await.unwrap();
        let outcome = plane.run_job("job", "runner", "scaler", &tokens(&["1", "2", "3"])).await.unwrap();
        assert_eq!(outcome.started.len(), 3);
        assert_eq!(running(&plane.executions("job", "runner").await.unwrap()), 3);

        plane.finish_executions("job", "runner");
        let executions = plane.executions("job", "runner").await.unwrap();
        assert_eq!(executions.len(), 3);
        assert_eq!(running(&executions), 0);
    }

    #[tokio::test]
    async fn a_token_starts_one_execution() {
        let plane = InMemoryControlPlane::new();
        plane.upsert(spec("job", "runner", "runner")).await.unwrap();
        let first = plane.run_job("job", "runner", "scaler", &tokens(&["42"])).await.unwrap();
        plane.finish_executions("job", "runner");
        let again = plane.run_job("job", "runner", "scaler", &tokens(&["42", "43"])).await.unwrap();

        assert_eq!(again.existing, first.started);
        assert_eq!(again.started.len(), 1);
        assert_eq!(again.started[0].token, "43");
        assert_eq!(plane.executions("job", "runner").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn execution_limit_fails_the_overflow_only() {
        let plane = InMemoryControlPlane::new();
        plane.upsert(spec("job", "runner", "runner")).await.unwrap();
        plane.set_execution_limit("job", "runner", 3);
        let outcome = plane
            .run_job("job", "runner", "scaler", &tokens(&["a", "b", "c", "d", "e"]))
            .await
            .unwrap();
        assert_eq!(outcome.started.len(), 3);
        let refused: Vec<_> = outcome.failures.iter().map(|f| f.token.as_str()).collect();
        assert_eq!(refused, vec!["d", "e"]);
        assert!(matches!(outcome.failures[0].reason, PlaneError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn secrets_keep_versions_not_values() {
        let plane = InMemoryControlPlane::new();
        let value = SecretValue::new("ghp_value");
        assert_eq!(plane.put_secret("pat", &value, "f1").await.unwrap(), "1");
        assert_eq!(plane.put_secret("pat", &value, "f1").await.unwrap(), "2");
        assert_eq!(plane.secret_versions("pat"), 2);
        assert_eq!(plane.secret_fingerprint("pat").await.unwrap().as_deref(), Some("f1"));
        assert_eq!(plane.secret_fingerprint("other").await.unwrap(), None);
        assert!(!format!("{plane:?}").contains("ghp_value"));
    }

    #[tokio::test]
    async fn snapshot_seeds_a_fresh_plane() {
        let plane = InMemoryControlPlane::new();
        plane.upsert(spec("job", "fleet-runner", "runner")).await.unwrap();

        let restored = InMemoryControlPlane::new().with_records(plane.records());
        let record = restored.get("job", "fleet-runner").await.unwrap().unwrap();
        assert_eq!(record.spec.owner, Some(id("runner")));
        assert_eq!(restored.records(), plane.records());
    }
}
