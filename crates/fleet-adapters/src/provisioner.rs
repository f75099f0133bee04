//! Provider-independent resource bookkeeping
//!
//! Every adapter writes through a `Provisioner`. It owns the mapping from
//! plane failures to node-scoped `ProviderError`s, stamps the request
//! fingerprint on the primary record, and tears down everything a node
//! owns on destroy.

use crate::plane::{ControlPlane, PlaneError, ResourceRecord, ResourceSpec};
use fleet_plan::{
    ContextKey, ContextRequest, DispatchKey, LaunchError, LaunchedRunner, NodeId, NodeOutputs,
    ObservedResource, ProviderError, ProviderErrorKind, RequestMeta, ResolvedEnv, ResolvedValue,
    RunnerExecution, Secret, SecretHandle,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Record kind used for resolved context lookups
pub const CONTEXT_KIND: &str = "context";

/// Label every managed resource carries, alongside the node's own labels
pub const MANAGED_NODE_TAG: &str = "fleet-node";

#[derive(Clone)]
pub(crate) struct Provisioner {
    plane: Arc<dyn ControlPlane>,
}

impl Provisioner {
    pub(crate) fn new(plane: Arc<dyn ControlPlane>) -> Self {
        Self { plane }
    }

    pub(crate) fn plane(&self) -> &Arc<dyn ControlPlane> {
        &self.plane
    }

    /// Write a secondary resource owned by the request's node.
    pub(crate) async fn put(&self, meta: &RequestMeta, spec: ResourceSpec) -> Result<ResourceRecord, ProviderError> {
        let spec = spec.owned_by(&meta.node).with_tags(tags(meta));
        tracing::debug!(node = %meta.node, kind = %spec.kind, name = %spec.name, "upsert resource");
        self.plane.upsert(spec).await.map_err(|err| err.for_node(&meta.node))
    }

    /// Write the node's primary resource last, with the request fingerprint.
    ///
    /// Returns the outputs stored on the record.
    pub(crate) async fn put_primary(&self, meta: &RequestMeta, spec: ResourceSpec) -> Result<NodeOutputs, ProviderError> {
        let spec = spec.with_fingerprint(meta.fingerprint.clone());
        let record = self.put(meta, spec).await?;
        Ok(record.spec.outputs)
    }

    /// Shared infrastructure with no owning node.
    pub(crate) async fn ensure_shared(&self, node: &NodeId, spec: ResourceSpec) -> Result<ResourceRecord, ProviderError> {
        if let Some(existing) = self
            .plane
            .get(&spec.kind, &spec.name)
            .await
            .map_err(|err| err.for_node(node))?
        {
            return Ok(existing);
        }
        tracing::info!(kind = %spec.kind, name = %spec.name, "creating shared infrastructure");
        self.plane.upsert(spec).await.map_err(|err| err.for_node(node))
    }

    /// Primary record of a node as an observation.
    pub(crate) async fn observe(
        &self,
        node: &NodeId,
        kind: &str,
        name: &str,
    ) -> Result<Option<ObservedResource>, ProviderError> {
        let record = self.plane.get(kind, name).await.map_err(|err| err.for_node(node))?;
        Ok(record
            .filter(|r| r.spec.owner.as_ref() == Some(node))
            .map(|r| ObservedResource {
                fingerprint: r.spec.fingerprint,
                outputs: r.spec.outputs,
            }))
    }

    /// Delete every record the node owns, newest first.
    pub(crate) async fn destroy(&self, node: &NodeId) -> Result<(), ProviderError> {
        let owned = self.plane.owned_by(node).await.map_err(|err| err.for_node(node))?;
        if owned.is_empty() {
            return Err(ProviderError::new(
                node.clone(),
                ProviderErrorKind::NotFound,
                "no resources owned by node",
            ));
        }
        for record in owned.iter().rev() {
            match self.plane.delete(&record.spec.kind, &record.spec.name).await {
                Ok(()) | Err(PlaneError::NotFound { .. }) => {
                    tracing::debug!(node = %node, kind = %record.spec.kind, name = %record.spec.name, "deleted");
                }
                Err(err) => return Err(err.for_node(node)),
            }
        }
        Ok(())
    }

    /// Resolve context keys and persist them so reapply can compare.
    ///
    /// `known` supplies values the adapter has from configuration; anything
    /// else is read from the plane under `{provider}:{output_key}`.
    pub(crate) async fn resolve_context(
        &self,
        request: &ContextRequest,
        provider: &str,
        known: impl Fn(ContextKey) -> Option<String>,
    ) -> Result<NodeOutputs, ProviderError> {
        let node = &request.meta.node;
        let mut spec = ResourceSpec::new(CONTEXT_KIND, node.as_str(), format!("{provider}:context/{node}"))
            .with_output("name", node.as_str())
            .with_output("id", format!("{provider}:context/{node}"));
        for key in &request.lookups {
            let value = match known(*key) {
                Some(value) => value,
                None => self
                    .plane
                    .lookup(&format!("{provider}:{}", key.output_key()))
                    .await
                    .map_err(|err| err.for_node(node))?,
            };
            spec = spec.with_output(key.output_key(), value);
        }
        self.put_primary(&request.meta, spec).await
    }

    /// Store a secret and return the handle built by `reference`.
    ///
    /// No new version is written when the stored fingerprint matches.
    pub(crate) async fn put_secret(
        &self,
        secret: &Secret,
        store_name: &str,
        reference: impl FnOnce(&str) -> String,
    ) -> Result<SecretHandle, ProviderError> {
        let fingerprint = secret.value.fingerprint();
        let stored = self
            .plane
            .secret_fingerprint(store_name)
            .await
            .map_err(|err| secret_error(&secret.name, &err))?;
        if stored.as_deref() == Some(fingerprint.as_str()) {
            tracing::debug!(secret = %secret.name, "secret unchanged");
        } else {
            let version = self
                .plane
                .put_secret(store_name, &secret.value, &fingerprint)
                .await
                .map_err(|err| secret_error(&secret.name, &err))?;
            tracing::debug!(secret = %secret.name, version = %version, "secret stored");
        }
        Ok(SecretHandle {
            name: secret.name.clone(),
            reference: reference(store_name),
        })
    }
}

/// Executions of a runner job, keyed by the token each was started with.
pub(crate) async fn runner_executions(
    plane: &dyn ControlPlane,
    target: &NodeId,
    kind: &str,
    name: &str,
    execution_name: impl Fn(&str) -> String,
) -> Result<Vec<RunnerExecution>, ProviderError> {
    let executions = plane.executions(kind, name).await.map_err(|err| err.for_node(target))?;
    Ok(executions
        .into_iter()
        .map(|e| RunnerExecution {
            key: DispatchKey::new(e.token),
            execution: execution_name(&e.id),
            running: e.running,
        })
        .collect())
}

/// Start one execution per key, passing the key as the plane's idempotency
/// token. Keys go out `per_call` at a time.
///
/// On failure the error carries every runner that did start, including
/// those of the failing call.
pub(crate) async fn launch_runners(
    plane: &dyn ControlPlane,
    target: &NodeId,
    (kind, name): (&str, &str),
    keys: &[DispatchKey],
    per_call: usize,
    execution_name: impl Fn(&str) -> String,
) -> Result<Vec<LaunchedRunner>, LaunchError> {
    let mut launched = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(per_call.max(1)) {
        let tokens: Vec<String> = chunk.iter().map(|k| k.as_str().to_string()).collect();
        let outcome = match plane.run_job(kind, name, crate::STARTED_BY, &tokens).await {
            Ok(outcome) => outcome,
            Err(err) => {
                return Err(LaunchError {
                    launched,
                    error: err.for_node(target),
                })
            }
        };
        let started = outcome.started.iter().map(|e| (e, true));
        let existing = outcome.existing.iter().map(|e| (e, false));
        launched.extend(started.chain(existing).map(|(e, fresh)| LaunchedRunner {
            key: DispatchKey::new(e.token.clone()),
            execution: execution_name(&e.id),
            fresh,
        }));
        if let Some(failure) = outcome.failures.first() {
            tracing::warn!(
                target_node = %target,
                refused = outcome.failures.len(),
                token = %failure.token,
                "run request partly refused"
            );
            return Err(LaunchError {
                launched,
                error: failure.reason.for_node(target),
            });
        }
    }
    Ok(launched)
}

/// Plane errors from `put_secret` have no node; attribute them to a
/// synthetic `secret-*` id so reports still name the failing secret.
fn secret_error(name: &str, err: &PlaneError) -> ProviderError {
    let node = NodeId::new(format!("secret-{}", crate::naming::sanitize(name)))
        .or_else(|_| NodeId::new("secret"))
        .unwrap_or_else(|_| unreachable!("static node id"));
    ProviderError::new(node, err.kind(), err.to_string())
}

fn tags(meta: &RequestMeta) -> BTreeMap<String, String> {
    let mut tags = meta.labels.clone();
    tags.insert(MANAGED_NODE_TAG.to_string(), meta.node.to_string());
    tags
}

/// Env split into plain values and secret references, in declaration order.
pub(crate) fn split_env(env: &[ResolvedEnv]) -> (Vec<(&str, &str)>, Vec<(&str, &SecretHandle)>) {
    let mut plain = Vec::new();
    let mut secrets = Vec::new();
    for binding in env {
        match &binding.value {
            ResolvedValue::Literal(value) => plain.push((binding.name.as_str(), value.as_str())),
            ResolvedValue::Secret(handle) => secrets.push((binding.name.as_str(), handle)),
        }
    }
    (plain, secrets)
}

/// Required output of a referenced node, or `DependencyNotReady`.
pub(crate) fn required<'a>(
    node: &NodeId,
    outputs: &'a NodeOutputs,
    owner: &NodeId,
    key: &str,
) -> Result<&'a str, ProviderError> {
    outputs.get(key).map(String::as_str).ok_or_else(|| {
        ProviderError::new(
            node.clone(),
            ProviderErrorKind::DependencyNotReady,
            format!("'{owner}' has no '{key}' output yet"),
        )
    })
}

/// Hex-derived UUID-shaped id, stable for a given seed.
pub(crate) fn stable_uuid(seed: &str) -> String {
    use sha2::{Digest, Sha256};
    let hex = hex::encode(Sha256::digest(seed.as_bytes()));
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::InMemoryControlPlane;
    use fleet_plan::SecretValue;
    use std::collections::BTreeSet;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn meta(node: &str, fingerprint: &str) -> RequestMeta {
        let mut meta = RequestMeta::new(id(node), BTreeMap::new(), BTreeMap::new());
        meta.fingerprint = fingerprint.to_string();
        meta
    }

    #[tokio::test]
    async fn primary_carries_fingerprint_and_owner() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let provisioner = Provisioner::new(plane.clone());
        provisioner
            .put_primary(&meta("runner", "abc"), ResourceSpec::new("job", "fleet-runner", "job/1"))
            .await
            .unwrap();

        let observed = provisioner.observe(&id("runner"), "job", "fleet-runner").await.unwrap().unwrap();
        assert_eq!(observed.fingerprint, "abc");
        assert!(provisioner.observe(&id("other"), "job", "fleet-runner").await.unwrap().is_none());

        let record = &plane.records()[0];
        assert_eq!(record.spec.tags.get(MANAGED_NODE_TAG).map(String::as_str), Some("runner"));
    }

    #[tokio::test]
    async fn destroy_without_resources_is_not_found() {
        let provisioner = Provisioner::new(Arc::new(InMemoryControlPlane::new()));
        let err = provisioner.destroy(&id("runner")).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::NotFound);
    }

    #[tokio::test]
    async fn context_falls_back_to_plane_lookups() {
        let plane = Arc::new(InMemoryControlPlane::new().with_lookup("aws:subnets", "subnet-1,subnet-2"));
        let provisioner = Provisioner::new(plane);
        let request = ContextRequest {
            meta: meta("ctx", "f"),
            lookups: BTreeSet::from([ContextKey::Region, ContextKey::Subnets]),
        };
        let outputs = provisioner
            .resolve_context(&request, "aws", |key| (key == ContextKey::Region).then(|| "eu-north-1".to_string()))
            .await
            .unwrap();
        assert_eq!(outputs.get("region").map(String::as_str), Some("eu-north-1"));
        assert_eq!(outputs.get("subnets").map(String::as_str), Some("subnet-1,subnet-2"));

        let missing = ContextRequest {
            meta: meta("ctx", "f"),
            lookups: BTreeSet::from([ContextKey::Project]),
        };
        let err = provisioner.resolve_context(&missing, "aws", |_| None).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::NotFound);
    }

    #[tokio::test]
    async fn secret_handle_uses_reference_builder() {
        let provisioner = Provisioner::new(Arc::new(InMemoryControlPlane::new()));
        let secret = Secret::new("pat", SecretValue::new("ghp_x"));
        let handle = provisioner
            .put_secret(&secret, "fleet-pat", |name| format!("arn:secret:{name}"))
            .await
            .unwrap();
        assert_eq!(handle.reference, "arn:secret:fleet-pat");
        assert!(!format!("{handle:?}").contains("ghp_x"));
    }

    #[tokio::test]
    async fn unchanged_secret_is_not_rewritten() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let provisioner = Provisioner::new(plane.clone());
        let secret = Secret::new("pat", SecretValue::new("ghp_x"));
        for _ in 0..2 {
            provisioner.put_secret(&secret, "fleet-pat", str::to_string).await.unwrap();
        }
        assert_eq!(plane.secret_versions("fleet-pat"), 1);

        let rotated = Secret::new("pat", SecretValue::new("ghp_y"));
        provisioner.put_secret(&rotated, "fleet-pat", str::to_string).await.unwrap();
        assert_eq!(plane.secret_versions("fleet-pat"), 2);
    }

    fn keys(names: &[&str]) -> Vec<DispatchKey> {
        names.iter().map(|k| DispatchKey::new(*k)).collect()
    }

    #[tokio::test]
    async fn launch_reports_runners_started_before_a_refusal() {
        let plane = InMemoryControlPlane::new();
        plane.upsert(ResourceSpec::new("job", "fleet-runner", "job/1")).await.unwrap();
        plane.set_execution_limit("job", "fleet-runner", 3);

        let err = launch_runners(
            &plane,
            &id("runner"),
            ("job", "fleet-runner"),
            &keys(&["1", "2", "3", "4", "5"]),
            10,
            str::to_string,
        )
        .await
        .unwrap_err();
        let started: Vec<_> = err.launched.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(started, vec!["1", "2", "3"]);
        assert!(err.launched.iter().all(|r| r.fresh));
        assert_eq!(err.error.kind, ProviderErrorKind::QuotaExceeded);
        assert_eq!(err.error.node, id("runner"));
    }

    #[tokio::test]
    async fn relaunching_a_key_returns_its_execution() {
        let plane = InMemoryControlPlane::new();
        plane.upsert(ResourceSpec::new("job", "fleet-runner", "job/1")).await.unwrap();
        let target = ("job", "fleet-runner");
        let first = launch_runners(&plane, &id("runner"), target, &keys(&["7"]), 1, str::to_string)
            .await
            .unwrap();
        let again = launch_runners(&plane, &id("runner"), target, &keys(&["7"]), 1, str::to_string)
            .await
            .unwrap();
        assert!(first[0].fresh);
        assert!(!again[0].fresh);
        assert_eq!(again[0].execution, first[0].execution);

        let executions = runner_executions(&plane, &id("runner"), "job", "fleet-runner", str::to_string)
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].key, DispatchKey::new("7"));
    }

    #[test]
    fn stable_uuid_is_deterministic() {
        let a = stable_uuid("identity-runner");
        assert_eq!(a, stable_uuid("identity-runner"));
        assert_eq!(a.len(), 36);
        assert_ne!(a, stable_uuid("identity-ctrl"));
    }
}
