//! Provisioning Plan
//!
//! An arena of nodes addressed by `NodeId`. Nodes are added explicitly with
//! `add_node`; every reference a node makes must already be in the plan, so
//! references can never point forward. `validate` checks the whole graph
//! and produces a `ValidatedPlan` with the apply order and ranks.
//!
//! Usage:
//! ```rust,ignore
//! let mut plan = Plan::new();
//! plan.add_node(Node::context(ctx.clone(), ContextSpec::new([ContextKey::Region])))?;
//! plan.add_node(Node::identity(identity.clone(), JobFamily::Runner))?;
//! let validated = plan.validate()?;
//! ```

mod graph;

use crate::binder::{IdentityBinder, IdentityBindings};
use crate::build::BuildLedger;
use crate::error::ValidationError;
use crate::node::{EnvValue, ImageRef, Node, NodeSpec, ReferenceRole};
use crate::secret::{Secret, SecretStore};
use crate::types::{NodeId, NodeKind};
use graph::{DependencyGraph, Slot};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// A graph of typed infrastructure nodes plus the secrets and build history
/// they refer to.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    nodes: Vec<Node>,
    index: IndexMap<NodeId, Slot>,
    graph: DependencyGraph,
    secrets: SecretStore,
    builds: BuildLedger,
}

/// Output of a successful `Plan::validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedPlan {
    /// Topological order
    pub order: Vec<NodeId>,
    /// Nodes grouped by rank; ids sorted within each rank
    pub ranks: Vec<Vec<NodeId>>,
    /// Grants derived for every compute node
    pub bindings: IdentityBindings,
}

impl ValidatedPlan {
    /// Number of ranks
    #[must_use]
    pub fn rank_count(&self) -> usize {
        self.ranks.len()
    }

    /// Rank a node belongs to
    #[must_use]
    pub fn rank_of(&self, id: &NodeId) -> Option<usize> {
        self.ranks.iter().position(|rank| rank.contains(id))
    }
}

impl Plan {
    /// Empty plan
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty plan seeded with an existing build history
    #[must_use]
    pub fn with_builds(builds: BuildLedger) -> Self {
        Self {
            builds,
            ..Self::default()
        }
    }

    /// Add a node.
    ///
    /// # Errors
    /// - `DuplicateId` if a node with the same id exists
    /// - `DanglingReference` if `depends_on` or any structural/output
    ///   reference names a node not yet in the plan
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, ValidationError> {
        if self.index.contains_key(&node.id) {
            return Err(ValidationError::DuplicateId(node.id));
        }
        for reference in node.references() {
            if !self.index.contains_key(&reference.target) {
                return Err(ValidationError::DanglingReference {
                    node: node.id.clone(),
                    reference: reference.target,
                });
            }
        }

        let slot = self.nodes.len();
        self.graph.add_node(slot);
        for dependency in node.ordering_dependencies() {
            if let Some(&dep) = self.index.get(&dependency) {
                self.graph.add_edge(dep, slot);
            }
        }

        let id = node.id.clone();
        tracing::trace!(node = %id, kind = %node.kind(), "node added");
        self.index.insert(id.clone(), slot);
        self.nodes.push(node);
        Ok(id)
    }

    /// Make `node` wait for `on`, both already in the plan.
    ///
    /// This is the only way to introduce an edge after both endpoints exist,
    /// so it is also the only way a plan can end up cyclic; `validate`
    /// reports such cycles.
    ///
    /// # Errors
    /// - `DanglingReference` if either id is unknown
    /// - `CycleDetected` for a self-dependency
    pub fn add_dependency(&mut self, node: &NodeId, on: &NodeId) -> Result<(), ValidationError> {
        let from = self.slot(node)?;
        let to = self
            .index
            .get(on)
            .copied()
            .ok_or_else(|| ValidationError::DanglingReference {
                node: node.clone(),
                reference: on.clone(),
            })?;
        if from == to {
            return Err(ValidationError::CycleDetected {
                cycle: vec![node.clone()],
            });
        }
        self.nodes[from].depends_on.insert(on.clone());
        self.graph.add_edge(to, from);
        Ok(())
    }

    fn slot(&self, id: &NodeId) -> Result<Slot, ValidationError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| ValidationError::DanglingReference {
                node: id.clone(),
                reference: id.clone(),
            })
    }

    /// Register a secret that env bindings may reference by name.
    pub fn add_secret(&mut self, secret: Secret) {
        tracing::debug!(secret = %secret.name, "secret registered");
        self.secrets.insert(secret);
    }

    /// Registered secrets
    #[must_use]
    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    /// Build history
    #[must_use]
    pub fn builds(&self) -> &BuildLedger {
        &self.builds
    }

    /// Mutable build history, for recording run transitions
    pub fn builds_mut(&mut self) -> &mut BuildLedger {
        &mut self.builds
    }

    /// Look up a node
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&slot| &self.nodes[slot])
    }

    /// Whether a node exists
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + Clone {
        self.nodes.iter()
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for an empty plan
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of ordering edges
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct ordering dependencies of a node
    #[must_use]
    pub fn dependencies_of(&self, id: &NodeId) -> BTreeSet<NodeId> {
        self.index.get(id).map_or_else(BTreeSet::new, |&slot| {
            self.graph
                .dependencies(slot)
                .map(|dep| self.nodes[dep].id.clone())
                .collect()
        })
    }

    /// Every node that transitively waits for `id`
    #[must_use]
    pub fn dependents_of(&self, id: &NodeId) -> BTreeSet<NodeId> {
        self.index.get(id).map_or_else(BTreeSet::new, |&slot| {
            self.graph
                .descendants(slot)
                .into_iter()
                .map(|s| self.nodes[s].id.clone())
                .collect()
        })
    }

    /// Whether `node` directly waits for `on`
    #[must_use]
    pub fn has_dependency(&self, node: &NodeId, on: &NodeId) -> bool {
        match (self.index.get(node), self.index.get(on)) {
            (Some(&n), Some(&o)) => self.graph.contains_edge(o, n),
            _ => false,
        }
    }

    /// Grants for every compute node in the plan
    #[must_use]
    pub fn bindings(&self) -> IdentityBindings {
        IdentityBinder::bind(self.nodes.iter())
    }

    /// Topological order and ranks, checking only for cycles.
    ///
    /// # Errors
    /// `CycleDetected` naming the members of a cycle.
    pub fn ordering(&self) -> Result<(Vec<NodeId>, Vec<Vec<NodeId>>), ValidationError> {
        let order = self.graph.topological_order().map_err(|cycle| {
            ValidationError::CycleDetected {
                cycle: cycle.into_iter().map(|s| self.nodes[s].id.clone()).collect(),
            }
        })?;

        let ranks = self
            .graph
            .ranks(&order)
            .into_iter()
            .map(|rank| {
                let mut ids: Vec<NodeId> = rank.into_iter().map(|s| self.nodes[s].id.clone()).collect();
                ids.sort();
                ids
            })
            .collect();
        let order = order.into_iter().map(|s| self.nodes[s].id.clone()).collect();
        Ok((order, ranks))
    }

    /// Validate the whole plan.
    ///
    /// Checks, in order: cycles, build ledger integrity, reference kinds,
    /// controller concurrency, env bindings and secrets, the build-before-run
    /// precondition, and identity sharing across job families. Never talks
    /// to a provider.
    ///
    /// # Errors
    /// The first `ValidationError` found, walking nodes in topological order.
    pub fn validate(&self) -> Result<ValidatedPlan, ValidationError> {
        let (order, ranks) = self.ordering()?;
        self.builds.check_integrity()?;

        for id in &order {
            let node = &self.nodes[self.slot(id)?];
            self.check_reference_kinds(node)?;
            self.check_controller(node)?;
            self.check_env(node)?;
            self.check_build_precondition(node)?;
        }
        self.check_identity_sharing()?;

        let bindings = self.bindings();
        tracing::debug!(
            nodes = self.nodes.len(),
            ranks = ranks.len(),
            grants = bindings.len(),
            "plan validated"
        );
        Ok(ValidatedPlan {
            order,
            ranks,
            bindings,
        })
    }

    fn check_reference_kinds(&self, node: &Node) -> Result<(), ValidationError> {
        for reference in node.references() {
            let Some(expected) = reference.role.expected_kind() else {
                continue;
            };
            let target = self
                .get(&reference.target)
                .ok_or_else(|| ValidationError::DanglingReference {
                    node: node.id.clone(),
                    reference: reference.target.clone(),
                })?;
            if target.kind() != expected {
                return Err(ValidationError::KindMismatch {
                    node: node.id.clone(),
                    reference: reference.target,
                    expected,
                    found: target.kind(),
                });
            }
        }
        Ok(())
    }

    fn check_controller(&self, node: &Node) -> Result<(), ValidationError> {
        if let NodeSpec::Controller(ctrl) = &node.spec {
            if ctrl.concurrency != 1 {
                return Err(ValidationError::UnsupportedConcurrency {
                    node: node.id.clone(),
                    requested: ctrl.concurrency,
                });
            }
        }
        Ok(())
    }

    fn check_env(&self, node: &Node) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for binding in node.env() {
            if !seen.insert(binding.name.as_str()) {
                return Err(ValidationError::DuplicateEnv {
                    node: node.id.clone(),
                    name: binding.name.clone(),
                });
            }
            match &binding.value {
                EnvValue::Secret(secret) if !self.secrets.contains(&secret.name) => {
                    return Err(ValidationError::UnknownSecret {
                        node: node.id.clone(),
                        secret: secret.name.clone(),
                    });
                }
                EnvValue::Literal(value) if self.secrets.leaks_into(value) => {
                    return Err(ValidationError::SecretEmbeddedAsLiteral {
                        node: node.id.clone(),
                        name: binding.name.clone(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_build_precondition(&self, node: &Node) -> Result<(), ValidationError> {
        if node.kind() != NodeKind::RunnerJob {
            return Ok(());
        }
        for reference in node.references() {
            if reference.role == ReferenceRole::BuildImage
                && self.builds.last_successful(&reference.target).is_none()
            {
                return Err(ValidationError::BuildPreconditionUnmet {
                    runner: node.id.clone(),
                    build: reference.target,
                });
            }
        }
        Ok(())
    }

    fn check_identity_sharing(&self) -> Result<(), ValidationError> {
        let mut runners: BTreeMap<&NodeId, &NodeId> = BTreeMap::new();
        for node in self.nodes.iter().filter(|n| n.kind() == NodeKind::RunnerJob) {
            if let Some(identity) = node.identity_ref() {
                runners.entry(identity).or_insert(&node.id);
            }
        }
        for node in self.nodes.iter().filter(|n| n.kind() == NodeKind::Controller) {
            if let Some(identity) = node.identity_ref() {
                if let Some(runner) = runners.get(identity) {
                    return Err(ValidationError::SharedIdentity {
                        identity: identity.clone(),
                        runner: (*runner).clone(),
                        controller: node.id.clone(),
                    });
                }
            }
        }

        for node in &self.nodes {
            let (Some(expected), Some(identity)) = (node.kind().job_family(), node.identity_ref())
            else {
                continue;
            };
            let Some(NodeSpec::Identity(spec)) = self.get(identity).map(|n| &n.spec) else {
                continue;
            };
            let found = spec.family;
            if found != expected {
                return Err(ValidationError::IdentityFamilyMismatch {
                    node: node.id.clone(),
                    identity: identity.clone(),
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Image a node should run: the literal reference, or the image of the
    /// last successful run of the referenced build.
    #[must_use]
    pub fn resolve_image(&self, image: &ImageRef) -> Option<String> {
        match image {
            ImageRef::Literal(image) => Some(image.clone()),
            ImageRef::LatestBuild(build) => self.builds.latest_image(build).map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{
        BuildSpec, ContextKey, ContextSpec, ControllerSpec, EnvBinding, JobSpec, RegistryTarget,
    };
    use crate::secret::SecretValue;
    use crate::types::JobFamily;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn base_plan() -> Plan {
        let mut plan = Plan::new();
        plan.add_node(Node::context(id("ctx"), ContextSpec::new([ContextKey::Region])))
            .unwrap();
        plan.add_node(Node::identity(id("identity-runner"), JobFamily::Runner).depends_on(id("ctx")))
            .unwrap();
        plan.add_node(Node::identity(id("identity-ctrl"), JobFamily::Autoscaler).depends_on(id("ctx")))
            .unwrap();
        plan.add_node(Node::log_sink(id("logsink"), JobFamily::Runner).depends_on(id("ctx")))
            .unwrap();
        plan
    }

    fn runner_spec(image: ImageRef) -> JobSpec {
        JobSpec::new(image, id("identity-runner"), id("logsink")).with_context(id("ctx"))
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut plan = base_plan();
        let err = plan
            .add_node(Node::identity(id("identity-runner"), JobFamily::Runner))
            .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateId(id("identity-runner")));
    }

    #[test]
    fn forward_reference_is_dangling() {
        let mut plan = base_plan();
        let node = Node::runner_job(
            id("runner"),
            runner_spec(ImageRef::literal("img")).with_env(EnvBinding::output("X", id("later"), "arn")),
        );
        let err = plan.add_node(node).unwrap_err();
        assert_eq!(err.code(), "dangling-reference");
        assert!(!plan.contains(&id("runner")));
    }

    #[test]
    fn identity_of_wrong_kind_is_mismatch() {
        let mut plan = base_plan();
        plan.add_node(Node::runner_job(
            id("runner"),
            JobSpec::new(ImageRef::literal("img"), id("logsink"), id("logsink")),
        ))
        .unwrap();
        let err = plan.validate().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::KindMismatch {
                expected: NodeKind::Identity,
                found: NodeKind::LogSink,
                ..
            }
        ));
    }

    #[test]
    fn add_dependency_creates_detectable_cycle() {
        let mut plan = base_plan();
        plan.add_node(Node::runner_job(id("runner"), runner_spec(ImageRef::literal("img"))))
            .unwrap();
        plan.add_node(Node::controller(
            id("controller"),
            ControllerSpec::new(
                ImageRef::literal("scaler"),
                id("runner"),
                id("identity-ctrl"),
                id("logsink"),
            ),
        ))
        .unwrap();
        plan.add_dependency(&id("runner"), &id("controller")).unwrap();

        match plan.validate().unwrap_err() {
            ValidationError::CycleDetected { cycle } => {
                assert_eq!(cycle, vec![id("runner"), id("controller")]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn self_dependency_rejected() {
        let mut plan = base_plan();
        let err = plan.add_dependency(&id("ctx"), &id("ctx")).unwrap_err();
        assert_eq!(err.code(), "cycle-detected");
    }

    #[test]
    fn secret_literal_and_unknown_secret() {
        let mut plan = base_plan();
        plan.add_secret(Secret::new("pat", SecretValue::new("ghp_123")));
        plan.add_node(Node::runner_job(
            id("runner"),
            runner_spec(ImageRef::literal("img")).with_env(EnvBinding::literal("TOKEN", "ghp_123")),
        ))
        .unwrap();
        assert_eq!(plan.validate().unwrap_err().code(), "secret-embedded-as-literal");

        let mut plan = base_plan();
        plan.add_node(Node::runner_job(
            id("runner"),
            runner_spec(ImageRef::literal("img")).with_env(EnvBinding::secret("TOKEN", "nope")),
        ))
        .unwrap();
        assert_eq!(plan.validate().unwrap_err().code(), "unknown-secret");
    }

    #[test]
    fn duplicate_env_rejected() {
        let mut plan = base_plan();
        plan.add_node(Node::runner_job(
            id("runner"),
            runner_spec(ImageRef::literal("img"))
                .with_env(EnvBinding::literal("A", "1"))
                .with_env(EnvBinding::literal("A", "2")),
        ))
        .unwrap();
        assert_eq!(plan.validate().unwrap_err().code(), "duplicate-env");
    }

    #[test]
    fn controller_concurrency_must_be_one() {
        let mut plan = base_plan();
        plan.add_node(Node::runner_job(id("runner"), runner_spec(ImageRef::literal("img"))))
            .unwrap();
        let mut spec = ControllerSpec::new(
            ImageRef::literal("scaler"),
            id("runner"),
            id("identity-ctrl"),
            id("logsink"),
        );
        spec.concurrency = 2;
        plan.add_node(Node::controller(id("controller"), spec)).unwrap();
        assert_eq!(plan.validate().unwrap_err().code(), "unsupported-concurrency");
    }

    #[test]
    fn shared_identity_rejected() {
        let mut plan = base_plan();
        plan.add_node(Node::runner_job(id("runner"), runner_spec(ImageRef::literal("img"))))
            .unwrap();
        plan.add_node(Node::controller(
            id("controller"),
            ControllerSpec::new(
                ImageRef::literal("scaler"),
                id("runner"),
                id("identity-runner"),
                id("logsink"),
            ),
        ))
        .unwrap();
        assert_eq!(plan.validate().unwrap_err().code(), "shared-identity");
    }

    fn build_spec(identity: &str) -> BuildSpec {
        BuildSpec {
            job: JobSpec::new(ImageRef::literal("kaniko"), id(identity), id("logsink")),
            dockerfile: "Dockerfile".into(),
            context_url: "git://github.com/example/repo.git".into(),
            target: None,
            destination: RegistryTarget {
                repository: "runner".into(),
                tag: "latest".into(),
            },
        }
    }

    #[test]
    fn build_on_runner_identity_is_family_mismatch() {
        let mut plan = base_plan();
        plan.add_node(Node::build_job(id("build"), build_spec("identity-runner"))).unwrap();
        assert_eq!(
            plan.validate().unwrap_err(),
            ValidationError::IdentityFamilyMismatch {
                node: id("build"),
                identity: id("identity-runner"),
                expected: JobFamily::Builder,
                found: JobFamily::Runner,
            }
        );

        let mut plan = base_plan();
        plan.add_node(Node::identity(id("identity-build"), JobFamily::Builder)).unwrap();
        plan.add_node(Node::build_job(id("build"), build_spec("identity-build"))).unwrap();
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn corrupt_ledger_fails_validation() {
        let mut ledger = BuildLedger::new();
        ledger.record_success(&id("build"), "img:v1").unwrap();
        let mut json = serde_json::to_value(&ledger).unwrap();
        json["runs"]["build"][0]["image"] = serde_json::Value::Null;

        let mut plan = Plan::with_builds(serde_json::from_value(json).unwrap());
        plan.add_node(Node::context(id("ctx"), ContextSpec::new([ContextKey::Region])))
            .unwrap();
        assert_eq!(plan.validate().unwrap_err().code(), "corrupt-build-record");
    }

    #[test]
    fn dependents_are_transitive() {
        let plan = base_plan();
        let deps = plan.dependents_of(&id("ctx"));
        assert!(deps.contains(&id("identity-runner")));
        assert!(deps.contains(&id("logsink")));
        assert!(plan.has_dependency(&id("logsink"), &id("ctx")));
    }
}
