//! Credential / Identity Binder
//!
//! Derives the minimal grant set for every compute node from what the node
//! declares. Every grant is scoped to one specific node's resource; there is
//! no wildcard scope to express.
//!
//! All compute nodes get, on their own resources:
//! - `StartOwnJob`, `DescribeOwnJob` on the node's own job
//! - `WriteOwnLogStream` on the node's log sink
//!
//! Controllers additionally get `CreateJob`, `StartTargetJob` and
//! `StopTargetJob`, scoped to their `trigger_target` runner job only.

use crate::node::{Node, NodeSpec};
use crate::types::{NodeId, NodeKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Abstract action an identity may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Start an execution of the node's own job
    StartOwnJob,
    /// Read status of the node's own executions
    DescribeOwnJob,
    /// Write to the node's own log stream
    WriteOwnLogStream,
    /// Create a new execution of the target job
    CreateJob,
    /// Start the target job
    StartTargetJob,
    /// Stop the target job
    StopTargetJob,
}

impl Action {
    /// Actions only a controller may hold
    pub const TRIGGER: [Action; 3] = [Action::CreateJob, Action::StartTargetJob, Action::StopTargetJob];

    /// Whether this is a controller-only trigger action
    #[inline]
    #[must_use]
    pub fn is_trigger(self) -> bool {
        Self::TRIGGER.contains(&self)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StartOwnJob => "start-own-job",
            Self::DescribeOwnJob => "describe-own-job",
            Self::WriteOwnLogStream => "write-own-log-stream",
            Self::CreateJob => "create-job",
            Self::StartTargetJob => "start-target-job",
            Self::StopTargetJob => "stop-target-job",
        };
        f.write_str(s)
    }
}

/// The single resource a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "node", rename_all = "kebab-case")]
pub enum ResourceScope {
    /// A build or runner job / controller resource
    Job(NodeId),
    /// A log sink
    LogSink(NodeId),
}

impl ResourceScope {
    /// Node whose resource is in scope
    #[must_use]
    pub fn node(&self) -> &NodeId {
        match self {
            Self::Job(id) | Self::LogSink(id) => id,
        }
    }
}

/// A set of actions granted to one identity on one resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Identity receiving the grant
    pub identity: NodeId,
    /// Compute node whose declared needs produced the grant
    pub grantee: NodeId,
    /// Allowed actions
    pub actions: BTreeSet<Action>,
    /// Resource the actions apply to
    pub scope: ResourceScope,
}

impl PermissionGrant {
    fn new(identity: &NodeId, grantee: &NodeId, actions: &[Action], scope: ResourceScope) -> Self {
        Self {
            identity: identity.clone(),
            grantee: grantee.clone(),
            actions: actions.iter().copied().collect(),
            scope,
        }
    }

    /// Whether the grant includes any trigger action
    #[must_use]
    pub fn is_trigger_grant(&self) -> bool {
        self.actions.iter().any(|a| a.is_trigger())
    }

    /// Short stable name, used by adapters for policy/role names
    #[must_use]
    pub fn slug(&self) -> String {
        let scope = match &self.scope {
            ResourceScope::Job(id) => format!("job-{id}"),
            ResourceScope::LogSink(id) => format!("logs-{id}"),
        };
        if self.is_trigger_grant() {
            format!("{}-trigger-{scope}", self.grantee)
        } else {
            format!("{}-{scope}", self.grantee)
        }
    }
}

/// Grants derived for a whole plan, grouped by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBindings {
    by_identity: BTreeMap<NodeId, Vec<PermissionGrant>>,
}

impl IdentityBindings {
    /// Grants held by an identity
    #[must_use]
    pub fn for_identity(&self, identity: &NodeId) -> &[PermissionGrant] {
        self.by_identity.get(identity).map_or(&[], Vec::as_slice)
    }

    /// Grants produced by one compute node
    #[must_use]
    pub fn for_grantee(&self, grantee: &NodeId) -> Vec<PermissionGrant> {
        self.by_identity
            .values()
            .flatten()
            .filter(|g| &g.grantee == grantee)
            .cloned()
            .collect()
    }

    /// Actions an identity holds on a scope
    #[must_use]
    pub fn actions_on(&self, identity: &NodeId, scope: &ResourceScope) -> BTreeSet<Action> {
        self.for_identity(identity)
            .iter()
            .filter(|g| &g.scope == scope)
            .flat_map(|g| g.actions.iter().copied())
            .collect()
    }

    /// Iterate `(identity, grants)` in id order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &[PermissionGrant])> {
        self.by_identity.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Total number of grants
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_identity.values().map(Vec::len).sum()
    }

    /// True when no grants were derived
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Derives least-privilege grants from node specs.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityBinder;

impl IdentityBinder {
    /// Grants required by a single node; empty for non-compute nodes.
    #[must_use]
    pub fn grants_for(node: &Node) -> Vec<PermissionGrant> {
        let (Some(identity), Some(sink)) = (node.identity_ref(), node.log_sink_ref()) else {
            return Vec::new();
        };

        let mut grants = vec![
            PermissionGrant::new(
                identity,
                &node.id,
                &[Action::StartOwnJob, Action::DescribeOwnJob],
                ResourceScope::Job(node.id.clone()),
            ),
            PermissionGrant::new(
                identity,
                &node.id,
                &[Action::WriteOwnLogStream],
                ResourceScope::LogSink(sink.clone()),
            ),
        ];

        if let NodeSpec::Controller(ctrl) = &node.spec {
            grants.push(PermissionGrant::new(
                identity,
                &node.id,
                &Action::TRIGGER,
                ResourceScope::Job(ctrl.trigger_target.clone()),
            ));
        }
        grants
    }

    /// Grants for every compute node in `nodes`, grouped by identity.
    pub fn bind<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> IdentityBindings {
        let mut by_identity: BTreeMap<NodeId, Vec<PermissionGrant>> = BTreeMap::new();
        for node in nodes {
            if !node.kind().is_compute() {
                continue;
            }
            for grant in Self::grants_for(node) {
                by_identity.entry(grant.identity.clone()).or_default().push(grant);
            }
        }
        for grants in by_identity.values_mut() {
            grants.sort();
            grants.dedup();
        }
        IdentityBindings { by_identity }
    }

    /// True if no identity used by a runner job holds a trigger action, and
    /// every trigger grant is scoped to its controller's own target.
    pub fn is_asymmetric<'a>(
        nodes: impl IntoIterator<Item = &'a Node> + Clone,
        bindings: &IdentityBindings,
    ) -> bool {
        let runner_identities: BTreeSet<&NodeId> = nodes
            .clone()
            .into_iter()
            .filter(|n| n.kind() == NodeKind::RunnerJob)
            .filter_map(Node::identity_ref)
            .collect();

        let targets: BTreeMap<&NodeId, &NodeId> = nodes
            .into_iter()
            .filter_map(|n| match &n.spec {
                NodeSpec::Controller(ctrl) => Some((&n.id, &ctrl.trigger_target)),
                _ => None,
            })
            .collect();

        bindings.iter().all(|(identity, grants)| {
            grants.iter().filter(|g| g.is_trigger_grant()).all(|g| {
                !runner_identities.contains(identity)
                    && targets.get(&g.grantee) == Some(&g.scope.node())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ControllerSpec, ImageRef, JobSpec};

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn runner() -> Node {
        Node::runner_job(
            id("runner"),
            JobSpec::new(ImageRef::literal("runner:1"), id("identity-runner"), id("logs")),
        )
    }

    fn controller() -> Node {
        Node::controller(
            id("controller"),
            ControllerSpec::new(
                ImageRef::literal("autoscaler:1"),
                id("runner"),
                id("identity-ctrl"),
                id("logs"),
            ),
        )
    }

    #[test]
    fn runner_gets_only_own_grants() {
        let grants = IdentityBinder::grants_for(&runner());
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().all(|g| !g.is_trigger_grant()));
        assert!(grants
            .iter()
            .any(|g| g.scope == ResourceScope::Job(id("runner"))));
    }

    #[test]
    fn controller_trigger_grant_is_scoped_to_target() {
        let grants = IdentityBinder::grants_for(&controller());
        let trigger: Vec<_> = grants.iter().filter(|g| g.is_trigger_grant()).collect();
        assert_eq!(trigger.len(), 1);
        assert_eq!(trigger[0].scope, ResourceScope::Job(id("runner")));
        assert_eq!(trigger[0].actions.len(), 3);
        assert_eq!(trigger[0].slug(), "controller-trigger-job-runner");
    }

    #[test]
    fn bind_groups_by_identity() {
        let nodes = [runner(), controller()];
        let bindings = IdentityBinder::bind(nodes.iter());
        assert_eq!(bindings.for_identity(&id("identity-runner")).len(), 2);
        assert_eq!(bindings.for_identity(&id("identity-ctrl")).len(), 3);
        assert!(bindings
            .actions_on(&id("identity-runner"), &ResourceScope::Job(id("runner")))
            .iter()
            .all(|a| !a.is_trigger()));
        assert!(IdentityBinder::is_asymmetric(nodes.iter(), &bindings));
    }

    #[test]
    fn shared_identity_breaks_asymmetry() {
        let mut ctrl = controller();
        if let NodeSpec::Controller(spec) = &mut ctrl.spec {
            spec.identity = id("identity-runner");
        }
        let nodes = [runner(), ctrl];
        let bindings = IdentityBinder::bind(nodes.iter());
        assert!(!IdentityBinder::is_asymmetric(nodes.iter(), &bindings));
    }

    #[test]
    fn non_compute_nodes_get_nothing() {
        let sink = Node::log_sink(id("logs"), crate::types::JobFamily::Runner);
        assert!(IdentityBinder::grants_for(&sink).is_empty());
    }
}
