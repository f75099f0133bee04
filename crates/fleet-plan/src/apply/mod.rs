//! Apply / Destroy engine
//!
//! `Applier` only runs plans that pass `Plan::validate`; a rejected plan
//! makes zero provider calls. The walk goes rank by rank:
//!
//! - every node whose dependencies all succeeded is resolved into a
//!   `NodeRequest` and spawned as its own task
//! - within a task: `observe`, then nothing if the fingerprint matches,
//!   otherwise grants first and the node's `create_*` call last
//! - a rank completes when all its tasks finish; dependents of a failed
//!   node are skipped, independent branches continue
//!
//! On timeout the tasks still in flight are detached, not aborted, and the
//! caller gets the outcomes gathered so far.

mod retry;

pub use retry::RetryPolicy;

use crate::adapter::{
    BuildJobRequest, ContextRequest, ControllerRequest, GrantRequest, IdentityRequest, JobRequest,
    LogSinkRequest, NodeRequest, ProviderAdapter, RequestMeta, ResolvedEnv, ResolvedValue,
};
use crate::binder::IdentityBinder;
use crate::error::{ApplyError, ProviderError, ProviderErrorKind};
use crate::node::{EnvBinding, EnvValue, ImageRef, JobSpec, Node, NodeSpec};
use crate::outputs::{NodeOutputs, OutputTable};
use crate::plan::Plan;
use crate::secret::SecretHandle;
use crate::types::{NodeId, NodeKind};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// What happened to one node during a walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum NodeOutcome {
    /// Resource did not exist and was created
    Created,
    /// Resource existed with a different desired state
    Updated,
    /// Resource matched the desired state; no create call was made
    Unchanged,
    /// Resource was deleted (or already absent) during destroy
    Deleted,
    /// The provider rejected an operation
    Failed {
        /// Provider error naming the node
        error: ProviderError,
    },
    /// Not attempted because a dependency did not succeed
    Skipped {
        /// The dependency that blocked this node
        blocked_by: NodeId,
    },
    /// Not finished when the deadline passed
    Pending,
}

impl NodeOutcome {
    /// Created, updated, unchanged or deleted
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Unchanged | Self::Deleted)
    }
}

/// Per-node outcomes and the outputs of every node that succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Ranks of the walk, in walk order
    pub ranks: Vec<Vec<NodeId>>,
    /// Outcome of every node in the plan
    pub outcomes: BTreeMap<NodeId, NodeOutcome>,
    /// Outputs of succeeded nodes
    pub outputs: OutputTable,
    /// Wall time of the walk
    pub elapsed_ms: u64,
}

impl ApplyReport {
    fn new(ranks: Vec<Vec<NodeId>>) -> Self {
        let outcomes = ranks
            .iter()
            .flatten()
            .map(|id| (id.clone(), NodeOutcome::Pending))
            .collect();
        Self {
            ranks,
            outcomes,
            ..Self::default()
        }
    }

    /// Outcome of a node
    #[must_use]
    pub fn outcome(&self, node: &NodeId) -> Option<&NodeOutcome> {
        self.outcomes.get(node)
    }

    fn ids_where(&self, pred: impl Fn(&NodeOutcome) -> bool) -> Vec<&NodeId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(id, _)| id)
            .collect()
    }

    /// Nodes that succeeded
    #[must_use]
    pub fn succeeded(&self) -> Vec<&NodeId> {
        self.ids_where(NodeOutcome::is_success)
    }

    /// Failed nodes with their errors
    #[must_use]
    pub fn failed(&self) -> Vec<(&NodeId, &ProviderError)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                NodeOutcome::Failed { error } => Some((id, error)),
                _ => None,
            })
            .collect()
    }

    /// Nodes skipped because of a failed dependency
    #[must_use]
    pub fn skipped(&self) -> Vec<&NodeId> {
        self.ids_where(|o| matches!(o, NodeOutcome::Skipped { .. }))
    }

    /// Nodes not finished when the deadline passed
    #[must_use]
    pub fn pending(&self) -> Vec<&NodeId> {
        self.ids_where(|o| matches!(o, NodeOutcome::Pending))
    }

    /// Nodes that were created
    #[must_use]
    pub fn created(&self) -> Vec<&NodeId> {
        self.ids_where(|o| matches!(o, NodeOutcome::Created))
    }

    /// True when every node succeeded
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.values().all(NodeOutcome::is_success)
    }

    fn record(&mut self, node: NodeId, outcome: NodeOutcome) {
        self.outcomes.insert(node, outcome);
    }
}

/// Caller-controlled knobs for a walk.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Overall deadline
    pub timeout: Option<Duration>,
    /// Retry schedule for `DependencyNotReady`
    pub retry: RetryPolicy,
}

impl ApplyOptions {
    /// Set the overall deadline
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry schedule
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One node's work, owned so it can move into a task.
struct NodeTask {
    request: NodeRequest,
    grants: Vec<GrantRequest>,
}

type TaskResult = (NodeId, Result<(NodeOutcome, NodeOutputs), ProviderError>);

/// Walks validated plans against a provider adapter.
pub struct Applier {
    adapter: Arc<dyn ProviderAdapter>,
    options: ApplyOptions,
}

impl Applier {
    /// Applier with default options
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            options: ApplyOptions::default(),
        }
    }

    /// Replace options
    #[must_use]
    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Apply a plan.
    ///
    /// # Errors
    /// - `Validation` if the plan is rejected; no provider call was made
    /// - `Partial` if any node failed or was skipped
    /// - `Timeout` if the deadline passed first
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport, ApplyError> {
        let validated = plan.validate()?;
        let started = Instant::now();
        let deadline = self
            .options
            .timeout
            .map(|t| tokio::time::Instant::now() + t);
        let mut report = ApplyReport::new(validated.ranks.clone());

        tracing::info!(
            provider = %self.adapter.provider(),
            nodes = plan.len(),
            ranks = validated.ranks.len(),
            "apply started"
        );

        let secrets = match with_deadline(deadline, self.put_secrets(plan)).await {
            Some(secrets) => secrets,
            None => return Err(self.timed_out(plan, report, started)),
        };

        for (rank, ids) in validated.ranks.iter().enumerate() {
            let mut in_flight = FuturesUnordered::new();

            for id in ids {
                let Some(node) = plan.get(id) else { continue };
                if let Some(blocked_by) = blocking_dependency(plan, &report, id) {
                    tracing::warn!(node = %id, blocked_by = %blocked_by, "skipped; dependency did not succeed");
                    report.record(id.clone(), NodeOutcome::Skipped { blocked_by });
                    continue;
                }

                let task = match prepare(plan, node, &report.outputs, &secrets) {
                    Ok(task) => task,
                    Err(error) => {
                        tracing::error!(node = %id, error = %error, "cannot resolve node");
                        report.record(id.clone(), NodeOutcome::Failed { error });
                        continue;
                    }
                };

                let span = tracing::info_span!("apply_node", node = %id, kind = %node.kind(), rank);
                let handle = tokio::spawn(
                    run_node(self.adapter.clone(), task, self.options.retry).instrument(span),
                );
                let id = id.clone();
                in_flight.push(handle.map(move |joined| match joined {
                    Ok(result) => result,
                    Err(join) => (
                        id.clone(),
                        Err(ProviderError::new(
                            id,
                            ProviderErrorKind::Transport,
                            format!("apply task aborted: {join}"),
                        )),
                    ),
                }));
            }

            while !in_flight.is_empty() {
                let Some(next) = with_deadline(deadline, in_flight.next()).await else {
                    return Err(self.timed_out(plan, report, started));
                };
                let Some((id, result)) = next else { break };
                match result {
                    Ok((outcome, outputs)) => {
                        report.outputs.insert(id.clone(), outputs);
                        report.record(id, outcome);
                    }
                    Err(error) => {
                        tracing::error!(node = %id, error = %error, "node failed");
                        report.record(id, NodeOutcome::Failed { error });
                    }
                }
            }
        }

        report.outputs.redact(plan.secrets());
        report.elapsed_ms = elapsed_ms(started);

        if report.is_complete() {
            tracing::info!(
                created = report.created().len(),
                nodes = report.outcomes.len(),
                elapsed_ms = report.elapsed_ms,
                "apply complete"
            );
            Ok(report)
        } else {
            tracing::warn!(
                succeeded = report.succeeded().len(),
                failed = report.failed().len(),
                skipped = report.skipped().len(),
                "apply finished with failures"
            );
            Err(ApplyError::Partial(Box::new(report)))
        }
    }

    async fn put_secrets(&self, plan: &Plan) -> BTreeMap<String, Result<SecretHandle, ProviderError>> {
        let referenced: BTreeSet<&str> = plan
            .nodes()
            .flat_map(Node::env)
            .filter_map(|binding| match &binding.value {
                EnvValue::Secret(secret) => Some(secret.name.as_str()),
                _ => None,
            })
            .collect();

        let mut handles = BTreeMap::new();
        for name in referenced {
            let Some(secret) = plan.secrets().get(name) else { continue };
            let result = self.adapter.put_secret(secret).await;
            match &result {
                Ok(handle) => tracing::debug!(secret = %name, reference = %handle.reference, "secret stored"),
                Err(err) => tracing::error!(secret = %name, error = %err, "cannot store secret"),
            }
            handles.insert(name.to_string(), result);
        }
        handles
    }

    fn timed_out(&self, plan: &Plan, mut report: ApplyReport, started: Instant) -> ApplyError {
        report.outputs.redact(plan.secrets());
        report.elapsed_ms = elapsed_ms(started);
        tracing::warn!(
            elapsed_ms = report.elapsed_ms,
            pending = report.pending().len(),
            "deadline passed; in-flight provider calls left running"
        );
        ApplyError::Timeout {
            elapsed_ms: report.elapsed_ms,
            report: Box::new(report),
        }
    }

    /// Destroy every node in reverse dependency order.
    ///
    /// A node is only destroyed once everything that depends on it is gone.
    /// Resources already absent count as deleted.
    ///
    /// # Errors
    /// - `Validation` if the plan has a cycle
    /// - `Partial` if any node could not be deleted
    /// - `Timeout` if the deadline passed first
    pub async fn destroy(&self, plan: &Plan) -> Result<ApplyReport, ApplyError> {
        let (_, ranks) = plan.ordering()?;
        let started = Instant::now();
        let deadline = self
            .options
            .timeout
            .map(|t| tokio::time::Instant::now() + t);
        let reversed: Vec<Vec<NodeId>> = ranks.into_iter().rev().collect();
        let mut report = ApplyReport::new(reversed.clone());

        tracing::info!(provider = %self.adapter.provider(), nodes = plan.len(), "destroy started");

        for ids in &reversed {
            let mut in_flight = FuturesUnordered::new();
            for id in ids {
                let Some(node) = plan.get(id) else { continue };
                let blocker = direct_dependents(plan, id)
                    .into_iter()
                    .find(|d| !report.outcome(d).is_some_and(NodeOutcome::is_success));
                if let Some(blocked_by) = blocker {
                    report.record(id.clone(), NodeOutcome::Skipped { blocked_by });
                    continue;
                }

                let adapter = self.adapter.clone();
                let retry = self.options.retry;
                let node_id = id.clone();
                let kind = node.kind();
                let span = tracing::info_span!("destroy_node", node = %id, kind = %kind);
                let handle = tokio::spawn(
                    async move {
                        let result = match retry
                            .run(&node_id, "destroy", || adapter.destroy(&node_id, kind))
                            .await
                        {
                            Ok(()) => {
                                tracing::info!("deleted");
                                Ok(())
                            }
                            Err(err) if err.kind == ProviderErrorKind::NotFound => {
                                tracing::debug!("already absent");
                                Ok(())
                            }
                            Err(err) => Err(err),
                        };
                        (node_id, result)
                    }
                    .instrument(span),
                );
                let id = id.clone();
                in_flight.push(handle.map(move |joined| match joined {
                    Ok(result) => result,
                    Err(join) => (
                        id.clone(),
                        Err(ProviderError::new(
                            id,
                            ProviderErrorKind::Transport,
                            format!("destroy task aborted: {join}"),
                        )),
                    ),
                }));
            }

            while !in_flight.is_empty() {
                let Some(next) = with_deadline(deadline, in_flight.next()).await else {
                    return Err(self.timed_out(plan, report, started));
                };
                let Some((id, result)) = next else { break };
                match result {
                    Ok(()) => report.record(id, NodeOutcome::Deleted),
                    Err(error) => {
                        tracing::error!(node = %id, error = %error, "destroy failed");
                        report.record(id, NodeOutcome::Failed { error });
                    }
                }
            }
        }

        report.elapsed_ms = elapsed_ms(started);
        if report.is_complete() {
            tracing::info!(nodes = report.outcomes.len(), "destroy complete");
            Ok(report)
        } else {
            Err(ApplyError::Partial(Box::new(report)))
        }
    }
}

impl Plan {
    /// Apply this plan through `adapter`.
    ///
    /// # Errors
    /// See [`Applier::apply`].
    pub async fn apply(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        options: ApplyOptions,
    ) -> Result<ApplyReport, ApplyError> {
        Applier::new(adapter).with_options(options).apply(self).await
    }

    /// Destroy this plan's resources through `adapter`.
    ///
    /// # Errors
    /// See [`Applier::destroy`].
    pub async fn destroy(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        options: ApplyOptions,
    ) -> Result<ApplyReport, ApplyError> {
        Applier::new(adapter).with_options(options).destroy(self).await
    }
}

async fn with_deadline<F: std::future::Future>(
    deadline: Option<tokio::time::Instant>,
    future: F,
) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn blocking_dependency(plan: &Plan, report: &ApplyReport, id: &NodeId) -> Option<NodeId> {
    plan.dependencies_of(id)
        .into_iter()
        .find(|dep| !report.outcome(dep).is_some_and(NodeOutcome::is_success))
}

fn direct_dependents(plan: &Plan, id: &NodeId) -> Vec<NodeId> {
    plan.nodes()
        .filter(|n| plan.has_dependency(&n.id, id))
        .map(|n| n.id.clone())
        .collect()
}

async fn run_node(adapter: Arc<dyn ProviderAdapter>, task: NodeTask, retry: RetryPolicy) -> TaskResult {
    let NodeTask { request, grants } = task;
    let node = request.meta().node.clone();
    let result = reconcile(adapter.as_ref(), &request, &grants, retry).await;
    (node, result)
}

async fn reconcile(
    adapter: &dyn ProviderAdapter,
    request: &NodeRequest,
    grants: &[GrantRequest],
    retry: RetryPolicy,
) -> Result<(NodeOutcome, NodeOutputs), ProviderError> {
    let node = &request.meta().node;
    let kind = request.kind();

    let observed = retry.run(node, "observe", || adapter.observe(node, kind)).await?;
    if let Some(observed) = &observed {
        if observed.fingerprint == request.meta().fingerprint {
            tracing::info!("unchanged");
            return Ok((NodeOutcome::Unchanged, observed.outputs.clone()));
        }
    }

    for grant in grants {
        retry
            .run(node, "grant_permission", || adapter.grant_permission(grant))
            .await?;
        tracing::debug!(scope = %grant.grant.scope.node(), "grant attached");
    }

    let outputs = retry.run(node, "create", || adapter.create(request)).await?;
    if observed.is_some() {
        tracing::info!("updated");
        Ok((NodeOutcome::Updated, outputs))
    } else {
        tracing::info!("created");
        Ok((NodeOutcome::Created, outputs))
    }
}

/// Resolve a node into an owned request plus its grants.
fn prepare(
    plan: &Plan,
    node: &Node,
    outputs: &OutputTable,
    secrets: &BTreeMap<String, Result<SecretHandle, ProviderError>>,
) -> Result<NodeTask, ProviderError> {
    let resolver = Resolver {
        plan,
        node,
        outputs,
        secrets,
    };
    let meta = RequestMeta::new(node.id.clone(), node.attributes.clone(), node.labels.clone());

    let request = match &node.spec {
        NodeSpec::ContextLookup(ctx) => NodeRequest::Context(ContextRequest {
            meta,
            lookups: ctx.lookups.clone(),
        }),
        NodeSpec::Identity(identity) => NodeRequest::Identity(IdentityRequest {
            meta,
            family: identity.family,
        }),
        NodeSpec::LogSink(sink) => NodeRequest::LogSink(LogSinkRequest {
            meta,
            family: sink.family,
            retention_days: sink.retention_days,
        }),
        NodeSpec::BuildJob(build) => NodeRequest::BuildJob(BuildJobRequest {
            job: resolver.job(meta, &build.job)?,
            dockerfile: build.dockerfile.clone(),
            context_url: build.context_url.clone(),
            target: build.target.clone(),
            destination: build.destination.clone(),
        }),
        NodeSpec::RunnerJob(job) => NodeRequest::RunnerJob(resolver.job(meta, job)?),
        NodeSpec::Controller(ctrl) => NodeRequest::Controller(ControllerRequest {
            meta,
            image: resolver.image(&ctrl.image)?,
            trigger_target: ctrl.trigger_target.clone(),
            target: resolver.outputs_of(&ctrl.trigger_target)?,
            concurrency: ctrl.concurrency,
            env: resolver.env(&ctrl.env)?,
            resources: ctrl.resources,
            identity: (ctrl.identity.clone(), resolver.outputs_of(&ctrl.identity)?),
            log_sink: (ctrl.log_sink.clone(), resolver.outputs_of(&ctrl.log_sink)?),
            context: ctrl.context.as_ref().and_then(|c| outputs.node(c).cloned()),
        }),
    };

    let grants = match node.identity_ref() {
        Some(identity) => {
            let identity_outputs = resolver.outputs_of(identity)?;
            let mut grants = Vec::new();
            for grant in IdentityBinder::grants_for(node) {
                let scope_kind = plan.get(grant.scope.node()).map(Node::kind).ok_or_else(|| {
                    resolver.error(
                        ProviderErrorKind::NotFound,
                        format!("grant scope '{}' is not in the plan", grant.scope.node()),
                    )
                })?;
                let scope_identity = match plan.get(grant.scope.node()).and_then(Node::identity_ref) {
                    Some(target) if grant.is_trigger_grant() => {
                        Some((target.clone(), resolver.outputs_of(target)?))
                    }
                    _ => None,
                };
                grants.push(GrantRequest {
                    meta: RequestMeta::new(node.id.clone(), BTreeMap::new(), node.labels.clone()),
                    grant,
                    scope_kind,
                    identity: identity_outputs.clone(),
                    scope_identity,
                });
            }
            grants
        }
        None => Vec::new(),
    };

    let request = request.seal(&grants.iter().map(|g| g.grant.clone()).collect::<Vec<_>>())?;
    Ok(NodeTask { request, grants })
}

struct Resolver<'a> {
    plan: &'a Plan,
    node: &'a Node,
    outputs: &'a OutputTable,
    secrets: &'a BTreeMap<String, Result<SecretHandle, ProviderError>>,
}

impl Resolver<'_> {
    fn error(&self, kind: ProviderErrorKind, message: String) -> ProviderError {
        ProviderError::new(self.node.id.clone(), kind, message)
    }

    fn image(&self, image: &ImageRef) -> Result<String, ProviderError> {
        self.plan.resolve_image(image).ok_or_else(|| match image {
            ImageRef::LatestBuild(build) => self.error(
                ProviderErrorKind::NotFound,
                format!("build '{build}' has no successful run"),
            ),
            ImageRef::Literal(_) => self.error(ProviderErrorKind::NotFound, "empty image".into()),
        })
    }

    fn outputs_of(&self, node: &NodeId) -> Result<NodeOutputs, ProviderError> {
        self.outputs.node(node).cloned().ok_or_else(|| {
            self.error(
                ProviderErrorKind::NotFound,
                format!("node '{node}' has no outputs"),
            )
        })
    }

    fn env(&self, bindings: &[EnvBinding]) -> Result<Vec<ResolvedEnv>, ProviderError> {
        bindings
            .iter()
            .map(|binding| {
                let value = match &binding.value {
                    EnvValue::Literal(value) => ResolvedValue::Literal(value.clone()),
                    EnvValue::NodeOutput(output) => self
                        .outputs
                        .resolve(output)
                        .map(|v| ResolvedValue::Literal(v.to_string()))
                        .ok_or_else(|| {
                            self.error(
                                ProviderErrorKind::NotFound,
                                format!("node '{}' did not produce output '{}'", output.node, output.key),
                            )
                        })?,
                    EnvValue::Secret(secret) => match self.secrets.get(&secret.name) {
                        Some(Ok(handle)) => ResolvedValue::Secret(handle.clone()),
                        Some(Err(err)) => {
                            return Err(self.error(
                                err.kind,
                                format!("secret '{}' unavailable: {}", secret.name, err.message),
                            ))
                        }
                        None => {
                            return Err(self.error(
                                ProviderErrorKind::NotFound,
                                format!("secret '{}' was not stored", secret.name),
                            ))
                        }
                    },
                };
                Ok(ResolvedEnv {
                    name: binding.name.clone(),
                    value,
                })
            })
            .collect()
    }

    fn job(&self, meta: RequestMeta, job: &JobSpec) -> Result<JobRequest, ProviderError> {
        Ok(JobRequest {
            meta,
            image: self.image(&job.image)?,
            command: job.command.clone(),
            args: job.args.clone(),
            resources: job.resources,
            env: self.env(&job.env)?,
            volume_mounts: job.volume_mounts.clone(),
            identity: (job.identity.clone(), self.outputs_of(&job.identity)?),
            log_sink: (job.log_sink.clone(), self.outputs_of(&job.log_sink)?),
            context: job.context.as_ref().and_then(|c| self.outputs.node(c).cloned()),
            timeout_secs: job.timeout_secs,
        })
    }
}
