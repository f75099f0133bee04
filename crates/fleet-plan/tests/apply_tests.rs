use fleet_plan::{
    ApplyError, ApplyOptions, EnvBinding, ImageRef, JobFamily, JobSpec, Node, NodeOutcome, Plan,
    ProviderAdapter, ProviderErrorKind, RetryPolicy, Secret, SecretValue,
};
use fleet_test_utils::{id, rank_names, scenario_a, scenario_b, scenario_c, MockAdapter, Operation, PAT};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn fast_retry() -> ApplyOptions {
    ApplyOptions::default().with_retry(RetryPolicy::new(4, Duration::from_millis(1)))
}

fn adapter() -> (Arc<MockAdapter>, Arc<dyn ProviderAdapter>) {
    let mock = Arc::new(MockAdapter::default());
    let dynamic: Arc<dyn ProviderAdapter> = mock.clone();
    (mock, dynamic)
}

#[tokio::test]
async fn scenario_a_applies_in_four_ranks() {
    let (mock, adapter) = adapter();
    let report = scenario_a().apply(adapter, fast_retry()).await.unwrap();

    assert_eq!(
        rank_names(&report.ranks),
        vec![
            vec!["ctx"],
            vec![
                "identity-build",
                "identity-ctrl",
                "identity-runner",
                "logs-build",
                "logs-ctrl",
                "logs-runner",
            ],
            vec!["build", "runner"],
            vec!["controller"],
        ]
    );
    assert_eq!(report.created().len(), 10);
    assert!(report.is_complete());
    assert_eq!(mock.resource_count(), 10);
    assert_eq!(
        report.outputs.get(&id("controller"), "endpoint"),
        Some("https://controller.mock")
    );
}

#[tokio::test]
async fn output_refs_resolve_from_earlier_ranks() {
    let (mock, adapter) = adapter();
    scenario_a().apply(adapter, fast_retry()).await.unwrap();

    let controller = mock.calls_for(Operation::CreateController);
    assert_eq!(controller.len(), 1);
    assert!(controller[0]
        .detail
        .contains("arn:mock:ecs::task-definition/runner"));

    let runner = mock.calls_for(Operation::CreateRunnerJob);
    assert!(runner[0].detail.contains("mock-region"));
    assert!(runner[0].detail.contains(fleet_test_utils::BUILT_IMAGE));
}

#[tokio::test]
async fn scenario_b_fails_before_any_provider_call() {
    let (mock, adapter) = adapter();
    let err = scenario_b().apply(adapter, fast_retry()).await.unwrap_err();

    match err {
        ApplyError::Validation(err) => assert_eq!(err.code(), "build-precondition-unmet"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn scenario_c_cycle_makes_no_calls() {
    let (mock, adapter) = adapter();
    let err = scenario_c().apply(adapter, fast_retry()).await.unwrap_err();
    assert!(matches!(err, ApplyError::Validation(ref e) if e.code() == "cycle-detected"));
    assert!(err.report().is_none());
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn scenario_d_trigger_grant_denied() {
    let (mock, adapter) = adapter();
    mock.fail("controller", Operation::GrantTrigger, ProviderErrorKind::PermissionDenied);

    let err = scenario_a().apply(adapter, fast_retry()).await.unwrap_err();
    let ApplyError::Partial(report) = err else {
        panic!("expected partial apply");
    };

    let failed = report.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, &id("controller"));
    assert_eq!(failed[0].1.kind, ProviderErrorKind::PermissionDenied);
    assert_eq!(failed[0].1.node, id("controller"));

    assert_eq!(report.outcome(&id("build")), Some(&NodeOutcome::Created));
    assert_eq!(report.outcome(&id("runner")), Some(&NodeOutcome::Created));
    assert!(report.outputs.node(&id("build")).is_some());
    assert!(report.outputs.node(&id("runner")).is_some());
    assert!(report.outputs.node(&id("controller")).is_none());
    assert!(mock.calls_for(Operation::CreateController).is_empty());
}

#[tokio::test]
async fn failure_skips_dependents_and_keeps_independent_branches() {
    let (mock, adapter) = adapter();
    mock.fail("runner", Operation::CreateRunnerJob, ProviderErrorKind::QuotaExceeded);

    let err = scenario_a().apply(adapter, fast_retry()).await.unwrap_err();
    let report = err.report().unwrap();

    assert_eq!(mock.calls_for(Operation::CreateRunnerJob).len(), 1);
    assert_eq!(report.outcome(&id("build")), Some(&NodeOutcome::Created));
    assert_eq!(
        report.outcome(&id("controller")),
        Some(&NodeOutcome::Skipped {
            blocked_by: id("runner")
        })
    );
    assert_eq!(report.succeeded().len(), 8);
}

#[tokio::test]
async fn dependency_not_ready_is_retried() {
    let (mock, adapter) = adapter();
    mock.fail_times(
        "runner",
        Operation::CreateRunnerJob,
        ProviderErrorKind::DependencyNotReady,
        2,
    );

    let report = scenario_a().apply(adapter, fast_retry()).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(mock.calls_for(Operation::CreateRunnerJob).len(), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let (mock, adapter) = adapter();
    mock.fail("logs-runner", Operation::CreateLogSink, ProviderErrorKind::DependencyNotReady);

    let err = scenario_a().apply(adapter, fast_retry()).await.unwrap_err();
    let report = err.report().unwrap();
    let attempts = mock
        .calls_for(Operation::CreateLogSink)
        .into_iter()
        .filter(|c| c.node == Some(id("logs-runner")))
        .count();
    assert_eq!(attempts, 4);
    assert_eq!(report.skipped(), vec![&id("controller"), &id("runner")]);
}

#[tokio::test]
async fn timeout_returns_outcomes_so_far() {
    let (mock, adapter) = adapter();
    mock.delay("runner", Duration::from_secs(5));

    let options = fast_retry().with_timeout(Duration::from_millis(200));
    let err = scenario_a().apply(adapter, options).await.unwrap_err();
    let ApplyError::Timeout { report, .. } = err else {
        panic!("expected timeout");
    };

    assert_eq!(report.outcome(&id("ctx")), Some(&NodeOutcome::Created));
    assert_eq!(report.outcome(&id("runner")), Some(&NodeOutcome::Pending));
    assert_eq!(report.outcome(&id("controller")), Some(&NodeOutcome::Pending));
    assert!(report.pending().len() >= 2);
}

#[tokio::test]
async fn secret_travels_only_by_reference() {
    let (mock, adapter) = adapter();
    let report = scenario_a().apply(adapter, fast_retry()).await.unwrap();

    assert_eq!(mock.calls_for(Operation::PutSecret).len(), 1);
    let transcript = mock.transcript();
    assert!(!transcript.contains(PAT));
    assert!(transcript.contains("mock://secrets/pat"));

    assert!(report.outputs.to_lines().iter().all(|line| !line.contains(PAT)));
    let json = serde_json::to_string(&report).unwrap();
    assert!(!json.contains(PAT));
}

#[tokio::test]
async fn literal_secret_value_is_rejected() {
    let (mock, adapter) = adapter();
    let mut plan = Plan::new();
    plan.add_secret(Secret::new("pat", SecretValue::new(PAT)));
    plan.add_node(Node::identity(id("identity-runner"), JobFamily::Runner)).unwrap();
    plan.add_node(Node::log_sink(id("logs"), JobFamily::Runner)).unwrap();
    let job = JobSpec::new(ImageRef::literal("runner:1"), id("identity-runner"), id("logs"))
        .with_env(EnvBinding::literal("TOKEN", PAT));
    plan.add_node(Node::runner_job(id("runner"), job)).unwrap();

    let err = plan.apply(adapter, fast_retry()).await.unwrap_err();
    assert!(matches!(err, ApplyError::Validation(ref e) if e.code() == "secret-embedded-as-literal"));
    assert!(!err.to_string().contains(PAT));
    assert!(mock.calls().is_empty());
}
