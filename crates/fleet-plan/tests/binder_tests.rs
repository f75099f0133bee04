use fleet_plan::{
    Action, ControllerSpec, IdentityBinder, ImageRef, JobFamily, JobSpec, Node, NodeId, Plan,
    ResourceScope, ValidationError,
};
use fleet_test_utils::{id, scenario_a};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn nid(prefix: &str, i: usize) -> NodeId {
    NodeId::new(format!("{prefix}{i}")).unwrap()
}

/// `runners` runner jobs with their own identities, and one controller per
/// entry of `targets`, each triggering `runner{target % runners}`.
fn fleet(runners: usize, targets: &[usize], shared_runner_identity: bool) -> Plan {
    let mut plan = Plan::new();
    plan.add_node(Node::log_sink(id("logs"), JobFamily::Runner)).unwrap();
    for r in 0..runners {
        if !shared_runner_identity || r == 0 {
            plan.add_node(Node::identity(nid("identity-r", r), JobFamily::Runner)).unwrap();
        }
        let identity = if shared_runner_identity { nid("identity-r", 0) } else { nid("identity-r", r) };
        let job = JobSpec::new(ImageRef::literal("runner:1"), identity, id("logs"));
        plan.add_node(Node::runner_job(nid("runner", r), job)).unwrap();
    }
    for (c, target) in targets.iter().enumerate() {
        plan.add_node(Node::identity(nid("identity-c", c), JobFamily::Autoscaler)).unwrap();
        let spec = ControllerSpec::new(
            ImageRef::literal("autoscaler:1"),
            nid("runner", target % runners),
            nid("identity-c", c),
            id("logs"),
        );
        plan.add_node(Node::controller(nid("controller", c), spec)).unwrap();
    }
    plan
}

proptest! {
    #[test]
    fn prop_trigger_grants_never_reach_runner_identities(
        runners in 1..6usize,
        targets in proptest::collection::vec(0..6usize, 0..6),
        shared in any::<bool>(),
    ) {
        let plan = fleet(runners, &targets, shared);
        let bindings = plan.bindings();
        prop_assert!(IdentityBinder::is_asymmetric(plan.nodes(), &bindings));

        for r in 0..runners {
            let identity = if shared { nid("identity-r", 0) } else { nid("identity-r", r) };
            prop_assert!(bindings.for_identity(&identity).iter().all(|g| !g.is_trigger_grant()));
        }
        for (c, target) in targets.iter().enumerate() {
            let trigger: Vec<_> = bindings
                .for_identity(&nid("identity-c", c))
                .iter()
                .filter(|g| g.is_trigger_grant())
                .cloned()
                .collect();
            prop_assert_eq!(trigger.len(), 1);
            prop_assert_eq!(&trigger[0].scope, &ResourceScope::Job(nid("runner", target % runners)));
        }
        prop_assert!(plan.validate().is_ok());
    }
}

#[test]
fn scenario_a_grants() {
    let plan = scenario_a();
    let bindings = plan.bindings();

    let ctrl = bindings.actions_on(&id("identity-ctrl"), &ResourceScope::Job(id("runner")));
    assert_eq!(
        ctrl,
        BTreeSet::from([Action::CreateJob, Action::StartTargetJob, Action::StopTargetJob])
    );
    let runner = bindings.actions_on(&id("identity-runner"), &ResourceScope::Job(id("runner")));
    assert_eq!(runner, BTreeSet::from([Action::StartOwnJob, Action::DescribeOwnJob]));
    assert!(bindings
        .actions_on(&id("identity-runner"), &ResourceScope::Job(id("controller")))
        .is_empty());
}

#[test]
fn identity_shared_between_runner_and_controller_is_rejected() {
    let mut plan = Plan::new();
    plan.add_node(Node::log_sink(id("logs"), JobFamily::Runner)).unwrap();
    plan.add_node(Node::identity(id("shared"), JobFamily::Runner)).unwrap();
    let job = JobSpec::new(ImageRef::literal("runner:1"), id("shared"), id("logs"));
    plan.add_node(Node::runner_job(id("runner"), job)).unwrap();
    let spec = ControllerSpec::new(
        ImageRef::literal("autoscaler:1"),
        id("runner"),
        id("shared"),
        id("logs"),
    );
    plan.add_node(Node::controller(id("controller"), spec)).unwrap();

    assert_eq!(
        plan.validate().unwrap_err(),
        ValidationError::SharedIdentity {
            identity: id("shared"),
            runner: id("runner"),
            controller: id("controller"),
        }
    );
}

#[test]
fn identity_reference_must_be_an_identity() {
    let mut plan = Plan::new();
    plan.add_node(Node::log_sink(id("logs"), JobFamily::Runner)).unwrap();
    let job = JobSpec::new(ImageRef::literal("runner:1"), id("logs"), id("logs"));
    plan.add_node(Node::runner_job(id("runner"), job)).unwrap();
    assert_eq!(plan.validate().unwrap_err().code(), "kind-mismatch");
}

#[test]
fn scenario_a_identities_stay_inside_their_family() {
    let plan = scenario_a();
    let bindings = plan.validate().unwrap().bindings;

    let families = [
        ("identity-build", "build", "logs-build"),
        ("identity-runner", "runner", "logs-runner"),
        ("identity-ctrl", "controller", "logs-ctrl"),
    ];
    for (identity, job, logs) in families {
        let scopes: BTreeSet<_> = bindings
            .for_identity(&id(identity))
            .iter()
            .filter(|g| !g.is_trigger_grant())
            .map(|g| g.scope.clone())
            .collect();
        assert_eq!(
            scopes,
            BTreeSet::from([ResourceScope::Job(id(job)), ResourceScope::LogSink(id(logs))]),
            "{identity}"
        );
    }
    assert!(bindings
        .for_identity(&id("identity-runner"))
        .iter()
        .all(|g| g.scope != ResourceScope::Job(id("build"))));
}

#[test]
fn build_sharing_the_runner_identity_is_rejected() {
    let mut plan = Plan::new();
    plan.add_node(Node::log_sink(id("logs"), JobFamily::Runner)).unwrap();
    plan.add_node(Node::identity(id("identity-runner"), JobFamily::Runner)).unwrap();
    let runner = JobSpec::new(ImageRef::literal("runner:1"), id("identity-runner"), id("logs"));
    plan.add_node(Node::runner_job(id("runner"), runner)).unwrap();
    let build = fleet_plan::BuildSpec {
        job: JobSpec::new(ImageRef::literal("kaniko"), id("identity-runner"), id("logs")),
        dockerfile: "Dockerfile".into(),
        context_url: "git://github.com/example/repo.git".into(),
        target: None,
        destination: fleet_plan::RegistryTarget {
            repository: "runner".into(),
            tag: "latest".into(),
        },
    };
    plan.add_node(Node::build_job(id("build"), build)).unwrap();

    assert_eq!(
        plan.validate().unwrap_err(),
        ValidationError::IdentityFamilyMismatch {
            node: id("build"),
            identity: id("identity-runner"),
            expected: JobFamily::Builder,
            found: JobFamily::Runner,
        }
    );
}
