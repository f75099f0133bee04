//! Subcommand implementations
//!
//! Every command loads the config and the state file into a [`Workspace`],
//! writes human or JSON output to the given writer, and returns the exit
//! code. Apply and destroy run against the in-memory control plane, whose
//! records are kept in a snapshot file between invocations.

use anyhow::{bail, Context as _, Result};
use fleet_adapters::{adapters_for, dry_run_plane, ResourceRecord};
use fleet_plan::{
    standard_plan, ApplyError, ApplyReport, FleetConfig, NodeId, NodeOutcome, Plan, PlanState,
    ResourceScope,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use ulid::Ulid;

/// Config, state and the files they came from.
pub(crate) struct Workspace {
    config: FleetConfig,
    state: PlanState,
    state_path: PathBuf,
    plane_path: PathBuf,
}

impl Workspace {
    pub(crate) fn load(config: &Path, state: &Path, plane: &Path) -> Result<Self> {
        let config = FleetConfig::from_file(config)
            .with_context(|| format!("loading config {}", config.display()))?;
        let state_data = PlanState::load(state)?;
        if let Some(recorded) = state_data.provider {
            if recorded != config.fleet.provider {
                bail!(
                    "state file {} belongs to provider '{recorded}' but the config selects '{}'",
                    state.display(),
                    config.fleet.provider
                );
            }
        }
        Ok(Self {
            config,
            state: state_data,
            state_path: state.to_path_buf(),
            plane_path: plane.to_path_buf(),
        })
    }

    fn plan(&self) -> Result<Plan> {
        let pat = self.config.pat()?;
        Ok(standard_plan(&self.config, self.state.builds.clone(), pat)?)
    }

    fn save_state(&mut self) -> Result<()> {
        self.state.provider = Some(self.config.fleet.provider);
        self.state.save(&self.state_path)?;
        Ok(())
    }

    fn load_plane(&self) -> Result<Vec<ResourceRecord>> {
        match std::fs::read_to_string(&self.plane_path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("reading plane snapshot {}", self.plane_path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err).with_context(|| format!("reading {}", self.plane_path.display())),
        }
    }

    fn save_plane(&self, records: &[ResourceRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        std::fs::write(&self.plane_path, json)
            .with_context(|| format!("writing {}", self.plane_path.display()))
    }
}

/// Validate the standard plan.
pub(crate) fn validate(ws: &Workspace, out: &mut impl Write) -> Result<ExitCode> {
    let plan = ws.plan()?;
    match plan.validate() {
        Ok(validated) => {
            let grants: usize = validated.bindings.iter().map(|(_, grants)| grants.len()).sum();
            writeln!(
                out,
                "ok: {} nodes in {} ranks, {grants} grants",
                plan.len(),
                validated.rank_count()
            )?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            writeln!(out, "invalid: {err}")?;
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Print the creation ranks.
pub(crate) fn ranks(ws: &Workspace, out: &mut impl Write) -> Result<ExitCode> {
    let validated = ws.plan()?.validate()?;
    for (rank, ids) in validated.ranks.iter().enumerate() {
        let names: Vec<&str> = ids.iter().map(NodeId::as_str).collect();
        writeln!(out, "rank {rank}: {}", names.join(", "))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Print every derived permission grant.
pub(crate) fn grants(ws: &Workspace, out: &mut impl Write) -> Result<ExitCode> {
    let validated = ws.plan()?.validate()?;
    for (identity, grants) in validated.bindings.iter() {
        for grant in grants {
            let actions: Vec<String> = grant.actions.iter().map(ToString::to_string).collect();
            let scope = match &grant.scope {
                ResourceScope::Job(node) => format!("job:{node}"),
                ResourceScope::LogSink(node) => format!("log-sink:{node}"),
            };
            let trigger = if grant.is_trigger_grant() { " [trigger]" } else { "" };
            writeln!(
                out,
                "{identity} (for {}): {} on {scope}{trigger}",
                grant.grantee,
                actions.join(",")
            )?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Walk direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Walk {
    Apply,
    Destroy,
}

/// Apply or destroy the standard plan against the in-memory plane.
pub(crate) async fn walk(ws: &mut Workspace, direction: Walk, json: bool, out: &mut impl Write) -> Result<ExitCode> {
    let plan = ws.plan()?;
    let plane = Arc::new(dry_run_plane().with_records(ws.load_plane()?));
    let adapters = adapters_for(&ws.config, plane.clone())?;
    let options = ws.config.apply_options();

    let result = match direction {
        Walk::Apply => plan.apply(adapters.provider, options).await,
        Walk::Destroy => plan.destroy(adapters.provider, options).await,
    };
    let (mut report, code) = match result {
        Ok(report) => (report, ExitCode::SUCCESS),
        Err(ApplyError::Validation(err)) => return Err(err.into()),
        Err(err) => {
            tracing::error!(error = %err, "walk did not complete");
            let report = match err {
                ApplyError::Partial(report) | ApplyError::Timeout { report, .. } => *report,
                ApplyError::Validation(_) => ApplyReport::default(),
            };
            (report, ExitCode::FAILURE)
        }
    };
    report.outputs.redact(plan.secrets());

    ws.save_plane(&plane.records())?;
    ws.state.absorb(&report);
    ws.save_state()?;
    print_report(&report, json, out)?;
    Ok(code)
}

fn print_report(report: &ApplyReport, json: bool, out: &mut impl Write) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, report)?;
        writeln!(out)?;
        return Ok(());
    }
    for (node, outcome) in &report.outcomes {
        writeln!(out, "{node}: {}", describe(outcome))?;
    }
    for line in report.outputs.to_lines() {
        writeln!(out, "  {line}")?;
    }
    writeln!(out, "finished in {}ms", report.elapsed_ms)?;
    Ok(())
}

fn describe(outcome: &NodeOutcome) -> String {
    match outcome {
        NodeOutcome::Created => "created".to_string(),
        NodeOutcome::Updated => "updated".to_string(),
        NodeOutcome::Unchanged => "unchanged".to_string(),
        NodeOutcome::Deleted => "deleted".to_string(),
        NodeOutcome::Failed { error } => format!("failed: {error}"),
        NodeOutcome::Skipped { blocked_by } => format!("skipped (blocked by {blocked_by})"),
        NodeOutcome::Pending => "pending".to_string(),
    }
}

/// Build-run bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BuildCommand {
    Pending,
    Running(Ulid),
    Succeeded { run: Ulid, image: String },
    Failed { run: Ulid, reason: String },
    List,
}

/// Record a build-run transition for `node` and persist the ledger.
pub(crate) fn build(ws: &mut Workspace, node: &NodeId, command: BuildCommand, out: &mut impl Write) -> Result<ExitCode> {
    let ledger = &mut ws.state.builds;
    match command {
        BuildCommand::Pending => {
            let run = ledger.record_pending(node);
            writeln!(out, "{run}")?;
        }
        BuildCommand::Running(run) => ledger.mark_running(node, run)?,
        BuildCommand::Succeeded { run, image } => ledger.mark_succeeded(node, run, image)?,
        BuildCommand::Failed { run, reason } => ledger.mark_failed(node, run, reason)?,
        BuildCommand::List => {
            for run in ledger.runs(node) {
                let detail = run.image.as_deref().or(run.failure.as_deref()).unwrap_or("");
                writeln!(
                    out,
                    "{} {:<9} {} {detail}",
                    run.run_id,
                    run.status.to_string(),
                    run.created_at.to_rfc3339()
                )?;
            }
            return Ok(ExitCode::SUCCESS);
        }
    }
    ws.save_state()?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAT_ENV: &str = "FLEETCTL_TEST_PAT";
    const PAT: &str = "ghp_cliFixtureTokenNeverPrinted";

    fn workspace(dir: &TempDir, provider: &str) -> Workspace {
        std::env::set_var(PAT_ENV, PAT);
        let config = dir.path().join("fleet.toml");
        std::fs::write(
            &config,
            format!(
                r#"
[fleet]
provider = "{provider}"
name = "gha-runner"

[github]
config_url = "https://github.com/example/repo"
pat_env = "{PAT_ENV}"

[runner]
image = "ghcr.io/actions/actions-runner:latest"

[aws]
region = "eu-north-1"
account_id = "123456789012"

[gcp]
project = "ci-project"
location = "europe-north1"
"#
            ),
        )
        .unwrap();
        Workspace::load(
            &config,
            &dir.path().join("fleet-state.json"),
            &dir.path().join("fleet-plane.json"),
        )
        .unwrap()
    }

    fn text(buf: Vec<u8>) -> String {
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn validate_and_ranks_describe_the_standard_plan() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(&dir, "aws");

        let mut out = Vec::new();
        assert_eq!(validate(&ws, &mut out).unwrap(), ExitCode::SUCCESS);
        assert!(text(out).starts_with("ok: 10 nodes in"));

        let mut out = Vec::new();
        ranks(&ws, &mut out).unwrap();
        let ranks = text(out);
        assert!(ranks.starts_with("rank 0: ctx\n"), "{ranks}");
        assert!(ranks.lines().last().unwrap().ends_with("controller"));
    }

    #[test]
    fn grants_mark_the_controller_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(&dir, "gcp");
        let mut out = Vec::new();
        grants(&ws, &mut out).unwrap();
        let trigger: Vec<String> = text(out).lines().filter(|l| l.contains("[trigger]")).map(str::to_string).collect();
        assert_eq!(trigger.len(), 1);
        assert!(trigger[0].starts_with("identity-ctrl (for controller)"), "{}", trigger[0]);
        assert!(trigger[0].contains("on job:runner"));
    }

    #[tokio::test]
    async fn reapply_reads_the_plane_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(&dir, "aws");

        let mut out = Vec::new();
        assert_eq!(walk(&mut ws, Walk::Apply, false, &mut out).await.unwrap(), ExitCode::SUCCESS);
        let first = text(out);
        assert!(first.contains("runner: created"), "{first}");
        assert!(!first.contains(PAT));

        let mut out = Vec::new();
        walk(&mut ws, Walk::Apply, true, &mut out).await.unwrap();
        let report: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(report["outcomes"]["runner"]["outcome"], "unchanged");

        let snapshot = std::fs::read_to_string(dir.path().join("fleet-plane.json")).unwrap();
        assert!(!snapshot.contains(PAT));
        let records: Vec<ResourceRecord> = serde_json::from_str(&snapshot).unwrap();
        assert!(!records.is_empty());

        let state = PlanState::load(&dir.path().join("fleet-state.json")).unwrap();
        assert!(state.outputs.get(&"runner".parse().unwrap(), "task_definition_arn").is_some());
    }

    #[tokio::test]
    async fn destroy_after_apply_deletes_every_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(&dir, "gcp");
        walk(&mut ws, Walk::Apply, false, &mut Vec::new()).await.unwrap();

        let mut out = Vec::new();
        assert_eq!(walk(&mut ws, Walk::Destroy, false, &mut out).await.unwrap(), ExitCode::SUCCESS);
        assert!(text(out).lines().filter(|l| l.ends_with(": deleted")).count() == 10);
        assert!(ws.state.outputs.is_empty());
    }

    #[test]
    fn build_transitions_persist_in_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(&dir, "aws");
        let node: NodeId = "build".parse().unwrap();

        let mut out = Vec::new();
        build(&mut ws, &node, BuildCommand::Pending, &mut out).unwrap();
        let run: Ulid = text(out).trim().parse().unwrap();
        build(&mut ws, &node, BuildCommand::Running(run), &mut Vec::new()).unwrap();
        build(
            &mut ws,
            &node,
            BuildCommand::Succeeded {
                run,
                image: "repo/results:v1".to_string(),
            },
            &mut Vec::new(),
        )
        .unwrap();

        let state = PlanState::load(&dir.path().join("fleet-state.json")).unwrap();
        assert_eq!(state.builds.latest_image(&node), Some("repo/results:v1"));

        let err = build(&mut ws, &node, BuildCommand::Running(run), &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("invalid-build-transition"), "{err}");
    }

    #[test]
    fn state_from_another_provider_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(&dir, "aws");
        ws.save_state().unwrap();

        let config = dir.path().join("fleet.toml");
        let content = std::fs::read_to_string(&config).unwrap().replace("provider = \"aws\"", "provider = \"gcp\"");
        std::fs::write(&config, content).unwrap();
        let err = Workspace::load(
            &config,
            &dir.path().join("fleet-state.json"),
            &dir.path().join("fleet-plane.json"),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("belongs to provider 'aws'"), "{err}");
    }
}
