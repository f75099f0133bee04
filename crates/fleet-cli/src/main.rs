//! `fleetctl` - validate, apply and destroy runner fleet plans

mod commands;

use anyhow::{Context as _, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use commands::{BuildCommand, Walk, Workspace};
use fleet_plan::NodeId;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const DEFAULT_FILTER: &str = "info,fleet=debug";

fn run_id_arg() -> Arg {
    Arg::new("run")
        .required(true)
        .value_parser(value_parser!(Ulid))
        .help("Run id printed by `build pending`")
}

fn cli() -> Command {
    Command::new("fleetctl")
        .version(fleet_plan::VERSION)
        .about("Provision ephemeral GitHub Actions runner fleets")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .default_value("fleet.toml")
                .value_parser(value_parser!(PathBuf))
                .help("Fleet configuration file"),
        )
        .arg(
            Arg::new("state")
                .long("state")
                .global(true)
                .default_value("fleet-state.json")
                .value_parser(value_parser!(PathBuf))
                .help("Outputs and build history kept between runs"),
        )
        .arg(
            Arg::new("plane")
                .long("plane")
                .global(true)
                .default_value("fleet-plane.json")
                .value_parser(value_parser!(PathBuf))
                .help("Snapshot of the in-memory control plane"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("pretty")
                .value_parser(["pretty", "json"])
                .help("Log output format"),
        )
        .subcommand(Command::new("validate").about("Validate the fleet plan"))
        .subcommand(Command::new("ranks").about("Print the creation ranks"))
        .subcommand(Command::new("grants").about("Print derived permission grants"))
        .subcommand(
            Command::new("apply").about("Create or update the fleet").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Print the report as JSON"),
            ),
        )
        .subcommand(
            Command::new("destroy").about("Delete the fleet in reverse order").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Print the report as JSON"),
            ),
        )
        .subcommand(
            Command::new("build")
                .about("Record build-run transitions")
                .subcommand_required(true)
                .arg(
                    Arg::new("node")
                        .long("node")
                        .global(true)
                        .default_value("build")
                        .help("Build node id"),
                )
                .subcommand(Command::new("pending").about("Record a new pending run"))
                .subcommand(Command::new("running").about("Mark a run as running").arg(run_id_arg()))
                .subcommand(
                    Command::new("succeeded")
                        .about("Mark a run as succeeded")
                        .arg(run_id_arg())
                        .arg(
                            Arg::new("image")
                                .long("image")
                                .required(true)
                                .help("Pushed image reference"),
                        ),
                )
                .subcommand(
                    Command::new("failed")
                        .about("Mark a run as failed")
                        .arg(run_id_arg())
                        .arg(
                            Arg::new("reason")
                                .long("reason")
                                .required(true)
                                .help("Failure reason"),
                        ),
                )
                .subcommand(Command::new("list").about("List recorded runs")),
        )
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn path(matches: &ArgMatches, name: &str) -> Result<PathBuf> {
    matches
        .get_one::<PathBuf>(name)
        .cloned()
        .with_context(|| format!("--{name} is required"))
}

fn build_command(matches: &ArgMatches) -> Result<BuildCommand> {
    let run = || {
        matches
            .subcommand()
            .and_then(|(_, args)| args.get_one::<Ulid>("run").copied())
            .context("run id is required")
    };
    let text = |name: &str| {
        matches
            .subcommand()
            .and_then(|(_, args)| args.get_one::<String>(name).cloned())
            .with_context(|| format!("--{name} is required"))
    };
    Ok(match matches.subcommand_name() {
        Some("pending") => BuildCommand::Pending,
        Some("running") => BuildCommand::Running(run()?),
        Some("succeeded") => BuildCommand::Succeeded {
            run: run()?,
            image: text("image")?,
        },
        Some("failed") => BuildCommand::Failed {
            run: run()?,
            reason: text("reason")?,
        },
        _ => BuildCommand::List,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();
    init_tracing(
        matches
            .get_one::<String>("log-format")
            .map_or("pretty", String::as_str),
    );

    let mut ws = Workspace::load(
        &path(&matches, "config")?,
        &path(&matches, "state")?,
        &path(&matches, "plane")?,
    )?;
    let mut out = std::io::stdout().lock();

    match matches.subcommand() {
        Some(("validate", _)) => commands::validate(&ws, &mut out),
        Some(("ranks", _)) => commands::ranks(&ws, &mut out),
        Some(("grants", _)) => commands::grants(&ws, &mut out),
        Some(("apply", args)) => commands::walk(&mut ws, Walk::Apply, args.get_flag("json"), &mut out).await,
        Some(("destroy", args)) => commands::walk(&mut ws, Walk::Destroy, args.get_flag("json"), &mut out).await,
        Some(("build", args)) => {
            let node: NodeId = args
                .get_one::<String>("node")
                .map_or("build", String::as_str)
                .parse()?;
            commands::build(&mut ws, &node, build_command(args)?, &mut out)
        }
        _ => Ok(ExitCode::SUCCESS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn build_subcommands_parse_run_ids() {
        let run = Ulid::new();
        let matches = cli()
            .try_get_matches_from([
                "fleetctl",
                "build",
                "succeeded",
                &run.to_string(),
                "--image",
                "repo/results:v2",
            ])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(
            build_command(args).unwrap(),
            BuildCommand::Succeeded {
                run,
                image: "repo/results:v2".to_string()
            }
        );
    }

    #[test]
    fn malformed_run_id_is_rejected() {
        let result = cli().try_get_matches_from(["fleetctl", "build", "running", "not-a-ulid"]);
        assert!(result.is_err());
    }

    #[test]
    fn global_paths_have_defaults() {
        let matches = cli().try_get_matches_from(["fleetctl", "ranks"]).unwrap();
        assert_eq!(path(&matches, "config").unwrap(), PathBuf::from("fleet.toml"));
        assert_eq!(path(&matches, "plane").unwrap(), PathBuf::from("fleet-plane.json"));
    }
}
