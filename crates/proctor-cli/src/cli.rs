//! CLI argument definitions for proctor
//!
//! Uses clap for argument parsing. This module defines all subcommands
//! and their options.

use clap::{Args, Parser, Subcommand, ValueEnum};
use proctor_proxy::reload::PolicyAction;
use std::path::PathBuf;

/// proctor - per-session forward proxy for proctored assessments
///
/// Hands every participant session its own proxy port, blocks the hosts
/// on the session's blocklist and reports violations upstream.
#[derive(Parser, Debug)]
#[command(name = "proctor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short = 'c', global = true, default_value = "proctor.toml")]
    pub config: PathBuf,

    /// Lease database, overrides the configuration file
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the gateway and its workers until interrupted
    #[command(after_help = "EXAMPLES:
    # Run with the settings in proctor.toml
    proctor serve

    # Override the gateway port
    proctor serve --config /etc/proctor.toml --port 9000
")]
    Serve(ServeArgs),

    /// Queue a policy notification for running workers
    #[command(after_help = "EXAMPLES:
    # A session's blocklist changed
    proctor notify --session 42

    # Monitoring was toggled for a whole assessment
    proctor notify --assessment final-exam --action monitoring-changed
")]
    Notify(NotifyArgs),

    /// List port leases
    Leases,

    /// Deactivate a session's lease, or delete it to free the port
    Release(ReleaseArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Gateway port, overrides the configuration file
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
}

#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("target").required(true).args(["session", "assessment"])))]
pub struct NotifyArgs {
    /// Target one session
    #[arg(long, value_name = "SESSION_ID")]
    pub session: Option<String>,

    /// Target every session of an assessment
    #[arg(long, value_name = "ASSESSMENT_ID")]
    pub assessment: Option<String>,

    /// What changed
    #[arg(long, value_enum, default_value_t = ActionArg::BlocklistChanged)]
    pub action: ActionArg,
}

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// Session whose lease to release
    #[arg(long, value_name = "SESSION_ID")]
    pub session: String,

    /// Delete the lease and return its port to the pool
    #[arg(long)]
    pub delete: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionArg {
    BlocklistChanged,
    MonitoringChanged,
    Refresh,
}

impl From<ActionArg> for PolicyAction {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::BlocklistChanged => PolicyAction::BlocklistChanged,
            ActionArg::MonitoringChanged => PolicyAction::MonitoringChanged,
            ActionArg::Refresh => PolicyAction::Refresh,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_port_override() {
        let cli = Cli::try_parse_from(["proctor", "serve", "--port", "9000"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("proctor.toml"));
        match cli.command {
            Commands::Serve(args) => assert_eq!(args.port, Some(9000)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_notify_requires_target() {
        assert!(Cli::try_parse_from(["proctor", "notify"]).is_err());
        assert!(Cli::try_parse_from([
            "proctor",
            "notify",
            "--session",
            "s1",
            "--assessment",
            "a1"
        ])
        .is_err());
    }

    #[test]
    fn test_notify_action() {
        let cli = Cli::try_parse_from([
            "proctor",
            "--config",
            "x.toml",
            "notify",
            "--assessment",
            "final",
            "--action",
            "monitoring-changed",
        ])
        .unwrap();
        match cli.command {
            Commands::Notify(args) => {
                assert_eq!(args.assessment.as_deref(), Some("final"));
                assert_eq!(
                    PolicyAction::from(args.action),
                    PolicyAction::MonitoringChanged
                );
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_release_delete_flag() {
        let cli =
            Cli::try_parse_from(["proctor", "release", "--session", "s1", "--delete"]).unwrap();
        match cli.command {
            Commands::Release(args) => {
                assert_eq!(args.session, "s1");
                assert!(args.delete);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
