//! CLI argument parsing using Clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// exthost - run editor-style extensions in isolated worker processes
#[derive(Parser, Debug)]
#[command(name = "exthost")]
#[command(version, about, long_about = None)]
#[command(after_help = "Examples:
  exthost list                                     Show discovered extensions
  exthost run --exec hello.world --arg '\"bob\"'     Run one command and exit
  exthost run --event onStartup                    Broadcast an event and exit
  exthost check-permission 'git status'            Explain a permission decision
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the host, spawn every extension, and optionally run a command
    Run {
        /// Directory containing one subdirectory per extension
        #[arg(long, env = "EXTHOST_EXTENSIONS_DIR")]
        extensions_dir: Option<PathBuf>,

        /// Activate these extensions right after spawning (repeatable)
        #[arg(long = "activate", value_name = "ID")]
        activate: Vec<String>,

        /// Command to execute once the host is up
        #[arg(long, value_name = "COMMAND")]
        exec: Option<String>,

        /// JSON argument for --exec (repeatable, in order)
        #[arg(long = "arg", value_name = "JSON", requires = "exec")]
        args: Vec<String>,

        /// Event to broadcast to every worker
        #[arg(long, value_name = "NAME")]
        event: Option<String>,

        /// JSON payload for --event
        #[arg(long, value_name = "JSON", requires = "event")]
        payload: Option<String>,
    },

    /// List discovered extensions as JSON
    List {
        /// Directory containing one subdirectory per extension
        #[arg(long, env = "EXTHOST_EXTENSIONS_DIR")]
        extensions_dir: Option<PathBuf>,
    },

    /// Evaluate a command string against the configured permission policy
    CheckPermission {
        /// Command string, e.g. "git status"
        command: String,
    },

    /// Worker process entry point (spawned by the host)
    #[command(hide = true)]
    Worker,
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn parse_run_with_exec_and_args() {
        let cli = Cli::parse_from([
            "exthost",
            "run",
            "--extensions-dir",
            "/tmp/exts",
            "--activate",
            "a",
            "--activate",
            "b",
            "--exec",
            "hello.world",
            "--arg",
            "1",
            "--arg",
            "\"two\"",
        ]);
        match cli.command {
            Commands::Run {
                extensions_dir,
                activate,
                exec,
                args,
                event,
                payload,
            } => {
                assert_eq!(extensions_dir, Some(PathBuf::from("/tmp/exts")));
                assert_eq!(activate, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(exec.as_deref(), Some("hello.world"));
                assert_eq!(args, vec!["1".to_string(), "\"two\"".to_string()]);
                assert!(event.is_none());
                assert!(payload.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn arg_requires_exec() {
        assert!(Cli::try_parse_from(["exthost", "run", "--arg", "1"]).is_err());
    }

    #[test]
    fn parse_check_permission_and_worker() {
        let cli = Cli::parse_from(["exthost", "check-permission", "git status"]);
        assert!(matches!(cli.command, Commands::CheckPermission { command } if command == "git status"));
        let cli = Cli::parse_from(["exthost", "worker"]);
        assert!(matches!(cli.command, Commands::Worker));
    }
}
