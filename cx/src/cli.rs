//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Cortexd - autonomous agent runtime
#[derive(Debug, Parser)]
#[command(name = "cx", version, about = "Autonomous agent runtime")]
pub struct Cli {
    /// Path to a config file (falls back to .cortexd.yml, then user config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Run,

    /// Parse, validate and compile a DSL plan file
    Check {
        /// Plan file to check
        file: PathBuf,
    },

    /// Print the canonical hash of a DSL plan file
    Hash {
        /// Plan file to hash
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["cx", "run"]);
        assert!(matches!(cli.command, Command::Run));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_check_with_config() {
        let cli = Cli::parse_from(["cx", "--config", "custom.yml", "check", "plan.dsl"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("custom.yml")));
        match cli.command {
            Command::Check { file } => assert_eq!(file, PathBuf::from("plan.dsl")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
