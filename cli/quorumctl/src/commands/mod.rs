//! CLI commands.

mod fingerprint;
mod watch;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::output::OutputFormat;

/// quorumctl - inspect the quorum message bus.
#[derive(Debug, Parser)]
#[command(name = "quorumctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Tail bus topics, printing quorum messages as they arrive.
    Watch(watch::WatchCommand),

    /// Compute a receiver or group fingerprint.
    Fingerprint(fingerprint::FingerprintCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Watch(cmd) => cmd.run(self.format).await,
            Commands::Fingerprint(cmd) => cmd.run(self.format),
            Commands::Version => {
                println!("quorumctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_format_flag_is_global() {
        let cli = Cli::try_parse_from(["quorumctl", "version", "--format", "yaml"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Yaml);
    }
}
