//! Fingerprint command.

use anyhow::Result;
use clap::Args;
use quorum_events::{fingerprint, FingerprintSeed};
use serde::Serialize;

use crate::output::OutputFormat;

/// Computes the fingerprint quorum stores for a receiver or group definition.
///
/// Receivers use their type as the action and the canonical schema JSON as
/// the only tag; groups use their type as the action and member ids as tags.
#[derive(Debug, Args)]
pub struct FingerprintCommand {
    /// Action, the receiver or group type.
    #[arg(long)]
    action: String,

    #[arg(long, default_value = "")]
    description: String,

    #[arg(long)]
    name: String,

    /// Tag, repeatable. Order is significant.
    #[arg(long = "tag")]
    tags: Vec<String>,

    #[arg(long)]
    version: String,
}

#[derive(Debug, Serialize)]
struct FingerprintOutput<'a> {
    fingerprint: String,
    #[serde(flatten)]
    seed: &'a FingerprintSeed,
}

impl FingerprintCommand {
    fn seed(&self) -> FingerprintSeed {
        FingerprintSeed {
            action: self.action.clone(),
            description: self.description.clone(),
            name: self.name.clone(),
            tags: self.tags.clone(),
            version: self.version.clone(),
        }
    }

    fn render(&self, format: OutputFormat) -> Result<String> {
        let seed = self.seed();
        let output = FingerprintOutput {
            fingerprint: fingerprint(&seed),
            seed: &seed,
        };
        Ok(match format {
            OutputFormat::Text => output.fingerprint,
            OutputFormat::Json => serde_json::to_string(&output)?,
            OutputFormat::Yaml => format!("---\n{}", serde_yaml::to_string(&output)?.trim_end()),
        })
    }

    pub fn run(self, format: OutputFormat) -> Result<()> {
        println!("{}", self.render(format)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Cli;
    use clap::Parser;

    #[test]
    fn test_tags_keep_command_line_order() {
        let cli = Cli::try_parse_from([
            "quorumctl",
            "fingerprint",
            "--action",
            "create",
            "--description",
            "build results",
            "--name",
            "build",
            "--tag",
            "a",
            "--tag",
            "b",
            "--version",
            "1.0.0",
        ])
        .unwrap();

        let super::super::Commands::Fingerprint(cmd) = cli.command else {
            panic!("expected fingerprint command");
        };
        assert_eq!(cmd.tags, vec!["a", "b"]);
        assert_eq!(
            fingerprint(&cmd.seed()),
            "4c037734b95564d0224f4394a766b74bcb0a8bd62b1e154cedb356aa9e8862cb"
        );
    }

    #[test]
    fn test_json_output_carries_seed() {
        let cmd = FingerprintCommand {
            action: "gate".to_string(),
            description: String::new(),
            name: "release".to_string(),
            tags: vec!["rcv_1".to_string()],
            version: "1".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&cmd.render(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["fingerprint"], cmd.render(OutputFormat::Text).unwrap());
        assert_eq!(json["name"], "release");
        assert_eq!(json["tags"][0], "rcv_1");
    }
}
