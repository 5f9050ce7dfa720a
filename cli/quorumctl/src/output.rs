//! Output formatting for CLI commands.

use colored::Colorize;
use quorum_bus::Record;
use quorum_events::Message;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// One human-readable line per record.
    #[default]
    Text,
    /// Compact JSON, one message per line.
    Json,
    /// YAML documents separated by `---`.
    Yaml,
}

/// Renders a watched record.
///
/// Records that are not quorum messages are shown as raw payload text.
pub fn format_record(record: &Record, format: OutputFormat) -> String {
    let Ok(message) = record.decode_json::<Message>() else {
        return format!(
            "{} {}",
            position(record).dimmed(),
            record.payload_str().unwrap_or("<binary payload>")
        );
    };

    match format {
        OutputFormat::Text => format_text(record, &message),
        OutputFormat::Json => message
            .to_json()
            .unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}")),
        OutputFormat::Yaml => match message.to_yaml() {
            Ok(yaml) => format!("---\n{}", yaml.trim_end()),
            Err(e) => format!("# {e}"),
        },
    }
}

fn position(record: &Record) -> String {
    format!("{}/{}@{}", record.topic, record.partition, record.offset)
}

fn format_text(record: &Record, message: &Message) -> String {
    let outcome = if message.success {
        "ok".green()
    } else {
        "failed".red()
    };
    format!(
        "{} {} {} {} {}@{}",
        position(record).dimmed(),
        outcome,
        message.message_type.bold(),
        message.source,
        message.name,
        message.version
    )
}
