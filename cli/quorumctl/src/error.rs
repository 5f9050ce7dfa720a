//! Error handling and display for the CLI.

use colored::Colorize;
use quorum_bus::BusError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("No brokers configured.")]
    NoBrokers,

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    // Check for specific error types and provide hints
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::NoBrokers => {
                eprintln!(
                    "\n{}",
                    "Hint: Pass --brokers or set KAFKA_BROKERS.".yellow()
                );
            }
            CliError::Bus(bus_err) if bus_err.is_config_error() => {
                eprintln!(
                    "\n{}",
                    "Hint: Check KAFKA_VERSION and KAFKA_SASL_MECHANISM.".yellow()
                );
            }
            CliError::Bus(BusError::Fetch(_)) => {
                eprintln!(
                    "\n{}",
                    "Hint: The broker connection was lost; the watch cannot resume in-process."
                        .yellow()
                );
            }
            _ => {}
        }
    }
}
