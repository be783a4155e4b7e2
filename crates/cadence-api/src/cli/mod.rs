//! CLI command definitions for the `cadence` binary.
//!
//! Uses clap derive macros for argument parsing. Commands follow a
//! noun-verb pattern (e.g., `cadence definition publish <id>`,
//! `cadence instance show <id>`).

pub mod definition;
pub mod event;
pub mod instance;
pub mod worker;

use std::path::PathBuf;

use anyhow::{Context, Result};
use cadence_types::instance::InstanceStatus;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Run event-driven workflows: publish definitions, start and inspect
/// instances, ingest events, and run the background worker.
#[derive(Parser)]
#[command(name = "cadence", version, about, long_about = None)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding `cadence.db` and `cadence.toml`.
    #[arg(long, global = true, env = "CADENCE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Action types to simulate with the built-in log handler.
    #[arg(
        long = "simulate",
        global = true,
        env = "CADENCE_SIMULATE",
        value_delimiter = ','
    )]
    pub simulate: Vec<String>,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a definition file without storing it.
    Validate {
        /// Path to a YAML or JSON definition.
        file: PathBuf,
    },

    /// Manage workflow definitions (drafts and published versions).
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        action: definition::DefinitionCommand,
    },

    /// Start, inspect, cancel and resume instances.
    #[command(alias = "inst")]
    Instance {
        #[command(subcommand)]
        action: instance::InstanceCommand,
    },

    /// Deliver inbound events.
    Event {
        #[command(subcommand)]
        action: event::EventCommand,
    },

    /// Fire due timers and dispatch due actions once, then exit.
    Tick {
        /// Keep ticking until nothing is due.
        #[arg(long)]
        until_idle: bool,
    },

    /// Run the timer and dispatch loops until interrupted.
    Worker,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared output helpers
// ---------------------------------------------------------------------------

pub(crate) fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("Invalid {what} ID: '{raw}'"))
}

/// Parse an inline JSON argument; `@path` reads the JSON from a file.
pub(crate) fn parse_payload(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read payload file '{path}'"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("Invalid JSON payload")
}

pub(crate) fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    let mut cells: Vec<Cell> = Vec::with_capacity(headers.len());
    for (i, h) in headers.iter().enumerate() {
        let cell = Cell::new(h);
        cells.push(if i == 0 { cell.fg(Color::Cyan) } else { cell });
    }
    table.set_header(cells);
    table
}

pub(crate) fn status_cell(status: InstanceStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        InstanceStatus::Pending => cell.fg(Color::Yellow),
        InstanceStatus::Running => cell.fg(Color::Blue),
        InstanceStatus::Waiting => cell.fg(Color::Magenta),
        InstanceStatus::Completed => cell.fg(Color::Green),
        InstanceStatus::Failed => cell.fg(Color::Red),
        InstanceStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

pub(crate) fn styled_status(status: InstanceStatus) -> console::StyledObject<&'static str> {
    let s = console::style(status.as_str());
    match status {
        InstanceStatus::Pending => s.yellow(),
        InstanceStatus::Running => s.blue(),
        InstanceStatus::Waiting => s.magenta(),
        InstanceStatus::Completed => s.green(),
        InstanceStatus::Failed => s.red(),
        InstanceStatus::Cancelled => s.yellow().dim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate_list() {
        let cli = Cli::try_parse_from(["cadence", "--simulate", "send_email,send_sms", "tick"]).unwrap();
        assert_eq!(cli.simulate, vec!["send_email", "send_sms"]);
        assert!(matches!(cli.command, Commands::Tick { until_idle: false }));
    }

    #[test]
    fn test_subcommand_version_pins_are_arguments() {
        let id = Uuid::now_v7().to_string();
        let cli = Cli::try_parse_from(["cadence", "definition", "show", &id, "--version", "2"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Definition {
                action: definition::DefinitionCommand::Show { version: Some(2), .. }
            }
        ));

        let cli = Cli::try_parse_from([
            "cadence", "instance", "start", &id, "--subject", "lead-1", "--version", "3",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Instance {
                action: instance::InstanceCommand::Start { version: Some(3), .. }
            }
        ));
    }

    #[test]
    fn test_parse_payload_inline_and_default() {
        assert_eq!(parse_payload(None).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_payload(Some(r#"{"score": 91}"#)).unwrap()["score"],
            91
        );
        assert!(parse_payload(Some("{not json")).is_err());
    }

    #[test]
    fn test_parse_payload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.json");
        std::fs::write(&path, r#"{"lead_id": "l-1"}"#).unwrap();
        let arg = format!("@{}", path.display());
        assert_eq!(parse_payload(Some(&arg)).unwrap()["lead_id"], "l-1");
    }

    #[test]
    fn test_short_id() {
        let id = Uuid::now_v7();
        assert_eq!(short_id(&id).len(), 8);
        assert!(parse_id("nope", "instance").is_err());
    }
}
