//! CLI event ingestion.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Subcommand;
use console::style;
use uuid::Uuid;

use cadence_core::workflow::IngestOutcome;
use cadence_types::event::InboundEvent;

use super::{parse_id, parse_payload, print_json, short_id};
use crate::state::AppState;

/// Event subcommands.
#[derive(Subcommand)]
pub enum EventCommand {
    /// Route an event to triggers or to a waiting instance.
    Ingest {
        /// Read the whole event as JSON from a file.
        #[arg(long, conflicts_with_all = ["event_type", "subject", "payload", "instance"])]
        file: Option<PathBuf>,

        /// Event type (e.g. `lead.created`).
        #[arg(long = "type")]
        event_type: Option<String>,

        /// Subject the event concerns.
        #[arg(long)]
        subject: Option<String>,

        /// Event payload as JSON (or @file).
        #[arg(long)]
        payload: Option<String>,

        /// Event ID used for deduplication (generated when omitted).
        #[arg(long)]
        id: Option<String>,

        /// Target a specific instance instead of the trigger registry.
        #[arg(long)]
        instance: Option<String>,
    },
}

/// Handle an event subcommand.
pub async fn handle_event_command(cmd: EventCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        EventCommand::Ingest {
            file,
            event_type,
            subject,
            payload,
            id,
            instance,
        } => {
            let event = match file {
                Some(path) => read_event(&path, id).await?,
                None => build_event(event_type, subject, payload.as_deref(), id, instance.as_deref())?,
            };
            handle_ingest(event, state, json).await
        }
    }
}

async fn read_event(path: &Path, id: Option<String>) -> Result<InboundEvent> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read event file {}", path.display()))?;
    let mut event: InboundEvent =
        serde_json::from_str(&text).with_context(|| format!("Invalid event in {}", path.display()))?;
    if let Some(id) = id {
        event.id = id;
    }
    Ok(event)
}

fn build_event(
    event_type: Option<String>,
    subject: Option<String>,
    payload: Option<&str>,
    id: Option<String>,
    instance: Option<&str>,
) -> Result<InboundEvent> {
    let Some(event_type) = event_type else {
        bail!("Either --file or --type is required");
    };
    Ok(InboundEvent {
        id: id.unwrap_or_else(|| Uuid::now_v7().to_string()),
        event_type,
        subject_id: subject,
        instance_id: instance.map(|i| parse_id(i, "instance")).transpose()?,
        payload: parse_payload(payload)?,
        occurred_at: Utc::now(),
    })
}

async fn handle_ingest(event: InboundEvent, state: &AppState, json: bool) -> Result<()> {
    state.recover().await?;

    let event_id = event.id.clone();
    let event_type = event.event_type.clone();
    let outcome = state
        .engine
        .ingest_event(event)
        .await
        .with_context(|| format!("Failed to ingest event '{event_id}'"))?;

    if json {
        return print_json(&outcome);
    }

    println!();
    match &outcome {
        IngestOutcome::Started { instance_ids } => {
            println!(
                "  {} '{}' started {} instance(s)",
                style("*").green().bold(),
                event_type,
                instance_ids.len()
            );
            for id in instance_ids {
                println!("    {}  {}", style(short_id(id)).cyan(), id);
            }
        }
        IngestOutcome::Resumed { instance_id } => {
            println!(
                "  {} '{}' resumed instance {}",
                style("*").green().bold(),
                event_type,
                style(short_id(instance_id)).cyan()
            );
        }
        IngestOutcome::Duplicate => {
            println!("  Event '{event_id}' was already processed.");
        }
        IngestOutcome::Unmatched => {
            println!("  No trigger or waiting instance matched '{event_type}'.");
        }
    }
    println!();
    Ok(())
}
