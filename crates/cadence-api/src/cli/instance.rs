//! CLI instance subcommands: start, show, list, cancel, resume.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use uuid::Uuid;

use cadence_core::repository::workflow::WorkflowRepository;
use cadence_core::workflow::IngestOutcome;
use cadence_types::event::InboundEvent;
use cadence_types::instance::{InstanceSnapshot, NodeOutcome, WaitReason};
use cadence_types::workflow::DefinitionRef;

use super::{parse_id, parse_payload, print_json, short_id, status_cell, styled_status, table};
use crate::state::AppState;

/// Instance subcommands.
#[derive(Subcommand)]
pub enum InstanceCommand {
    /// Start an instance of a published definition.
    Start {
        /// Definition UUID.
        definition_id: String,

        /// Subject the instance runs for (e.g. a lead ID).
        #[arg(long)]
        subject: String,

        /// Trigger payload as JSON (or @file).
        #[arg(long)]
        payload: Option<String>,

        /// Pin a published version (defaults to the latest).
        #[arg(long)]
        version: Option<u32>,
    },

    /// Show an instance with its execution history.
    Show {
        /// Instance UUID.
        id: String,
    },

    /// List recent instances.
    #[command(alias = "ls")]
    List {
        /// Only instances of this definition.
        #[arg(long)]
        definition: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Cancel a non-terminal instance.
    Cancel {
        /// Instance UUID.
        id: String,
    },

    /// Deliver an event to a waiting instance.
    Resume {
        /// Instance UUID.
        id: String,

        /// Event type (`action.completed` / `action.failed` resolve a
        /// deferred action; include `task_id` in the payload).
        #[arg(long = "type", default_value = "external")]
        event_type: String,

        /// Event payload as JSON (or @file).
        #[arg(long)]
        payload: Option<String>,

        /// Event ID used for deduplication (generated when omitted).
        #[arg(long)]
        event_id: Option<String>,
    },
}

/// Handle an instance subcommand.
pub async fn handle_instance_command(
    cmd: InstanceCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        InstanceCommand::Start {
            definition_id,
            subject,
            payload,
            version,
        } => handle_start(&definition_id, &subject, payload.as_deref(), version, state, json).await,
        InstanceCommand::Show { id } => handle_show(&id, state, json).await,
        InstanceCommand::List { definition, limit } => {
            handle_list(definition.as_deref(), limit, state, json).await
        }
        InstanceCommand::Cancel { id } => handle_cancel(&id, state, json).await,
        InstanceCommand::Resume {
            id,
            event_type,
            payload,
            event_id,
        } => handle_resume(&id, event_type, payload.as_deref(), event_id, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

async fn handle_start(
    raw_def: &str,
    subject: &str,
    payload: Option<&str>,
    version: Option<u32>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let definition_id = parse_id(raw_def, "definition")?;
    let payload = parse_payload(payload)?;

    let id = match version {
        Some(version) => {
            state
                .engine
                .start_instance(DefinitionRef { id: definition_id, version }, subject, payload)
                .await
        }
        None => state.engine.start_latest(definition_id, subject, payload).await,
    }
    .with_context(|| format!("Failed to start an instance of {definition_id}"))?;

    let snapshot = state.engine.get_instance(id).await?;
    if json {
        return print_json(&snapshot);
    }

    println!();
    println!(
        "  {} Started instance {} for '{}'",
        style("*").green().bold(),
        style(short_id(&id)).cyan(),
        subject
    );
    println!("  ID: {id}");
    println!(
        "  Status: {} at '{}'",
        styled_status(snapshot.instance.status),
        snapshot.instance.current_node
    );
    println!();
    println!(
        "  Run due actions with: {}",
        style("cadence tick --until-idle").dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show / List
// ---------------------------------------------------------------------------

async fn handle_show(raw_id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(raw_id, "instance")?;
    let snapshot = state
        .engine
        .get_instance(id)
        .await
        .with_context(|| format!("Instance '{raw_id}' not found"))?;
    let tasks = state
        .engine
        .repository()
        .list_tasks(&id)
        .await
        .context("Failed to list action tasks")?;

    if json {
        return print_json(&serde_json::json!({
            "instance": snapshot.instance,
            "history": snapshot.history,
            "tasks": tasks,
        }));
    }

    display_snapshot(&snapshot);

    if !tasks.is_empty() {
        let mut t = table(&["Task", "Node", "Action", "Status", "Attempt", "Last error"]);
        for task in &tasks {
            t.add_row(vec![
                Cell::new(short_id(&task.id)),
                Cell::new(&task.node_id),
                Cell::new(&task.action_type),
                Cell::new(task.status),
                Cell::new(format!("{}/{}", task.attempt, task.max_attempts)),
                Cell::new(
                    task.last_error
                        .as_ref()
                        .map(|e| e.chars().take(40).collect::<String>())
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ]);
        }
        println!("  Action tasks");
        println!("{t}");
        println!();
    }
    Ok(())
}

fn display_snapshot(snapshot: &InstanceSnapshot) {
    let instance = &snapshot.instance;
    println!();
    println!(
        "  {} {}",
        style("Instance:").bold(),
        style(short_id(&instance.id)).cyan()
    );
    println!(
        "  Definition: {} v{}",
        instance.definition_id, instance.definition_version
    );
    println!("  Subject: {}", instance.subject_id);
    println!("  Status: {}", styled_status(instance.status));
    println!("  Current node: {}", instance.current_node);
    if let Some(wait) = &instance.wait {
        match &wait.reason {
            WaitReason::Delay { resume_at } => {
                println!("  Waiting: delay until {}", resume_at.format("%Y-%m-%d %H:%M:%S"));
            }
            WaitReason::Action { task_id, .. } => {
                println!("  Waiting: action task {}", short_id(task_id));
            }
        }
    }
    if let Some(err) = &instance.error {
        println!("  Error: {}", style(err).red());
    }
    println!(
        "  Started: {}",
        instance.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!();

    if snapshot.history.is_empty() {
        return;
    }
    let mut t = table(&["#", "Node", "Type", "Outcome", "Edge", "Exited"]);
    for record in &snapshot.history {
        t.add_row(vec![
            Cell::new(record.sequence),
            Cell::new(&record.node_id),
            Cell::new(record.node_type),
            Cell::new(outcome_label(&record.outcome)),
            Cell::new(record.outcome.edge_id().unwrap_or("-")),
            Cell::new(record.exited_at.format("%H:%M:%S").to_string()),
        ]);
    }
    println!("  History");
    println!("{t}");
    println!();
}

fn outcome_label(outcome: &NodeOutcome) -> String {
    match outcome {
        NodeOutcome::Advanced { .. } => "advanced".into(),
        NodeOutcome::Branched { key, .. } => format!("branched: {key}"),
        NodeOutcome::ActionSucceeded { .. } => "action succeeded".into(),
        NodeOutcome::ActionFailed { .. } => "action failed".into(),
        NodeOutcome::DelayElapsed { .. } => "delay elapsed".into(),
        NodeOutcome::Errored { .. } => "errored".into(),
        NodeOutcome::LoopRepeated { iteration, .. } => format!("repeat #{iteration}"),
        NodeOutcome::LoopExited { iterations, .. } => format!("exited after {iterations}"),
        NodeOutcome::Completed => "completed".into(),
        NodeOutcome::Failed => "failed".into(),
        NodeOutcome::Cancelled => "cancelled".into(),
    }
}

async fn handle_list(
    raw_def: Option<&str>,
    limit: u32,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let definition_id = raw_def.map(|d| parse_id(d, "definition")).transpose()?;
    let instances = state
        .engine
        .repository()
        .list_instances(definition_id.as_ref(), limit)
        .await
        .context("Failed to list instances")?;

    if json {
        return print_json(&instances);
    }

    if instances.is_empty() {
        println!();
        println!("  No instances.");
        println!();
        return Ok(());
    }

    let mut t = table(&["Instance", "Definition", "Subject", "Status", "Node", "Updated"]);
    for i in &instances {
        t.add_row(vec![
            Cell::new(short_id(&i.id)),
            Cell::new(format!("{} v{}", short_id(&i.definition_id), i.definition_version)),
            Cell::new(&i.subject_id),
            status_cell(i.status),
            Cell::new(&i.current_node),
            Cell::new(i.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!();
    println!("{t}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel / Resume
// ---------------------------------------------------------------------------

async fn handle_cancel(raw_id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(raw_id, "instance")?;
    state
        .engine
        .cancel_instance(id)
        .await
        .with_context(|| format!("Failed to cancel instance {id}"))?;

    if json {
        print_json(&serde_json::json!({ "cancelled": id }))?;
    } else {
        println!();
        println!(
            "  {} Cancelled instance {}",
            style("*").green().bold(),
            style(short_id(&id)).cyan()
        );
        println!();
    }
    Ok(())
}

async fn handle_resume(
    raw_id: &str,
    event_type: String,
    payload: Option<&str>,
    event_id: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let id = parse_id(raw_id, "instance")?;
    let event = InboundEvent {
        id: event_id.unwrap_or_else(|| Uuid::now_v7().to_string()),
        event_type,
        subject_id: None,
        instance_id: Some(id),
        payload: parse_payload(payload)?,
        occurred_at: Utc::now(),
    };
    let outcome = state
        .engine
        .resume_instance(id, event)
        .await
        .with_context(|| format!("Failed to resume instance {id}"))?;

    if json {
        return print_json(&outcome);
    }
    println!();
    match outcome {
        IngestOutcome::Resumed { instance_id } => {
            let snapshot = state.engine.get_instance(instance_id).await?;
            println!(
                "  {} Resumed {} ({})",
                style("*").green().bold(),
                style(short_id(&instance_id)).cyan(),
                styled_status(snapshot.instance.status)
            );
        }
        IngestOutcome::Duplicate => println!("  Event already delivered; nothing to do."),
        IngestOutcome::Unmatched => {
            println!("  The instance is not waiting for this event; it was ignored.");
        }
        IngestOutcome::Started { .. } => {}
    }
    println!();
    Ok(())
}
