//! CLI definition subcommands.
//!
//! Provides validate, create, update, publish, show, list, export and
//! import operations for workflow definitions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;

use cadence_core::repository::workflow::WorkflowRepository;
use cadence_core::workflow::EngineError;
use cadence_core::workflow::definition::{
    discover_definitions, load_definition_file, save_definition_file,
};
use cadence_core::workflow::validator::ValidationReport;
use cadence_types::workflow::{DefinitionStatus, WorkflowDefinition};

use super::{parse_id, print_json, short_id, table};
use crate::state::AppState;

/// Definition management subcommands.
#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Store a definition file as a new draft.
    Create {
        /// Path to the YAML or JSON definition.
        file: PathBuf,

        /// Publish the draft right away.
        #[arg(long)]
        publish: bool,
    },

    /// Replace the draft of an existing definition.
    Update {
        /// Definition UUID.
        id: String,

        /// Path to the YAML or JSON definition.
        file: PathBuf,
    },

    /// Validate the draft and publish it as the next version.
    Publish {
        /// Definition UUID.
        id: String,
    },

    /// Show a definition (latest published unless --version is given).
    Show {
        /// Definition UUID.
        id: String,

        #[arg(long)]
        version: Option<u32>,
    },

    /// List definitions.
    #[command(alias = "ls")]
    List {
        /// List drafts instead of published versions.
        #[arg(long)]
        drafts: bool,
    },

    /// Write a definition to a YAML file.
    Export {
        /// Definition UUID.
        id: String,

        /// Destination path.
        output: PathBuf,

        #[arg(long)]
        version: Option<u32>,
    },

    /// Create drafts for every definition file under a directory.
    Import {
        dir: PathBuf,

        /// Publish each imported draft.
        #[arg(long)]
        publish: bool,
    },
}

/// Handle a definition subcommand.
pub async fn handle_definition_command(
    cmd: DefinitionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        DefinitionCommand::Create { file, publish } => {
            handle_create(&file, publish, state, json).await
        }
        DefinitionCommand::Update { id, file } => handle_update(&id, &file, state, json).await,
        DefinitionCommand::Publish { id } => handle_publish(&id, state, json).await,
        DefinitionCommand::Show { id, version } => handle_show(&id, version, state, json).await,
        DefinitionCommand::List { drafts } => handle_list(drafts, state, json).await,
        DefinitionCommand::Export {
            id,
            output,
            version,
        } => handle_export(&id, &output, version, state, json).await,
        DefinitionCommand::Import { dir, publish } => {
            handle_import(&dir, publish, state, json).await
        }
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// `cadence validate <file>`: parse and check without storing anything.
pub fn handle_validate(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = load(file)?;
    match state.engine.validate_definition(&def) {
        Ok(()) => {
            if json {
                print_json(&serde_json::json!({ "valid": true, "name": def.name }))?;
            } else {
                println!();
                println!(
                    "  {} '{}' is valid ({} nodes, {} edges)",
                    style("*").green().bold(),
                    style(&def.name).cyan(),
                    def.nodes.len(),
                    def.edges.len()
                );
                println!();
            }
            Ok(())
        }
        Err(report) => {
            if json {
                print_json(&serde_json::json!({ "valid": false, "issues": report.issues }))?;
            } else {
                print_report(&def.name, &report);
            }
            bail!("{} has {} validation issue(s)", file.display(), report.issues.len())
        }
    }
}

// ---------------------------------------------------------------------------
// Create / Update / Publish
// ---------------------------------------------------------------------------

async fn handle_create(file: &Path, publish: bool, state: &AppState, json: bool) -> Result<()> {
    let def = load(file)?;
    let name = def.name.clone();
    let id = state
        .engine
        .create_definition(def)
        .await
        .context("Failed to create definition")?;

    let version = if publish {
        Some(publish_or_report(id, &name, state, json).await?)
    } else {
        None
    };

    if json {
        print_json(&serde_json::json!({
            "id": id,
            "name": name,
            "published_version": version,
        }))?;
    } else {
        println!();
        println!(
            "  {} Created definition '{}'",
            style("*").green().bold(),
            style(&name).cyan()
        );
        println!("  ID: {id}");
        match version {
            Some(v) => println!("  Published: version {v}"),
            None => println!(
                "  Publish with: {}",
                style(format!("cadence definition publish {id}")).dim()
            ),
        }
        println!();
    }
    Ok(())
}

async fn handle_update(raw_id: &str, file: &Path, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(raw_id, "definition")?;
    let def = load(file)?;
    state
        .engine
        .update_definition(id, def)
        .await
        .with_context(|| format!("Failed to update definition {id}"))?;

    if json {
        print_json(&serde_json::json!({ "updated": id }))?;
    } else {
        println!();
        println!(
            "  {} Updated draft {}",
            style("*").green().bold(),
            style(short_id(&id)).cyan()
        );
        println!();
    }
    Ok(())
}

async fn handle_publish(raw_id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(raw_id, "definition")?;
    let name = state
        .engine
        .get_definition(id, None)
        .await
        .map(|d| d.name)
        .unwrap_or_else(|_| short_id(&id));
    let version = publish_or_report(id, &name, state, json).await?;

    if json {
        print_json(&serde_json::json!({ "id": id, "version": version }))?;
    } else {
        println!();
        println!(
            "  {} Published '{}' as version {}",
            style("*").green().bold(),
            style(&name).cyan(),
            version
        );
        println!();
    }
    Ok(())
}

/// Publish, printing the validation report when the draft is rejected.
async fn publish_or_report(
    id: uuid::Uuid,
    name: &str,
    state: &AppState,
    json: bool,
) -> Result<u32> {
    match state.engine.publish_definition(id).await {
        Ok(version) => Ok(version),
        Err(EngineError::Validation(report)) => {
            if json {
                print_json(&serde_json::json!({ "published": false, "issues": report.issues }))?;
            } else {
                print_report(name, &report);
            }
            bail!("Definition '{name}' was not published")
        }
        Err(e) => Err(e).with_context(|| format!("Failed to publish definition {id}")),
    }
}

// ---------------------------------------------------------------------------
// Show / List
// ---------------------------------------------------------------------------

async fn handle_show(
    raw_id: &str,
    version: Option<u32>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let id = parse_id(raw_id, "definition")?;
    let def = state
        .engine
        .get_definition(id, version)
        .await
        .with_context(|| format!("Definition '{raw_id}' not found"))?;

    if json {
        return print_json(&def);
    }

    println!();
    println!(
        "  {} {} (version {}, {})",
        style("Definition:").bold(),
        style(&def.name).cyan(),
        def.version,
        status_label(def.status)
    );
    println!("  ID: {}", def.id);
    if let Some(desc) = &def.description {
        println!("  Description: {desc}");
    }
    if let Some(at) = def.published_at {
        println!("  Published: {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();

    let mut nodes = table(&["Node", "Type", "Next"]);
    for node in &def.nodes {
        let targets: Vec<String> = def
            .outgoing(&node.id)
            .map(|e| match e.route.branch_key() {
                Some(key) => format!("{key} -> {}", e.target),
                None => e.target.clone(),
            })
            .collect();
        nodes.add_row(vec![
            Cell::new(node.display_name()),
            Cell::new(node.node_type),
            Cell::new(if targets.is_empty() {
                "-".to_string()
            } else {
                targets.join(", ")
            }),
        ]);
    }
    println!("{nodes}");
    println!();
    Ok(())
}

async fn handle_list(drafts: bool, state: &AppState, json: bool) -> Result<()> {
    let defs = if drafts {
        state
            .engine
            .repository()
            .list_drafts()
            .await
            .context("Failed to list drafts")?
    } else {
        state
            .engine
            .list_definitions()
            .await
            .context("Failed to list definitions")?
    };

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "name": d.name,
                    "version": d.version,
                    "status": d.status,
                    "nodes": d.nodes.len(),
                    "published_at": d.published_at.map(|t| t.to_rfc3339()),
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!(
            "  No {} definitions.",
            if drafts { "draft" } else { "published" }
        );
        println!(
            "  Create one with: {}",
            style("cadence definition create <file.yaml> --publish").dim()
        );
        println!();
        return Ok(());
    }

    let mut t = table(&["Name", "ID", "Version", "Nodes", "Updated"]);
    for d in &defs {
        t.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.id),
            Cell::new(d.version),
            Cell::new(d.nodes.len()),
            Cell::new(d.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!();
    println!("{t}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Export / Import
// ---------------------------------------------------------------------------

async fn handle_export(
    raw_id: &str,
    output: &Path,
    version: Option<u32>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let id = parse_id(raw_id, "definition")?;
    let def = state
        .engine
        .get_definition(id, version)
        .await
        .with_context(|| format!("Definition '{raw_id}' not found"))?;
    save_definition_file(output, &def)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if json {
        print_json(&serde_json::json!({ "id": id, "version": def.version, "path": output }))?;
    } else {
        println!();
        println!(
            "  {} Wrote '{}' v{} to {}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.version,
            output.display()
        );
        println!();
    }
    Ok(())
}

async fn handle_import(dir: &Path, publish: bool, state: &AppState, json: bool) -> Result<()> {
    let found = discover_definitions(dir)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;

    let mut imported = Vec::with_capacity(found.len());
    for (path, def) in found {
        let name = def.name.clone();
        let id = match state.engine.create_definition(def).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "definition not imported");
                continue;
            }
        };
        let version = if publish {
            match state.engine.publish_definition(id).await {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "imported draft not published");
                    None
                }
            }
        } else {
            None
        };
        imported.push((path, name, id, version));
    }

    if json {
        let out: Vec<_> = imported
            .iter()
            .map(|(path, name, id, version)| {
                serde_json::json!({ "path": path, "name": name, "id": id, "version": version })
            })
            .collect();
        return print_json(&out);
    }

    println!();
    if imported.is_empty() {
        println!("  No definitions imported from {}.", dir.display());
    } else {
        let mut t = table(&["Name", "ID", "Published", "File"]);
        for (path, name, id, version) in &imported {
            t.add_row(vec![
                Cell::new(name),
                Cell::new(id),
                Cell::new(version.map(|v| format!("v{v}")).unwrap_or_else(|| "-".into())),
                Cell::new(path.display()),
            ]);
        }
        println!("{t}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load(file: &Path) -> Result<WorkflowDefinition> {
    load_definition_file(file).with_context(|| format!("Failed to load {}", file.display()))
}

fn status_label(status: DefinitionStatus) -> console::StyledObject<&'static str> {
    match status {
        DefinitionStatus::Draft => style("draft").yellow(),
        DefinitionStatus::Published => style("published").green(),
    }
}

fn print_report(name: &str, report: &ValidationReport) {
    println!();
    println!(
        "  {} '{}' has {} validation issue(s)",
        style("x").red().bold(),
        style(name).cyan(),
        report.issues.len()
    );
    println!();
    let mut t = table(&["Code", "Node", "Edge", "Problem"]);
    for issue in &report.issues {
        let code = serde_json::to_value(issue.code)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        t.add_row(vec![
            Cell::new(code),
            Cell::new(issue.node_id.as_deref().unwrap_or("-")),
            Cell::new(issue.edge_id.as_deref().unwrap_or("-")),
            Cell::new(&issue.message),
        ]);
    }
    println!("{t}");
    println!();
}
