//! Background execution from the CLI: one-shot ticks and the long-running worker.

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use cadence_core::workflow::dispatcher::DispatchReport;
use cadence_types::event::EngineEvent;

use super::{print_json, short_id};
use crate::state::AppState;

/// Upper bound on passes for `tick --until-idle`.
const MAX_IDLE_PASSES: usize = 1000;

#[derive(Debug, Default, Serialize)]
struct TickSummary {
    passes: usize,
    timers_fired: usize,
    dispatch: DispatchReport,
}

impl TickSummary {
    fn absorb(&mut self, fired: usize, report: &DispatchReport) {
        self.passes += 1;
        self.timers_fired += fired;
        let d = &mut self.dispatch;
        d.claimed += report.claimed;
        d.invoked += report.invoked;
        d.replayed += report.replayed;
        d.succeeded += report.succeeded;
        d.deferred += report.deferred;
        d.retried += report.retried;
        d.failed += report.failed;
        d.skipped += report.skipped;
    }
}

fn is_idle(fired: usize, report: &DispatchReport) -> bool {
    fired == 0 && report.claimed == 0
}

/// Fire due timers and run a dispatch pass, optionally until nothing is due.
pub async fn handle_tick(until_idle: bool, state: &AppState, json: bool) -> Result<()> {
    state.recover().await?;

    let mut summary = TickSummary::default();
    loop {
        let fired = state
            .engine
            .fire_due_timers()
            .await
            .context("Failed to fire due timers")?;
        let report = state
            .engine
            .process_due_actions()
            .await
            .context("Failed to dispatch due actions")?;
        summary.absorb(fired, &report);

        if !until_idle || is_idle(fired, &report) {
            break;
        }
        if summary.passes >= MAX_IDLE_PASSES {
            tracing::warn!(passes = summary.passes, "tick stopped before reaching idle");
            break;
        }
    }

    if json {
        return print_json(&summary);
    }

    let d = &summary.dispatch;
    println!();
    println!(
        "  {} {} pass(es): {} timer(s) fired, {} action(s) claimed",
        style("*").green().bold(),
        summary.passes,
        summary.timers_fired,
        d.claimed
    );
    if d.claimed > 0 {
        println!(
            "    succeeded {}  deferred {}  retried {}  failed {}  replayed {}  skipped {}",
            style(d.succeeded).green(),
            d.deferred,
            style(d.retried).yellow(),
            style(d.failed).red(),
            d.replayed,
            d.skipped
        );
    }
    let waiting = state.engine.pending_wakes();
    if waiting > 0 {
        println!("    {waiting} delay(s) still pending");
    }
    println!();
    Ok(())
}

/// Run the timer and dispatch loops until Ctrl+C or SIGTERM.
pub async fn handle_worker(state: &AppState, json: bool) -> Result<()> {
    let recovered = state.recover().await?;
    let mut events = state.engine.subscribe();

    let cancel = CancellationToken::new();
    let handles = state.engine.spawn_workers(cancel.clone());

    if !json {
        println!();
        println!(
            "  {} Worker running ({} trigger(s), {} delay(s) restored)",
            style("*").green().bold(),
            recovered.triggers_registered,
            recovered.wakes_restored
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    let printer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => print_event(&event, json),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event printer lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    };

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "worker task panicked");
        }
    }
    let _ = printer.await;

    if !json {
        println!("\n  Worker stopped.");
    }
    Ok(())
}

fn print_event(event: &EngineEvent, json: bool) {
    let value = match serde_json::to_value(event) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "unserializable engine event");
            return;
        }
    };
    if json {
        println!("{value}");
        return;
    }
    let kind = value["type"].as_str().unwrap_or("event");
    match event.instance_id() {
        Some(id) => println!("  {} {}", style(short_id(&id)).cyan(), kind),
        None => println!("  {kind}"),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
