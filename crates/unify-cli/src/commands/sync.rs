use std::time::Duration;

use anyhow::{anyhow, Result};
use unify_auth_bridge::OrganisationId;
use unify_core::{BestEffortOutcome, SyncState, SyncStatusReport};

use crate::admin_client::TriggerOutcome;
use crate::commands::ready_client;
use crate::ui;

pub async fn run(org: &OrganisationId, timeout_secs: u64, detach: bool) -> Result<()> {
    let client = ready_client().await?;

    match client.trigger_sync(org).await? {
        TriggerOutcome::Started(ack) => {
            ui::info(&format!("Sync started at {}", ack.started_at.format("%H:%M:%S")));
        }
        TriggerOutcome::AlreadyRunning => {
            ui::info("A sync is already running; following it.");
        }
    }
    if detach {
        return Ok(());
    }

    let pb = ui::sync_bar("Starting");
    let watch_pb = pb.clone();
    let watched = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        client.watch_sync(org, move |report| {
            watch_pb.set_position(report.progress.current as u64);
            watch_pb.set_message(report.progress.message.clone());
        }),
    )
    .await;

    let report = match watched {
        Ok(Ok(report)) => report,
        Ok(Err(err)) => {
            pb.abandon_with_message("Failed");
            return Err(err);
        }
        Err(_) => {
            pb.abandon_with_message("Still running");
            ui::info(&format!(
                "Stopped waiting after {}s. Check progress with `unify status`.",
                timeout_secs
            ));
            return Ok(());
        }
    };

    match report.status {
        SyncState::Completed => {
            pb.set_position(100);
            pb.finish_with_message("Done");
            print_summary(&report);
            Ok(())
        }
        SyncState::Error => {
            pb.abandon_with_message("Failed");
            let reason = report
                .failure
                .map(|f| format!("{} failed: {}", f.phase.label(), f.message))
                .unwrap_or_else(|| "sync failed".to_string());
            ui::error(&reason);
            ui::info("The previous snapshot is still available.");
            Err(anyhow!(reason))
        }
        SyncState::Idle | SyncState::Syncing => {
            pb.finish_and_clear();
            ui::info(&format!("Sync is {}.", report.status.as_str()));
            Ok(())
        }
    }
}

fn print_summary(report: &SyncStatusReport) {
    let counts = report.counts;
    ui::success(&format!(
        "{} events, {} contacts, {} insights",
        counts.events, counts.contacts, counts.insights
    ));
    match &report.drive_check {
        Some(BestEffortOutcome::Completed { listed, relevant }) => {
            ui::info(&format!("Drive: {} of {} recent files look relevant", relevant, listed));
        }
        Some(BestEffortOutcome::Skipped { reason }) => {
            ui::info(&format!("Drive check skipped: {}", reason));
        }
        None => {}
    }
}
