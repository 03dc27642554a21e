use anyhow::Result;
use console::style;
use serde::Serialize;

use unify_auth_bridge::{OrganisationId, Platform};
use unify_core::{BestEffortOutcome, SyncState, SyncStatusReport};

use crate::admin_client::AdminClient;
use crate::ui;

#[derive(Serialize)]
struct Status {
    daemon: DaemonStatusJson,
    org: String,
    connected: Option<bool>,
    sync: Option<SyncStatusReport>,
}

#[derive(Serialize)]
struct DaemonStatusJson {
    status: String,
    version: Option<String>,
    ready: bool,
}

impl Status {
    fn stopped(org: &OrganisationId, status: &str) -> Self {
        Self {
            daemon: DaemonStatusJson {
                status: status.to_string(),
                version: None,
                ready: false,
            },
            org: org.to_string(),
            connected: None,
            sync: None,
        }
    }
}

pub async fn run(org: &OrganisationId, json: bool) -> Result<()> {
    let client = AdminClient::new();

    if !client.is_daemon_running() {
        if json {
            println!("{}", serde_json::to_string_pretty(&Status::stopped(org, "stopped"))?);
            return Ok(());
        }
        println!();
        ui::error("Daemon not running.");
        ui::info("Start it with:");
        println!("    unify-server");
        println!();
        return Ok(());
    }

    let daemon = match client.get_status(Some(org)).await {
        Ok(s) => s,
        Err(e) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&Status::stopped(org, "error"))?);
                return Ok(());
            }
            ui::error(&format!("Cannot connect to daemon: {}", e));
            return Ok(());
        }
    };

    let connected = if daemon.ready {
        client.is_connected(org, Platform::Google).await.ok()
    } else {
        None
    };

    let status = Status {
        daemon: DaemonStatusJson {
            status: if daemon.running { "running" } else { "stopped" }.to_string(),
            version: Some(daemon.version),
            ready: daemon.ready,
        },
        org: org.to_string(),
        connected,
        sync: daemon.sync,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    let daemon_display = if status.daemon.ready {
        format!("{}", style("running").green())
    } else {
        format!("{}", style("starting...").yellow())
    };
    println!("  {:<12} {}", style("daemon").bold(), daemon_display);
    if let Some(version) = &status.daemon.version {
        println!("  {:<12} v{}", "version", version);
    }

    ui::section(&format!("ORGANISATION {}", org));
    let google = match status.connected {
        Some(true) => format!("{}", style("✔ connected").green()),
        Some(false) => format!("{}", style("○ not connected").dim()),
        None => format!("{}", style("unknown").dim()),
    };
    println!("  {:<12} {}", "google", google);

    let Some(sync) = &status.sync else {
        println!();
        return Ok(());
    };

    let state = match sync.status {
        SyncState::Idle => format!("{}", style("idle").dim()),
        SyncState::Syncing => format!(
            "{} {}% {}",
            style("⚡ syncing").yellow(),
            sync.progress.current,
            style(&sync.progress.message).dim()
        ),
        SyncState::Completed => format!("{}", style("✔ completed").green()),
        SyncState::Error => format!("{}", style("✖ error").red()),
    };
    println!("  {:<12} {}", "sync", state);

    if let Some(failure) = &sync.failure {
        println!(
            "  {:<12} {} failed: {}",
            "",
            failure.phase.label(),
            style(&failure.message).red()
        );
    }
    let last_sync = sync
        .last_sync_at
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!("  {:<12} {}", "last sync", style(last_sync).dim());

    if let Some(BestEffortOutcome::Skipped { reason }) = &sync.drive_check {
        println!("  {:<12} {}", "drive", style(format!("skipped: {}", reason)).yellow());
    }

    ui::section("SNAPSHOT");
    println!("  {:<12} {}", "events", sync.counts.events);
    println!("  {:<12} {}", "contacts", sync.counts.contacts);
    println!("  {:<12} {}", "insights", sync.counts.insights);
    println!("  {:<12} {}", "documents", sync.counts.documents);
    println!();

    Ok(())
}
