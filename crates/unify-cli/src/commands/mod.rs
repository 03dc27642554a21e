use anyhow::{anyhow, Result};
use unify_auth_bridge::Platform;

use crate::admin_client::AdminClient;
use crate::ui;

pub mod connect;
pub mod disconnect;
pub mod snapshot;
pub mod status;
pub mod sync;

/// Connect to a ready daemon or explain how to start one.
pub async fn ready_client() -> Result<AdminClient> {
    let client = AdminClient::new();
    if !client.is_daemon_running() {
        ui::error("Daemon not running.");
        ui::info("Start it with:");
        println!("    unify-server");
        return Err(anyhow!("daemon not running"));
    }
    let status = client.get_status(None).await?;
    if !status.ready {
        return Err(anyhow!("Daemon is still starting, try again in a moment"));
    }
    Ok(client)
}

pub fn parse_platform(raw: &str) -> Result<Platform> {
    Platform::parse(raw).ok_or_else(|| anyhow!("Unknown platform: {}", raw))
}
