use anyhow::Result;
use unify_auth_bridge::OrganisationId;

use crate::commands::{parse_platform, ready_client};
use crate::ui;

pub async fn run(org: &OrganisationId, platform: &str, yes: bool) -> Result<()> {
    let platform = parse_platform(platform)?;
    let client = ready_client().await?;

    if !client.is_connected(org, platform).await? {
        ui::info(&format!("{} is not connected for {}.", platform.display_name(), org));
        return Ok(());
    }

    if !yes
        && !ui::prompt_confirm(
            &format!("Disconnect {} from {}?", platform.display_name(), org),
            false,
        )?
    {
        ui::info("Cancelled.");
        return Ok(());
    }

    client.clear_credential(org, platform).await?;
    ui::success(&format!("{} disconnected.", platform.display_name()));
    ui::info("The last snapshot stays readable until the next successful sync.");
    Ok(())
}
