use anyhow::Result;
use clap::{Parser, Subcommand};
use unify_auth_bridge::OrganisationId;

mod admin_client;
mod commands;
mod ui;

#[derive(Parser)]
#[command(name = "unify")]
#[command(about = "Sync your society's inbox into events, contacts and insights.")]
#[command(version)]
struct Cli {
    /// Organisation to act on (falls back to UNIFY_ORG, then "default")
    #[arg(long, global = true)]
    org: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect a platform account through OAuth
    Connect {
        /// Platform to connect (google)
        #[arg(value_name = "PLATFORM", default_value = "google")]
        platform: String,

        /// Start a sync once connected
        #[arg(long)]
        sync: bool,
    },

    /// Remove a stored platform credential
    Disconnect {
        #[arg(value_name = "PLATFORM", default_value = "google")]
        platform: String,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Start a sync and follow its progress
    Sync {
        /// Stop waiting after this many seconds (the sync keeps running)
        #[arg(long, default_value = "600")]
        timeout_secs: u64,

        /// Return right after the sync is accepted
        #[arg(long)]
        detach: bool,
    },

    /// Show daemon health and the organisation's sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the last committed snapshot
    Snapshot {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn resolve_org(flag: Option<String>) -> OrganisationId {
    let raw = flag
        .or_else(|| std::env::var("UNIFY_ORG").ok())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "default".to_string());
    OrganisationId::new(raw.trim())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Debug logs stay hidden unless RUST_LOG asks for them
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let org = resolve_org(cli.org);

    match cli.command {
        Commands::Connect { platform, sync } => commands::connect::run(&org, &platform, sync).await,
        Commands::Disconnect { platform, yes } => {
            commands::disconnect::run(&org, &platform, yes).await
        }
        Commands::Sync {
            timeout_secs,
            detach,
        } => commands::sync::run(&org, timeout_secs, detach).await,
        Commands::Status { json } => commands::status::run(&org, json).await,
        Commands::Snapshot { json } => commands::snapshot::run(&org, json).await,
    }
}
