use std::sync::Arc;

use anyhow::Result;
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use unify_core::{Engine, UnifyPaths};

mod admin;

use admin::{handle_admin_client, AdminHandler, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout stays clean; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let paths = UnifyPaths::from_env();
    paths.ensure_dirs()?;

    if paths.admin_socket_path.exists() {
        std::fs::remove_file(&paths.admin_socket_path)?;
    }

    let state = Arc::new(ServerState::new(paths.clone()));

    // Bind first so clients can ping while the engine starts.
    let admin_listener = UnixListener::bind(&paths.admin_socket_path)?;
    info!("Admin server listening on {}", paths.admin_socket_path.display());

    let admin_handler = Arc::new(AdminHandler::new(state.clone()));
    tokio::spawn(async move {
        loop {
            match admin_listener.accept().await {
                Ok((stream, _)) => {
                    let handler = admin_handler.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_admin_client(stream, handler).await {
                            error!("Admin client error: {}", err);
                        }
                    });
                }
                Err(err) => {
                    error!("Admin accept error: {}", err);
                }
            }
        }
    });

    let init_state = state.clone();
    tokio::spawn(async move {
        match Engine::init(&init_state.paths) {
            Ok(engine) => {
                match engine.restore_snapshots().await {
                    Ok(0) => {}
                    Ok(n) => info!("Restored {} stored snapshot(s)", n),
                    Err(err) => warn!("Could not restore snapshots: {}", err),
                }
                init_state.set_engine(engine).await;
                info!("Engine initialized");
            }
            Err(err) => {
                error!("Failed to initialize engine: {:#}", err);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    if let Err(err) = std::fs::remove_file(&paths.admin_socket_path) {
        warn!("Could not remove admin socket: {}", err);
    }
    Ok(())
}
