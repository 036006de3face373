mod api;
mod config;
mod error;
mod handlers;
mod push;
mod registry;
mod storage;
mod validator;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rendezvous_shared::constants::AUTH_TOKEN_SIZE;
use rendezvous_shared::crypto;
use rendezvous_shared::records::ManagementData;
use rendezvous_shared::types::AuthToken;
use rendezvous_shared::wire::WireRecord;

use crate::config::Config;
use crate::handlers::{AppState, Core};
use crate::push::PushGateway;
use crate::registry::Registry;
use crate::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "rendezvous.json".to_string());
    let config = Config::load(Path::new(&config_path))?;
    init_tracing(&config)?;

    info!(
        "Starting Rendezvous server v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        data = %config.data_folder.display(),
        development = config.development,
        push = !config.notification_server.is_empty(),
        "Loaded configuration"
    );

    let storage = Storage::open(config.data_folder.clone())
        .await
        .map_err(|e| anyhow::anyhow!("storage initialization failed: {e}"))?;

    let registry = match storage
        .read_snapshot()
        .await
        .map_err(|e| anyhow::anyhow!("snapshot read failed: {e}"))?
    {
        Some(bytes) => {
            let data = ManagementData::decode(&bytes)
                .map_err(|e| anyhow::anyhow!("snapshot is corrupt: {e}"))?;
            let registry = Registry::restore(data)
                .map_err(|e| anyhow::anyhow!("snapshot restore failed: {e}"))?;
            info!("registry restored from snapshot");
            registry
        }
        None => {
            let token = AuthToken(crypto::random_array::<AUTH_TOKEN_SIZE>());
            // logged exactly once; rotate via /admin/renew afterwards
            info!(admin_token = %token.to_hex(), "first boot, generated admin token");
            Registry::new(token)
        }
    };

    let state = Arc::new(AppState {
        core: Mutex::new(Core {
            registry,
            storage,
            development: config.development,
        }),
        push: PushGateway::new(config.notification_server.clone()),
    });

    tokio::select! {
        result = api::serve(state, config.bind, config.static_files.clone()) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rendezvous_server=debug"));
    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("cannot open log file '{}': {e}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
