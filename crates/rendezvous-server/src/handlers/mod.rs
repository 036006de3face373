//! Request handlers: one per operation, composing validator, registry and
//! storage.
//!
//! The HTTP adapter locks the [`Core`] once per request, calls the
//! handler, snapshots, releases the lock and only then dispatches the
//! push targets the handler returned.

pub mod admin;
pub mod device;
pub mod keys;
pub mod topic;
pub mod user;

use tokio::sync::Mutex;
use tracing::warn;

use rendezvous_shared::types::{DeviceKey, UserKey};
use rendezvous_shared::wire::WireRecord;

use crate::push::PushGateway;
use crate::registry::Registry;
use crate::storage::Storage;

/// Everything the request pipeline owns exclusively.
pub struct Core {
    pub registry: Registry,
    pub storage: Storage,
    pub development: bool,
}

impl Core {
    /// Persists the registry snapshot when dirty. A failure is logged and
    /// swallowed: the per-entity blobs stay authoritative for everything
    /// except the admin token and the allowed-user table.
    pub async fn snapshot(&mut self) {
        if !self.registry.take_dirty() {
            return;
        }
        let bytes = self.registry.snapshot_data().encode();
        if let Err(err) = self.storage.write_snapshot(&bytes).await {
            warn!(error = %err, "registry snapshot failed");
        }
    }
}

pub struct AppState {
    pub core: Mutex<Core>,
    pub push: PushGateway,
}

/// The authenticated (user, device, token) triple carried by most
/// requests, parsed from headers or from the request body.
#[derive(Debug, Clone)]
pub struct UserAuth {
    pub user: UserKey,
    pub device: DeviceKey,
    pub token: Vec<u8>,
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
