//! Admin surface: token rotation, allow-listing, user removal and the
//! development-mode reset.

use tracing::info;

use rendezvous_shared::constants::{MAX_NAME_LEN, PIN_EXPIRY_SECS, PIN_RANGE, REGISTRATION_TRIES};
use rendezvous_shared::crypto;
use rendezvous_shared::records::AllowedUser;
use rendezvous_shared::types::{AuthToken, UserKey};

use super::Core;
use crate::error::ServerError;
use crate::registry::Registry;

pub fn renew_token(core: &mut Core, token: &[u8]) -> Result<AuthToken, ServerError> {
    core.registry.authenticate_admin(token)?;
    let new = core.registry.renew_admin_token();
    info!("admin token rotated");
    Ok(new)
}

/// Wipes all storage and re-initializes an empty registry under the same
/// admin token. Development mode only.
pub async fn reset(core: &mut Core, token: &[u8]) -> Result<(), ServerError> {
    core.registry.authenticate_admin(token)?;
    if !core.development {
        return Err(ServerError::InvalidRequest(
            "reset requires development mode".to_string(),
        ));
    }
    core.storage.delete_all().await?;
    let admin_token = *core.registry.admin_token();
    core.registry = Registry::new(admin_token);
    core.registry.mark_dirty();
    info!("server reset");
    Ok(())
}

pub fn list_accounts(core: &Core, token: &[u8]) -> Result<String, ServerError> {
    core.registry.authenticate_admin(token)?;
    let mut listing = core.registry.user_names().join("\n");
    if !listing.is_empty() {
        listing.push('\n');
    }
    Ok(listing)
}

/// Whitelists a name for registration with a fresh random pin.
pub fn allow_user(core: &mut Core, token: &[u8], name: &str, now: i64) -> Result<AllowedUser, ServerError> {
    core.registry.authenticate_admin(token)?;
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(ServerError::InvalidRequest("invalid user name".to_string()));
    }
    if core.registry.name_taken(name) {
        return Err(ServerError::ResourceAlreadyExists(format!("user {name}")));
    }
    let pin = u32::from_le_bytes(crypto::random_array::<4>()) % PIN_RANGE;
    let entry = AllowedUser {
        name: name.to_string(),
        pin,
        expiry: now + PIN_EXPIRY_SECS,
        tries_remaining: REGISTRATION_TRIES,
    };
    core.registry.allow_user(entry.clone());
    info!(name, "user allowed for registration");
    Ok(entry)
}

pub async fn delete_user(core: &mut Core, token: &[u8], user: &UserKey) -> Result<(), ServerError> {
    core.registry.authenticate_admin(token)?;
    core.registry
        .remove_user(user)
        .ok_or_else(|| ServerError::ResourceNotAvailable(format!("user {}", user.short())))?;
    core.storage.delete_user_tree(user).await?;
    info!(user = %user.short(), "user removed by admin");
    Ok(())
}
