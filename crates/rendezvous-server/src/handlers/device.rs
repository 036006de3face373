//! Device lifecycle. Register and delete are both gated on a fresh
//! self-signed user record whose device list differs from the stored one
//! by exactly one entry and whose timestamp is strictly newer.

use tracing::info;

use rendezvous_shared::constants::{MAX_APP_ID_LEN, PUSH_TOKEN_SIZE};
use rendezvous_shared::records::InternalUser;
use rendezvous_shared::types::{AuthToken, DeviceKey, UserKey};

use super::{Core, UserAuth};
use crate::error::ServerError;
use crate::validator;

pub fn register(
    core: &mut Core,
    new_info: InternalUser,
    now: i64,
) -> Result<AuthToken, ServerError> {
    validator::check_freshness(new_info.timestamp, now)?;
    validator::verify_self_signed_user(&new_info)?;
    let user_key = UserKey::from_slice(&new_info.identity_key)
        .ok_or_else(|| ServerError::InvalidRequest("malformed identity key".to_string()))?;
    let old = core
        .registry
        .user(&user_key)
        .ok_or_else(|| ServerError::ResourceNotAvailable(format!("user {}", user_key.short())))?;
    let added = validator::validate_device_added(old, &new_info)?;
    if added.application.chars().count() > MAX_APP_ID_LEN {
        return Err(ServerError::InvalidRequest(
            "application id too long".to_string(),
        ));
    }
    let device_key = DeviceKey::from_slice(&added.device_key)
        .ok_or_else(|| ServerError::InvalidRequest("malformed device key".to_string()))?;
    if core.registry.device_key_in_use(&device_key) {
        return Err(ServerError::ResourceAlreadyExists(format!(
            "device {}",
            device_key.short()
        )));
    }
    core.registry.insert_user(user_key, new_info);
    let token = core.registry.mint_device_token(&device_key);
    core.registry.init_mailbox(&device_key, 0, 0);
    info!(user = %user_key.short(), device = %device_key.short(), "device registered");
    Ok(token)
}

pub async fn delete(core: &mut Core, new_info: InternalUser, now: i64) -> Result<(), ServerError> {
    validator::check_freshness(new_info.timestamp, now)?;
    validator::verify_self_signed_user(&new_info)?;
    let user_key = UserKey::from_slice(&new_info.identity_key)
        .ok_or_else(|| ServerError::InvalidRequest("malformed identity key".to_string()))?;
    let old = core
        .registry
        .user(&user_key)
        .ok_or_else(|| ServerError::ResourceNotAvailable(format!("user {}", user_key.short())))?;
    let removed = validator::validate_device_removed(old, &new_info)?;
    let device_key = DeviceKey::from_slice(&removed.device_key)
        .ok_or_else(|| ServerError::InvalidRequest("malformed device key".to_string()))?;
    core.registry.insert_user(user_key, new_info);
    core.registry.drop_device(&device_key);
    core.storage.delete_prekeys(&user_key, &device_key).await?;
    info!(user = %user_key.short(), device = %device_key.short(), "device deleted");
    Ok(())
}

pub fn set_push_token(
    core: &mut Core,
    auth: &UserAuth,
    token_bytes: &[u8],
) -> Result<(), ServerError> {
    core.registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    if token_bytes.len() != PUSH_TOKEN_SIZE {
        return Err(ServerError::InvalidRequest(
            "push token must be 16 bytes".to_string(),
        ));
    }
    core.registry
        .set_notification_token(&auth.device, token_bytes.to_vec());
    Ok(())
}
