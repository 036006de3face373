//! User lifecycle: registration, info reads and account deletion.

use tracing::info;

use rendezvous_shared::constants::{MAX_APP_ID_LEN, MAX_NAME_LEN};
use rendezvous_shared::crypto;
use rendezvous_shared::records::{verify_signed, InternalUser, RegistrationBundle};
use rendezvous_shared::types::{AuthToken, DeviceKey, UserKey};

use super::{Core, UserAuth};
use crate::error::ServerError;
use crate::validator;

/// Creates a user from a whitelisted name, its single initial device and
/// the first batch of key material. Returns the device auth token.
pub async fn register(
    core: &mut Core,
    bundle: RegistrationBundle,
    pin: u32,
    now: i64,
) -> Result<AuthToken, ServerError> {
    let info = bundle.info;
    if info.devices.len() != 1 {
        return Err(ServerError::InvalidRequest(
            "registration requires exactly one device".to_string(),
        ));
    }
    if info.name.is_empty() || info.name.chars().count() > MAX_NAME_LEN {
        return Err(ServerError::InvalidRequest("invalid user name".to_string()));
    }
    let device = info.devices[0].clone();
    if device.application.chars().count() > MAX_APP_ID_LEN {
        return Err(ServerError::InvalidRequest(
            "application id too long".to_string(),
        ));
    }
    if !info.notification_server.is_empty()
        && reqwest::Url::parse(&info.notification_server).is_err()
    {
        return Err(ServerError::InvalidRequest(
            "invalid notification server".to_string(),
        ));
    }
    validator::check_freshness(info.timestamp, now)?;
    validator::verify_self_signed_user(&info)?;
    let user_key = UserKey::from_slice(&info.identity_key)
        .ok_or_else(|| ServerError::InvalidRequest("malformed identity key".to_string()))?;
    let device_key = DeviceKey::from_slice(&device.device_key)
        .ok_or_else(|| ServerError::InvalidRequest("malformed device key".to_string()))?;

    if !core.registry.can_register(&info.name, pin, now) {
        return Err(ServerError::AuthenticationFailed);
    }
    if core.registry.user(&user_key).is_some() {
        return Err(ServerError::ResourceAlreadyExists(format!(
            "user {}",
            user_key.short()
        )));
    }
    if core.registry.device_key_in_use(&device_key) {
        return Err(ServerError::ResourceAlreadyExists(format!(
            "device {}",
            device_key.short()
        )));
    }
    for pre_key in &bundle.pre_keys {
        verify_signed(pre_key, &device.device_key).map_err(|_| ServerError::InvalidSignature)?;
    }
    for topic_key in &bundle.topic_keys {
        crypto::verify(
            &info.identity_key,
            &topic_key.signed_payload(),
            &topic_key.signature,
        )
        .map_err(|_| ServerError::InvalidSignature)?;
    }

    core.storage.create_user_tree(&user_key).await?;
    let pre_key_count = core
        .storage
        .store_prekeys(&user_key, &device_key, bundle.pre_keys)
        .await?;
    let topic_key_count = if bundle.topic_keys.is_empty() {
        0
    } else {
        core.storage
            .store_topic_keys(&user_key, &device.application, bundle.topic_keys)
            .await?
    };

    let name = info.name.clone();
    core.registry.insert_user(user_key, info);
    let token = core.registry.mint_device_token(&device_key);
    core.registry
        .init_mailbox(&device_key, pre_key_count, topic_key_count);
    core.registry.remove_allowed_user(&name);
    info!(user = %user_key.short(), name, "user registered");
    Ok(token)
}

pub fn get_info(core: &Core, auth: &UserAuth) -> Result<InternalUser, ServerError> {
    let record = core
        .registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    Ok(record.clone())
}

/// Removes a user on presentation of a fresh self-signed record.
pub async fn delete(core: &mut Core, info: InternalUser, now: i64) -> Result<(), ServerError> {
    validator::check_freshness(info.timestamp, now)?;
    validator::verify_self_signed_user(&info)?;
    let user_key = UserKey::from_slice(&info.identity_key)
        .ok_or_else(|| ServerError::InvalidRequest("malformed identity key".to_string()))?;
    core.registry
        .remove_user(&user_key)
        .ok_or_else(|| ServerError::ResourceNotAvailable(format!("user {}", user_key.short())))?;
    core.storage.delete_user_tree(&user_key).await?;
    info!(user = %user_key.short(), "user deleted");
    Ok(())
}
