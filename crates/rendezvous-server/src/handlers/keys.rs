//! Prekey and topic-key surface.
//!
//! Both pools are strictly one-shot: a key handed out by a consume
//! operation is removed from storage in the same commit.

use std::collections::HashSet;

use rendezvous_shared::constants::MAX_APP_ID_LEN;
use rendezvous_shared::crypto;
use rendezvous_shared::records::{
    verify_signed, DevicePreKeyBundle, DevicePrekeyUploadRequest, TopicKey, TopicKeyBundle,
    TopicKeyRequest, TopicKeyResponse, UserTopicKey,
};
use rendezvous_shared::types::{DeviceKey, UserKey};

use super::{Core, UserAuth};
use crate::error::ServerError;
use crate::registry::PushTarget;

fn parse_auth(user_key: &[u8], device_key: &[u8], token: &[u8]) -> Result<UserAuth, ServerError> {
    Ok(UserAuth {
        user: UserKey::from_slice(user_key)
            .ok_or_else(|| ServerError::InvalidRequest("malformed user key".to_string()))?,
        device: DeviceKey::from_slice(device_key)
            .ok_or_else(|| ServerError::InvalidRequest("malformed device key".to_string()))?,
        token: token.to_vec(),
    })
}

/// Appends signed prekeys to the uploading device's pool.
pub async fn add_prekeys(
    core: &mut Core,
    request: DevicePrekeyUploadRequest,
) -> Result<(), ServerError> {
    let auth = parse_auth(&request.user_key, &request.device_key, &request.auth_token)?;
    core.registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    for pre_key in &request.pre_keys {
        verify_signed(pre_key, &request.device_key).map_err(|_| ServerError::InvalidSignature)?;
    }
    let count = core
        .storage
        .store_prekeys(&auth.user, &auth.device, request.pre_keys)
        .await?;
    core.registry.set_remaining_prekeys(&auth.device, count);
    Ok(())
}

/// Consumes up to `count` prekeys from each of the user's devices. The
/// bundle is bounded by the smallest pool so every slot has one key per
/// device.
pub async fn get_prekeys(
    core: &mut Core,
    auth: &UserAuth,
    count: u64,
) -> Result<DevicePreKeyBundle, ServerError> {
    let record = core
        .registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    let devices: Vec<DeviceKey> = record
        .devices
        .iter()
        .filter_map(|d| DeviceKey::from_slice(&d.device_key))
        .collect();
    let bundle = core
        .storage
        .consume_prekeys(&auth.user, &devices, count)
        .await?;
    for list in &bundle.lists {
        if let Some(device) = DeviceKey::from_slice(&list.device_key) {
            core.registry.set_remaining_prekeys(&device, list.remaining);
        }
    }
    Ok(bundle)
}

/// Accepts new topic keys together with one encrypted copy of every key
/// for every sibling device, and fans the copies out.
pub async fn add_topic_keys(
    core: &mut Core,
    bundle: TopicKeyBundle,
) -> Result<Vec<PushTarget>, ServerError> {
    let auth = parse_auth(&bundle.user_key, &bundle.device_key, &bundle.auth_token)?;
    let record = core
        .registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    if bundle.application.chars().count() > MAX_APP_ID_LEN {
        return Err(ServerError::InvalidRequest(
            "application id too long".to_string(),
        ));
    }
    for key in &bundle.keys {
        crypto::verify(&bundle.user_key, &key.signed_payload(), &key.signature)
            .map_err(|_| ServerError::InvalidSignature)?;
    }

    // every sibling device in this application must receive a copy
    let expected: HashSet<Vec<u8>> = record
        .devices
        .iter()
        .filter(|d| d.application == bundle.application && d.device_key != bundle.device_key)
        .map(|d| d.device_key.clone())
        .collect();
    let listed: HashSet<Vec<u8>> = bundle
        .messages
        .iter()
        .map(|l| l.device_key.clone())
        .collect();
    if expected != listed || bundle.messages.len() != expected.len() {
        return Err(ServerError::InvalidKeyUpload(
            "recipient devices do not match the user's devices".to_string(),
        ));
    }
    // ...and a copy of every uploaded key
    let uploaded: HashSet<&[u8]> = bundle.keys.iter().map(|k| k.signature_key.as_slice()).collect();
    for list in &bundle.messages {
        let carried: HashSet<&[u8]> = list
            .messages
            .iter()
            .map(|m| m.signature_key.as_slice())
            .collect();
        if carried != uploaded || list.messages.len() != uploaded.len() {
            let device = DeviceKey::from_slice(&list.device_key)
                .map(|d| d.short())
                .unwrap_or_default();
            return Err(ServerError::InvalidKeyUpload(format!(
                "incomplete key messages for device {device}"
            )));
        }
    }

    let total = core
        .storage
        .store_topic_keys(&auth.user, &bundle.application, bundle.keys)
        .await?;
    let targets = core
        .registry
        .enqueue_topic_key_messages(&bundle.messages, &bundle.application);
    core.registry.set_remaining_topic_keys(&auth.user, total);
    Ok(targets)
}

/// Consumes one topic key from the receiver's queue for the given
/// application.
pub async fn get_topic_key(
    core: &mut Core,
    auth: &UserAuth,
    receiver: &UserKey,
    application: &str,
) -> Result<TopicKey, ServerError> {
    core.registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    if core.registry.user(receiver).is_none() {
        return Err(ServerError::ResourceNotAvailable(format!(
            "user {}",
            receiver.short()
        )));
    }
    let (key, remaining) = core
        .storage
        .consume_topic_key(receiver, application)
        .await?;
    core.registry.set_remaining_topic_keys(receiver, remaining);
    Ok(key)
}

/// Bulk topic-key fetch; receivers with an empty queue are skipped.
pub async fn get_topic_keys(
    core: &mut Core,
    request: TopicKeyRequest,
) -> Result<TopicKeyResponse, ServerError> {
    let auth = parse_auth(&request.user_key, &request.device_key, &request.auth_token)?;
    core.registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    let mut response = TopicKeyResponse::default();
    for receiver_bytes in &request.receivers {
        let Some(receiver) = UserKey::from_slice(receiver_bytes) else {
            continue;
        };
        if core.registry.user(&receiver).is_none() {
            continue;
        }
        match core
            .storage
            .consume_topic_key(&receiver, &request.application)
            .await
        {
            Ok((key, remaining)) => {
                core.registry.set_remaining_topic_keys(&receiver, remaining);
                response.keys.push(UserTopicKey {
                    user_key: receiver_bytes.clone(),
                    key,
                });
            }
            Err(ServerError::ResourceNotAvailable(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(response)
}
