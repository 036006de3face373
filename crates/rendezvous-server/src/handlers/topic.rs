//! Topic surface: creation, update commits into the hash chain, range
//! reads, file fetches and mailbox drains.

use std::collections::HashMap;

use tracing::info;

use rendezvous_shared::crypto;
use rendezvous_shared::records::{
    ChainState, DeviceDownload, FileData, MessageChain, Topic, TopicState, TopicUpdateUpload,
};
use rendezvous_shared::types::{DeviceKey, MessageId, TopicId, UserKey};

use super::{Core, UserAuth};
use crate::error::ServerError;
use crate::registry::PushTarget;
use crate::validator;

/// Seeds a topic: chain index 0, chain output = topic id. The record is
/// fanned out to every member device except the creator's.
pub async fn create(
    core: &mut Core,
    auth: &UserAuth,
    topic: Topic,
    now: i64,
) -> Result<Vec<PushTarget>, ServerError> {
    core.registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    {
        let registry = &core.registry;
        validator::validate_topic_creation(&topic, &auth.user, now, |key| {
            registry.user(key).is_some()
        })?;
    }
    let topic_id = TopicId::from_slice(&topic.topic_id)
        .ok_or_else(|| ServerError::InvalidRequest("malformed topic id".to_string()))?;
    if core.registry.topic(&topic_id).is_some() {
        return Err(ServerError::ResourceAlreadyExists(format!(
            "topic {}",
            topic_id.short()
        )));
    }
    core.storage.create_topic(&topic_id).await?;
    core.registry.insert_topic(
        topic_id,
        TopicState {
            info: topic.clone(),
            chain: ChainState {
                chain_index: 0,
                output: topic_id.as_bytes().to_vec(),
            },
        },
    );
    let targets = core.registry.enqueue_topic_update(&topic, &auth.device);
    info!(topic = %topic_id.short(), members = topic.members.len(), "topic created");
    Ok(targets)
}

/// Commits one update: stores its files, appends it to the segment file,
/// advances the chain head and fans the committed message out.
pub async fn add_message(
    core: &mut Core,
    upload: TopicUpdateUpload,
) -> Result<(ChainState, Vec<PushTarget>), ServerError> {
    let device = DeviceKey::from_slice(&upload.device_key)
        .ok_or_else(|| ServerError::InvalidRequest("malformed device key".to_string()))?;
    core.registry
        .authenticate_device(&device, &upload.auth_token)?;
    let topic_id = TopicId::from_slice(&upload.topic_id)
        .ok_or_else(|| ServerError::InvalidRequest("malformed topic id".to_string()))?;
    let state = core
        .registry
        .topic(&topic_id)
        .ok_or_else(|| ServerError::ResourceNotAvailable(format!("topic {}", topic_id.short())))?;
    let chain = state.chain.clone();
    validator::validate_topic_update(&upload.update, &state.info)?;

    // every referenced file must already exist or arrive in this upload
    // with a matching hash
    let uploaded: HashMap<&[u8], &FileData> = upload
        .files
        .iter()
        .map(|f| (f.id.as_slice(), f))
        .collect();
    for file_ref in &upload.update.files {
        match uploaded.get(file_ref.id.as_slice()) {
            Some(data) => {
                if crypto::sha256(&data.data)[..] != file_ref.hash[..] {
                    return Err(ServerError::InvalidRequest(
                        "file hash mismatch".to_string(),
                    ));
                }
            }
            None => {
                let message_id = MessageId::from_slice(&file_ref.id).ok_or_else(|| {
                    ServerError::InvalidRequest("malformed file id".to_string())
                })?;
                if !core.storage.file_exists(&topic_id, &message_id).await {
                    return Err(ServerError::InvalidRequest(format!(
                        "file {} not uploaded",
                        message_id.short()
                    )));
                }
            }
        }
    }
    for file in &upload.files {
        let message_id = MessageId::from_slice(&file.id)
            .ok_or_else(|| ServerError::InvalidRequest("malformed file id".to_string()))?;
        core.storage
            .store_file(&topic_id, &message_id, &file.data)
            .await?;
    }

    let new_index = chain.chain_index + 1;
    let new_output = core
        .storage
        .append_update(&topic_id, &upload.update, new_index, &chain.output)
        .await?;
    let new_chain = ChainState {
        chain_index: new_index,
        output: new_output.to_vec(),
    };
    let targets =
        core.registry
            .enqueue_message(&topic_id, new_chain.clone(), upload.update, &device);
    Ok((new_chain, targets))
}

/// Drains the device mailbox and advertises delivery receipts back to
/// every member of every topic the drain covered.
pub fn get_messages(
    core: &mut Core,
    auth: &UserAuth,
) -> Result<(DeviceDownload, Vec<PushTarget>), ServerError> {
    core.registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    let drained = core.registry.drain_mailbox(&auth.device);

    let mut per_topic: HashMap<TopicId, u32> = HashMap::new();
    for message in &drained.messages {
        let Some(topic_id) = TopicId::from_slice(&message.topic_id) else {
            continue;
        };
        let max = per_topic.entry(topic_id).or_insert(0);
        *max = (*max).max(message.chain.chain_index);
    }

    let mut targets = Vec::new();
    for (topic_id, max_index) in per_topic {
        let Some(state) = core.registry.topic(&topic_id) else {
            continue;
        };
        let application = state.info.application.clone();
        let recipients: Vec<UserKey> = state
            .info
            .members
            .iter()
            .filter_map(|m| m.creation_info.as_ref())
            .filter_map(|info| UserKey::from_slice(&info.user_key))
            .collect();
        targets.extend(core.registry.enqueue_delivery_receipts(
            &recipients,
            &auth.user,
            &topic_id,
            max_index,
            &application,
        ));
    }
    Ok((drained, targets))
}

/// Reads committed updates `[start, start + count)` (1-based), bounded by
/// the chain head. Out-of-range reads return an empty chain.
pub async fn get_range(
    core: &Core,
    auth: &UserAuth,
    topic_id: &TopicId,
    start: u32,
    count: u32,
) -> Result<MessageChain, ServerError> {
    core.registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    let state = core
        .registry
        .topic(topic_id)
        .ok_or_else(|| ServerError::ResourceNotAvailable(format!("topic {}", topic_id.short())))?;
    let end = start.saturating_add(count).min(state.chain.chain_index + 1);
    if start == 0 || start >= end {
        return Ok(MessageChain::default());
    }
    let updates = core.storage.read_updates(topic_id, start, end - start).await?;
    Ok(MessageChain { updates })
}

/// Returns an encrypted file to any member of the topic.
pub async fn get_file(
    core: &Core,
    auth: &UserAuth,
    topic_id: &TopicId,
    message_id: &MessageId,
) -> Result<Vec<u8>, ServerError> {
    core.registry
        .authenticate_user(&auth.user, &auth.device, &auth.token)?;
    let state = core
        .registry
        .topic(topic_id)
        .ok_or_else(|| ServerError::ResourceNotAvailable(format!("topic {}", topic_id.short())))?;
    let is_member = state.info.members.iter().any(|m| {
        m.creation_info
            .as_ref()
            .is_some_and(|info| info.user_key == auth.user.as_bytes())
    });
    if !is_member {
        return Err(ServerError::AuthenticationFailed);
    }
    core.storage.read_file(topic_id, message_id).await
}
