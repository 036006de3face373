//! Stateless request checks, composed by the handlers.
//!
//! Every check raises a typed `ServerError` kind; handlers propagate them
//! unchanged and the HTTP adapter turns kinds into status codes.

use rendezvous_shared::constants::{
    FILE_HASH_SIZE, FILE_TAG_SIZE, FRESHNESS_WINDOW_SECS, MESSAGE_ID_SIZE, METADATA_LIMIT,
    TOPIC_ID_SIZE,
};
use rendezvous_shared::records::{
    verify_signed, Device, InternalUser, Topic, TopicUpdate,
};
use rendezvous_shared::types::UserKey;

use crate::error::ServerError;

/// Rejects timestamps outside the 60 s window around now.
pub fn check_freshness(timestamp: i64, now: i64) -> Result<(), ServerError> {
    if (now - timestamp).abs() > FRESHNESS_WINDOW_SECS {
        return Err(ServerError::RequestOutdated);
    }
    Ok(())
}

/// Verifies a user record against its own identity key.
pub fn verify_self_signed_user(user: &InternalUser) -> Result<(), ServerError> {
    verify_signed(user, &user.identity_key).map_err(|_| ServerError::InvalidSignature)
}

fn check_immutable_fields(old: &InternalUser, new: &InternalUser) -> Result<(), ServerError> {
    if new.identity_key != old.identity_key {
        return Err(ServerError::InvalidRequest(
            "identity key changed".to_string(),
        ));
    }
    if new.creation_time != old.creation_time {
        return Err(ServerError::InvalidRequest(
            "creation time changed".to_string(),
        ));
    }
    if new.name != old.name {
        return Err(ServerError::InvalidRequest("name changed".to_string()));
    }
    if new.notification_server != old.notification_server {
        return Err(ServerError::InvalidRequest(
            "notification server changed".to_string(),
        ));
    }
    if new.timestamp <= old.timestamp {
        return Err(ServerError::RequestOutdated);
    }
    Ok(())
}

/// A device-add mutation: exactly one device appended at the tail, all
/// other fields untouched, timestamp strictly newer. Returns the added
/// device.
pub fn validate_device_added(
    old: &InternalUser,
    new: &InternalUser,
) -> Result<Device, ServerError> {
    check_immutable_fields(old, new)?;
    if new.devices.len() != old.devices.len() + 1 {
        return Err(ServerError::InvalidRequest(
            "expected exactly one added device".to_string(),
        ));
    }
    if new.devices[..old.devices.len()] != old.devices[..] {
        return Err(ServerError::InvalidRequest(
            "existing devices changed".to_string(),
        ));
    }
    Ok(new.devices[old.devices.len()].clone())
}

/// A device-remove mutation: exactly one device gone, order preserved.
/// Returns the removed device.
pub fn validate_device_removed(
    old: &InternalUser,
    new: &InternalUser,
) -> Result<Device, ServerError> {
    check_immutable_fields(old, new)?;
    if new.devices.len() + 1 != old.devices.len() {
        return Err(ServerError::InvalidRequest(
            "expected exactly one removed device".to_string(),
        ));
    }
    let mut removed = None;
    let mut new_iter = new.devices.iter();
    let mut pending = new_iter.next();
    for device in &old.devices {
        match pending {
            Some(next) if next == device => pending = new_iter.next(),
            _ => {
                if removed.is_some() {
                    return Err(ServerError::InvalidRequest(
                        "devices reordered".to_string(),
                    ));
                }
                removed = Some(device.clone());
            }
        }
    }
    match (removed, pending) {
        (Some(device), None) => Ok(device),
        _ => Err(ServerError::InvalidRequest(
            "devices reordered".to_string(),
        )),
    }
}

/// Topic creation invariants (§ chain seed). `user_exists` is the
/// registry lookup, injected so this stays free of registry state.
pub fn validate_topic_creation(
    topic: &Topic,
    authenticated_user: &UserKey,
    now: i64,
    user_exists: impl Fn(&UserKey) -> bool,
) -> Result<(), ServerError> {
    check_freshness(topic.timestamp, now)?;
    if topic.creation_time != topic.timestamp {
        return Err(ServerError::InvalidRequest(
            "creation time differs from timestamp".to_string(),
        ));
    }
    if topic.topic_id.len() != TOPIC_ID_SIZE {
        return Err(ServerError::InvalidRequest("malformed topic id".to_string()));
    }
    let creator = topic.creator().ok_or_else(|| {
        ServerError::InvalidRequest("creator index out of range".to_string())
    })?;
    if creator.role() != Some(rendezvous_shared::records::Role::Admin) {
        return Err(ServerError::InvalidRequest(
            "creator must be an admin".to_string(),
        ));
    }
    let creator_info = creator.creation_info.as_ref().ok_or_else(|| {
        ServerError::InvalidRequest("creator lacks creation info".to_string())
    })?;
    if creator_info.user_key != authenticated_user.as_bytes() {
        return Err(ServerError::InvalidRequest(
            "creator does not match authenticated user".to_string(),
        ));
    }
    verify_signed(topic, &creator.signature_key).map_err(|_| ServerError::InvalidSignature)?;

    for member in &topic.members {
        if member.role().is_none() {
            return Err(ServerError::InvalidRequest("invalid member role".to_string()));
        }
        let info = member.creation_info.as_ref().ok_or_else(|| {
            ServerError::InvalidRequest("member lacks creation info".to_string())
        })?;
        let user_key = UserKey::from_slice(&info.user_key).ok_or_else(|| {
            ServerError::InvalidRequest("malformed member user key".to_string())
        })?;
        if !user_exists(&user_key) {
            return Err(ServerError::ResourceNotAvailable(format!(
                "user {}",
                user_key.short()
            )));
        }
        // the member's identity key vouches for its topic key pair
        let mut payload = member.signature_key.clone();
        payload.extend_from_slice(&info.encryption_key);
        rendezvous_shared::crypto::verify(&info.user_key, &payload, &info.signature)
            .map_err(|_| ServerError::InvalidSignature)?;
    }
    Ok(())
}

/// Structural update invariants. File availability needs storage and is
/// checked by the handler; everything else lives here.
pub fn validate_topic_update(update: &TopicUpdate, topic: &Topic) -> Result<(), ServerError> {
    let author = topic
        .members
        .get(update.index_in_member_list as usize)
        .ok_or_else(|| ServerError::InvalidRequest("author index out of range".to_string()))?;
    let role = author
        .role()
        .ok_or_else(|| ServerError::InvalidRequest("invalid author role".to_string()))?;
    if !role.may_post() {
        return Err(ServerError::InvalidRequest(
            "observers may not post".to_string(),
        ));
    }
    if update.metadata.len() >= METADATA_LIMIT {
        return Err(ServerError::InvalidRequest("metadata too large".to_string()));
    }
    for file in &update.files {
        if file.id.len() != MESSAGE_ID_SIZE
            || file.hash.len() != FILE_HASH_SIZE
            || file.tag.len() != FILE_TAG_SIZE
        {
            return Err(ServerError::InvalidRequest(
                "malformed file reference".to_string(),
            ));
        }
    }
    verify_signed(update, &author.signature_key).map_err(|_| ServerError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_shared::crypto::KeyPair;
    use rendezvous_shared::records::{
        CreationInfo, FileRef, MemberInfo, Role, Signed,
    };

    fn device(n: u8) -> Device {
        Device {
            device_key: vec![n; 32],
            creation_time: 1_000,
            is_active: true,
            application: "chat".to_string(),
        }
    }

    fn signed_user(keys: &KeyPair, devices: Vec<Device>, timestamp: i64) -> InternalUser {
        let mut user = InternalUser {
            identity_key: keys.public.to_vec(),
            creation_time: 1_000,
            name: "alice".to_string(),
            devices,
            notification_server: String::new(),
            timestamp,
            signature: Vec::new(),
        };
        user.signature = keys.sign(&user.signed_bytes());
        user
    }

    #[test]
    fn test_freshness_window() {
        assert!(check_freshness(1_000, 1_000).is_ok());
        assert!(check_freshness(1_000, 1_060).is_ok());
        assert!(check_freshness(1_060, 1_000).is_ok());
        assert!(matches!(
            check_freshness(1_000, 1_061),
            Err(ServerError::RequestOutdated)
        ));
        assert!(matches!(
            check_freshness(1_061, 1_000),
            Err(ServerError::RequestOutdated)
        ));
    }

    #[test]
    fn test_self_signed_user() {
        let keys = KeyPair::generate();
        let user = signed_user(&keys, vec![device(1)], 2_000);
        assert!(verify_self_signed_user(&user).is_ok());

        let mut tampered = user.clone();
        tampered.name = "mallory".to_string();
        assert!(matches!(
            verify_self_signed_user(&tampered),
            Err(ServerError::InvalidSignature)
        ));
    }

    #[test]
    fn test_device_added() {
        let keys = KeyPair::generate();
        let old = signed_user(&keys, vec![device(1)], 2_000);
        let new = signed_user(&keys, vec![device(1), device(2)], 2_001);
        let added = validate_device_added(&old, &new).unwrap();
        assert_eq!(added, device(2));
    }

    #[test]
    fn test_device_added_rejects_altered_name() {
        let keys = KeyPair::generate();
        let old = signed_user(&keys, vec![device(1)], 2_000);
        let mut new = signed_user(&keys, vec![device(1), device(2)], 2_001);
        new.name = "bob".to_string();
        new.signature.clear();
        new.signature = keys.sign(&new.signed_bytes());
        assert!(matches!(
            validate_device_added(&old, &new),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_device_added_requires_newer_timestamp() {
        let keys = KeyPair::generate();
        let old = signed_user(&keys, vec![device(1)], 2_000);
        let new = signed_user(&keys, vec![device(1), device(2)], 2_000);
        assert!(matches!(
            validate_device_added(&old, &new),
            Err(ServerError::RequestOutdated)
        ));
    }

    #[test]
    fn test_device_added_rejects_replaced_prefix() {
        let keys = KeyPair::generate();
        let old = signed_user(&keys, vec![device(1), device(2)], 2_000);
        let new = signed_user(&keys, vec![device(1), device(3), device(4)], 2_001);
        assert!(matches!(
            validate_device_added(&old, &new),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_device_removed() {
        let keys = KeyPair::generate();
        let old = signed_user(&keys, vec![device(1), device(2), device(3)], 2_000);
        let new = signed_user(&keys, vec![device(1), device(3)], 2_001);
        let removed = validate_device_removed(&old, &new).unwrap();
        assert_eq!(removed, device(2));
    }

    #[test]
    fn test_device_removed_rejects_swap() {
        let keys = KeyPair::generate();
        let old = signed_user(&keys, vec![device(1), device(2), device(3)], 2_000);
        // one removed but another replaced
        let new = signed_user(&keys, vec![device(1), device(4)], 2_001);
        assert!(matches!(
            validate_device_removed(&old, &new),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    fn signed_topic(
        creator_keys: &KeyPair,
        creator_identity: &KeyPair,
        member_identity: &KeyPair,
        member_topic_keys: &KeyPair,
        now: i64,
    ) -> Topic {
        let creator_encryption = [7u8; 32];
        let mut creator_payload = creator_keys.public.to_vec();
        creator_payload.extend_from_slice(&creator_encryption);
        let member_encryption = [8u8; 32];
        let mut member_payload = member_topic_keys.public.to_vec();
        member_payload.extend_from_slice(&member_encryption);

        let mut topic = Topic {
            topic_id: vec![5u8; 12],
            application: "chat".to_string(),
            creation_time: now,
            index_of_message_creator: 0,
            members: vec![
                MemberInfo {
                    signature_key: creator_keys.public.to_vec(),
                    role: Role::Admin.raw(),
                    encrypted_message_key: vec![1, 2],
                    creation_info: Some(CreationInfo {
                        user_key: creator_identity.public.to_vec(),
                        encryption_key: creator_encryption.to_vec(),
                        signature: creator_identity.sign(&creator_payload),
                    }),
                },
                MemberInfo {
                    signature_key: member_topic_keys.public.to_vec(),
                    role: Role::Participant.raw(),
                    encrypted_message_key: vec![3, 4],
                    creation_info: Some(CreationInfo {
                        user_key: member_identity.public.to_vec(),
                        encryption_key: member_encryption.to_vec(),
                        signature: member_identity.sign(&member_payload),
                    }),
                },
            ],
            timestamp: now,
            signature: Vec::new(),
        };
        topic.signature = creator_keys.sign(&topic.signed_bytes());
        topic
    }

    #[test]
    fn test_topic_creation_accepts_valid_record() {
        let creator_keys = KeyPair::generate();
        let creator_identity = KeyPair::generate();
        let member_identity = KeyPair::generate();
        let member_topic_keys = KeyPair::generate();
        let now = 5_000;
        let topic = signed_topic(
            &creator_keys,
            &creator_identity,
            &member_identity,
            &member_topic_keys,
            now,
        );
        let creator = UserKey(creator_identity.public);
        assert!(validate_topic_creation(&topic, &creator, now, |_| true).is_ok());
    }

    #[test]
    fn test_topic_creation_rejects_unknown_member() {
        let creator_keys = KeyPair::generate();
        let creator_identity = KeyPair::generate();
        let member_identity = KeyPair::generate();
        let member_topic_keys = KeyPair::generate();
        let now = 5_000;
        let topic = signed_topic(
            &creator_keys,
            &creator_identity,
            &member_identity,
            &member_topic_keys,
            now,
        );
        let creator = UserKey(creator_identity.public);
        let known = creator_identity.public;
        let result = validate_topic_creation(&topic, &creator, now, |key| key.0 == known);
        assert!(matches!(result, Err(ServerError::ResourceNotAvailable(_))));
    }

    #[test]
    fn test_topic_creation_rejects_wrong_creator() {
        let creator_keys = KeyPair::generate();
        let creator_identity = KeyPair::generate();
        let member_identity = KeyPair::generate();
        let member_topic_keys = KeyPair::generate();
        let now = 5_000;
        let topic = signed_topic(
            &creator_keys,
            &creator_identity,
            &member_identity,
            &member_topic_keys,
            now,
        );
        // authenticated as the participant, not the creator
        let wrong = UserKey(member_identity.public);
        assert!(matches!(
            validate_topic_creation(&topic, &wrong, now, |_| true),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_topic_creation_rejects_time_mismatch() {
        let creator_keys = KeyPair::generate();
        let creator_identity = KeyPair::generate();
        let member_identity = KeyPair::generate();
        let member_topic_keys = KeyPair::generate();
        let now = 5_000;
        let mut topic = signed_topic(
            &creator_keys,
            &creator_identity,
            &member_identity,
            &member_topic_keys,
            now,
        );
        topic.creation_time = now - 1;
        topic.signature.clear();
        topic.signature = creator_keys.sign(&topic.signed_bytes());
        let creator = UserKey(creator_identity.public);
        assert!(matches!(
            validate_topic_creation(&topic, &creator, now, |_| true),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_topic_creation_rejects_tampered_signature() {
        let creator_keys = KeyPair::generate();
        let creator_identity = KeyPair::generate();
        let member_identity = KeyPair::generate();
        let member_topic_keys = KeyPair::generate();
        let now = 5_000;
        let mut topic = signed_topic(
            &creator_keys,
            &creator_identity,
            &member_identity,
            &member_topic_keys,
            now,
        );
        topic.application = "game".to_string();
        let creator = UserKey(creator_identity.public);
        assert!(matches!(
            validate_topic_creation(&topic, &creator, now, |_| true),
            Err(ServerError::InvalidSignature)
        ));
    }

    fn signed_update(author_keys: &KeyPair, index: u32, metadata: Vec<u8>) -> TopicUpdate {
        let mut update = TopicUpdate {
            index_in_member_list: index,
            files: vec![],
            metadata,
            signature: Vec::new(),
        };
        update.signature = author_keys.sign(&update.signed_bytes());
        update
    }

    fn topic_for_updates(admin: &KeyPair, observer: &KeyPair) -> Topic {
        Topic {
            topic_id: vec![5u8; 12],
            application: "chat".to_string(),
            creation_time: 1_000,
            index_of_message_creator: 0,
            members: vec![
                MemberInfo {
                    signature_key: admin.public.to_vec(),
                    role: Role::Admin.raw(),
                    ..Default::default()
                },
                MemberInfo {
                    signature_key: observer.public.to_vec(),
                    role: Role::Observer.raw(),
                    ..Default::default()
                },
            ],
            timestamp: 1_000,
            signature: vec![1u8; 64],
        }
    }

    #[test]
    fn test_update_accepts_admin_author() {
        let admin = KeyPair::generate();
        let observer = KeyPair::generate();
        let topic = topic_for_updates(&admin, &observer);
        let update = signed_update(&admin, 0, vec![1, 2, 3]);
        assert!(validate_topic_update(&update, &topic).is_ok());
    }

    #[test]
    fn test_update_rejects_observer_author() {
        let admin = KeyPair::generate();
        let observer = KeyPair::generate();
        let topic = topic_for_updates(&admin, &observer);
        let update = signed_update(&observer, 1, vec![]);
        assert!(matches!(
            validate_topic_update(&update, &topic),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_update_rejects_oversized_metadata() {
        let admin = KeyPair::generate();
        let observer = KeyPair::generate();
        let topic = topic_for_updates(&admin, &observer);
        let update = signed_update(&admin, 0, vec![0u8; METADATA_LIMIT]);
        assert!(matches!(
            validate_topic_update(&update, &topic),
            Err(ServerError::InvalidRequest(_))
        ));
        let update = signed_update(&admin, 0, vec![0u8; METADATA_LIMIT - 1]);
        assert!(validate_topic_update(&update, &topic).is_ok());
    }

    #[test]
    fn test_update_rejects_malformed_file_ref() {
        let admin = KeyPair::generate();
        let observer = KeyPair::generate();
        let topic = topic_for_updates(&admin, &observer);
        let mut update = TopicUpdate {
            index_in_member_list: 0,
            files: vec![FileRef {
                id: vec![1u8; 12],
                hash: vec![2u8; 31],
                tag: vec![3u8; 16],
            }],
            metadata: vec![],
            signature: Vec::new(),
        };
        update.signature = admin.sign(&update.signed_bytes());
        assert!(matches!(
            validate_topic_update(&update, &topic),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_update_rejects_foreign_signature() {
        let admin = KeyPair::generate();
        let observer = KeyPair::generate();
        let topic = topic_for_updates(&admin, &observer);
        // signed by the observer but claiming the admin slot
        let update = signed_update(&observer, 0, vec![]);
        assert!(matches!(
            validate_topic_update(&update, &topic),
            Err(ServerError::InvalidSignature)
        ));
    }
}
