//! Authoritative in-memory state: users, devices, tokens, mailboxes and
//! topic chain heads.
//!
//! Mutators never perform I/O. Every mutation flags the registry dirty;
//! the request pipeline decides when to snapshot. Fanout helpers return
//! the push targets they touched so the caller can notify after the
//! commit, outside the lock.

use std::collections::HashMap;

use rendezvous_shared::constants::AUTH_TOKEN_SIZE;
use rendezvous_shared::crypto;
use rendezvous_shared::records::{
    AllowedUser, ChainState, DeviceDownload, InternalUser, MailboxEntry, ManagementData, Message,
    Receipt, TokenEntry, Topic, TopicKeyMessage, TopicKeyMessageList, TopicState, TopicUpdate,
};
use rendezvous_shared::types::{AuthToken, DeviceKey, TopicId, UserKey};

use crate::error::ServerError;

/// A device to notify after a commit, with the push token and the owning
/// user's notification server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub device: DeviceKey,
    pub token: Vec<u8>,
    pub endpoint: String,
}

#[derive(Debug)]
pub struct Registry {
    admin_token: AuthToken,
    allowed_users: HashMap<String, AllowedUser>,
    users: HashMap<UserKey, InternalUser>,
    auth_tokens: HashMap<DeviceKey, AuthToken>,
    notification_tokens: HashMap<DeviceKey, Vec<u8>>,
    mailboxes: HashMap<DeviceKey, DeviceDownload>,
    old_mailboxes: HashMap<DeviceKey, DeviceDownload>,
    topics: HashMap<TopicId, TopicState>,
    dirty: bool,
}

impl Registry {
    pub fn new(admin_token: AuthToken) -> Self {
        Self {
            admin_token,
            allowed_users: HashMap::new(),
            users: HashMap::new(),
            auth_tokens: HashMap::new(),
            notification_tokens: HashMap::new(),
            mailboxes: HashMap::new(),
            old_mailboxes: HashMap::new(),
            topics: HashMap::new(),
            dirty: false,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns and clears the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    // --- authentication ---

    pub fn admin_token(&self) -> &AuthToken {
        &self.admin_token
    }

    pub fn renew_admin_token(&mut self) -> AuthToken {
        self.admin_token = AuthToken(crypto::random_array::<AUTH_TOKEN_SIZE>());
        self.dirty = true;
        self.admin_token
    }

    pub fn authenticate_admin(&self, token: &[u8]) -> Result<(), ServerError> {
        if crypto::constant_time_eq(token, self.admin_token.as_bytes()) {
            Ok(())
        } else {
            Err(ServerError::AuthenticationFailed)
        }
    }

    /// Requires the user to exist, the device to belong to the user, and
    /// the token to match.
    pub fn authenticate_user(
        &self,
        user: &UserKey,
        device: &DeviceKey,
        token: &[u8],
    ) -> Result<&InternalUser, ServerError> {
        let record = self
            .users
            .get(user)
            .ok_or(ServerError::AuthenticationFailed)?;
        let owns = record
            .devices
            .iter()
            .any(|d| d.device_key == device.as_bytes());
        if !owns {
            return Err(ServerError::AuthenticationFailed);
        }
        self.check_device_token(device, token)?;
        Ok(record)
    }

    /// Authenticates a device without user binding and resolves its owner.
    pub fn authenticate_device(
        &self,
        device: &DeviceKey,
        token: &[u8],
    ) -> Result<(UserKey, &InternalUser), ServerError> {
        let (key, record) = self
            .device_owner(device)
            .ok_or(ServerError::AuthenticationFailed)?;
        self.check_device_token(device, token)?;
        Ok((key, record))
    }

    fn check_device_token(&self, device: &DeviceKey, token: &[u8]) -> Result<(), ServerError> {
        let expected = self
            .auth_tokens
            .get(device)
            .ok_or(ServerError::AuthenticationFailed)?;
        if crypto::constant_time_eq(token, expected.as_bytes()) {
            Ok(())
        } else {
            Err(ServerError::AuthenticationFailed)
        }
    }

    pub fn device_owner(&self, device: &DeviceKey) -> Option<(UserKey, &InternalUser)> {
        self.users.iter().find_map(|(key, user)| {
            user.devices
                .iter()
                .any(|d| d.device_key == device.as_bytes())
                .then_some((*key, user))
        })
    }

    pub fn device_key_in_use(&self, device: &DeviceKey) -> bool {
        self.device_owner(device).is_some()
    }

    // --- registration gate ---

    pub fn allow_user(&mut self, entry: AllowedUser) {
        self.allowed_users.insert(entry.name.clone(), entry);
        self.dirty = true;
    }

    pub fn allowed_user(&self, name: &str) -> Option<&AllowedUser> {
        self.allowed_users.get(name)
    }

    pub fn remove_allowed_user(&mut self, name: &str) {
        if self.allowed_users.remove(name).is_some() {
            self.dirty = true;
        }
    }

    /// The pin gate. Expired entries and entries that exhaust their tries
    /// are evicted; eviction is permanent until the admin re-adds the
    /// name.
    pub fn can_register(&mut self, name: &str, pin: u32, now: i64) -> bool {
        let Some(entry) = self.allowed_users.get_mut(name) else {
            return false;
        };
        if entry.expiry < now {
            self.allowed_users.remove(name);
            self.dirty = true;
            return false;
        }
        if entry.pin == pin {
            return true;
        }
        entry.tries_remaining = entry.tries_remaining.saturating_sub(1);
        if entry.tries_remaining == 0 {
            self.allowed_users.remove(name);
        }
        self.dirty = true;
        false
    }

    // --- users and devices ---

    pub fn user(&self, key: &UserKey) -> Option<&InternalUser> {
        self.users.get(key)
    }

    pub fn user_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.users.values().map(|u| u.name.clone()).collect();
        names.sort();
        names
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.users.values().any(|u| u.name == name)
    }

    pub fn insert_user(&mut self, key: UserKey, record: InternalUser) {
        self.users.insert(key, record);
        self.dirty = true;
    }

    /// Removes a user and every per-device residue: tokens, push tokens
    /// and both mailbox generations.
    pub fn remove_user(&mut self, key: &UserKey) -> Option<InternalUser> {
        let record = self.users.remove(key)?;
        for device in &record.devices {
            if let Some(device_key) = DeviceKey::from_slice(&device.device_key) {
                self.drop_device(&device_key);
            }
        }
        self.dirty = true;
        Some(record)
    }

    pub fn mint_device_token(&mut self, device: &DeviceKey) -> AuthToken {
        let token = AuthToken(crypto::random_array::<AUTH_TOKEN_SIZE>());
        self.auth_tokens.insert(*device, token);
        self.dirty = true;
        token
    }

    pub fn drop_device(&mut self, device: &DeviceKey) {
        self.auth_tokens.remove(device);
        self.notification_tokens.remove(device);
        self.mailboxes.remove(device);
        self.old_mailboxes.remove(device);
        self.dirty = true;
    }

    pub fn set_notification_token(&mut self, device: &DeviceKey, token: Vec<u8>) {
        self.notification_tokens.insert(*device, token);
        self.dirty = true;
    }

    // --- mailboxes ---

    pub fn init_mailbox(&mut self, device: &DeviceKey, pre_keys: u64, topic_keys: u64) {
        self.mailboxes.insert(
            *device,
            DeviceDownload {
                remaining_pre_keys: pre_keys,
                remaining_topic_keys: topic_keys,
                ..Default::default()
            },
        );
        self.dirty = true;
    }

    pub fn mailbox(&self, device: &DeviceKey) -> Option<&DeviceDownload> {
        self.mailboxes.get(device)
    }

    pub fn set_remaining_prekeys(&mut self, device: &DeviceKey, remaining: u64) {
        self.mailboxes.entry(*device).or_default().remaining_pre_keys = remaining;
        self.dirty = true;
    }

    /// Sets the topic-key counter on every device of the user; the pool is
    /// per user, so every device advertises the same number.
    pub fn set_remaining_topic_keys(&mut self, user: &UserKey, remaining: u64) {
        let devices: Vec<DeviceKey> = match self.users.get(user) {
            Some(record) => record
                .devices
                .iter()
                .filter_map(|d| DeviceKey::from_slice(&d.device_key))
                .collect(),
            None => return,
        };
        for device in devices {
            self.mailboxes
                .entry(device)
                .or_default()
                .remaining_topic_keys = remaining;
        }
        self.dirty = true;
    }

    /// Empties the device's mailbox, keeping the key counters, and parks
    /// the drained snapshot as the retry copy.
    pub fn drain_mailbox(&mut self, device: &DeviceKey) -> DeviceDownload {
        let drained = self.mailboxes.remove(device).unwrap_or_default();
        self.mailboxes.insert(
            *device,
            DeviceDownload {
                remaining_pre_keys: drained.remaining_pre_keys,
                remaining_topic_keys: drained.remaining_topic_keys,
                ..Default::default()
            },
        );
        self.old_mailboxes.insert(*device, drained.clone());
        self.dirty = true;
        drained
    }

    // --- topics ---

    pub fn topic(&self, id: &TopicId) -> Option<&TopicState> {
        self.topics.get(id)
    }

    pub fn insert_topic(&mut self, id: TopicId, state: TopicState) {
        self.topics.insert(id, state);
        self.dirty = true;
    }

    pub fn remove_topic(&mut self, id: &TopicId) {
        if self.topics.remove(id).is_some() {
            self.dirty = true;
        }
    }

    // --- fanout ---

    fn push_target(&self, device: &DeviceKey, endpoint: &str) -> Option<PushTarget> {
        let token = self.notification_tokens.get(device)?;
        Some(PushTarget {
            device: *device,
            token: token.clone(),
            endpoint: endpoint.to_string(),
        })
    }

    /// Every member's active devices in the topic's application, except
    /// one. Members resolve to users through their creation info.
    fn member_devices(&self, topic: &Topic, except: Option<&DeviceKey>) -> Vec<(UserKey, DeviceKey)> {
        let mut devices = Vec::new();
        for member in &topic.members {
            let Some(info) = &member.creation_info else {
                continue;
            };
            let Some(user_key) = UserKey::from_slice(&info.user_key) else {
                continue;
            };
            let Some(user) = self.users.get(&user_key) else {
                continue;
            };
            for device in &user.devices {
                if !device.is_active || device.application != topic.application {
                    continue;
                }
                let Some(device_key) = DeviceKey::from_slice(&device.device_key) else {
                    continue;
                };
                if except == Some(&device_key) {
                    continue;
                }
                devices.push((user_key, device_key));
            }
        }
        devices
    }

    fn notification_endpoint(&self, user: &UserKey) -> String {
        self.users
            .get(user)
            .map(|u| u.notification_server.clone())
            .unwrap_or_default()
    }

    /// Fans a topic creation record out to every member device except the
    /// creator's.
    pub fn enqueue_topic_update(&mut self, record: &Topic, except: &DeviceKey) -> Vec<PushTarget> {
        let mut targets = Vec::new();
        for (user_key, device_key) in self.member_devices(record, Some(except)) {
            self.mailboxes
                .entry(device_key)
                .or_default()
                .topic_updates
                .push(record.clone());
            let endpoint = self.notification_endpoint(&user_key);
            if let Some(target) = self.push_target(&device_key, &endpoint) {
                targets.push(target);
            }
        }
        self.dirty = true;
        targets
    }

    /// Commits the new chain head and fans the committed update out to
    /// every member device except the sender's.
    pub fn enqueue_message(
        &mut self,
        topic_id: &TopicId,
        chain: ChainState,
        content: TopicUpdate,
        sender: &DeviceKey,
    ) -> Vec<PushTarget> {
        let Some(state) = self.topics.get_mut(topic_id) else {
            return Vec::new();
        };
        state.chain = chain.clone();
        let info = state.info.clone();
        let mut targets = Vec::new();
        for (user_key, device_key) in self.member_devices(&info, Some(sender)) {
            self.mailboxes
                .entry(device_key)
                .or_default()
                .messages
                .push(Message {
                    topic_id: topic_id.as_bytes().to_vec(),
                    chain: chain.clone(),
                    content: content.clone(),
                });
            let endpoint = self.notification_endpoint(&user_key);
            if let Some(target) = self.push_target(&device_key, &endpoint) {
                targets.push(target);
            }
        }
        self.dirty = true;
        targets
    }

    /// Delivers one encrypted topic-key copy per recipient device.
    pub fn enqueue_topic_key_messages(
        &mut self,
        lists: &[TopicKeyMessageList],
        application: &str,
    ) -> Vec<PushTarget> {
        let mut targets = Vec::new();
        for list in lists {
            let Some(device_key) = DeviceKey::from_slice(&list.device_key) else {
                continue;
            };
            let endpoint = self
                .device_owner(&device_key)
                .map(|(key, _)| self.notification_endpoint(&key))
                .unwrap_or_default();
            let mailbox = self.mailboxes.entry(device_key).or_default();
            for message in &list.messages {
                mailbox.topic_key_messages.push(TopicKeyMessage {
                    application: application.to_string(),
                    signature_key: message.signature_key.clone(),
                    payload: message.payload.clone(),
                });
            }
            if let Some(target) = self.push_target(&device_key, &endpoint) {
                targets.push(target);
            }
        }
        self.dirty = true;
        targets
    }

    /// Advances the stored receipt for `(sender, topic)` on every
    /// recipient device; only newly-advanced receipts produce a push.
    pub fn enqueue_delivery_receipts(
        &mut self,
        recipients: &[UserKey],
        sender: &UserKey,
        topic_id: &TopicId,
        chain_index: u32,
        application: &str,
    ) -> Vec<PushTarget> {
        let mut targets = Vec::new();
        for recipient in recipients {
            let Some(user) = self.users.get(recipient) else {
                continue;
            };
            let endpoint = user.notification_server.clone();
            let devices: Vec<DeviceKey> = user
                .devices
                .iter()
                .filter(|d| d.is_active && d.application == application)
                .filter_map(|d| DeviceKey::from_slice(&d.device_key))
                .collect();
            for device_key in devices {
                let mailbox = self.mailboxes.entry(device_key).or_default();
                let advanced = match mailbox.receipts.iter_mut().find(|r| {
                    r.user_key == sender.as_bytes() && r.topic_id == topic_id.as_bytes()
                }) {
                    Some(receipt) if receipt.chain_index < chain_index => {
                        receipt.chain_index = chain_index;
                        true
                    }
                    Some(_) => false,
                    None => {
                        mailbox.receipts.push(Receipt {
                            user_key: sender.as_bytes().to_vec(),
                            topic_id: topic_id.as_bytes().to_vec(),
                            chain_index,
                        });
                        true
                    }
                };
                if advanced {
                    if let Some(target) = self.push_target(&device_key, &endpoint) {
                        targets.push(target);
                    }
                }
            }
        }
        self.dirty = true;
        targets
    }

    // --- snapshot ---

    pub fn snapshot_data(&self) -> ManagementData {
        let mut data = ManagementData {
            admin_token: self.admin_token.as_bytes().to_vec(),
            ..Default::default()
        };
        data.allowed_users = self.allowed_users.values().cloned().collect();
        data.allowed_users.sort_by(|a, b| a.name.cmp(&b.name));
        data.users = self.users.values().cloned().collect();
        data.users.sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
        data.auth_tokens = token_entries(&self.auth_tokens, |t| t.as_bytes().to_vec());
        data.notification_tokens = token_entries(&self.notification_tokens, |t| t.clone());
        data.topics = self.topics.values().cloned().collect();
        data.topics.sort_by(|a, b| a.info.topic_id.cmp(&b.info.topic_id));
        data.mailboxes = mailbox_entries(&self.mailboxes);
        data.old_mailboxes = mailbox_entries(&self.old_mailboxes);
        data
    }

    pub fn restore(data: ManagementData) -> Result<Self, ServerError> {
        let admin_token = AuthToken::from_slice(&data.admin_token)
            .ok_or_else(|| ServerError::Internal("snapshot admin token malformed".to_string()))?;
        let mut registry = Registry::new(admin_token);
        for entry in data.allowed_users {
            registry.allowed_users.insert(entry.name.clone(), entry);
        }
        for user in data.users {
            let key = UserKey::from_slice(&user.identity_key)
                .ok_or_else(|| ServerError::Internal("snapshot user key malformed".to_string()))?;
            registry.users.insert(key, user);
        }
        for entry in data.auth_tokens {
            let device = DeviceKey::from_slice(&entry.device_key).ok_or_else(|| {
                ServerError::Internal("snapshot device key malformed".to_string())
            })?;
            let token = AuthToken::from_slice(&entry.token).ok_or_else(|| {
                ServerError::Internal("snapshot auth token malformed".to_string())
            })?;
            registry.auth_tokens.insert(device, token);
        }
        for entry in data.notification_tokens {
            let device = DeviceKey::from_slice(&entry.device_key).ok_or_else(|| {
                ServerError::Internal("snapshot device key malformed".to_string())
            })?;
            registry.notification_tokens.insert(device, entry.token);
        }
        for state in data.topics {
            let id = TopicId::from_slice(&state.info.topic_id).ok_or_else(|| {
                ServerError::Internal("snapshot topic id malformed".to_string())
            })?;
            registry.topics.insert(id, state);
        }
        for entry in data.mailboxes {
            let device = DeviceKey::from_slice(&entry.device_key).ok_or_else(|| {
                ServerError::Internal("snapshot device key malformed".to_string())
            })?;
            registry.mailboxes.insert(device, entry.download);
        }
        for entry in data.old_mailboxes {
            let device = DeviceKey::from_slice(&entry.device_key).ok_or_else(|| {
                ServerError::Internal("snapshot device key malformed".to_string())
            })?;
            registry.old_mailboxes.insert(device, entry.download);
        }
        Ok(registry)
    }
}

fn token_entries<T>(map: &HashMap<DeviceKey, T>, to_bytes: impl Fn(&T) -> Vec<u8>) -> Vec<TokenEntry> {
    let mut entries: Vec<TokenEntry> = map
        .iter()
        .map(|(device, token)| TokenEntry {
            device_key: device.as_bytes().to_vec(),
            token: to_bytes(token),
        })
        .collect();
    entries.sort_by(|a, b| a.device_key.cmp(&b.device_key));
    entries
}

fn mailbox_entries(map: &HashMap<DeviceKey, DeviceDownload>) -> Vec<MailboxEntry> {
    let mut entries: Vec<MailboxEntry> = map
        .iter()
        .map(|(device, download)| MailboxEntry {
            device_key: device.as_bytes().to_vec(),
            download: download.clone(),
        })
        .collect();
    entries.sort_by(|a, b| a.device_key.cmp(&b.device_key));
    entries
}
