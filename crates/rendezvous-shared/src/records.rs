//! The canonical record schema shared between server and clients.
//!
//! Field numbers are part of the wire contract and never change. Signed
//! records follow one convention: the signed bytes are the canonical
//! encoding of the record with the signature field cleared.

use crate::crypto;
use crate::error::{CryptoError, WireError};
use crate::wire::{message_field, Reader, WireRecord, Writer};

/// A record carrying its own Ed25519 signature.
pub trait Signed: WireRecord + Clone {
    fn signature(&self) -> &[u8];
    fn clear_signature(&mut self);

    /// Canonical encoding with `signature = []`; the bytes the signature
    /// covers.
    fn signed_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.clear_signature();
        unsigned.encode()
    }
}

/// Verifies a signed record under the designated key.
pub fn verify_signed<R: Signed>(record: &R, key: &[u8]) -> Result<(), CryptoError> {
    crypto::verify(key, &record.signed_bytes(), record.signature())
}

/// Role of a topic member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Participant,
    Observer,
}

impl Role {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Role::Admin),
            2 => Some(Role::Participant),
            3 => Some(Role::Observer),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Role::Admin => 1,
            Role::Participant => 2,
            Role::Observer => 3,
        }
    }

    /// Only admins and participants may append updates.
    pub fn may_post(self) -> bool {
        matches!(self, Role::Admin | Role::Participant)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    pub device_key: Vec<u8>,
    pub creation_time: i64,
    pub is_active: bool,
    pub application: String,
}

impl WireRecord for Device {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.device_key);
        w.varint_field(2, self.creation_time as u64);
        w.bool_field(3, self.is_active);
        w.str_field(4, &self.application);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.device_key = value.bytes().to_vec(),
                2 => record.creation_time = value.varint() as i64,
                3 => record.is_active = value.varint() != 0,
                4 => record.application = value.str()?.to_string(),
                _ => {}
            }
        }
        Ok(record)
    }
}

/// The self-signed user record: identity key, device list and metadata.
/// Every mutation re-signs the whole record with a fresh timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalUser {
    pub identity_key: Vec<u8>,
    pub creation_time: i64,
    pub name: String,
    pub devices: Vec<Device>,
    pub notification_server: String,
    pub timestamp: i64,
    pub signature: Vec<u8>,
}

impl WireRecord for InternalUser {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.identity_key);
        w.varint_field(2, self.creation_time as u64);
        w.str_field(3, &self.name);
        for device in &self.devices {
            message_field(w, 4, device);
        }
        w.str_field(5, &self.notification_server);
        w.varint_field(6, self.timestamp as u64);
        w.bytes_field(7, &self.signature);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.identity_key = value.bytes().to_vec(),
                2 => record.creation_time = value.varint() as i64,
                3 => record.name = value.str()?.to_string(),
                4 => record.devices.push(Device::decode(value.bytes())?),
                5 => record.notification_server = value.str()?.to_string(),
                6 => record.timestamp = value.varint() as i64,
                7 => record.signature = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

impl Signed for InternalUser {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn clear_signature(&mut self) {
        self.signature.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedUser {
    pub name: String,
    pub pin: u32,
    pub expiry: i64,
    pub tries_remaining: u32,
}

impl WireRecord for AllowedUser {
    fn encode_into(&self, w: &mut Writer) {
        w.str_field(1, &self.name);
        w.varint_field(2, self.pin as u64);
        w.varint_field(3, self.expiry as u64);
        w.varint_field(4, self.tries_remaining as u64);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.name = value.str()?.to_string(),
                2 => record.pin = value.varint() as u32,
                3 => record.expiry = value.varint() as i64,
                4 => record.tries_remaining = value.varint() as u32,
                _ => {}
            }
        }
        Ok(record)
    }
}

/// A one-shot public prekey, signed by the owning device key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePrekey {
    pub pre_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl WireRecord for DevicePrekey {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.pre_key);
        w.bytes_field(2, &self.signature);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.pre_key = value.bytes().to_vec(),
                2 => record.signature = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

impl Signed for DevicePrekey {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn clear_signature(&mut self) {
        self.signature.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePreKeyList {
    pub device_key: Vec<u8>,
    pub pre_keys: Vec<DevicePrekey>,
    pub remaining: u64,
}

impl WireRecord for DevicePreKeyList {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.device_key);
        for key in &self.pre_keys {
            message_field(w, 2, key);
        }
        w.varint_field(3, self.remaining);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.device_key = value.bytes().to_vec(),
                2 => record.pre_keys.push(DevicePrekey::decode(value.bytes())?),
                3 => record.remaining = value.varint(),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePreKeyBundle {
    pub lists: Vec<DevicePreKeyList>,
}

impl WireRecord for DevicePreKeyBundle {
    fn encode_into(&self, w: &mut Writer) {
        for list in &self.lists {
            message_field(w, 1, list);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            if field == 1 {
                record.lists.push(DevicePreKeyList::decode(value.bytes())?);
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePrekeyUploadRequest {
    pub user_key: Vec<u8>,
    pub device_key: Vec<u8>,
    pub auth_token: Vec<u8>,
    pub pre_keys: Vec<DevicePrekey>,
}

impl WireRecord for DevicePrekeyUploadRequest {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.user_key);
        w.bytes_field(2, &self.device_key);
        w.bytes_field(3, &self.auth_token);
        for key in &self.pre_keys {
            message_field(w, 4, key);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.user_key = value.bytes().to_vec(),
                2 => record.device_key = value.bytes().to_vec(),
                3 => record.auth_token = value.bytes().to_vec(),
                4 => record.pre_keys.push(DevicePrekey::decode(value.bytes())?),
                _ => {}
            }
        }
        Ok(record)
    }
}

/// A user's per-topic key pair, signed by the identity key over
/// `signatureKey || encryptionKey`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicKey {
    pub signature_key: Vec<u8>,
    pub encryption_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl TopicKey {
    /// The bytes the identity-key signature covers.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut payload = self.signature_key.clone();
        payload.extend_from_slice(&self.encryption_key);
        payload
    }
}

impl WireRecord for TopicKey {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.signature_key);
        w.bytes_field(2, &self.encryption_key);
        w.bytes_field(3, &self.signature);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.signature_key = value.bytes().to_vec(),
                2 => record.encryption_key = value.bytes().to_vec(),
                3 => record.signature = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicKeyList {
    pub application: String,
    pub keys: Vec<TopicKey>,
}

impl WireRecord for TopicKeyList {
    fn encode_into(&self, w: &mut Writer) {
        w.str_field(1, &self.application);
        for key in &self.keys {
            message_field(w, 2, key);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.application = value.str()?.to_string(),
                2 => record.keys.push(TopicKey::decode(value.bytes())?),
                _ => {}
            }
        }
        Ok(record)
    }
}

/// One encrypted topic-key copy addressed to a single device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicKeyMessage {
    pub application: String,
    pub signature_key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl WireRecord for TopicKeyMessage {
    fn encode_into(&self, w: &mut Writer) {
        w.str_field(1, &self.application);
        w.bytes_field(2, &self.signature_key);
        w.bytes_field(3, &self.payload);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.application = value.str()?.to_string(),
                2 => record.signature_key = value.bytes().to_vec(),
                3 => record.payload = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicKeyMessageList {
    pub device_key: Vec<u8>,
    pub messages: Vec<TopicKeyMessage>,
}

impl WireRecord for TopicKeyMessageList {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.device_key);
        for message in &self.messages {
            message_field(w, 2, message);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.device_key = value.bytes().to_vec(),
                2 => record
                    .messages
                    .push(TopicKeyMessage::decode(value.bytes())?),
                _ => {}
            }
        }
        Ok(record)
    }
}

/// Upload of fresh topic keys plus one encrypted copy of every key for
/// every sibling device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicKeyBundle {
    pub user_key: Vec<u8>,
    pub device_key: Vec<u8>,
    pub auth_token: Vec<u8>,
    pub application: String,
    pub keys: Vec<TopicKey>,
    pub messages: Vec<TopicKeyMessageList>,
}

impl WireRecord for TopicKeyBundle {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.user_key);
        w.bytes_field(2, &self.device_key);
        w.bytes_field(3, &self.auth_token);
        w.str_field(4, &self.application);
        for key in &self.keys {
            message_field(w, 5, key);
        }
        for list in &self.messages {
            message_field(w, 6, list);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.user_key = value.bytes().to_vec(),
                2 => record.device_key = value.bytes().to_vec(),
                3 => record.auth_token = value.bytes().to_vec(),
                4 => record.application = value.str()?.to_string(),
                5 => record.keys.push(TopicKey::decode(value.bytes())?),
                6 => record
                    .messages
                    .push(TopicKeyMessageList::decode(value.bytes())?),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicKeyRequest {
    pub user_key: Vec<u8>,
    pub device_key: Vec<u8>,
    pub auth_token: Vec<u8>,
    pub receivers: Vec<Vec<u8>>,
    pub application: String,
}

impl WireRecord for TopicKeyRequest {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.user_key);
        w.bytes_field(2, &self.device_key);
        w.bytes_field(3, &self.auth_token);
        for receiver in &self.receivers {
            w.bytes_field(4, receiver);
        }
        w.str_field(5, &self.application);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.user_key = value.bytes().to_vec(),
                2 => record.device_key = value.bytes().to_vec(),
                3 => record.auth_token = value.bytes().to_vec(),
                4 => record.receivers.push(value.bytes().to_vec()),
                5 => record.application = value.str()?.to_string(),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserTopicKey {
    pub user_key: Vec<u8>,
    pub key: TopicKey,
}

impl WireRecord for UserTopicKey {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.user_key);
        message_field(w, 2, &self.key);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.user_key = value.bytes().to_vec(),
                2 => record.key = TopicKey::decode(value.bytes())?,
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicKeyResponse {
    pub keys: Vec<UserTopicKey>,
}

impl WireRecord for TopicKeyResponse {
    fn encode_into(&self, w: &mut Writer) {
        for key in &self.keys {
            message_field(w, 1, key);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            if field == 1 {
                record.keys.push(UserTopicKey::decode(value.bytes())?);
            }
        }
        Ok(record)
    }
}

/// Binds a topic member to a server-known user: the member's identity key,
/// their topic encryption key, and the identity-key signature over
/// `signatureKey || encryptionKey`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreationInfo {
    pub user_key: Vec<u8>,
    pub encryption_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl WireRecord for CreationInfo {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.user_key);
        w.bytes_field(2, &self.encryption_key);
        w.bytes_field(3, &self.signature);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.user_key = value.bytes().to_vec(),
                2 => record.encryption_key = value.bytes().to_vec(),
                3 => record.signature = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberInfo {
    pub signature_key: Vec<u8>,
    pub role: u32,
    pub encrypted_message_key: Vec<u8>,
    pub creation_info: Option<CreationInfo>,
}

impl MemberInfo {
    pub fn role(&self) -> Option<Role> {
        Role::from_raw(self.role)
    }
}

impl WireRecord for MemberInfo {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.signature_key);
        w.varint_field(2, self.role as u64);
        w.bytes_field(3, &self.encrypted_message_key);
        if let Some(info) = &self.creation_info {
            message_field(w, 4, info);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.signature_key = value.bytes().to_vec(),
                2 => record.role = value.varint() as u32,
                3 => record.encrypted_message_key = value.bytes().to_vec(),
                4 => record.creation_info = Some(CreationInfo::decode(value.bytes())?),
                _ => {}
            }
        }
        Ok(record)
    }
}

/// The topic creation record, signed by the creator's topic signature key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    pub topic_id: Vec<u8>,
    pub application: String,
    pub creation_time: i64,
    pub index_of_message_creator: u32,
    pub members: Vec<MemberInfo>,
    pub timestamp: i64,
    pub signature: Vec<u8>,
}

impl Topic {
    pub fn creator(&self) -> Option<&MemberInfo> {
        self.members.get(self.index_of_message_creator as usize)
    }
}

impl WireRecord for Topic {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.topic_id);
        w.str_field(2, &self.application);
        w.varint_field(3, self.creation_time as u64);
        w.varint_field(4, self.index_of_message_creator as u64);
        for member in &self.members {
            message_field(w, 5, member);
        }
        w.varint_field(6, self.timestamp as u64);
        w.bytes_field(7, &self.signature);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.topic_id = value.bytes().to_vec(),
                2 => record.application = value.str()?.to_string(),
                3 => record.creation_time = value.varint() as i64,
                4 => record.index_of_message_creator = value.varint() as u32,
                5 => record.members.push(MemberInfo::decode(value.bytes())?),
                6 => record.timestamp = value.varint() as i64,
                7 => record.signature = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

impl Signed for Topic {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn clear_signature(&mut self) {
        self.signature.clear();
    }
}

/// Reference to an encrypted file carried by a topic update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRef {
    pub id: Vec<u8>,
    pub hash: Vec<u8>,
    pub tag: Vec<u8>,
}

impl WireRecord for FileRef {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.id);
        w.bytes_field(2, &self.hash);
        w.bytes_field(3, &self.tag);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.id = value.bytes().to_vec(),
                2 => record.hash = value.bytes().to_vec(),
                3 => record.tag = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileData {
    pub id: Vec<u8>,
    pub data: Vec<u8>,
}

impl WireRecord for FileData {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.id);
        w.bytes_field(2, &self.data);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.id = value.bytes().to_vec(),
                2 => record.data = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

/// A signed append to a topic. The signature feeds the hash chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicUpdate {
    pub index_in_member_list: u32,
    pub files: Vec<FileRef>,
    pub metadata: Vec<u8>,
    pub signature: Vec<u8>,
}

impl WireRecord for TopicUpdate {
    fn encode_into(&self, w: &mut Writer) {
        w.varint_field(1, self.index_in_member_list as u64);
        for file in &self.files {
            message_field(w, 2, file);
        }
        w.bytes_field(3, &self.metadata);
        w.bytes_field(4, &self.signature);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.index_in_member_list = value.varint() as u32,
                2 => record.files.push(FileRef::decode(value.bytes())?),
                3 => record.metadata = value.bytes().to_vec(),
                4 => record.signature = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

impl Signed for TopicUpdate {
    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn clear_signature(&mut self) {
        self.signature.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicUpdateUpload {
    pub device_key: Vec<u8>,
    pub auth_token: Vec<u8>,
    pub topic_id: Vec<u8>,
    pub update: TopicUpdate,
    pub files: Vec<FileData>,
}

impl WireRecord for TopicUpdateUpload {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.device_key);
        w.bytes_field(2, &self.auth_token);
        w.bytes_field(3, &self.topic_id);
        message_field(w, 4, &self.update);
        for file in &self.files {
            message_field(w, 5, file);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.device_key = value.bytes().to_vec(),
                2 => record.auth_token = value.bytes().to_vec(),
                3 => record.topic_id = value.bytes().to_vec(),
                4 => record.update = TopicUpdate::decode(value.bytes())?,
                5 => record.files.push(FileData::decode(value.bytes())?),
                _ => {}
            }
        }
        Ok(record)
    }
}

/// Head of a topic's hash chain. `output` is the topic id before the first
/// update and a 32-byte SHA-256 output afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainState {
    pub chain_index: u32,
    pub output: Vec<u8>,
}

impl WireRecord for ChainState {
    fn encode_into(&self, w: &mut Writer) {
        w.varint_field(1, self.chain_index as u64);
        w.bytes_field(2, &self.output);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.chain_index = value.varint() as u32,
                2 => record.output = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicState {
    pub info: Topic,
    pub chain: ChainState,
}

impl WireRecord for TopicState {
    fn encode_into(&self, w: &mut Writer) {
        message_field(w, 1, &self.info);
        message_field(w, 2, &self.chain);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.info = Topic::decode(value.bytes())?,
                2 => record.chain = ChainState::decode(value.bytes())?,
                _ => {}
            }
        }
        Ok(record)
    }
}

/// A contiguous run of committed updates, as stored in one chain segment
/// file and as returned by range reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageChain {
    pub updates: Vec<TopicUpdate>,
}

impl WireRecord for MessageChain {
    fn encode_into(&self, w: &mut Writer) {
        for update in &self.updates {
            message_field(w, 1, update);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            if field == 1 {
                record.updates.push(TopicUpdate::decode(value.bytes())?);
            }
        }
        Ok(record)
    }
}

/// A committed update as delivered to a device mailbox, stamped with the
/// chain state it produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub topic_id: Vec<u8>,
    pub chain: ChainState,
    pub content: TopicUpdate,
}

impl WireRecord for Message {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.topic_id);
        message_field(w, 2, &self.chain);
        message_field(w, 3, &self.content);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.topic_id = value.bytes().to_vec(),
                2 => record.chain = ChainState::decode(value.bytes())?,
                3 => record.content = TopicUpdate::decode(value.bytes())?,
                _ => {}
            }
        }
        Ok(record)
    }
}

/// Per-sender, per-topic maximum chain index a member has downloaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub user_key: Vec<u8>,
    pub topic_id: Vec<u8>,
    pub chain_index: u32,
}

impl WireRecord for Receipt {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.user_key);
        w.bytes_field(2, &self.topic_id);
        w.varint_field(3, self.chain_index as u64);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.user_key = value.bytes().to_vec(),
                2 => record.topic_id = value.bytes().to_vec(),
                3 => record.chain_index = value.varint() as u32,
                _ => {}
            }
        }
        Ok(record)
    }
}

/// Everything a device drains on poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDownload {
    pub topic_updates: Vec<Topic>,
    pub topic_key_messages: Vec<TopicKeyMessage>,
    pub messages: Vec<Message>,
    pub receipts: Vec<Receipt>,
    pub remaining_topic_keys: u64,
    pub remaining_pre_keys: u64,
}

impl DeviceDownload {
    pub fn is_empty(&self) -> bool {
        self.topic_updates.is_empty()
            && self.topic_key_messages.is_empty()
            && self.messages.is_empty()
            && self.receipts.is_empty()
    }
}

impl WireRecord for DeviceDownload {
    fn encode_into(&self, w: &mut Writer) {
        for topic in &self.topic_updates {
            message_field(w, 1, topic);
        }
        for message in &self.topic_key_messages {
            message_field(w, 2, message);
        }
        for message in &self.messages {
            message_field(w, 3, message);
        }
        for receipt in &self.receipts {
            message_field(w, 4, receipt);
        }
        w.varint_field(5, self.remaining_topic_keys);
        w.varint_field(6, self.remaining_pre_keys);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.topic_updates.push(Topic::decode(value.bytes())?),
                2 => record
                    .topic_key_messages
                    .push(TopicKeyMessage::decode(value.bytes())?),
                3 => record.messages.push(Message::decode(value.bytes())?),
                4 => record.receipts.push(Receipt::decode(value.bytes())?),
                5 => record.remaining_topic_keys = value.varint(),
                6 => record.remaining_pre_keys = value.varint(),
                _ => {}
            }
        }
        Ok(record)
    }
}

/// Registration payload: the initial single-device user record, the pin,
/// and the first key material.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationBundle {
    pub info: InternalUser,
    pub pin: u32,
    pub pre_keys: Vec<DevicePrekey>,
    pub topic_keys: Vec<TopicKey>,
}

impl WireRecord for RegistrationBundle {
    fn encode_into(&self, w: &mut Writer) {
        message_field(w, 1, &self.info);
        w.varint_field(2, self.pin as u64);
        for key in &self.pre_keys {
            message_field(w, 3, key);
        }
        for key in &self.topic_keys {
            message_field(w, 4, key);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.info = InternalUser::decode(value.bytes())?,
                2 => record.pin = value.varint() as u32,
                3 => record.pre_keys.push(DevicePrekey::decode(value.bytes())?),
                4 => record.topic_keys.push(TopicKey::decode(value.bytes())?),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenEntry {
    pub device_key: Vec<u8>,
    pub token: Vec<u8>,
}

impl WireRecord for TokenEntry {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.device_key);
        w.bytes_field(2, &self.token);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.device_key = value.bytes().to_vec(),
                2 => record.token = value.bytes().to_vec(),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxEntry {
    pub device_key: Vec<u8>,
    pub download: DeviceDownload,
}

impl WireRecord for MailboxEntry {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.device_key);
        message_field(w, 2, &self.download);
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.device_key = value.bytes().to_vec(),
                2 => record.download = DeviceDownload::decode(value.bytes())?,
                _ => {}
            }
        }
        Ok(record)
    }
}

/// The registry snapshot persisted as the `server` blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagementData {
    pub admin_token: Vec<u8>,
    pub allowed_users: Vec<AllowedUser>,
    pub users: Vec<InternalUser>,
    pub auth_tokens: Vec<TokenEntry>,
    pub notification_tokens: Vec<TokenEntry>,
    pub topics: Vec<TopicState>,
    pub mailboxes: Vec<MailboxEntry>,
    pub old_mailboxes: Vec<MailboxEntry>,
}

impl WireRecord for ManagementData {
    fn encode_into(&self, w: &mut Writer) {
        w.bytes_field(1, &self.admin_token);
        for user in &self.allowed_users {
            message_field(w, 2, user);
        }
        for user in &self.users {
            message_field(w, 3, user);
        }
        for entry in &self.auth_tokens {
            message_field(w, 4, entry);
        }
        for entry in &self.notification_tokens {
            message_field(w, 5, entry);
        }
        for topic in &self.topics {
            message_field(w, 6, topic);
        }
        for entry in &self.mailboxes {
            message_field(w, 7, entry);
        }
        for entry in &self.old_mailboxes {
            message_field(w, 8, entry);
        }
    }

    fn decode(buffer: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut r = Reader::new(buffer);
        while let Some((field, value)) = r.next()? {
            match field {
                1 => record.admin_token = value.bytes().to_vec(),
                2 => record
                    .allowed_users
                    .push(AllowedUser::decode(value.bytes())?),
                3 => record.users.push(InternalUser::decode(value.bytes())?),
                4 => record.auth_tokens.push(TokenEntry::decode(value.bytes())?),
                5 => record
                    .notification_tokens
                    .push(TokenEntry::decode(value.bytes())?),
                6 => record.topics.push(TopicState::decode(value.bytes())?),
                7 => record.mailboxes.push(MailboxEntry::decode(value.bytes())?),
                8 => record
                    .old_mailboxes
                    .push(MailboxEntry::decode(value.bytes())?),
                _ => {}
            }
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn sample_user() -> InternalUser {
        InternalUser {
            identity_key: vec![1u8; 32],
            creation_time: 1_700_000_000,
            name: "alice".to_string(),
            devices: vec![Device {
                device_key: vec![2u8; 32],
                creation_time: 1_700_000_000,
                is_active: true,
                application: "chat".to_string(),
            }],
            notification_server: "https://push.example.org".to_string(),
            timestamp: 1_700_000_060,
            signature: vec![3u8; 64],
        }
    }

    #[test]
    fn test_user_roundtrip() {
        let user = sample_user();
        let decoded = InternalUser::decode(&user.encode()).unwrap();
        assert_eq!(decoded, user);
    }

    #[test]
    fn test_signed_bytes_excludes_signature() {
        let user = sample_user();
        let mut unsigned = user.clone();
        unsigned.signature.clear();
        assert_eq!(user.signed_bytes(), unsigned.encode());
        // the signature field changes the full encoding but not the
        // signed bytes
        let mut resigned = user.clone();
        resigned.signature = vec![9u8; 64];
        assert_eq!(resigned.signed_bytes(), user.signed_bytes());
        assert_ne!(resigned.encode(), user.encode());
    }

    #[test]
    fn test_self_signed_verification() {
        let keys = KeyPair::generate();
        let mut user = sample_user();
        user.identity_key = keys.public.to_vec();
        user.signature.clear();
        user.signature = keys.sign(&user.signed_bytes());
        assert!(verify_signed(&user, &keys.public).is_ok());

        user.name = "mallory".to_string();
        assert!(verify_signed(&user, &keys.public).is_err());
    }

    #[test]
    fn test_topic_roundtrip_with_members() {
        let topic = Topic {
            topic_id: vec![7u8; 12],
            application: "chat".to_string(),
            creation_time: 1_700_000_000,
            index_of_message_creator: 1,
            members: vec![
                MemberInfo {
                    signature_key: vec![1u8; 32],
                    role: Role::Observer.raw(),
                    encrypted_message_key: vec![4, 5, 6],
                    creation_info: None,
                },
                MemberInfo {
                    signature_key: vec![2u8; 32],
                    role: Role::Admin.raw(),
                    encrypted_message_key: vec![7, 8],
                    creation_info: Some(CreationInfo {
                        user_key: vec![9u8; 32],
                        encryption_key: vec![10u8; 32],
                        signature: vec![11u8; 64],
                    }),
                },
            ],
            timestamp: 1_700_000_000,
            signature: vec![12u8; 64],
        };
        let decoded = Topic::decode(&topic.encode()).unwrap();
        assert_eq!(decoded, topic);
        assert_eq!(decoded.creator().unwrap().role(), Some(Role::Admin));
    }

    #[test]
    fn test_invalid_role_is_preserved_and_unmapped() {
        let member = MemberInfo {
            signature_key: vec![1u8; 32],
            role: 9,
            ..Default::default()
        };
        let decoded = MemberInfo::decode(&member.encode()).unwrap();
        assert_eq!(decoded.role, 9);
        assert_eq!(decoded.role(), None);
    }

    #[test]
    fn test_topic_key_signed_payload_is_concatenation() {
        let key = TopicKey {
            signature_key: vec![1, 2, 3],
            encryption_key: vec![4, 5],
            signature: vec![6u8; 64],
        };
        assert_eq!(key.signed_payload(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_device_download_roundtrip() {
        let download = DeviceDownload {
            topic_updates: vec![Topic {
                topic_id: vec![1u8; 12],
                ..Default::default()
            }],
            topic_key_messages: vec![TopicKeyMessage {
                application: "chat".to_string(),
                signature_key: vec![2u8; 32],
                payload: vec![3, 4, 5],
            }],
            messages: vec![Message {
                topic_id: vec![1u8; 12],
                chain: ChainState {
                    chain_index: 4,
                    output: vec![6u8; 32],
                },
                content: TopicUpdate {
                    index_in_member_list: 1,
                    files: vec![FileRef {
                        id: vec![7u8; 12],
                        hash: vec![8u8; 32],
                        tag: vec![9u8; 16],
                    }],
                    metadata: vec![10, 11],
                    signature: vec![12u8; 64],
                },
            }],
            receipts: vec![Receipt {
                user_key: vec![13u8; 32],
                topic_id: vec![1u8; 12],
                chain_index: 3,
            }],
            remaining_topic_keys: 5,
            remaining_pre_keys: 17,
        };
        let decoded = DeviceDownload::decode(&download.encode()).unwrap();
        assert_eq!(decoded, download);
        assert!(!decoded.is_empty());
        assert!(DeviceDownload::default().is_empty());
    }

    #[test]
    fn test_management_data_roundtrip() {
        let data = ManagementData {
            admin_token: vec![1u8; 16],
            allowed_users: vec![AllowedUser {
                name: "bob".to_string(),
                pin: 4711,
                expiry: 1_700_000_000,
                tries_remaining: 3,
            }],
            users: vec![sample_user()],
            auth_tokens: vec![TokenEntry {
                device_key: vec![2u8; 32],
                token: vec![3u8; 16],
            }],
            notification_tokens: vec![],
            topics: vec![TopicState {
                info: Topic {
                    topic_id: vec![7u8; 12],
                    ..Default::default()
                },
                chain: ChainState {
                    chain_index: 0,
                    output: vec![7u8; 12],
                },
            }],
            mailboxes: vec![MailboxEntry {
                device_key: vec![2u8; 32],
                download: DeviceDownload {
                    remaining_pre_keys: 2,
                    ..Default::default()
                },
            }],
            old_mailboxes: vec![],
        };
        let decoded = ManagementData::decode(&data.encode()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_decode_skips_unknown_fields() {
        let mut writer = Writer::new();
        writer.bytes_field(2, &[5u8; 12]);
        // field 15 does not exist in ChainState
        writer.bytes_field(15, b"future");
        let decoded = ChainState::decode(&writer.into_bytes()).unwrap();
        assert_eq!(decoded.output, vec![5u8; 12]);
    }
}
