//! Durable per-entity blobs in a content-addressed directory tree.
//!
//! ```text
//! base/server                                  registry snapshot
//! base/users/<userKey>/prekeys/<deviceKey>     DevicePreKeyList
//! base/users/<userKey>/topickeys/<appId>       TopicKeyList
//! base/topics/<topicId>/<chainBaseIndex>       MessageChain segment
//! base/files/<topicId>/<messageId>             opaque encrypted file
//! ```
//!
//! Binary identifiers become base32 path segments, application ids
//! URL-safe base64. Every blob replacement goes through a temp file and
//! rename so readers never observe a partial write.

use data_encoding::BASE64URL_NOPAD;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use rendezvous_shared::constants::CHAIN_SEGMENT_LEN;
use rendezvous_shared::crypto;
use rendezvous_shared::records::{
    DevicePreKeyBundle, DevicePreKeyList, DevicePrekey, MessageChain, TopicKey, TopicKeyList,
    TopicUpdate,
};
use rendezvous_shared::types::{DeviceKey, MessageId, TopicId, UserKey};
use rendezvous_shared::wire::WireRecord;

use crate::error::ServerError;

const SNAPSHOT_FILE: &str = "server";
const SELF_TEST_FILE: &str = ".selftest";

/// Chain segment holding a given 1-based update index. Index 0 is the
/// creation record and is never stored, so the first segment carries
/// 1..=999 and later segments a full 1000 each.
fn segment_base(index: u32) -> u32 {
    index / CHAIN_SEGMENT_LEN * CHAIN_SEGMENT_LEN
}

fn segment_offset(index: u32) -> usize {
    let base = segment_base(index);
    if base == 0 {
        (index - 1) as usize
    } else {
        (index - base) as usize
    }
}

fn app_segment(application: &str) -> String {
    BASE64URL_NOPAD.encode(application.as_bytes())
}

#[derive(Debug, Clone)]
pub struct Storage {
    base: PathBuf,
}

impl Storage {
    /// Opens the tree rooted at `base`, creating it if needed, and
    /// self-tests write/read/delete on the base directory. A failed
    /// self-test aborts startup.
    pub async fn open(base: PathBuf) -> Result<Self, ServerError> {
        let storage = Self { base };
        storage.init_tree().await?;
        storage.self_test().await?;
        info!(path = %storage.base.display(), "storage initialized");
        Ok(storage)
    }

    async fn init_tree(&self) -> Result<(), ServerError> {
        for dir in [
            self.base.clone(),
            self.base.join("users"),
            self.base.join("topics"),
            self.base.join("files"),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| ServerError::io("creating storage tree", e))?;
        }
        Ok(())
    }

    async fn self_test(&self) -> Result<(), ServerError> {
        let probe = self.base.join(SELF_TEST_FILE);
        let payload = crypto::random_bytes(32);
        fs::write(&probe, &payload)
            .await
            .map_err(|e| ServerError::io("storage self-test write", e))?;
        let read = fs::read(&probe)
            .await
            .map_err(|e| ServerError::io("storage self-test read", e))?;
        if read != payload {
            return Err(ServerError::Internal(
                "storage self-test read back different bytes".to_string(),
            ));
        }
        fs::remove_file(&probe)
            .await
            .map_err(|e| ServerError::io("storage self-test delete", e))
    }

    /// Atomic replace: write next to the target, then rename over it.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), ServerError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| ServerError::io("writing blob", e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| ServerError::io("replacing blob", e))
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<Vec<u8>>, ServerError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::io("reading blob", e)),
        }
    }

    fn user_dir(&self, user: &UserKey) -> PathBuf {
        self.base.join("users").join(user.to_base32())
    }

    fn prekey_path(&self, user: &UserKey, device: &DeviceKey) -> PathBuf {
        self.user_dir(user).join("prekeys").join(device.to_base32())
    }

    fn topic_key_path(&self, user: &UserKey, application: &str) -> PathBuf {
        self.user_dir(user)
            .join("topickeys")
            .join(app_segment(application))
    }

    fn topic_dir(&self, topic: &TopicId) -> PathBuf {
        self.base.join("topics").join(topic.to_base32())
    }

    fn segment_path(&self, topic: &TopicId, base_index: u32) -> PathBuf {
        self.topic_dir(topic).join(base_index.to_string())
    }

    fn file_path(&self, topic: &TopicId, message: &MessageId) -> PathBuf {
        self.base
            .join("files")
            .join(topic.to_base32())
            .join(message.to_base32())
    }

    pub async fn create_user_tree(&self, user: &UserKey) -> Result<(), ServerError> {
        for dir in [
            self.user_dir(user).join("prekeys"),
            self.user_dir(user).join("topickeys"),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| ServerError::io("creating user tree", e))?;
        }
        Ok(())
    }

    pub async fn delete_user_tree(&self, user: &UserKey) -> Result<(), ServerError> {
        match fs::remove_dir_all(self.user_dir(user)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::io("deleting user tree", e)),
        }
    }

    pub async fn delete_prekeys(
        &self,
        user: &UserKey,
        device: &DeviceKey,
    ) -> Result<(), ServerError> {
        match fs::remove_file(self.prekey_path(user, device)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::io("deleting prekey pool", e)),
        }
    }

    /// Appends prekeys to the device's pool and returns the new count.
    pub async fn store_prekeys(
        &self,
        user: &UserKey,
        device: &DeviceKey,
        new_keys: Vec<DevicePrekey>,
    ) -> Result<u64, ServerError> {
        let path = self.prekey_path(user, device);
        let mut list = match self.read_optional(&path).await? {
            Some(bytes) => DevicePreKeyList::decode(&bytes)
                .map_err(|e| ServerError::Internal(format!("corrupt prekey pool: {e}")))?,
            None => DevicePreKeyList {
                device_key: device.as_bytes().to_vec(),
                ..Default::default()
            },
        };
        list.pre_keys.extend(new_keys);
        let count = list.pre_keys.len() as u64;
        self.write_atomic(&path, &list.encode()).await?;
        debug!(user = %user.short(), device = %device.short(), count, "prekeys stored");
        Ok(count)
    }

    async fn read_prekey_list(
        &self,
        user: &UserKey,
        device: &DeviceKey,
    ) -> Result<DevicePreKeyList, ServerError> {
        let path = self.prekey_path(user, device);
        match self.read_optional(&path).await? {
            Some(bytes) => DevicePreKeyList::decode(&bytes)
                .map_err(|e| ServerError::Internal(format!("corrupt prekey pool: {e}"))),
            None => Ok(DevicePreKeyList {
                device_key: device.as_bytes().to_vec(),
                ..Default::default()
            }),
        }
    }

    /// Takes `min(count, smallest pool)` prekeys from the head of every
    /// device's pool, so the caller gets one matching key per device for
    /// each consumed slot.
    pub async fn consume_prekeys(
        &self,
        user: &UserKey,
        devices: &[DeviceKey],
        count: u64,
    ) -> Result<DevicePreKeyBundle, ServerError> {
        let mut lists = Vec::with_capacity(devices.len());
        for device in devices {
            lists.push(self.read_prekey_list(user, device).await?);
        }
        let available = lists
            .iter()
            .map(|l| l.pre_keys.len() as u64)
            .min()
            .unwrap_or(0)
            .min(count) as usize;

        let mut bundle = DevicePreKeyBundle::default();
        for (device, mut list) in devices.iter().zip(lists) {
            let taken: Vec<DevicePrekey> = list.pre_keys.drain(..available).collect();
            let remaining = list.pre_keys.len() as u64;
            let path = self.prekey_path(user, device);
            if available > 0 {
                if list.pre_keys.is_empty() {
                    self.delete_prekeys(user, device).await?;
                } else {
                    self.write_atomic(&path, &list.encode()).await?;
                }
            }
            bundle.lists.push(DevicePreKeyList {
                device_key: device.as_bytes().to_vec(),
                pre_keys: taken,
                remaining,
            });
        }
        Ok(bundle)
    }

    pub async fn prekey_count(
        &self,
        user: &UserKey,
        device: &DeviceKey,
    ) -> Result<u64, ServerError> {
        Ok(self.read_prekey_list(user, device).await?.pre_keys.len() as u64)
    }

    /// Appends topic keys to the user's per-application queue and returns
    /// the new total.
    pub async fn store_topic_keys(
        &self,
        user: &UserKey,
        application: &str,
        new_keys: Vec<TopicKey>,
    ) -> Result<u64, ServerError> {
        let path = self.topic_key_path(user, application);
        let mut list = match self.read_optional(&path).await? {
            Some(bytes) => TopicKeyList::decode(&bytes)
                .map_err(|e| ServerError::Internal(format!("corrupt topic key queue: {e}")))?,
            None => TopicKeyList {
                application: application.to_string(),
                ..Default::default()
            },
        };
        list.keys.extend(new_keys);
        let count = list.keys.len() as u64;
        self.write_atomic(&path, &list.encode()).await?;
        Ok(count)
    }

    /// Takes one topic key from the tail of the queue. Returns the key and
    /// the number left.
    pub async fn consume_topic_key(
        &self,
        user: &UserKey,
        application: &str,
    ) -> Result<(TopicKey, u64), ServerError> {
        let path = self.topic_key_path(user, application);
        let mut list = match self.read_optional(&path).await? {
            Some(bytes) => TopicKeyList::decode(&bytes)
                .map_err(|e| ServerError::Internal(format!("corrupt topic key queue: {e}")))?,
            None => {
                return Err(ServerError::ResourceNotAvailable(
                    "no topic keys".to_string(),
                ))
            }
        };
        let key = list
            .keys
            .pop()
            .ok_or_else(|| ServerError::ResourceNotAvailable("no topic keys".to_string()))?;
        let remaining = list.keys.len() as u64;
        if list.keys.is_empty() {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ServerError::io("deleting topic key queue", e)),
            }
        } else {
            self.write_atomic(&path, &list.encode()).await?;
        }
        Ok((key, remaining))
    }

    pub async fn topic_exists(&self, topic: &TopicId) -> bool {
        fs::metadata(self.topic_dir(topic)).await.is_ok()
    }

    pub async fn create_topic(&self, topic: &TopicId) -> Result<(), ServerError> {
        if self.topic_exists(topic).await {
            return Err(ServerError::ResourceAlreadyExists(format!(
                "topic {}",
                topic.short()
            )));
        }
        for dir in [
            self.topic_dir(topic),
            self.base.join("files").join(topic.to_base32()),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| ServerError::io("creating topic tree", e))?;
        }
        Ok(())
    }

    /// Appends one update at 1-based `new_index` and returns the new chain
    /// output `SHA256(priorOutput || update.signature)`. The segment must
    /// be exactly one short of the new index; anything else means the
    /// caller and the durable chain disagree.
    pub async fn append_update(
        &self,
        topic: &TopicId,
        update: &TopicUpdate,
        new_index: u32,
        prior_output: &[u8],
    ) -> Result<[u8; 32], ServerError> {
        let base = segment_base(new_index);
        let path = self.segment_path(topic, base);
        let mut chain = match self.read_optional(&path).await? {
            Some(bytes) => MessageChain::decode(&bytes)
                .map_err(|e| ServerError::Internal(format!("corrupt chain segment: {e}")))?,
            None => MessageChain::default(),
        };
        if chain.updates.len() != segment_offset(new_index) {
            return Err(ServerError::Internal(format!(
                "chain segment for topic {} out of step at index {new_index}",
                topic.short()
            )));
        }
        chain.updates.push(update.clone());
        self.write_atomic(&path, &chain.encode()).await?;
        Ok(crypto::sha256_pair(prior_output, &update.signature))
    }

    /// Reads `count` updates starting at 1-based `start`, crossing segment
    /// boundaries as needed. The caller bounds the range against the chain
    /// head, so a hole is storage corruption, not a client error.
    pub async fn read_updates(
        &self,
        topic: &TopicId,
        start: u32,
        count: u32,
    ) -> Result<Vec<TopicUpdate>, ServerError> {
        let mut updates = Vec::with_capacity(count as usize);
        let end = start + count;
        let mut index = start;
        while index < end {
            let base = segment_base(index);
            let path = self.segment_path(topic, base);
            let chain = match self.read_optional(&path).await? {
                Some(bytes) => MessageChain::decode(&bytes)
                    .map_err(|e| ServerError::Internal(format!("corrupt chain segment: {e}")))?,
                None => {
                    return Err(ServerError::Internal(format!(
                        "missing chain segment {base} for topic {}",
                        topic.short()
                    )))
                }
            };
            while index < end && segment_base(index) == base {
                let offset = segment_offset(index);
                let update = chain.updates.get(offset).ok_or_else(|| {
                    ServerError::Internal(format!(
                        "chain segment {base} for topic {} truncated at {index}",
                        topic.short()
                    ))
                })?;
                updates.push(update.clone());
                index += 1;
            }
        }
        Ok(updates)
    }

    /// Stores an encrypted file blob. Re-uploading an existing id fails;
    /// idempotence is the caller's concern.
    pub async fn store_file(
        &self,
        topic: &TopicId,
        message: &MessageId,
        bytes: &[u8],
    ) -> Result<(), ServerError> {
        let path = self.file_path(topic, message);
        if fs::metadata(&path).await.is_ok() {
            return Err(ServerError::ResourceAlreadyExists(format!(
                "file {}",
                message.short()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ServerError::io("creating file tree", e))?;
        }
        self.write_atomic(&path, bytes).await
    }

    pub async fn file_exists(&self, topic: &TopicId, message: &MessageId) -> bool {
        fs::metadata(self.file_path(topic, message)).await.is_ok()
    }

    pub async fn read_file(
        &self,
        topic: &TopicId,
        message: &MessageId,
    ) -> Result<Vec<u8>, ServerError> {
        self.read_optional(&self.file_path(topic, message))
            .await?
            .ok_or_else(|| ServerError::ResourceNotAvailable(format!("file {}", message.short())))
    }

    pub async fn write_snapshot(&self, bytes: &[u8]) -> Result<(), ServerError> {
        self.write_atomic(&self.base.join(SNAPSHOT_FILE), bytes)
            .await
    }

    pub async fn read_snapshot(&self) -> Result<Option<Vec<u8>>, ServerError> {
        self.read_optional(&self.base.join(SNAPSHOT_FILE)).await
    }

    /// Removes every blob and rebuilds the empty tree.
    pub async fn delete_all(&self) -> Result<(), ServerError> {
        match fs::remove_dir_all(&self.base).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ServerError::io("deleting storage", e)),
        }
        self.init_tree().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_storage() -> (Storage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().to_path_buf()).await.unwrap();
        (storage, dir)
    }

    fn prekey(n: u8) -> DevicePrekey {
        DevicePrekey {
            pre_key: vec![n; 32],
            signature: vec![n; 64],
        }
    }

    fn topic_key(n: u8) -> TopicKey {
        TopicKey {
            signature_key: vec![n; 32],
            encryption_key: vec![n + 1; 32],
            signature: vec![n; 64],
        }
    }

    fn update(n: u8) -> TopicUpdate {
        TopicUpdate {
            index_in_member_list: 0,
            files: vec![],
            metadata: vec![n],
            signature: vec![n; 64],
        }
    }

    #[test]
    fn test_segment_math() {
        assert_eq!(segment_base(1), 0);
        assert_eq!(segment_base(999), 0);
        assert_eq!(segment_base(1000), 1000);
        assert_eq!(segment_base(1999), 1000);
        assert_eq!(segment_base(2000), 2000);
        assert_eq!(segment_offset(1), 0);
        assert_eq!(segment_offset(999), 998);
        assert_eq!(segment_offset(1000), 0);
        assert_eq!(segment_offset(1999), 999);
    }

    #[tokio::test]
    async fn test_prekey_store_and_consume() {
        let (storage, _dir) = test_storage().await;
        let user = UserKey([1; 32]);
        let d1 = DeviceKey([2; 32]);
        let d2 = DeviceKey([3; 32]);
        storage.create_user_tree(&user).await.unwrap();

        storage
            .store_prekeys(&user, &d1, vec![prekey(1), prekey(2), prekey(3)])
            .await
            .unwrap();
        let total = storage
            .store_prekeys(&user, &d2, (0..5).map(prekey).collect())
            .await
            .unwrap();
        assert_eq!(total, 5);

        // pools of (3, 5): a request for 5 yields 3 per device
        let bundle = storage
            .consume_prekeys(&user, &[d1, d2], 5)
            .await
            .unwrap();
        assert_eq!(bundle.lists.len(), 2);
        assert_eq!(bundle.lists[0].pre_keys.len(), 3);
        assert_eq!(bundle.lists[0].remaining, 0);
        assert_eq!(bundle.lists[1].pre_keys.len(), 3);
        assert_eq!(bundle.lists[1].remaining, 2);
        // consumption is from the head, in upload order
        assert_eq!(bundle.lists[0].pre_keys[0], prekey(1));

        // second call: min(5, 0) = 0
        let bundle = storage
            .consume_prekeys(&user, &[d1, d2], 5)
            .await
            .unwrap();
        assert_eq!(bundle.lists[0].pre_keys.len(), 0);
        assert_eq!(bundle.lists[1].pre_keys.len(), 0);
        assert_eq!(bundle.lists[1].remaining, 2);
    }

    #[tokio::test]
    async fn test_topic_keys_are_one_shot() {
        let (storage, _dir) = test_storage().await;
        let user = UserKey([1; 32]);
        storage.create_user_tree(&user).await.unwrap();

        storage
            .store_topic_keys(&user, "chat", vec![topic_key(1), topic_key(2)])
            .await
            .unwrap();

        // tail first
        let (key, remaining) = storage.consume_topic_key(&user, "chat").await.unwrap();
        assert_eq!(key, topic_key(2));
        assert_eq!(remaining, 1);
        let (key, remaining) = storage.consume_topic_key(&user, "chat").await.unwrap();
        assert_eq!(key, topic_key(1));
        assert_eq!(remaining, 0);
        assert!(matches!(
            storage.consume_topic_key(&user, "chat").await,
            Err(ServerError::ResourceNotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_chain_append_and_read() {
        let (storage, _dir) = test_storage().await;
        let topic = TopicId([7; 12]);
        storage.create_topic(&topic).await.unwrap();

        let mut output = topic.as_bytes().to_vec();
        for i in 1..=5u32 {
            let u = update(i as u8);
            let new = storage
                .append_update(&topic, &u, i, &output)
                .await
                .unwrap();
            assert_eq!(new, crypto::sha256_pair(&output, &u.signature));
            output = new.to_vec();
        }

        let updates = storage.read_updates(&topic, 2, 3).await.unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0], update(2));
        assert_eq!(updates[2], update(4));
    }

    #[tokio::test]
    async fn test_chain_rejects_out_of_step_append() {
        let (storage, _dir) = test_storage().await;
        let topic = TopicId([7; 12]);
        storage.create_topic(&topic).await.unwrap();

        let seed = topic.as_bytes().to_vec();
        storage
            .append_update(&topic, &update(1), 1, &seed)
            .await
            .unwrap();
        // skipping index 2 must fail
        assert!(matches!(
            storage.append_update(&topic, &update(3), 3, &seed).await,
            Err(ServerError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_chain_crosses_segment_boundary() {
        let (storage, _dir) = test_storage().await;
        let topic = TopicId([8; 12]);
        storage.create_topic(&topic).await.unwrap();

        // fake a full first segment so index 1000 opens a new file
        let first = MessageChain {
            updates: (0..999).map(|i| update((i % 251) as u8)).collect(),
        };
        let path = storage.segment_path(&topic, 0);
        storage.write_atomic(&path, &first.encode()).await.unwrap();

        let seed = [0u8; 32];
        storage
            .append_update(&topic, &update(42), 1000, &seed)
            .await
            .unwrap();
        assert!(fs::metadata(storage.segment_path(&topic, 1000))
            .await
            .is_ok());

        let updates = storage.read_updates(&topic, 998, 3).await.unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[2], update(42));
    }

    #[tokio::test]
    async fn test_file_store_collision() {
        let (storage, _dir) = test_storage().await;
        let topic = TopicId([1; 12]);
        let message = MessageId([2; 12]);
        storage.create_topic(&topic).await.unwrap();

        storage
            .store_file(&topic, &message, b"ciphertext")
            .await
            .unwrap();
        assert!(matches!(
            storage.store_file(&topic, &message, b"other").await,
            Err(ServerError::ResourceAlreadyExists(_))
        ));
        assert_eq!(
            storage.read_file(&topic, &message).await.unwrap(),
            b"ciphertext"
        );
        assert!(matches!(
            storage.read_file(&topic, &MessageId([9; 12])).await,
            Err(ServerError::ResourceNotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_and_reset() {
        let (storage, _dir) = test_storage().await;
        assert!(storage.read_snapshot().await.unwrap().is_none());
        storage.write_snapshot(b"state-v1").await.unwrap();
        storage.write_snapshot(b"state-v2").await.unwrap();
        assert_eq!(
            storage.read_snapshot().await.unwrap().unwrap(),
            b"state-v2"
        );

        storage.delete_all().await.unwrap();
        assert!(storage.read_snapshot().await.unwrap().is_none());
        // tree is usable again after reset
        let topic = TopicId([3; 12]);
        storage.create_topic(&topic).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_user_tree() {
        let (storage, _dir) = test_storage().await;
        let user = UserKey([5; 32]);
        let device = DeviceKey([6; 32]);
        storage.create_user_tree(&user).await.unwrap();
        storage
            .store_prekeys(&user, &device, vec![prekey(1)])
            .await
            .unwrap();

        storage.delete_user_tree(&user).await.unwrap();
        assert_eq!(storage.prekey_count(&user, &device).await.unwrap(), 0);
        // deleting twice is fine
        storage.delete_user_tree(&user).await.unwrap();
    }
}
