use data_encoding::BASE32_NOPAD;
use std::fmt;

// Fixed-size binary identifiers. All of them arrive on the wire as opaque
// byte strings and are validated into these newtypes at the trust boundary.

/// Ed25519 public key binding a user across the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserKey(pub [u8; 32]);

/// Ed25519 public key binding one device of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey(pub [u8; 32]);

/// 12-byte topic identifier, also the seed of the topic's hash chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId(pub [u8; 12]);

/// 12-byte identifier of an encrypted file within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 12]);

/// 16 random bytes, one per device (or the admin). Compared in constant time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthToken(pub [u8; 16]);

macro_rules! binary_id {
    ($name:ident, $len:expr) => {
        impl $name {
            pub const LEN: usize = $len;

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; $len] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Filesystem-safe form used for storage path segments.
            pub fn to_base32(&self) -> String {
                BASE32_NOPAD.encode(&self.0)
            }

            pub fn from_base32(s: &str) -> Option<Self> {
                let bytes = BASE32_NOPAD.decode(s.as_bytes()).ok()?;
                Self::from_slice(&bytes)
            }

            /// Abbreviated hex form for log output.
            pub fn short(&self) -> String {
                self.to_hex()[..8].to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

binary_id!(UserKey, 32);
binary_id!(DeviceKey, 32);
binary_id!(TopicId, 12);
binary_id!(MessageId, 12);
binary_id!(AuthToken, 16);
