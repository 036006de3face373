use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// An Ed25519 key pair. The server itself only verifies; generation exists
/// for clients and tests.
#[derive(Clone)]
pub struct KeyPair {
    pub secret: [u8; 32],
    pub public: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            secret: signing.to_bytes(),
            public: signing.verifying_key().to_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        sign(&self.secret, message).to_vec()
    }
}

/// Verifies an Ed25519 signature under caller-supplied key bytes.
pub fn verify(key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key: [u8; 32] = key.try_into().map_err(|_| CryptoError::InvalidKey)?;
    let verifying = VerifyingKey::from_bytes(&key).map_err(|_| CryptoError::InvalidKey)?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::Signature)?;
    verifying
        .verify(message, &signature)
        .map_err(|_| CryptoError::Signature)
}

pub fn sign(secret: &[u8; 32], message: &[u8]) -> [u8; 64] {
    SigningKey::from_bytes(secret).sign(message).to_bytes()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over the concatenation of two byte strings. This is the topic
/// chain step: `output_i = SHA256(output_{i-1} || signature_i)`.
pub fn sha256_pair(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Constant-time byte-wise equality. Unequal lengths compare as false
/// without inspecting content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1
}
