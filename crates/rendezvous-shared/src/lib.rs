pub mod constants;
pub mod crypto;
pub mod error;
pub mod records;
pub mod types;
pub mod wire;

pub use error::{CryptoError, WireError};
