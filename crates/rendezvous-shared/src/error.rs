use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key material")]
    InvalidKey,

    #[error("Signature verification failed")]
    Signature,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("Unexpected end of record")]
    UnexpectedEof,

    #[error("Varint overflow")]
    VarintOverflow,

    #[error("Unsupported wire type {0}")]
    InvalidWireType(u8),

    #[error("Field length exceeds record")]
    LengthOverflow,

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,
}
