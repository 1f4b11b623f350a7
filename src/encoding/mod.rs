pub mod keycode;

use crate::error::Result;

pub use keycode::Lexicode;

/// Error type for encoding operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    InvalidFormat(String),
    TruncatedData,
    InvalidUtf8,
    OutOfRange(String),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid encoding format: {}", msg),
            EncodingError::TruncatedData => write!(f, "Truncated data"),
            EncodingError::InvalidUtf8 => write!(f, "Invalid UTF-8 sequence"),
            EncodingError::OutOfRange(msg) => write!(f, "Value out of range: {}", msg),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        crate::Error::Format(err)
    }
}

/// Encodes `value` as an index or row key.
pub fn encode<K: Lexicode + ?Sized>(value: &K) -> Vec<u8> {
    value.encode()
}

/// Decodes a key produced by [`encode`].
pub fn decode<K: Lexicode>(bytes: &[u8]) -> Result<K> {
    K::decode(bytes)
}
