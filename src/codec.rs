//! Payload serialization
//!
//! The tiers only ever see opaque bytes; a codec turns typed values into those
//! bytes and back.

use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Converts cached payloads to and from bytes.
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CacheError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError>;
}

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
