//! Payload encodings for cached values.

use polars::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

use super::CacheError;

/// Conversion between a value and the bytes held by the cache tiers.
///
/// Callers always receive a freshly decoded copy, never a shared reference
/// into the cache.
pub trait CacheCodec: Sized {
    fn encode(&self) -> Result<Vec<u8>, CacheError>;
    fn decode(bytes: &[u8]) -> Result<Self, CacheError>;
}

impl CacheCodec for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(bytes.to_vec())
    }
}

impl CacheCodec for String {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

impl CacheCodec for serde_json::Value {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(self).map_err(|e| CacheError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

/// Tables travel as in-memory Parquet.
impl CacheCodec for DataFrame {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let mut buf = Vec::new();
        ParquetWriter::new(&mut buf)
            .finish(&mut self.clone())
            .map_err(|e| CacheError::Codec(format!("parquet encode: {e}")))?;
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        ParquetReader::new(Cursor::new(bytes.to_vec()))
            .finish()
            .map_err(|e| CacheError::Codec(format!("parquet decode: {e}")))
    }
}

/// JSON encoding for any serde type.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Serialize + DeserializeOwned> CacheCodec for Json<T> {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(&self.0).map_err(|e| CacheError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(bytes)
            .map(Json)
            .map_err(|e| CacheError::Codec(e.to_string()))
    }
}
