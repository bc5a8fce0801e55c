use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("received empty payload")]
    Empty,
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Turns the raw bytes of a record into what the message handler consumes.
///
/// The broker client picks its decoder at construction time, which keeps the
/// consumption loop unaware of encodings.
pub trait PayloadDecoder: Send + Sync + 'static {
    type Output: Send + 'static;

    fn decode(&self, payload: Option<&[u8]>) -> Result<Self::Output, DecodeError>;
}

/// Hands payloads through untouched. Tombstones are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPayload;

impl PayloadDecoder for RawPayload {
    type Output = Vec<u8>;

    fn decode(&self, payload: Option<&[u8]>) -> Result<Vec<u8>, DecodeError> {
        payload.map(<[u8]>::to_vec).ok_or(DecodeError::Empty)
    }
}

/// Deserializes JSON payloads into `T`.
pub struct JsonPayload<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonPayload<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonPayload<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadDecoder for JsonPayload<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn decode(&self, payload: Option<&[u8]>) -> Result<T, DecodeError> {
        let payload = payload.ok_or(DecodeError::Empty)?;
        Ok(serde_json::from_slice(payload)?)
    }
}
