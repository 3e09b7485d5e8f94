//! Payload serialization.
//!
//! Outbound payloads are serialized on the caller's thread before they are
//! handed to a producer, so a payload that cannot be encoded is reported to the
//! caller instead of being dropped by a worker. Every format carries a content
//! type, which is stamped on the published message and used to pick the
//! decoder when a delivery is read back.
//!
//! ```rust
//! use courier::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Reading {
//!    sensor: String,
//! }
//!
//! let data = Reading { sensor: "north".to_string() };
//! let bytes = Serializer::Json.to_bytes(&data).unwrap();
//! let back: Reading = Serializer::from_content_type(Some("application/json"))
//!     .from_bytes(&bytes)
//!     .unwrap();
//! assert_eq!(back, data);
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, ControllerOptions};

/// Provides a unified interface for serializing and deserializing payloads.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Json,
    Cbor,
    Postcard,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Cbor => write!(f, "cbor"),
            Self::Postcard => write!(f, "postcard"),
        }
    }
}

impl Serializer {
    /// The content type stamped on messages produced with this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Cbor => "application/cbor",
            Self::Postcard => "application/postcard",
        }
    }

    /// Pick the format matching a delivered content type. Unknown or absent
    /// content types are treated as JSON.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.ends_with("cbor") => Self::Cbor,
            Some(ct) if ct.ends_with("postcard") => Self::Postcard,
            _ => Self::Json,
        }
    }

    /// Serializes the given value using the specified format.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::Postcard => Ok(postcard::to_allocvec(value)?),
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result)
            }
        }
    }

    /// Deserializes the given bytes using the specified format.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<&ControllerOptions> for Serializer {
    fn from(options: &ControllerOptions) -> Self {
        match options.serializer {
            config::Serializer::Json => Self::Json,
            config::Serializer::Cbor => Self::Cbor,
            config::Serializer::Postcard => Self::Postcard,
        }
    }
}
