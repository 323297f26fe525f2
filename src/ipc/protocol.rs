//! Control socket protocol
//!
//! Newline-delimited JSON between host processes and the cache daemon.
//! Payloads travel as standard base64 strings.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::service::CacheStatus;
use crate::store::Category;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Longest command line the server accepts, newline excluded
pub const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

/// Commands sent by a host to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Store bytes under a key in a category
    Store {
        category: Category,
        key: String,
        /// Base64 payload
        payload: String,
    },
    /// Read a key from a category
    Retrieve { category: Category, key: String },
    /// Delete a key from a category
    Remove { category: Category, key: String },
    /// Clear one category, or every category with `all`
    Clear { category: Category },
    /// Store through the memory-fronted image tier
    CacheImage {
        key: String,
        /// Base64 payload
        payload: String,
    },
    /// Read through the memory-fronted image tier
    RetrieveImage { key: String },
    /// Empty the image tier (memory and disk)
    ClearImageCache,
    /// Total bytes on disk across all categories
    TotalSize,
    /// Turn the image tier on or off
    SetCachingEnabled { enabled: bool },
    /// Host is under memory pressure; drop everything
    MemoryPressure,
    /// Daemon and cache status
    GetStatus,
}

/// Responses sent by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Success response
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error response
    Error {
        /// Error message
        error: String,
    },
    /// Result of a retrieve; `payload` is base64 when found
    Payload {
        found: bool,
        payload: Option<String>,
    },
    /// Result of a size query
    Size { bytes: u64 },
    /// Status response with daemon state
    Status {
        /// Protocol version
        version: u32,
        /// Whether daemon is healthy
        healthy: bool,
        /// Cache snapshot
        cache: CacheStatus,
    },
}

impl Response {
    /// Build a payload response from a lookup result
    pub fn from_lookup(payload: Option<Vec<u8>>) -> Self {
        match payload {
            Some(bytes) => Response::Payload {
                found: true,
                payload: Some(encode_payload(&bytes)),
            },
            None => Response::Payload {
                found: false,
                payload: None,
            },
        }
    }
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded.trim())
}
