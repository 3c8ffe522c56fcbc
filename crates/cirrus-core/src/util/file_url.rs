//! Streamable file URL payloads.
//!
//! To render a remote file as a plain HTTP URL, the engine appends a
//! base64-encoded JSON record `{state, id, name, size}` to the handle's
//! `file_url`. Since the encoded form travels inside a URL path segment,
//! `/` characters produced by standard base64 are substituted with `-`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::domain::errors::{CloudError, CloudResult};

/// The record embedded in a streamable file URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    pub state: String,
    pub id: String,
    pub name: String,
    pub size: u64,
}

/// Builds the full streamable URL for a file served under `file_url`.
pub fn encode_file_url(file_url: &str, payload: &FilePayload) -> String {
    let json = serde_json::to_string(payload).expect("payload is always serializable");
    let encoded = BASE64.encode(json).replace('/', "-");
    format!("{}/{}", file_url.trim_end_matches('/'), encoded)
}

/// Decodes the last path segment of a streamable URL back into its payload.
pub fn decode_file_payload(segment: &str) -> CloudResult<FilePayload> {
    let restored = segment.replace('-', "/");
    let bytes = BASE64
        .decode(restored)
        .map_err(|e| CloudError::failure(format!("bad file url: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| CloudError::failure(format!("bad file url: {e}")))
}
