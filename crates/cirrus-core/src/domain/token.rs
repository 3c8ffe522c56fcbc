//! Tokens, hints and session serialization.
//!
//! A [`Token`] pairs what the provider considers persistable (an OAuth
//! refresh token, or a compact JSON credential blob for the non-OAuth kinds)
//! with the short-lived bearer. The session envelope `{token, hints}` is the
//! lossless string form handed to the user for storage between runs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::{CloudError, CloudResult};
use super::item::Item;

/// Opaque per-handle key/value hints.
pub type Hints = HashMap<String, String>;

/// Well-known hint keys.
pub mod hint {
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_SECRET: &str = "client_secret";
    pub const REDIRECT_URI: &str = "redirect_uri";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const STATE: &str = "state";
    pub const FILE_URL: &str = "file_url";
    pub const REGION: &str = "region";
    pub const REWRITTEN_ENDPOINT: &str = "rewritten_endpoint";
    pub const TEMPORARY_DIRECTORY: &str = "temporary_directory";
    pub const LOGIN_PAGE: &str = "login_page";
    pub const SUCCESS_PAGE: &str = "success_page";
    pub const ERROR_PAGE: &str = "error_page";
}

/// Credential pair held by an authorized handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// The persistable part, typically an OAuth refresh token.
    pub token: String,
    /// The short-lived bearer presented on wire requests.
    pub access_token: String,
}

impl Token {
    pub fn new(token: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            access_token: access_token.into(),
        }
    }
}

/// Account-level information reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralData {
    pub username: String,
    #[serde(default)]
    pub space_used: Option<u64>,
    #[serde(default)]
    pub space_total: Option<u64>,
}

/// One page of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageData {
    pub items: Vec<Item>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SessionEnvelope {
    token: String,
    hints: Hints,
}

/// Serializes `(token, hints)` into the compact JSON session string.
pub fn serialize_session(token: &str, hints: &Hints) -> String {
    serde_json::to_string(&SessionEnvelope {
        token: token.to_string(),
        hints: hints.clone(),
    })
    .expect("session envelope is always serializable")
}

/// Inverse of [`serialize_session`].
pub fn deserialize_session(serialized: &str) -> CloudResult<(String, Hints)> {
    let envelope: SessionEnvelope = serde_json::from_str(serialized)
        .map_err(|e| CloudError::failure(format!("malformed session: {e}")))?;
    Ok((envelope.token, envelope.hints))
}
