//! Cirrus core - domain model for the cloud storage library
//!
//! This crate holds the types shared by every other cirrus crate:
//! - [`Item`] - a node in a provider namespace (value object)
//! - [`Range`] - half-open byte intervals with a "to end of object" sentinel
//! - [`CloudError`] - the error record delivered to user-visible callbacks
//! - [`Token`] / session serialization - what the user persists between runs
//! - [`ProviderKind`] - the set of known provider backends
//! - [`Config`] - the JSON key configuration
//!
//! It deliberately contains no I/O beyond config loading; transport, server
//! and filesystem behavior live in the sibling crates.

pub mod config;
pub mod domain;
pub mod util;

pub use config::{Config, ProviderKeys};
pub use domain::errors::{code, CloudError, CloudResult};
pub use domain::item::{FileType, Item};
pub use domain::kind::ProviderKind;
pub use domain::range::Range;
pub use domain::token::{
    deserialize_session, serialize_session, GeneralData, Hints, PageData, Token,
};
pub use util::file_url::{decode_file_payload, encode_file_url, FilePayload};
pub use util::lru::LruCache;
pub use util::mime::mime_type_for;
pub use util::sanitize::sanitize;
