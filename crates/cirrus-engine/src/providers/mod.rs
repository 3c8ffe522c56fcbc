//! Shipped provider adapters.
//!
//! One adapter per backend family: an OAuth object store with path-shaped
//! ids (dropbox), an OAuth store with numeric ids and link-resolved
//! downloads (pcloud), a credential-blob WebDAV backend, and a signed
//! S3-style bucket with per-descendant mutations (amazons3). The other
//! recognized kinds have no adapter here and are refused by the factory.

pub mod amazons3;
pub mod dropbox;
pub mod pcloud;
pub mod webdav;

use cirrus_core::ProviderKind;

use crate::adapter::ProviderAdapter;

/// Instantiates the adapter for a kind, or `None` when no adapter ships.
pub fn adapter_for(kind: ProviderKind) -> Option<Box<dyn ProviderAdapter>> {
    match kind {
        ProviderKind::Dropbox => Some(Box::new(dropbox::Dropbox)),
        ProviderKind::PCloud => Some(Box::new(pcloud::PCloud)),
        ProviderKind::WebDav => Some(Box::new(webdav::WebDav)),
        ProviderKind::AmazonS3 => Some(Box::new(amazons3::AmazonS3)),
        _ => None,
    }
}

/// Kinds with a shipped adapter.
pub fn available() -> Vec<ProviderKind> {
    ProviderKind::ALL
        .iter()
        .copied()
        .filter(|kind| adapter_for(*kind).is_some())
        .collect()
}
