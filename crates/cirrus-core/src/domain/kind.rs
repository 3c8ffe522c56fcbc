//! The set of known provider backends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::CloudError;

/// Identifies a provider backend.
///
/// Every kind is recognized by name so that persisted sessions stay loadable;
/// whether an adapter actually ships for a kind is the engine's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderKind {
    AmazonS3,
    Dropbox,
    Box,
    Google,
    OneDrive,
    PCloud,
    WebDav,
    Yandex,
    Mega,
    GPhotos,
    Local,
    AnimeZone,
    FourShared,
}

impl ProviderKind {
    pub const ALL: &'static [ProviderKind] = &[
        ProviderKind::AmazonS3,
        ProviderKind::Dropbox,
        ProviderKind::Box,
        ProviderKind::Google,
        ProviderKind::OneDrive,
        ProviderKind::PCloud,
        ProviderKind::WebDav,
        ProviderKind::Yandex,
        ProviderKind::Mega,
        ProviderKind::GPhotos,
        ProviderKind::Local,
        ProviderKind::AnimeZone,
        ProviderKind::FourShared,
    ];

    /// The wire name, used in URLs, sessions and the key configuration.
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::AmazonS3 => "amazons3",
            ProviderKind::Dropbox => "dropbox",
            ProviderKind::Box => "box",
            ProviderKind::Google => "google",
            ProviderKind::OneDrive => "onedrive",
            ProviderKind::PCloud => "pcloud",
            ProviderKind::WebDav => "webdav",
            ProviderKind::Yandex => "yandex",
            ProviderKind::Mega => "mega",
            ProviderKind::GPhotos => "gphotos",
            ProviderKind::Local => "local",
            ProviderKind::AnimeZone => "animezone",
            ProviderKind::FourShared => "4shared",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| CloudError::failure(format!("unknown provider: {s}")))
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = CloudError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> String {
        kind.name().to_string()
    }
}
