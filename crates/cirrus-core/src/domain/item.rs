//! Items - nodes in a provider namespace.
//!
//! An [`Item`] is a value object: mutating operations on the remote return a
//! fresh item, and callers may keep stale copies around. Identity is the
//! provider-specific `id` string, which is opaque to everything outside the
//! provider's adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse classification of an item, used for MIME fallbacks and directory
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Directory,
    Video,
    Audio,
    Image,
    Unknown,
}

impl FileType {
    /// Integer encoding used by the persisted listing cache.
    pub fn to_code(self) -> u8 {
        match self {
            FileType::Directory => 0,
            FileType::Video => 1,
            FileType::Audio => 2,
            FileType::Image => 3,
            FileType::Unknown => 4,
        }
    }

    /// Inverse of [`FileType::to_code`]; unknown codes decode to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => FileType::Directory,
            1 => FileType::Video,
            2 => FileType::Audio,
            3 => FileType::Image,
            _ => FileType::Unknown,
        }
    }

    /// Classifies a filename by its extension.
    pub fn from_extension(filename: &str) -> Self {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" | "mkv" | "webm" | "avi" | "mov" | "wmv" | "ts" | "m3u8" => FileType::Video,
            "mp3" | "flac" | "ogg" | "oga" | "wav" | "m4a" | "aac" => FileType::Audio,
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "svg" => FileType::Image,
            _ => FileType::Unknown,
        }
    }
}

/// A node in a provider namespace.
///
/// `size` is `None` when the provider did not report one; `timestamp` is
/// `None` when no wall-clock time is known. `url` and `thumbnail_url` are
/// provider-cached values which may go stale; refresh through the engine's
/// item-data operation before trusting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub file_type: FileType,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl Item {
    pub fn new(filename: impl Into<String>, id: impl Into<String>, file_type: FileType) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            size: None,
            timestamp: None,
            file_type,
            url: None,
            thumbnail_url: None,
            mime_type: None,
            hidden: false,
            parents: Vec::new(),
        }
    }

    /// Convenience constructor for directories.
    pub fn directory(filename: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(filename, id, FileType::Directory)
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_thumbnail_url(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Returns a copy bound to a new filename, as produced by a rename.
    pub fn renamed(&self, filename: impl Into<String>) -> Self {
        let mut item = self.clone();
        item.filename = filename.into();
        item
    }
}
