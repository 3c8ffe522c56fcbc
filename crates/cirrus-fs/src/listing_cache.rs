//! Persisted directory-listing cache.
//!
//! Maps `(kind, label, directory id)` to the last known listing and
//! persists the whole map to a single file so a fresh mount can show
//! directory contents before the first network round-trip.
//!
//! The on-disk format is self-describing: one version byte, then framed
//! records, each a little-endian u32 length followed by a JSON object
//! `{type, label, id, list: [item, ...]}`. Items use compact keys with a
//! unix-seconds timestamp (0 = unknown) and a sentinel max size for
//! unknown sizes.
//!
//! Saves are debounced onto a dedicated control thread: mutations mark the
//! cache dirty and the thread writes once the burst settles.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cirrus_core::{CloudResult, FileType, Item, ProviderKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const FORMAT_VERSION: u8 = 1;

/// Sentinel for unknown sizes in the persisted form.
const UNKNOWN_SIZE: u64 = u64::MAX;

/// How long after the last mutation the save fires.
const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Cache key: provider kind, mount label, directory id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingKey {
    pub kind: ProviderKind,
    pub label: String,
    pub directory: String,
}

#[derive(Serialize, Deserialize)]
struct PersistedItem {
    filename: String,
    /// Integer file type code.
    #[serde(rename = "type")]
    file_type: u8,
    id: String,
    /// Unix seconds; 0 when unknown.
    timestamp: i64,
    /// [`UNKNOWN_SIZE`] when unknown.
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    mime_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    parents: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    url: Option<String>,
}

impl From<&Item> for PersistedItem {
    fn from(item: &Item) -> Self {
        Self {
            filename: item.filename.clone(),
            file_type: item.file_type.to_code(),
            id: item.id.clone(),
            timestamp: item.timestamp.map(|t| t.timestamp()).unwrap_or(0),
            size: item.size.unwrap_or(UNKNOWN_SIZE),
            mime_type: item.mime_type.clone(),
            parents: item.parents.clone(),
            hidden: item.hidden,
            thumbnail_url: item.thumbnail_url.clone(),
            url: item.url.clone(),
        }
    }
}

impl From<PersistedItem> for Item {
    fn from(persisted: PersistedItem) -> Self {
        let mut item = Item::new(
            persisted.filename,
            persisted.id,
            FileType::from_code(persisted.file_type),
        );
        if persisted.size != UNKNOWN_SIZE {
            item.size = Some(persisted.size);
        }
        if persisted.timestamp != 0 {
            item.timestamp = DateTime::<Utc>::from_timestamp(persisted.timestamp, 0);
        }
        item.mime_type = persisted.mime_type;
        item.parents = persisted.parents;
        item.hidden = persisted.hidden;
        item.thumbnail_url = persisted.thumbnail_url;
        item.url = persisted.url;
        item
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedRecord {
    #[serde(rename = "type")]
    kind: ProviderKind,
    label: String,
    id: String,
    list: Vec<PersistedItem>,
}

struct CacheState {
    entries: Option<HashMap<ListingKey, Vec<Item>>>,
    dirty: bool,
    running: bool,
}

struct Inner {
    path: PathBuf,
    state: Mutex<CacheState>,
    changed: Condvar,
}

/// The persisted listing cache with its save thread.
pub struct ListingCache {
    inner: Arc<Inner>,
    saver: Option<JoinHandle<()>>,
}

impl ListingCache {
    /// Opens a cache backed by `path`. The file is not read until the
    /// first lookup.
    pub fn open(path: PathBuf) -> Self {
        let inner = Arc::new(Inner {
            path,
            state: Mutex::new(CacheState {
                entries: None,
                dirty: false,
                running: true,
            }),
            changed: Condvar::new(),
        });
        let saver_inner = Arc::clone(&inner);
        let saver = std::thread::Builder::new()
            .name("listing-cache".into())
            .spawn(move || save_loop(saver_inner))
            .expect("cache thread spawn");
        Self {
            inner,
            saver: Some(saver),
        }
    }

    /// Looks up the cached listing of a directory, loading the backing
    /// file on first use.
    pub fn get(&self, key: &ListingKey) -> Option<Vec<Item>> {
        let mut state = self.inner.state.lock().unwrap();
        self.ensure_loaded(&mut state);
        state
            .entries
            .as_ref()
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    /// Replaces the cached listing of a directory and schedules a save.
    pub fn put(&self, key: ListingKey, items: Vec<Item>) {
        let mut state = self.inner.state.lock().unwrap();
        self.ensure_loaded(&mut state);
        if let Some(entries) = state.entries.as_mut() {
            entries.insert(key, items);
        }
        state.dirty = true;
        self.inner.changed.notify_all();
    }

    /// Writes the cache out immediately if dirty.
    pub fn flush(&self) {
        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.dirty {
                return;
            }
            state.dirty = false;
            state.entries.clone()
        };
        if let Some(entries) = snapshot {
            if let Err(err) = write_entries(&self.inner.path, &entries) {
                warn!(error = %err, "listing cache save failed");
            }
        }
    }

    fn ensure_loaded(&self, state: &mut CacheState) {
        if state.entries.is_some() {
            return;
        }
        let entries = match std::fs::File::open(&self.inner.path) {
            Ok(file) => match read_entries(file) {
                Ok(entries) => {
                    debug!(count = entries.len(), "listing cache loaded");
                    entries
                }
                Err(err) => {
                    warn!(error = %err, "discarding unreadable listing cache");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        state.entries = Some(entries);
    }
}

impl Drop for ListingCache {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.running = false;
            self.inner.changed.notify_all();
        }
        if let Some(saver) = self.saver.take() {
            let _ = saver.join();
        }
        self.flush();
    }
}

fn save_loop(inner: Arc<Inner>) {
    loop {
        let snapshot = {
            let mut state = inner.state.lock().unwrap();
            while !state.dirty && state.running {
                state = inner.changed.wait(state).unwrap();
            }
            if !state.running {
                return;
            }
            // Debounce: let a burst of mutations settle before writing.
            let (mut state, _) = inner
                .changed
                .wait_timeout(state, SAVE_DEBOUNCE)
                .unwrap();
            if !state.running {
                return;
            }
            state.dirty = false;
            state.entries.clone()
        };
        if let Some(entries) = snapshot {
            if let Err(err) = write_entries(&inner.path, &entries) {
                warn!(error = %err, "listing cache save failed");
            }
        }
    }
}

fn write_entries(
    path: &PathBuf,
    entries: &HashMap<ListingKey, Vec<Item>>,
) -> CloudResult<()> {
    let mut buffer = vec![FORMAT_VERSION];
    for (key, items) in entries {
        let record = PersistedRecord {
            kind: key.kind,
            label: key.label.clone(),
            id: key.directory.clone(),
            list: items.iter().map(PersistedItem::from).collect(),
        };
        let json = serde_json::to_vec(&record)?;
        buffer.extend_from_slice(&(json.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&json);
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&buffer)?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_entries(mut file: std::fs::File) -> CloudResult<HashMap<ListingKey, Vec<Item>>> {
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    if data.first() != Some(&FORMAT_VERSION) {
        return Err(cirrus_core::CloudError::failure("unknown cache version"));
    }
    let mut entries = HashMap::new();
    let mut offset = 1usize;
    while offset + 4 <= data.len() {
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if offset + len > data.len() {
            return Err(cirrus_core::CloudError::failure("truncated cache record"));
        }
        let record: PersistedRecord = serde_json::from_slice(&data[offset..offset + len])?;
        offset += len;
        entries.insert(
            ListingKey {
                kind: record.kind,
                label: record.label,
                directory: record.id,
            },
            record.list.into_iter().map(Item::from).collect(),
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_items() -> Vec<Item> {
        vec![
            Item::directory("docs", "/docs").with_hidden(false),
            Item::new("clip.mp4", "/clip.mp4", FileType::Video)
                .with_size(4096)
                .with_timestamp(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
                .with_mime_type("video/mp4")
                .with_thumbnail_url("https://t/x.jpg"),
        ]
    }

    fn key() -> ListingKey {
        ListingKey {
            kind: ProviderKind::Dropbox,
            label: "personal".into(),
            directory: "/".into(),
        }
    }

    #[test]
    fn round_trips_through_the_framed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.db");
        {
            let cache = ListingCache::open(path.clone());
            cache.put(key(), sample_items());
            cache.flush();
        }
        let cache = ListingCache::open(path);
        let restored = cache.get(&key()).unwrap();
        assert_eq!(restored, sample_items());
    }

    #[test]
    fn unknown_size_and_timestamp_use_sentinels() {
        let item = Item::new("mystery", "/mystery", FileType::Unknown);
        let persisted = PersistedItem::from(&item);
        assert_eq!(persisted.size, UNKNOWN_SIZE);
        assert_eq!(persisted.timestamp, 0);
        let back: Item = persisted.into();
        assert_eq!(back.size, None);
        assert_eq!(back.timestamp, None);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ListingCache::open(dir.path().join("absent.db"));
        assert!(cache.get(&key()).is_none());
    }

    #[test]
    fn bad_version_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.db");
        std::fs::write(&path, [9u8, 0, 0, 0]).unwrap();
        let cache = ListingCache::open(path);
        // Unreadable file behaves like an empty cache.
        assert!(cache.get(&key()).is_none());
    }

    #[test]
    fn debounced_save_lands_without_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.db");
        let cache = ListingCache::open(path.clone());
        cache.put(key(), sample_items());
        std::thread::sleep(SAVE_DEBOUNCE + Duration::from_millis(300));
        assert!(path.exists());
        drop(cache);
    }
}
