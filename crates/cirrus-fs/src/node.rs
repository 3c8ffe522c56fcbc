//! Per-inode state.
//!
//! The filesystem lock guards the inode table, path index and directory
//! cache; each node additionally carries its own leaf lock for transfer
//! state (chunk FIFO, parked reads, pending download windows, the local
//! write buffer). Never take the filesystem lock while holding a node
//! lock.

use std::collections::VecDeque;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use cirrus_core::{CloudResult, Item, Range};
use cirrus_engine::{CloudAccess, RequestHandle};

/// Local 64-bit identifier, stable for the lifetime of one filesystem.
pub type Inode = u64;

/// The synthetic root.
pub const ROOT_INODE: Inode = 1;

/// Fixed id of the synthetic `authorize.html` child under each provider
/// root; reads on it return inlined HTML redirecting to the consent URL.
pub const AUTH_ITEM_ID: &str = "Xu7CzqaXfM";

/// Minimum window fetched for any read; also drives opportunistic
/// prefetch of the following window.
pub const READ_AHEAD: u64 = 2 * 1024 * 1024;

/// Bound of the per-inode chunk FIFO.
pub const CACHED_CHUNK_COUNT: usize = 4;

/// How long a directory listing stays fresh before a background refresh.
pub const CACHE_DIRECTORY_DURATION: Duration = Duration::from_secs(10);

/// A recently downloaded `(range, bytes)` pair.
pub struct Chunk {
    pub range: Range,
    pub data: Vec<u8>,
}

/// A read waiting for a download window to land.
pub struct ParkedRead {
    pub range: Range,
    pub callback: Box<dyn FnOnce(CloudResult<Vec<u8>>) + Send>,
}

/// Transfer state guarded by the node's leaf lock.
pub struct NodeContent {
    pub item: Item,
    /// Running size while an upload reports progress.
    pub size: Option<u64>,
    /// Open local buffer for writes, present together with its filename.
    pub write_buffer: Option<File>,
    pub cache_filename: Option<PathBuf>,
    /// In-flight upload, cancelled instead of remotely deleted on remove.
    pub upload: Option<RequestHandle>,
    /// Download windows currently on the wire.
    pub pending_downloads: Vec<Range>,
    pub read_requests: Vec<ParkedRead>,
    pub chunks: VecDeque<Chunk>,
    /// A listing refresh is already running for this directory.
    pub list_pending: bool,
}

/// One filesystem node.
pub struct Node {
    pub inode: Inode,
    pub parent: Inode,
    /// `None` only for the synthetic root.
    pub access: Option<CloudAccess>,
    pub content: Mutex<NodeContent>,
}

impl Node {
    pub fn new(inode: Inode, parent: Inode, access: Option<CloudAccess>, item: Item) -> Self {
        let size = item.size;
        Self {
            inode,
            parent,
            access,
            content: Mutex::new(NodeContent {
                item,
                size,
                write_buffer: None,
                cache_filename: None,
                upload: None,
                pending_downloads: Vec::new(),
                read_requests: Vec::new(),
                chunks: VecDeque::new(),
                list_pending: false,
            }),
        }
    }

    pub fn item(&self) -> Item {
        self.content.lock().unwrap().item.clone()
    }

    pub fn size(&self) -> Option<u64> {
        self.content.lock().unwrap().size
    }

    pub fn is_directory(&self) -> bool {
        self.content.lock().unwrap().item.is_directory()
    }

    pub fn filename(&self) -> String {
        self.content.lock().unwrap().item.filename.clone()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let content = self.content.get_mut().unwrap();
        if content.write_buffer.take().is_some() {
            if let Some(path) = content.cache_filename.take() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
