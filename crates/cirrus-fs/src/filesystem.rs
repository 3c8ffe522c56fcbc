//! The virtual filesystem.
//!
//! A stable inode namespace over the union of all mounted providers. The
//! synthetic root (inode 1) has one child per mount; each mount's root
//! carries a synthetic `authorize.html` child whose reads return inlined
//! HTML redirecting to the provider's consent URL, which is also what a
//! failed first listing surfaces.
//!
//! Locking: the filesystem lock guards the inode table, path index and
//! directory cache; each node's content lock is a leaf. The filesystem
//! lock is never acquired while a node lock is held.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use cirrus_core::{sanitize, CloudError, CloudResult, FileType, Item, Range};
use cirrus_engine::{
    CloudAccess, CloudHandle, EventLoop, RequestHandle, UploadSource, VecSink,
};
use cirrus_http::{HttpRequestSpec, Method};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::listing_cache::{ListingCache, ListingKey};
use crate::node::{
    Chunk, Inode, Node, NodeContent, ParkedRead, AUTH_ITEM_ID, CACHED_CHUNK_COUNT,
    CACHE_DIRECTORY_DURATION, READ_AHEAD, ROOT_INODE,
};
use crate::workers::WorkerQueues;

/// One provider mounted under the root.
pub struct ProviderMount {
    pub label: String,
    pub access: CloudAccess,
}

/// Attribute snapshot handed to the outer layer.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub inode: Inode,
    pub parent: Inode,
    pub filename: String,
    pub file_type: FileType,
    pub size: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Redirect page served for the synthetic authorize node.
fn authorize_page(url: &str) -> String {
    format!("<html><script>window.location.href=\"{url}\";</script></html>")
}

fn node_key(access: Option<&CloudAccess>, item: &Item) -> String {
    let provider = access.map(|a| a.handle().state()).unwrap_or("");
    format!("{provider}#{}#{}", item.filename, item.id)
}

struct FsState {
    nodes: HashMap<Inode, Arc<Node>>,
    by_key: HashMap<String, Inode>,
    /// Sanitized path -> inode; the root is the empty path.
    paths: HashMap<String, Inode>,
    node_paths: HashMap<Inode, String>,
    /// Directory cache: present means "has been listed (or seeded)".
    children: HashMap<Inode, HashSet<Inode>>,
    /// When the directory was last refreshed from the provider; absent for
    /// listings seeded from the persisted cache.
    refreshed: HashMap<Inode, Instant>,
    /// Provider handle state -> its authorize node.
    auth_nodes: HashMap<String, Inode>,
    next: Inode,
}

fn add_node(
    state: &mut FsState,
    access: Option<CloudAccess>,
    parent: Inode,
    item: Item,
) -> Arc<Node> {
    let key = node_key(access.as_ref(), &item);
    if let Some(&inode) = state.by_key.get(&key) {
        if let Some(node) = state.nodes.get(&inode) {
            return Arc::clone(node);
        }
    }
    let inode = state.next;
    state.next += 1;
    let path = if parent == 0 {
        String::new()
    } else {
        let parent_path = state.node_paths.get(&parent).cloned().unwrap_or_default();
        format!("{parent_path}/{}", sanitize(&item.filename))
    };
    let node = Arc::new(Node::new(inode, parent, access, item));
    state.nodes.insert(inode, Arc::clone(&node));
    state.by_key.insert(key, inode);
    state.paths.insert(path.clone(), inode);
    state.node_paths.insert(inode, path);
    node
}

fn remove_node(state: &mut FsState, inode: Inode) {
    if let Some(node) = state.nodes.remove(&inode) {
        state.by_key.remove(&node_key(node.access.as_ref(), &node.item()));
        if let Some(path) = state.node_paths.remove(&inode) {
            state.paths.remove(&path);
        }
    }
    state.children.remove(&inode);
    state.refreshed.remove(&inode);
}

/// Drops all descendants of `inode`; their ids are stale after a rename or
/// move and must be re-listed.
fn invalidate(state: &mut FsState, inode: Inode) {
    if let Some(children) = state.children.remove(&inode) {
        for child in children {
            invalidate(state, child);
            remove_node(state, child);
        }
    }
    state.refreshed.remove(&inode);
}

/// Replaces the node bound to `inode`, keeping the inode number.
fn rebind_node(state: &mut FsState, inode: Inode, replacement: Arc<Node>) {
    if let Some(old) = state.nodes.remove(&inode) {
        state
            .by_key
            .remove(&node_key(old.access.as_ref(), &old.item()));
        if let Some(path) = state.node_paths.remove(&inode) {
            state.paths.remove(&path);
        }
    }
    let key = node_key(replacement.access.as_ref(), &replacement.item());
    let path = if replacement.parent == 0 {
        String::new()
    } else {
        let parent_path = state
            .node_paths
            .get(&replacement.parent)
            .cloned()
            .unwrap_or_default();
        format!("{parent_path}/{}", sanitize(&replacement.filename()))
    };
    state.nodes.insert(inode, Arc::clone(&replacement));
    state.by_key.insert(key, inode);
    state.paths.insert(path.clone(), inode);
    state.node_paths.insert(inode, path);
}

/// The virtual filesystem over a set of mounted providers.
pub struct CloudFileSystem {
    state: Mutex<FsState>,
    mounts: Vec<ProviderMount>,
    temporary_directory: PathBuf,
    listing_cache: Option<ListingCache>,
    workers: Mutex<Option<WorkerQueues>>,
    events: EventLoop,
    runtime: tokio::runtime::Handle,
}

impl CloudFileSystem {
    /// Builds the namespace: the synthetic root, one node per mount and
    /// one authorize node per provider root.
    pub fn new(
        mounts: Vec<ProviderMount>,
        runtime: tokio::runtime::Handle,
        temporary_directory: PathBuf,
        listing_cache_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let mut state = FsState {
            nodes: HashMap::new(),
            by_key: HashMap::new(),
            paths: HashMap::new(),
            node_paths: HashMap::new(),
            children: HashMap::new(),
            refreshed: HashMap::new(),
            auth_nodes: HashMap::new(),
            next: ROOT_INODE,
        };
        add_node(&mut state, None, 0, Item::directory("/", "root"));
        let mut root_children = HashSet::new();
        for mount in &mounts {
            let root_item = Item::directory(&mount.label, mount.access.root_directory().id);
            let provider_root = add_node(&mut state, Some(mount.access.clone()), ROOT_INODE, root_item);
            root_children.insert(provider_root.inode);
            let page = authorize_page(&mount.access.authorize_url());
            let auth_item = Item::new("authorize.html", AUTH_ITEM_ID, FileType::Unknown)
                .with_size(page.len() as u64);
            let auth_node = add_node(
                &mut state,
                Some(mount.access.clone()),
                provider_root.inode,
                auth_item,
            );
            state
                .auth_nodes
                .insert(mount.access.handle().state().to_string(), auth_node.inode);
        }
        state.children.insert(ROOT_INODE, root_children);

        let events = EventLoop::new();
        Arc::new(Self {
            state: Mutex::new(state),
            mounts,
            temporary_directory,
            listing_cache: listing_cache_path.map(ListingCache::open),
            workers: Mutex::new(Some(WorkerQueues::start(events.clone()))),
            events,
            runtime,
        })
    }

    /// Cancels everything in flight, joins the workers and flushes the
    /// listing cache.
    pub fn shutdown(&self) {
        for mount in &self.mounts {
            mount.access.handle().shutdown();
        }
        // Take the workers out before joining: a completion running on the
        // finish worker may itself need the workers mutex to spawn.
        let workers = self.workers.lock().unwrap().take();
        if let Some(mut workers) = workers {
            workers.shutdown();
        }
        if let Some(cache) = &self.listing_cache {
            cache.flush();
        }
    }

    fn node(&self, inode: Inode) -> Option<Arc<Node>> {
        self.state.lock().unwrap().nodes.get(&inode).cloned()
    }

    fn info(&self, node: &Node) -> NodeInfo {
        let content = node.content.lock().unwrap();
        NodeInfo {
            inode: node.inode,
            parent: node.parent,
            filename: content.item.filename.clone(),
            file_type: content.item.file_type,
            size: content.size,
            timestamp: content.item.timestamp,
        }
    }

    fn label_for(&self, access: &CloudAccess) -> String {
        self.mounts
            .iter()
            .find(|mount| Arc::ptr_eq(mount.access.handle(), access.handle()))
            .map(|mount| mount.label.clone())
            .unwrap_or_default()
    }

    fn spawn_op<T, F, Fut>(
        &self,
        access: &CloudAccess,
        op: F,
        callback: impl FnOnce(CloudResult<T>) + Send + 'static,
    ) -> RequestHandle
    where
        T: Send + 'static,
        F: FnOnce(Arc<CloudHandle>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = CloudResult<T>> + Send + 'static,
    {
        let handle = Arc::clone(access.handle());
        let cancel = handle.child_token();
        let fut = op(handle, cancel.clone());
        let request = RequestHandle::spawn(&self.runtime, &self.events, cancel, fut, callback);
        if let Some(workers) = self.workers.lock().unwrap().as_ref() {
            workers.add(request.clone());
        }
        request
    }

    fn queue_cancel(&self, request: RequestHandle) {
        if let Some(workers) = self.workers.lock().unwrap().as_ref() {
            workers.cancel(request);
        } else {
            request.cancel();
        }
    }

    // ------------------------------------------------------------------
    // Attributes and lookup
    // ------------------------------------------------------------------

    /// Attributes of an inode. Files whose size is unknown resolve it with
    /// a HEAD probe against their content URL and are rebound.
    pub fn getattr(
        self: &Arc<Self>,
        inode: Inode,
        callback: impl FnOnce(CloudResult<NodeInfo>) + Send + 'static,
    ) {
        let Some(node) = self.node(inode) else {
            return callback(Err(CloudError::not_found("no such inode")));
        };
        let item = node.item();
        let access = match node.access.clone() {
            Some(access) if !item.is_directory() && node.size().is_none() => access,
            _ => return callback(Ok(self.info(&node))),
        };
        let fs = Arc::clone(self);
        self.spawn_op(
            &access,
            |handle, cancel| async move {
                let url = handle.get_item_url(&item, &cancel).await?;
                let response = handle
                    .transport()
                    .send(HttpRequestSpec::new(url, Method::HEAD), &cancel)
                    .await?;
                if response.is_success() {
                    Ok(response.content_length().unwrap_or(0))
                } else {
                    Err(response.to_error())
                }
            },
            move |result| match result {
                Ok(size) => {
                    node.content.lock().unwrap().size = Some(size);
                    callback(Ok(fs.info(&node)));
                }
                Err(err) => {
                    node.content.lock().unwrap().size = Some(0);
                    callback(Err(err));
                }
            },
        );
    }

    /// Attributes by absolute sanitized path.
    pub fn getattr_path(
        self: &Arc<Self>,
        path: &str,
        callback: impl FnOnce(CloudResult<NodeInfo>) + Send + 'static,
    ) {
        let normalized = path.trim_end_matches('/');
        let inode = self.state.lock().unwrap().paths.get(normalized).copied();
        match inode {
            Some(inode) => self.getattr(inode, callback),
            None => callback(Err(CloudError::not_found("file not found"))),
        }
    }

    /// Finds a child of `parent` by its sanitized name.
    pub fn lookup(
        self: &Arc<Self>,
        parent: Inode,
        name: &str,
        callback: impl FnOnce(CloudResult<NodeInfo>) + Send + 'static,
    ) {
        let name = name.to_string();
        self.readdir(parent, move |result| match result {
            Ok(entries) => {
                match entries
                    .into_iter()
                    .find(|entry| sanitize(&entry.filename) == name)
                {
                    Some(entry) => callback(Ok(entry)),
                    None => callback(Err(CloudError::not_found("not found"))),
                }
            }
            Err(err) => callback(Err(err)),
        });
    }

    /// Resolves a path relative to `inode`, one lookup per segment.
    pub fn get_path(
        self: &Arc<Self>,
        inode: Inode,
        path: &str,
        callback: Box<dyn FnOnce(CloudResult<NodeInfo>) + Send>,
    ) {
        if path.is_empty() || path == "/" {
            return self.getattr(inode, callback);
        }
        let trimmed = path.trim_start_matches('/');
        let (segment, rest) = match trimmed.find('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
            None => (trimmed, "/"),
        };
        let rest = rest.to_string();
        let fs = Arc::clone(self);
        self.lookup(inode, segment, move |result| match result {
            Ok(entry) => fs.get_path(entry.inode, &rest, callback),
            Err(err) => callback(Err(err)),
        });
    }

    // ------------------------------------------------------------------
    // Directory listing
    // ------------------------------------------------------------------

    /// Lists a directory. Cached children are returned immediately; a
    /// background refresh is kicked when the cache is stale and none is
    /// already pending. The first listing of a directory that fails
    /// surfaces the provider's authorize node instead.
    pub fn readdir(
        self: &Arc<Self>,
        inode: Inode,
        callback: impl FnOnce(CloudResult<Vec<NodeInfo>>) + Send + 'static,
    ) {
        let mut callback = Some(callback);
        let Some(node) = self.node(inode) else {
            if let Some(cb) = callback.take() {
                cb(Err(CloudError::not_found("no such inode")));
            }
            return;
        };

        let mut reported = false;
        {
            let state = self.state.lock().unwrap();
            if let Some(children) = state.children.get(&inode) {
                let entries: Vec<NodeInfo> = children
                    .iter()
                    .filter_map(|child| state.nodes.get(child))
                    .map(|child| {
                        let content = child.content.lock().unwrap();
                        NodeInfo {
                            inode: child.inode,
                            parent: child.parent,
                            filename: content.item.filename.clone(),
                            file_type: content.item.file_type,
                            size: content.size,
                            timestamp: content.item.timestamp,
                        }
                    })
                    .collect();
                reported = true;
                drop(state);
                if let Some(cb) = callback.take() {
                    cb(Ok(entries));
                }
            }
        }

        let Some(access) = node.access.clone() else {
            // The synthetic root always has its children cached.
            if let Some(cb) = callback.take() {
                cb(Err(CloudError::not_found("no provider")));
            }
            return;
        };

        let directory_item = node.item();
        let cache_key = ListingKey {
            kind: access.kind(),
            label: self.label_for(&access),
            directory: directory_item.id.clone(),
        };

        // Not seen yet: a persisted listing can answer immediately while
        // the refresh runs.
        if !reported {
            if let Some(items) = self
                .listing_cache
                .as_ref()
                .and_then(|cache| cache.get(&cache_key))
            {
                let entries = {
                    let mut state = self.state.lock().unwrap();
                    let mut set = HashSet::new();
                    let mut entries = Vec::new();
                    for item in items {
                        let child =
                            add_node(&mut state, Some(access.clone()), inode, item);
                        set.insert(child.inode);
                        entries.push(self.info(&child));
                    }
                    state.children.insert(inode, set);
                    // No refreshed stamp: the listing is stale by
                    // definition and the refresh below still runs.
                    entries
                };
                debug!(inode, "directory served from persisted cache");
                reported = true;
                if let Some(cb) = callback.take() {
                    cb(Ok(entries));
                }
            }
        }

        let fresh = {
            let state = self.state.lock().unwrap();
            state
                .refreshed
                .get(&inode)
                .map(|at| at.elapsed() <= CACHE_DIRECTORY_DURATION)
                .unwrap_or(false)
        };
        {
            let mut content = node.content.lock().unwrap();
            if reported && (content.list_pending || fresh) {
                return;
            }
            content.list_pending = true;
        }

        let fs = Arc::clone(self);
        let refresh_node = Arc::clone(&node);
        let refresh_access = access.clone();
        self.spawn_op(
            &access,
            |handle, cancel| async move { handle.list_directory(&directory_item, &cancel).await },
            move |result| {
                match result {
                    Ok(items) => {
                        let entries = {
                            let mut state = fs.state.lock().unwrap();
                            let mut set = HashSet::new();
                            let mut entries = Vec::new();
                            for item in &items {
                                let child = add_node(
                                    &mut state,
                                    Some(refresh_access.clone()),
                                    inode,
                                    item.clone(),
                                );
                                set.insert(child.inode);
                                entries.push(fs.info(&child));
                            }
                            state.children.insert(inode, set);
                            state.refreshed.insert(inode, Instant::now());
                            entries
                        };
                        if let Some(cache) = &fs.listing_cache {
                            cache.put(cache_key, items);
                        }
                        if let Some(cb) = callback.take() {
                            cb(Ok(entries));
                        }
                    }
                    Err(err) => {
                        debug!(inode, error = %err, "directory refresh failed");
                        if let Some(cb) = callback.take() {
                            // Surface the authorize node so the outer layer
                            // can show the consent redirect.
                            let auth_entry = {
                                let state = fs.state.lock().unwrap();
                                state
                                    .auth_nodes
                                    .get(refresh_access.handle().state())
                                    .and_then(|auth| state.nodes.get(auth))
                                    .map(|auth| fs.info(auth))
                            };
                            match auth_entry {
                                Some(entry) => cb(Ok(vec![entry])),
                                None => cb(Err(err)),
                            }
                        }
                    }
                }
                refresh_node.content.lock().unwrap().list_pending = false;
            },
        );
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Reads a byte range, served from the chunk cache when possible and
    /// otherwise parked until a download window lands. Reads past the end
    /// return the available tail.
    pub fn read(
        self: &Arc<Self>,
        inode: Inode,
        offset: u64,
        size: u32,
        callback: impl FnOnce(CloudResult<Vec<u8>>) + Send + 'static,
    ) {
        let Some(node) = self.node(inode) else {
            return callback(Err(CloudError::not_found("no such inode")));
        };
        let item = node.item();
        let Some(access) = node.access.clone() else {
            return callback(Ok(Vec::new()));
        };
        if item.id == AUTH_ITEM_ID {
            let page = authorize_page(&access.authorize_url()).into_bytes();
            let start = (offset as usize).min(page.len());
            let end = (start + size as usize).min(page.len());
            return callback(Ok(page[start..end].to_vec()));
        }
        let Some(len) = node.size() else {
            return callback(Ok(Vec::new()));
        };
        if len == 0 {
            return callback(Ok(Vec::new()));
        }
        let range = Range::new(offset, size as u64).clip(len);
        if range.size == 0 {
            return callback(Ok(Vec::new()));
        }

        let mut content = node.content.lock().unwrap();

        // Opportunistic read-ahead: fetch the following window unless a
        // cached chunk already covers it.
        let probe = Range::new(range.start + READ_AHEAD / 2, READ_AHEAD / 2).clip(len);
        let ahead_covered = probe.size == 0
            || content
                .chunks
                .iter()
                .any(|chunk| probe.is_inside(&chunk.range));
        if !ahead_covered {
            let ahead = Range::new(range.start + READ_AHEAD / 2, range.size).clip(len);
            self.start_download(&node, &access, len, ahead, &mut content);
        }

        let cached = content.chunks.iter().find_map(|chunk| {
            if !range.is_inside(&chunk.range) {
                return None;
            }
            let start = (range.start - chunk.range.start) as usize;
            let end = start + range.size as usize;
            chunk.data.get(start..end).map(<[u8]>::to_vec)
        });
        if let Some(data) = cached {
            drop(content);
            return callback(Ok(data));
        }

        content.read_requests.push(ParkedRead {
            range,
            callback: Box::new(callback),
        });
        self.start_download(&node, &access, len, range, &mut content);
    }

    /// Issues a download window unless a pending one already covers the
    /// requested range. The window is at least `READ_AHEAD` bytes, clipped
    /// to the object.
    fn start_download(
        self: &Arc<Self>,
        node: &Arc<Node>,
        access: &CloudAccess,
        len: u64,
        requested: Range,
        content: &mut NodeContent,
    ) {
        if requested.size == 0 {
            return;
        }
        if content
            .pending_downloads
            .iter()
            .any(|pending| requested.is_inside(pending))
        {
            return;
        }
        let window = Range::new(requested.start, requested.size.max(READ_AHEAD)).clip(len);
        content.pending_downloads.push(window);
        debug!(
            inode = node.inode,
            start = window.start,
            len = window.size,
            "requesting range"
        );

        let item = content.item.clone();
        let node = Arc::clone(node);
        self.spawn_op(
            access,
            move |handle, cancel| async move {
                let mut sink = VecSink::default();
                handle.download_file(&item, window, &mut sink, &cancel).await?;
                Ok(sink.data)
            },
            move |result: CloudResult<Vec<u8>>| {
                let mut deliveries: Vec<(ParkedRead, CloudResult<Vec<u8>>)> = Vec::new();
                {
                    let mut content = node.content.lock().unwrap();
                    let mut remaining = Vec::new();
                    for parked in content.read_requests.drain(..) {
                        if parked.range.is_inside(&window) {
                            let slice = match &result {
                                Ok(data) => {
                                    let start = (parked.range.start - window.start) as usize;
                                    let end = start + parked.range.size as usize;
                                    if end <= data.len() {
                                        Ok(data[start..end].to_vec())
                                    } else {
                                        Err(CloudError::failure("short download"))
                                    }
                                }
                                Err(err) => Err(err.clone()),
                            };
                            deliveries.push((parked, slice));
                        } else {
                            remaining.push(parked);
                        }
                    }
                    content.read_requests = remaining;
                    content.pending_downloads.retain(|pending| *pending != window);
                    if let Ok(data) = result {
                        content.chunks.push_back(Chunk {
                            range: window,
                            data,
                        });
                        while content.chunks.len() > CACHED_CHUNK_COUNT {
                            content.chunks.pop_front();
                        }
                    }
                }
                for (parked, slice) in deliveries {
                    (parked.callback)(slice);
                }
            },
        );
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Creates a file-to-be under `parent` backed by an empty local write
    /// buffer. Returns `None` when the parent has no provider.
    pub fn mknod(&self, parent: Inode, name: &str) -> Option<Inode> {
        let node = {
            let mut state = self.state.lock().unwrap();
            let parent_node = state.nodes.get(&parent)?.clone();
            let access = parent_node.access.clone()?;
            let item = Item::new(name, "", FileType::Unknown).with_size(0);
            let node = add_node(&mut state, Some(access), parent, item);
            if let Some(children) = state.children.get_mut(&parent) {
                children.insert(node.inode);
            }
            node
        };
        let filename = self
            .temporary_directory
            .join(format!("cirrus{}", node.inode));
        match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&filename)
        {
            Ok(file) => {
                let mut content = node.content.lock().unwrap();
                content.write_buffer = Some(file);
                content.cache_filename = Some(filename);
                Some(node.inode)
            }
            Err(err) => {
                warn!(error = %err, "could not create write buffer");
                None
            }
        }
    }

    /// Writes into the local buffer at `offset`; returns bytes written,
    /// zero on failure.
    pub fn write(&self, inode: Inode, data: &[u8], offset: u64) -> u32 {
        let Some(node) = self.node(inode) else {
            return 0;
        };
        let mut content = node.content.lock().unwrap();
        if content.write_buffer.is_none() {
            let filename = self.temporary_directory.join(format!("cirrus{inode}"));
            match std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&filename)
            {
                Ok(file) => {
                    content.write_buffer = Some(file);
                    content.cache_filename = Some(filename);
                }
                Err(err) => {
                    warn!(error = %err, "could not create write buffer");
                    return 0;
                }
            }
        }
        debug!(inode, offset, len = data.len(), "writing");
        let file = content.write_buffer.as_mut().expect("ensured above");
        match file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
        {
            Ok(()) => data.len() as u32,
            Err(err) => {
                warn!(error = %err, "write into buffer failed");
                0
            }
        }
    }

    /// Uploads the local buffer. On success the inode is rebound to the
    /// server-returned item; on failure the buffer is retained for a later
    /// retry.
    pub fn fsync(
        self: &Arc<Self>,
        inode: Inode,
        callback: impl FnOnce(CloudResult<()>) + Send + 'static,
    ) {
        let Some(node) = self.node(inode) else {
            return callback(Err(CloudError::not_found("no such inode")));
        };
        let Some(parent_node) = self.node(node.parent) else {
            return callback(Err(CloudError::service_unavailable("no parent")));
        };
        let Some(access) = parent_node.access.clone() else {
            return callback(Err(CloudError::service_unavailable("no provider")));
        };
        let file = {
            let content = node.content.lock().unwrap();
            match &content.write_buffer {
                None => return callback(Ok(())),
                Some(file) => match file.try_clone() {
                    Ok(file) => file,
                    Err(err) => return callback(Err(CloudError::failure(err.to_string()))),
                },
            }
        };
        let filename = node.filename();
        info!(inode, filename, "fsync");
        let parent_item = parent_node.item();
        let source = Box::new(FileSource {
            file,
            fs: Arc::downgrade(self),
            inode,
        });
        let fs = Arc::clone(self);
        let upload_node = Arc::clone(&node);
        let upload_access = access.clone();
        let request = self.spawn_op(
            &access,
            move |handle, cancel| async move {
                handle
                    .upload_file(&parent_item, &filename, source, &cancel)
                    .await
            },
            move |result| match result {
                Ok(item) => {
                    {
                        let mut state = fs.state.lock().unwrap();
                        let replacement = Arc::new(Node::new(
                            inode,
                            upload_node.parent,
                            Some(upload_access),
                            item,
                        ));
                        rebind_node(&mut state, inode, replacement);
                    }
                    info!(inode, "fsynced");
                    callback(Ok(()));
                }
                Err(err) => {
                    upload_node.content.lock().unwrap().upload = None;
                    warn!(inode, error = %err, "upload failed, buffer retained");
                    callback(Err(err));
                }
            },
        );
        node.content.lock().unwrap().upload = Some(request);
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Creates a directory on the provider and inserts it into the cache.
    pub fn mkdir(
        self: &Arc<Self>,
        parent: Inode,
        name: &str,
        callback: impl FnOnce(CloudResult<NodeInfo>) + Send + 'static,
    ) {
        let Some(parent_node) = self.node(parent) else {
            return callback(Err(CloudError::not_found("no such inode")));
        };
        let Some(access) = parent_node.access.clone() else {
            return callback(Err(CloudError::service_unavailable("no provider")));
        };
        let parent_item = parent_node.item();
        let name = name.to_string();
        let fs = Arc::clone(self);
        let insert_access = access.clone();
        self.spawn_op(
            &access,
            move |handle, cancel| async move {
                handle.create_directory(&parent_item, &name, &cancel).await
            },
            move |result| match result {
                Ok(item) => {
                    let entry = {
                        let mut state = fs.state.lock().unwrap();
                        let child = add_node(&mut state, Some(insert_access), parent, item);
                        if let Some(children) = state.children.get_mut(&parent) {
                            children.insert(child.inode);
                        }
                        fs.info(&child)
                    };
                    callback(Ok(entry));
                }
                Err(err) => callback(Err(err)),
            },
        );
    }

    /// Renames and/or moves `name` under `parent` to `newname` under
    /// `newparent`. Cross-provider moves are refused. The inode is
    /// re-parented atomically and its descendants are invalidated.
    pub fn rename(
        self: &Arc<Self>,
        parent: Inode,
        name: &str,
        newparent: Inode,
        newname: &str,
        callback: impl FnOnce(CloudResult<NodeInfo>) + Send + 'static,
    ) {
        if sanitize(newname) != newname {
            return callback(Err(CloudError::service_unavailable("invalid new name")));
        }
        info!(name, newname, "renaming");
        let newname = newname.to_string();
        let fs = Arc::clone(self);
        let name_owned = name.to_string();
        self.lookup(parent, &name_owned, move |result| {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => return callback(Err(err)),
            };
            let Some(node) = fs.node(entry.inode) else {
                return callback(Err(CloudError::not_found("node vanished")));
            };
            let (Some(parent_node), Some(dest_node)) = (fs.node(parent), fs.node(newparent))
            else {
                return callback(Err(CloudError::failure("invalid provider")));
            };
            let (Some(src_access), Some(dst_access)) =
                (parent_node.access.clone(), dest_node.access.clone())
            else {
                return callback(Err(CloudError::failure("invalid provider")));
            };
            if !Arc::ptr_eq(src_access.handle(), dst_access.handle()) {
                return callback(Err(CloudError::service_unavailable(
                    "can't move files between providers",
                )));
            }
            let Some(access) = node.access.clone() else {
                return callback(Err(CloudError::service_unavailable("no provider")));
            };

            let dest_item = dest_node.item();
            let item = node.item();
            let needs_rename = sanitize(&item.filename) != newname;
            let needs_move = parent != newparent;
            let fs2 = Arc::clone(&fs);
            let rebind_access = access.clone();
            fs.spawn_op(
                &access,
                move |handle, cancel| async move {
                    let mut current = item;
                    if needs_rename {
                        current = handle.rename_item(&current, &newname, &cancel).await?;
                    }
                    if needs_move {
                        current = handle.move_item(&current, &dest_item, &cancel).await?;
                    }
                    Ok(current)
                },
                move |result: CloudResult<Item>| match result {
                    Ok(final_item) => {
                        let info = {
                            let mut state = fs2.state.lock().unwrap();
                            invalidate(&mut state, entry.inode);
                            if let Some(children) = state.children.get_mut(&parent) {
                                children.remove(&entry.inode);
                            }
                            if let Some(children) = state.children.get_mut(&newparent) {
                                children.insert(entry.inode);
                            }
                            let replacement = Arc::new(Node::new(
                                entry.inode,
                                newparent,
                                Some(rebind_access),
                                final_item,
                            ));
                            rebind_node(&mut state, entry.inode, Arc::clone(&replacement));
                            drop(state);
                            fs2.info(&replacement)
                        };
                        callback(Ok(info));
                    }
                    Err(err) => callback(Err(err)),
                },
            );
        });
    }

    /// Removes `name` under `parent`. Non-empty directories are refused;
    /// files with an in-flight upload have the upload cancelled and are
    /// dropped locally without a remote delete.
    pub fn remove(
        self: &Arc<Self>,
        parent: Inode,
        name: &str,
        callback: impl FnOnce(CloudResult<()>) + Send + 'static,
    ) {
        info!(name, "removing");
        let fs = Arc::clone(self);
        self.lookup(parent, name, move |result| {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => return callback(Err(err)),
            };
            if entry.file_type == FileType::Directory {
                let fs2 = Arc::clone(&fs);
                fs.readdir(entry.inode, move |result| match result {
                    Ok(entries) if !entries.is_empty() => {
                        callback(Err(CloudError::not_empty("not empty")))
                    }
                    Ok(_) => fs2.remove_leaf(parent, entry.inode, callback),
                    Err(err) => callback(Err(err)),
                });
            } else {
                fs.remove_leaf(parent, entry.inode, callback);
            }
        });
    }

    fn remove_leaf(
        self: &Arc<Self>,
        parent: Inode,
        inode: Inode,
        callback: impl FnOnce(CloudResult<()>) + Send + 'static,
    ) {
        let Some(node) = self.node(inode) else {
            return callback(Err(CloudError::not_found("node vanished")));
        };
        // An in-flight upload means the file does not exist remotely yet:
        // cancel it and drop the local node.
        let upload = node.content.lock().unwrap().upload.take();
        if let Some(request) = upload {
            self.queue_cancel(request);
            let mut state = self.state.lock().unwrap();
            if let Some(children) = state.children.get_mut(&parent) {
                children.remove(&inode);
            }
            remove_node(&mut state, inode);
            drop(state);
            return callback(Ok(()));
        }
        let Some(access) = node.access.clone() else {
            return callback(Err(CloudError::service_unavailable("no provider")));
        };
        let item = node.item();
        let fs = Arc::clone(self);
        self.spawn_op(
            &access,
            move |handle, cancel| async move { handle.delete_item(&item, &cancel).await },
            move |result| match result {
                Ok(()) => {
                    let mut state = fs.state.lock().unwrap();
                    if let Some(children) = state.children.get_mut(&parent) {
                        children.remove(&inode);
                    }
                    remove_node(&mut state, inode);
                    drop(state);
                    callback(Ok(()));
                }
                Err(err) => {
                    warn!(inode, error = %err, "remove failed");
                    callback(Err(err));
                }
            },
        );
    }
}

impl Drop for CloudFileSystem {
    fn drop(&mut self) {
        for mount in &self.mounts {
            mount.access.handle().shutdown();
        }
        let workers = self.workers.lock().unwrap().take();
        if let Some(mut workers) = workers {
            workers.shutdown();
        }
    }
}

/// Streams the node's local write buffer into an upload, reporting
/// progress as the inode's running size. Holds the filesystem weakly so an
/// upload outliving the filesystem discards its updates.
struct FileSource {
    file: std::fs::File,
    fs: Weak<CloudFileSystem>,
    inode: Inode,
}

impl UploadSource for FileSource {
    fn size(&mut self) -> CloudResult<u64> {
        let len = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(len)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> CloudResult<usize> {
        Ok(self.file.read(buf)?)
    }

    fn reset(&mut self) -> CloudResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn progress(&mut self, sent: u64, _total: u64) {
        if let Some(fs) = self.fs.upgrade() {
            if let Some(node) = fs.node(self.inode) {
                node.content.lock().unwrap().size = Some(sent);
            }
        }
    }
}
