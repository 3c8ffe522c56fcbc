//! Provider handles and the uniform operation vocabulary.
//!
//! A [`CloudHandle`] binds one provider adapter to one set of credentials
//! and implements every operation of the vocabulary as a cancellable async
//! call: re-authorization on retry-worthy failures, internalized listing
//! pagination, path resolution by segment walking, and depth-first
//! traversal for backends whose mutations need one wire call per
//! descendant.
//!
//! [`CloudAccess`] is the callback-flavored wrapper the factory hands out:
//! each operation is spawned onto the runtime as a [`RequestHandle`] and its
//! single completion is dispatched through the event loop.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cirrus_core::domain::token::hint;
use cirrus_core::{
    encode_file_url, CloudError, CloudResult, FilePayload, GeneralData, Hints, Item, PageData,
    ProviderKind, Range, Token,
};
use cirrus_http::{HttpRequestSpec, HttpResponse, Transport};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AuthSnapshot, Operation, ProviderAdapter};
use crate::auth::{AuthCallback, AuthManager, ConsentStatus};
use crate::event_loop::EventLoop;
use crate::runtime::RequestHandle;

/// Read granularity for streamed uploads.
const UPLOAD_BUFFER: usize = 64 * 1024;

/// Receives download payload bytes as they arrive.
pub trait DownloadSink: Send {
    fn received(&mut self, data: &[u8]);

    fn progress(&mut self, received: u64, total: Option<u64>) {
        let _ = (received, total);
    }
}

/// Sink buffering the whole download in memory.
#[derive(Default)]
pub struct VecSink {
    pub data: Vec<u8>,
}

impl DownloadSink for VecSink {
    fn received(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }
}

/// Supplies upload payload bytes in bounded chunks.
///
/// `reset` rewinds to the beginning so the runtime can replay the body
/// after a re-authorization pass.
pub trait UploadSource: Send + 'static {
    fn size(&mut self) -> CloudResult<u64>;

    /// Fills `buf`, returning the number of bytes produced; zero means end
    /// of stream.
    fn read_chunk(&mut self, buf: &mut [u8]) -> CloudResult<usize>;

    fn reset(&mut self) -> CloudResult<()>;

    fn progress(&mut self, sent: u64, total: u64) {
        let _ = (sent, total);
    }
}

/// In-memory upload source, mostly for tests and small payloads.
pub struct BytesSource {
    data: Bytes,
    offset: usize,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
        }
    }
}

impl UploadSource for BytesSource {
    fn size(&mut self) -> CloudResult<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> CloudResult<usize> {
        let remaining = self.data.len() - self.offset;
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    fn reset(&mut self) -> CloudResult<()> {
        self.offset = 0;
        Ok(())
    }
}

fn upload_stream(
    source: Arc<Mutex<Box<dyn UploadSource>>>,
    total: u64,
) -> futures::stream::BoxStream<'static, std::io::Result<Bytes>> {
    futures::stream::unfold((source, 0u64), move |(source, sent)| async move {
        let mut buf = vec![0u8; UPLOAD_BUFFER];
        let read = {
            let mut guard = source.lock().unwrap();
            guard.read_chunk(&mut buf)
        };
        match read {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                let sent = sent + n as u64;
                source.lock().unwrap().progress(sent, total);
                Some((Ok(Bytes::from(buf)), (source, sent)))
            }
            Err(err) => Some((
                Err(std::io::Error::other(err.to_string())),
                (source, total),
            )),
        }
    })
    .boxed()
}

/// Returns the prefix of a path-shaped id up to and including the final
/// separator of its parent, e.g. `a/b/c.txt` -> `a/b/` and `a/b/` -> `a/`.
fn parent_prefix(id: &str) -> &str {
    let trimmed = id.strip_suffix('/').unwrap_or(id);
    match trimmed.rfind('/') {
        Some(idx) => &id[..idx + 1],
        None => "",
    }
}

fn last_segment(id: &str) -> &str {
    let trimmed = id.strip_suffix('/').unwrap_or(id);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// What the depth-first traversal applies to each visited node.
#[derive(Clone, Copy)]
enum RecursiveAction<'a> {
    Delete,
    /// Copy the node's id from under `old_base` to under `new_base`, then
    /// delete the original.
    Transfer {
        old_base: &'a str,
        new_base: &'a str,
    },
}

/// One provider instance bound to one set of credentials.
pub struct CloudHandle {
    kind: ProviderKind,
    adapter: Box<dyn ProviderAdapter>,
    transport: Transport,
    auth: AuthManager,
    auth_callback: Arc<dyn AuthCallback>,
    hints: Mutex<Hints>,
    state: String,
    file_url: String,
    /// Parent of every operation token; cancelled at shutdown.
    root_token: CancellationToken,
}

impl CloudHandle {
    pub fn new(
        adapter: Box<dyn ProviderAdapter>,
        transport: Transport,
        auth_callback: Arc<dyn AuthCallback>,
        token: Option<Token>,
        hints: Hints,
    ) -> Self {
        let kind = adapter.kind();
        let state = hints.get(hint::STATE).cloned().unwrap_or_default();
        let file_url = hints.get(hint::FILE_URL).cloned().unwrap_or_default();
        // A bearer persisted from a previous run rides in through hints.
        let token = token.map(|t| {
            if t.access_token.is_empty() {
                let bearer = hints.get(hint::ACCESS_TOKEN).cloned().unwrap_or_default();
                Token::new(t.token, bearer)
            } else {
                t
            }
        });
        Self {
            kind,
            adapter,
            transport,
            auth: AuthManager::new(token),
            auth_callback,
            hints: Mutex::new(hints),
            state,
            file_url,
            root_token: CancellationToken::new(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn adapter(&self) -> &dyn ProviderAdapter {
        &*self.adapter
    }

    /// The persistable token string, empty when unauthorized.
    pub fn token(&self) -> String {
        self.auth.token().map(|t| t.token).unwrap_or_default()
    }

    pub fn hints(&self) -> Hints {
        self.hints.lock().unwrap().clone()
    }

    pub fn root_directory(&self) -> Item {
        self.adapter.root_directory()
    }

    /// URL the user visits to grant this handle access.
    pub fn authorize_url(&self) -> String {
        self.adapter.authorize_url(&self.snapshot())
    }

    /// A fresh cancellation token parented to this handle.
    pub fn child_token(&self) -> CancellationToken {
        self.root_token.child_token()
    }

    /// Cancels every operation issued through this handle.
    pub fn shutdown(&self) {
        self.root_token.cancel();
    }

    /// Hands an out-of-band authorization code to a parked consent waiter.
    pub fn deliver_code(&self, code: &str) -> bool {
        self.auth.deliver_code(code)
    }

    fn snapshot(&self) -> AuthSnapshot {
        let hints = self.hints.lock().unwrap().clone();
        let token = self.auth.token();
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        AuthSnapshot {
            client_id: hints.get(hint::CLIENT_ID).cloned().unwrap_or_default(),
            client_secret: hints.get(hint::CLIENT_SECRET).cloned().unwrap_or_default(),
            redirect_uri: hints.get(hint::REDIRECT_URI).cloned().unwrap_or_default(),
            state: self.state.clone(),
            access_token: token
                .as_ref()
                .map(|t| t.access_token.clone())
                .and_then(non_empty),
            token: token.map(|t| t.token).and_then(non_empty),
            hints,
        }
    }

    fn ensure(&self, op: Operation) -> CloudResult<()> {
        if self.adapter.supported_operations().contains(op) {
            Ok(())
        } else {
            Err(CloudError::aborted())
        }
    }

    // ------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------

    /// Runs one pass of the authorization state machine under the barrier.
    pub async fn authorize(&self, cancel: &CancellationToken) -> CloudResult<()> {
        let result = self
            .auth
            .authorize(self.kind, || self.authorize_round_trip(cancel))
            .await;
        if result.is_ok() {
            if let Some(token) = self.auth.token() {
                self.hints
                    .lock()
                    .unwrap()
                    .insert(hint::ACCESS_TOKEN.into(), token.access_token);
            }
        }
        self.auth_callback.done(self.kind, &result);
        result
    }

    async fn authorize_round_trip(&self, cancel: &CancellationToken) -> CloudResult<Token> {
        let snapshot = self.snapshot();
        if snapshot.token.is_some() {
            match self.adapter.refresh_request(&snapshot) {
                Ok(Some(spec)) => {
                    let response = self.transport.send(spec, cancel).await?;
                    if self.adapter.is_success(response.status, &response.headers) {
                        return self.adapter.refresh_response(&snapshot, &response);
                    }
                    debug!(
                        kind = %self.kind,
                        status = response.status,
                        "token refresh rejected, falling back to consent"
                    );
                }
                Ok(None) => {
                    // Credential-blob kinds revalidate the stored blob.
                    let blob = snapshot.token.clone().unwrap_or_default();
                    return self.exchange_round_trip(&snapshot, &blob, cancel).await;
                }
                Err(err) if err.is_aborted() => {
                    // No refresh concept; continue to consent.
                }
                Err(err) => return Err(err),
            }
        }
        match self.auth_callback.user_consent_required(self.kind) {
            ConsentStatus::WaitForAuthorizationCode => {
                info!(kind = %self.kind, "waiting for authorization code");
                let receiver = self.auth.wait_for_code();
                let code = tokio::select! {
                    _ = cancel.cancelled() => return Err(CloudError::aborted()),
                    code = receiver => code.map_err(|_| CloudError::aborted())?,
                };
                self.exchange_round_trip(&self.snapshot(), &code, cancel).await
            }
            ConsentStatus::None => Err(CloudError::unauthorized("consent refused")),
        }
    }

    async fn exchange_round_trip(
        &self,
        snapshot: &AuthSnapshot,
        code: &str,
        cancel: &CancellationToken,
    ) -> CloudResult<Token> {
        match self.adapter.exchange_code_request(snapshot, code)? {
            Some(spec) => {
                let response = self.transport.send(spec, cancel).await?;
                if !self.adapter.is_success(response.status, &response.headers) {
                    return Err(response.to_error());
                }
                self.adapter.exchange_code_response(snapshot, code, &response)
            }
            None => {
                let empty = HttpResponse {
                    status: 200,
                    headers: Default::default(),
                    body: Bytes::new(),
                };
                self.adapter.exchange_code_response(snapshot, code, &empty)
            }
        }
    }

    /// Exchanges an authorization code (or credential blob) for a token and
    /// adopts it.
    pub async fn exchange_code(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> CloudResult<Token> {
        self.ensure(Operation::ExchangeCode)?;
        let token = self
            .exchange_round_trip(&self.snapshot(), code, cancel)
            .await?;
        self.auth.set_token(token.clone());
        self.hints
            .lock()
            .unwrap()
            .insert(hint::ACCESS_TOKEN.into(), token.access_token.clone());
        Ok(token)
    }

    // ------------------------------------------------------------------
    // The re-authorizing round-trip combinator
    // ------------------------------------------------------------------

    /// One wire round-trip under the handle's re-authorization policy:
    /// authorize when unauthorized, dispatch, and on a retry-worthy status
    /// authorize once and replay the same request. A second failure is
    /// surfaced.
    async fn run_request<T>(
        &self,
        cancel: &CancellationToken,
        build: impl Fn(&AuthSnapshot) -> CloudResult<HttpRequestSpec>,
        parse: impl FnOnce(&AuthSnapshot, &HttpResponse) -> CloudResult<T>,
    ) -> CloudResult<T> {
        if !self.auth.is_authorized() {
            self.authorize(cancel).await?;
        }
        let snapshot = self.snapshot();
        let response = self.transport.send(build(&snapshot)?, cancel).await?;
        if self.adapter.is_success(response.status, &response.headers) {
            return parse(&snapshot, &response);
        }
        if self.adapter.reauthorize(response.status, &response.headers) {
            debug!(kind = %self.kind, status = response.status, "re-authorizing and retrying");
            self.authorize(cancel).await?;
            let snapshot = self.snapshot();
            let response = self.transport.send(build(&snapshot)?, cancel).await?;
            if self.adapter.is_success(response.status, &response.headers) {
                return parse(&snapshot, &response);
            }
            return Err(response.to_error());
        }
        Err(response.to_error())
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    /// Fetches one page of a directory listing.
    pub async fn list_directory_page(
        &self,
        directory: &Item,
        page_token: &str,
        cancel: &CancellationToken,
    ) -> CloudResult<PageData> {
        self.ensure(Operation::ListDirectoryPage)?;
        self.run_request(
            cancel,
            |auth| self.adapter.list_page_request(auth, directory, page_token),
            |auth, response| self.adapter.list_page_response(auth, directory, response),
        )
        .await
    }

    /// Lists a whole directory, driving pagination until the next-page
    /// token comes back empty.
    pub async fn list_directory(
        &self,
        directory: &Item,
        cancel: &CancellationToken,
    ) -> CloudResult<Vec<Item>> {
        self.ensure(Operation::ListDirectory)?;
        let mut items = Vec::new();
        let mut page_token = String::new();
        loop {
            let page = self
                .list_directory_page(directory, &page_token, cancel)
                .await?;
            items.extend(page.items);
            match page.next_token {
                Some(token) if !token.is_empty() => page_token = token,
                _ => break,
            }
        }
        debug!(kind = %self.kind, directory = %directory.id, count = items.len(), "listed directory");
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Item metadata
    // ------------------------------------------------------------------

    /// Refreshes an item (and its cached URLs) by id.
    pub async fn get_item_data(&self, id: &str, cancel: &CancellationToken) -> CloudResult<Item> {
        self.ensure(Operation::GetItemData)?;
        self.run_request(
            cancel,
            |auth| self.adapter.item_data_request(auth, id),
            |auth, response| self.adapter.item_data_response(auth, id, response),
        )
        .await
    }

    /// Resolves an absolute path to an item by walking the namespace one
    /// segment at a time.
    pub async fn get_item(&self, path: &str, cancel: &CancellationToken) -> CloudResult<Item> {
        self.ensure(Operation::GetItem)?;
        let mut current = self.adapter.root_directory();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_directory() {
                return Err(CloudError::not_found(format!("{path}: not a directory")));
            }
            let children = self.list_directory(&current, cancel).await?;
            current = children
                .into_iter()
                .find(|item| item.filename == segment)
                .ok_or_else(|| CloudError::not_found(format!("{path}: no entry {segment}")))?;
        }
        Ok(current)
    }

    /// Resolves a direct content URL for an item, preferring the cached one.
    pub async fn get_item_url(
        &self,
        item: &Item,
        cancel: &CancellationToken,
    ) -> CloudResult<String> {
        self.ensure(Operation::GetItemUrl)?;
        if let Some(url) = &item.url {
            return Ok(url.clone());
        }
        match self.adapter.item_url_request(&self.snapshot(), item)? {
            Some(_) => {
                self.run_request(
                    cancel,
                    |auth| {
                        self.adapter
                            .item_url_request(auth, item)?
                            .ok_or_else(|| CloudError::failure("url request disappeared"))
                    },
                    |auth, response| self.adapter.item_url_response(auth, item, response),
                )
                .await
            }
            None => {
                let empty = HttpResponse {
                    status: 200,
                    headers: Default::default(),
                    body: Bytes::new(),
                };
                self.adapter
                    .item_url_response(&self.snapshot(), item, &empty)
            }
        }
    }

    /// Builds the URL under which the embedded file server streams this
    /// item. Purely local.
    pub fn get_file_daemon_url(&self, item: &Item) -> CloudResult<String> {
        self.ensure(Operation::GetFileDaemonUrl)?;
        let payload = FilePayload {
            state: self.state.clone(),
            id: item.id.clone(),
            name: item.filename.clone(),
            size: item.size.unwrap_or(0),
        };
        Ok(encode_file_url(&self.file_url, &payload))
    }

    // ------------------------------------------------------------------
    // Content transfer
    // ------------------------------------------------------------------

    /// Downloads a byte range of an item into `sink`.
    ///
    /// Backends that serve content through resolved direct links get the
    /// item URL resolved as a subrequest first.
    pub async fn download_file(
        &self,
        item: &Item,
        range: Range,
        sink: &mut dyn DownloadSink,
        cancel: &CancellationToken,
    ) -> CloudResult<()> {
        self.ensure(Operation::DownloadFile)?;
        if !self.auth.is_authorized() {
            self.authorize(cancel).await?;
        }
        let resolved;
        let item = if self.adapter.download_via_url() && item.url.is_none() {
            let url = self.get_item_url(item, cancel).await?;
            resolved = item.clone().with_url(url);
            &resolved
        } else {
            item
        };
        let snapshot = self.snapshot();
        let spec = self.adapter.download_request(&snapshot, item, range)?;
        let response = self
            .transport
            .send_streaming(spec, cancel, |chunk, received, total| {
                sink.received(chunk);
                sink.progress(received, total);
            })
            .await?;
        if self.adapter.is_success(response.status, &response.headers) {
            return Ok(());
        }
        if self.adapter.reauthorize(response.status, &response.headers) {
            self.authorize(cancel).await?;
            let snapshot = self.snapshot();
            let spec = self.adapter.download_request(&snapshot, item, range)?;
            let response = self
                .transport
                .send_streaming(spec, cancel, |chunk, received, total| {
                    sink.received(chunk);
                    sink.progress(received, total);
                })
                .await?;
            if self.adapter.is_success(response.status, &response.headers) {
                return Ok(());
            }
            return Err(response.to_error());
        }
        Err(response.to_error())
    }

    /// Downloads a thumbnail for an item, falling back to the item's cached
    /// thumbnail URL when the backend has no dedicated endpoint.
    pub async fn get_thumbnail(
        &self,
        item: &Item,
        sink: &mut dyn DownloadSink,
        cancel: &CancellationToken,
    ) -> CloudResult<()> {
        self.ensure(Operation::GetThumbnail)?;
        let snapshot = self.snapshot();
        let spec = match self.adapter.thumbnail_request(&snapshot, item) {
            Ok(spec) => spec,
            Err(err) if err.is_aborted() => match &item.thumbnail_url {
                Some(url) => HttpRequestSpec::get(url.clone()),
                None => return Err(err),
            },
            Err(err) => return Err(err),
        };
        let response = self
            .transport
            .send_streaming(spec, cancel, |chunk, received, total| {
                sink.received(chunk);
                sink.progress(received, total);
            })
            .await?;
        if self.adapter.is_success(response.status, &response.headers) {
            Ok(())
        } else {
            Err(response.to_error())
        }
    }

    /// Streams `source` into a new file under `parent`. On success the
    /// returned item is the server-side binding of the uploaded file.
    pub async fn upload_file(
        &self,
        parent: &Item,
        filename: &str,
        source: Box<dyn UploadSource>,
        cancel: &CancellationToken,
    ) -> CloudResult<Item> {
        self.ensure(Operation::UploadFile)?;
        if !self.auth.is_authorized() {
            self.authorize(cancel).await?;
        }
        let source = Arc::new(Mutex::new(source));
        let total = source.lock().unwrap().size()?;
        let build = |snapshot: &AuthSnapshot| -> CloudResult<HttpRequestSpec> {
            let spec = self
                .adapter
                .upload_request(snapshot, parent, filename, total)?;
            Ok(spec.body_stream(upload_stream(Arc::clone(&source), total), Some(total)))
        };

        let snapshot = self.snapshot();
        let response = self.transport.send(build(&snapshot)?, cancel).await?;
        if self.adapter.is_success(response.status, &response.headers) {
            info!(kind = %self.kind, filename, size = total, "upload finished");
            return self
                .adapter
                .upload_response(&snapshot, parent, filename, total, &response);
        }
        if self.adapter.reauthorize(response.status, &response.headers) {
            self.authorize(cancel).await?;
            source.lock().unwrap().reset()?;
            let snapshot = self.snapshot();
            let response = self.transport.send(build(&snapshot)?, cancel).await?;
            if self.adapter.is_success(response.status, &response.headers) {
                return self
                    .adapter
                    .upload_response(&snapshot, parent, filename, total, &response);
            }
            return Err(response.to_error());
        }
        warn!(kind = %self.kind, filename, status = response.status, "upload failed");
        Err(response.to_error())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Depth-first post-order traversal: directories list their children
    /// first, then `action` is applied to every node, children before
    /// parents. Errors short-circuit the traversal.
    fn recursive<'a>(
        &'a self,
        item: Item,
        cancel: &'a CancellationToken,
        action: RecursiveAction<'a>,
    ) -> BoxFuture<'a, CloudResult<()>> {
        async move {
            if item.is_directory() {
                let children = self.list_directory(&item, cancel).await?;
                for child in children {
                    self.recursive(child, cancel, action).await?;
                }
            }
            match action {
                RecursiveAction::Delete => {
                    self.run_request(
                        cancel,
                        |auth| self.adapter.delete_request(auth, &item),
                        |_, _| Ok(()),
                    )
                    .await
                }
                RecursiveAction::Transfer { old_base, new_base } => {
                    let new_id = format!("{new_base}{}", &item.id[old_base.len()..]);
                    self.transfer_node(&item, &new_id, cancel).await
                }
            }
        }
        .boxed()
    }

    /// Deletes an item. On backends with per-descendant mutations the
    /// subtree is deleted bottom-up.
    pub async fn delete_item(&self, item: &Item, cancel: &CancellationToken) -> CloudResult<()> {
        self.ensure(Operation::DeleteItem)?;
        if self.adapter.recursive_operations() && item.is_directory() {
            return self
                .recursive(item.clone(), cancel, RecursiveAction::Delete)
                .await;
        }
        self.run_request(
            cancel,
            |auth| self.adapter.delete_request(auth, item),
            |_, _| Ok(()),
        )
        .await
    }

    /// Creates a directory under `parent`.
    pub async fn create_directory(
        &self,
        parent: &Item,
        name: &str,
        cancel: &CancellationToken,
    ) -> CloudResult<Item> {
        self.ensure(Operation::CreateDirectory)?;
        self.run_request(
            cancel,
            |auth| self.adapter.create_directory_request(auth, parent, name),
            |auth, response| {
                self.adapter
                    .create_directory_response(auth, parent, name, response)
            },
        )
        .await
    }

    /// Copies one node to `new_id` and deletes the original. Used by the
    /// per-descendant traversals.
    async fn transfer_node(
        &self,
        node: &Item,
        new_id: &str,
        cancel: &CancellationToken,
    ) -> CloudResult<()> {
        self.run_request(
            cancel,
            |auth| self.adapter.copy_request(auth, node, new_id),
            |_, _| Ok(()),
        )
        .await?;
        self.run_request(
            cancel,
            |auth| self.adapter.delete_request(auth, node),
            |_, _| Ok(()),
        )
        .await
    }

    /// Rewrites every id under `old_base` to live under `new_base`, copying
    /// then deleting bottom-up, and returns the root's new binding.
    async fn recursive_transfer(
        &self,
        root: &Item,
        old_base: &str,
        new_base: &str,
        cancel: &CancellationToken,
    ) -> CloudResult<Item> {
        self.recursive(
            root.clone(),
            cancel,
            RecursiveAction::Transfer { old_base, new_base },
        )
        .await?;
        let new_root_id = format!("{new_base}{}", &root.id[old_base.len()..]);
        let mut rebound = root.clone();
        rebound.id = new_root_id.clone();
        rebound.filename = last_segment(&new_root_id).to_string();
        rebound.url = None;
        Ok(rebound)
    }

    /// Moves an item into the `destination` directory.
    pub async fn move_item(
        &self,
        item: &Item,
        destination: &Item,
        cancel: &CancellationToken,
    ) -> CloudResult<Item> {
        self.ensure(Operation::MoveItem)?;
        if self.adapter.recursive_operations() {
            let old_base = parent_prefix(&item.id).to_string();
            return self
                .recursive_transfer(item, &old_base, &destination.id, cancel)
                .await;
        }
        self.run_request(
            cancel,
            |auth| self.adapter.move_request(auth, item, destination),
            |auth, response| self.adapter.move_response(auth, item, destination, response),
        )
        .await
    }

    /// Renames an item in place.
    pub async fn rename_item(
        &self,
        item: &Item,
        name: &str,
        cancel: &CancellationToken,
    ) -> CloudResult<Item> {
        self.ensure(Operation::RenameItem)?;
        if self.adapter.recursive_operations() {
            let suffix = if item.is_directory() { "/" } else { "" };
            let new_base = format!("{}{}{}", parent_prefix(&item.id), name, suffix);
            return self
                .recursive_transfer(item, &item.id, &new_base, cancel)
                .await;
        }
        self.run_request(
            cancel,
            |auth| self.adapter.rename_request(auth, item, name),
            |auth, response| self.adapter.rename_response(auth, item, name, response),
        )
        .await
    }

    /// Fetches account-level data (username, quota).
    pub async fn get_general_data(&self, cancel: &CancellationToken) -> CloudResult<GeneralData> {
        self.ensure(Operation::GetGeneralData)?;
        match self.adapter.general_data_request(&self.snapshot())? {
            Some(_) => {
                self.run_request(
                    cancel,
                    |auth| {
                        self.adapter
                            .general_data_request(auth)?
                            .ok_or_else(|| CloudError::failure("account request disappeared"))
                    },
                    |auth, response| self.adapter.general_data_response(auth, response),
                )
                .await
            }
            None => {
                let empty = HttpResponse {
                    status: 200,
                    headers: Default::default(),
                    body: Bytes::new(),
                };
                self.adapter.general_data_response(&self.snapshot(), &empty)
            }
        }
    }
}

/// Callback-flavored wrapper handed to embedding applications.
///
/// Operations spawn onto the runtime and deliver their single completion
/// through the event loop; the returned [`RequestHandle`] supports
/// idempotent cross-thread cancellation and a blocking join.
#[derive(Clone)]
pub struct CloudAccess {
    handle: Arc<CloudHandle>,
    runtime: tokio::runtime::Handle,
    event_loop: EventLoop,
}

impl std::fmt::Debug for CloudAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudAccess").finish_non_exhaustive()
    }
}

impl CloudAccess {
    pub fn new(
        handle: Arc<CloudHandle>,
        runtime: tokio::runtime::Handle,
        event_loop: EventLoop,
    ) -> Self {
        Self {
            handle,
            runtime,
            event_loop,
        }
    }

    pub fn handle(&self) -> &Arc<CloudHandle> {
        &self.handle
    }

    pub fn kind(&self) -> ProviderKind {
        self.handle.kind()
    }

    pub fn root_directory(&self) -> Item {
        self.handle.root_directory()
    }

    pub fn authorize_url(&self) -> String {
        self.handle.authorize_url()
    }

    pub fn token(&self) -> String {
        self.handle.token()
    }

    pub fn hints(&self) -> Hints {
        self.handle.hints()
    }

    /// Serialized session for persistence between runs.
    pub fn session(&self) -> String {
        cirrus_core::serialize_session(&self.handle.token(), &self.handle.hints())
    }

    fn spawn<T, F, Fut>(
        &self,
        op: F,
        callback: impl FnOnce(CloudResult<T>) + Send + 'static,
    ) -> RequestHandle
    where
        T: Send + 'static,
        F: FnOnce(Arc<CloudHandle>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = CloudResult<T>> + Send + 'static,
    {
        let cancel = self.handle.child_token();
        let fut = op(Arc::clone(&self.handle), cancel.clone());
        RequestHandle::spawn(&self.runtime, &self.event_loop, cancel, fut, callback)
    }

    pub fn list_directory_async(
        &self,
        directory: Item,
        callback: impl FnOnce(CloudResult<Vec<Item>>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.list_directory(&directory, &cancel).await },
            callback,
        )
    }

    pub fn list_directory_page_async(
        &self,
        directory: Item,
        page_token: String,
        callback: impl FnOnce(CloudResult<PageData>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move {
                handle
                    .list_directory_page(&directory, &page_token, &cancel)
                    .await
            },
            callback,
        )
    }

    pub fn get_item_async(
        &self,
        path: String,
        callback: impl FnOnce(CloudResult<Item>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.get_item(&path, &cancel).await },
            callback,
        )
    }

    pub fn get_item_data_async(
        &self,
        id: String,
        callback: impl FnOnce(CloudResult<Item>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.get_item_data(&id, &cancel).await },
            callback,
        )
    }

    pub fn get_item_url_async(
        &self,
        item: Item,
        callback: impl FnOnce(CloudResult<String>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.get_item_url(&item, &cancel).await },
            callback,
        )
    }

    /// Downloads a range into memory and hands the bytes to the callback.
    pub fn download_async(
        &self,
        item: Item,
        range: Range,
        callback: impl FnOnce(CloudResult<Vec<u8>>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move {
                let mut sink = VecSink::default();
                handle
                    .download_file(&item, range, &mut sink, &cancel)
                    .await?;
                Ok(sink.data)
            },
            callback,
        )
    }

    pub fn upload_async(
        &self,
        parent: Item,
        filename: String,
        source: Box<dyn UploadSource>,
        callback: impl FnOnce(CloudResult<Item>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move {
                handle
                    .upload_file(&parent, &filename, source, &cancel)
                    .await
            },
            callback,
        )
    }

    pub fn delete_async(
        &self,
        item: Item,
        callback: impl FnOnce(CloudResult<()>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.delete_item(&item, &cancel).await },
            callback,
        )
    }

    pub fn create_directory_async(
        &self,
        parent: Item,
        name: String,
        callback: impl FnOnce(CloudResult<Item>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.create_directory(&parent, &name, &cancel).await },
            callback,
        )
    }

    pub fn move_async(
        &self,
        item: Item,
        destination: Item,
        callback: impl FnOnce(CloudResult<Item>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.move_item(&item, &destination, &cancel).await },
            callback,
        )
    }

    pub fn rename_async(
        &self,
        item: Item,
        name: String,
        callback: impl FnOnce(CloudResult<Item>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.rename_item(&item, &name, &cancel).await },
            callback,
        )
    }

    pub fn general_data_async(
        &self,
        callback: impl FnOnce(CloudResult<GeneralData>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.get_general_data(&cancel).await },
            callback,
        )
    }

    pub fn exchange_code_async(
        &self,
        code: String,
        callback: impl FnOnce(CloudResult<Token>) + Send + 'static,
    ) -> RequestHandle {
        self.spawn(
            |handle, cancel| async move { handle.exchange_code(&code, &cancel).await },
            callback,
        )
    }
}
