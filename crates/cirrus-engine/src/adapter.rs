//! Provider adapter contract.
//!
//! An adapter supplies, per operation, a `(build_request, parse_response)`
//! pair over transport request specs, plus the policy knobs the runtime
//! consults: which statuses count as success, which trigger a
//! re-authorization pass, and which operations the backend supports at all.
//! Requesting an unsupported operation fails with an aborted-operation
//! error before anything touches the wire.
//!
//! Adapters are stateless policy objects; all mutable credential state
//! lives in the owning handle and reaches the adapter as an
//! [`AuthSnapshot`].

use std::collections::HashMap;

use cirrus_core::{
    CloudError, CloudResult, GeneralData, Hints, Item, PageData, ProviderKind, Range, Token,
};
use cirrus_http::{HttpRequestSpec, HttpResponse};

/// One operation of the uniform vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Operation {
    ExchangeCode = 1 << 0,
    GetItemUrl = 1 << 1,
    ListDirectoryPage = 1 << 2,
    ListDirectory = 1 << 3,
    GetItem = 1 << 4,
    GetItemData = 1 << 5,
    DownloadFile = 1 << 6,
    UploadFile = 1 << 7,
    DeleteItem = 1 << 8,
    CreateDirectory = 1 << 9,
    MoveItem = 1 << 10,
    RenameItem = 1 << 11,
    GetGeneralData = 1 << 12,
    GetThumbnail = 1 << 13,
    GetFileDaemonUrl = 1 << 14,
}

/// Bit set of supported operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationSet(pub u32);

impl OperationSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn with(self, op: Operation) -> Self {
        Self(self.0 | op as u32)
    }

    pub fn contains(self, op: Operation) -> bool {
        self.0 & op as u32 != 0
    }
}

/// Read-only view of a handle's credential state, assembled fresh before
/// every build call so adapters always see the current bearer.
#[derive(Debug, Clone)]
pub struct AuthSnapshot {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Per-handle state string embedded in callback URLs.
    pub state: String,
    /// Current bearer, when authorized.
    pub access_token: Option<String>,
    /// The persistable token (refresh token or credential blob).
    pub token: Option<String>,
    /// Remaining hints (region, rewritten endpoint and friends).
    pub hints: Hints,
}

impl AuthSnapshot {
    pub fn hint(&self, key: &str) -> Option<&str> {
        self.hints.get(key).map(|s| s.as_str())
    }

    /// The bearer, or an unauthorized error when absent.
    pub fn bearer(&self) -> CloudResult<&str> {
        self.access_token
            .as_deref()
            .ok_or_else(|| CloudError::unauthorized("no access token"))
    }
}

fn unsupported<T>() -> CloudResult<T> {
    Err(CloudError::aborted())
}

/// The pluggable per-provider policy.
///
/// Every build/parse pair has a default body failing with the
/// aborted-operation error, so adapters only implement what the backend
/// supports and must keep `supported_operations` in sync.
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn supported_operations(&self) -> OperationSet;

    /// The root of the provider namespace.
    fn root_directory(&self) -> Item;

    /// URL the user must visit to grant consent (OAuth kinds) or the login
    /// page collecting a credential blob (everything else).
    fn authorize_url(&self, auth: &AuthSnapshot) -> String;

    /// Whether a response terminates the exchange successfully. Some
    /// backends need a stricter reading than plain 2xx (a redirect that
    /// signals a stale endpoint, an error flag riding in a header).
    fn is_success(&self, status: u16, headers: &HashMap<String, String>) -> bool {
        let _ = headers;
        (200..300).contains(&status)
    }

    /// Whether a failed status should trigger one authorization pass and a
    /// retry of the same request.
    fn reauthorize(&self, status: u16, headers: &HashMap<String, String>) -> bool {
        let _ = headers;
        status == 401
    }

    /// Directory traversals (delete, move, rename) require one wire call
    /// per descendant on this backend.
    fn recursive_operations(&self) -> bool {
        false
    }

    /// Content is fetched through a resolved direct URL rather than an API
    /// endpoint; the runtime resolves the item URL before downloading.
    fn download_via_url(&self) -> bool {
        false
    }

    // ------------------------------------------------------------------
    // Authorization round-trips
    // ------------------------------------------------------------------

    /// Builds the code-for-token exchange. Non-OAuth kinds interpret `code`
    /// as an opaque credential blob and may skip the wire entirely by
    /// returning `None`, in which case `exchange_code_response` is invoked
    /// with an empty success response.
    fn exchange_code_request(
        &self,
        auth: &AuthSnapshot,
        code: &str,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        let _ = (auth, code);
        unsupported()
    }

    fn exchange_code_response(
        &self,
        auth: &AuthSnapshot,
        code: &str,
        response: &HttpResponse,
    ) -> CloudResult<Token> {
        let _ = (auth, code, response);
        unsupported()
    }

    /// Builds the refresh-token round-trip. `None` means this kind has no
    /// refresh concept and the stored token is re-validated as-is.
    fn refresh_request(&self, auth: &AuthSnapshot) -> CloudResult<Option<HttpRequestSpec>> {
        let _ = auth;
        unsupported()
    }

    fn refresh_response(&self, auth: &AuthSnapshot, response: &HttpResponse) -> CloudResult<Token> {
        let _ = (auth, response);
        unsupported()
    }

    // ------------------------------------------------------------------
    // Directory listings
    // ------------------------------------------------------------------

    fn list_page_request(
        &self,
        auth: &AuthSnapshot,
        directory: &Item,
        page_token: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, directory, page_token);
        unsupported()
    }

    /// Parses one listing page; an absent next-page token ends pagination.
    fn list_page_response(
        &self,
        auth: &AuthSnapshot,
        directory: &Item,
        response: &HttpResponse,
    ) -> CloudResult<PageData> {
        let _ = (auth, directory, response);
        unsupported()
    }

    // ------------------------------------------------------------------
    // Item metadata and content
    // ------------------------------------------------------------------

    fn item_data_request(&self, auth: &AuthSnapshot, id: &str) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, id);
        unsupported()
    }

    fn item_data_response(
        &self,
        auth: &AuthSnapshot,
        id: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let _ = (auth, id, response);
        unsupported()
    }

    /// Builds the round-trip resolving a direct content URL. `None` means
    /// the URL is derivable locally and `item_url_response` is invoked with
    /// an empty success response.
    fn item_url_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        let _ = (auth, item);
        unsupported()
    }

    fn item_url_response(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        response: &HttpResponse,
    ) -> CloudResult<String> {
        let _ = (auth, item, response);
        unsupported()
    }

    fn download_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        range: Range,
    ) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, item, range);
        unsupported()
    }

    /// Builds the upload request shell; the runtime attaches the streamed
    /// body afterwards.
    fn upload_request(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        filename: &str,
        size: u64,
    ) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, parent, filename, size);
        unsupported()
    }

    fn upload_response(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        filename: &str,
        size: u64,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let _ = (auth, parent, filename, size, response);
        unsupported()
    }

    fn thumbnail_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
    ) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, item);
        unsupported()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    fn delete_request(&self, auth: &AuthSnapshot, item: &Item) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, item);
        unsupported()
    }

    /// Single-node copy used by the per-descendant traversals; `new_id` is
    /// the complete target id. Only backends with `recursive_operations`
    /// implement this.
    fn copy_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        new_id: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, item, new_id);
        unsupported()
    }

    fn create_directory_request(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, parent, name);
        unsupported()
    }

    fn create_directory_response(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        name: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let _ = (auth, parent, name, response);
        unsupported()
    }

    fn move_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        destination: &Item,
    ) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, item, destination);
        unsupported()
    }

    fn move_response(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        destination: &Item,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let _ = (auth, item, destination, response);
        unsupported()
    }

    fn rename_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let _ = (auth, item, name);
        unsupported()
    }

    fn rename_response(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        name: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let _ = (auth, item, name, response);
        unsupported()
    }

    // ------------------------------------------------------------------
    // Account data
    // ------------------------------------------------------------------

    /// Builds the account-data round-trip; `None` when the data is
    /// derivable locally and `general_data_response` is invoked with an
    /// empty success response.
    fn general_data_request(
        &self,
        auth: &AuthSnapshot,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        let _ = auth;
        unsupported()
    }

    fn general_data_response(
        &self,
        auth: &AuthSnapshot,
        response: &HttpResponse,
    ) -> CloudResult<GeneralData> {
        let _ = (auth, response);
        unsupported()
    }
}
