//! Shared test fixtures: a minimal wire protocol served by wiremock and an
//! adapter speaking it, so filesystem behavior (directory caching, the
//! chunked read path, the write-then-sync path, rename and remove) can be
//! exercised without a real provider.

use std::collections::HashMap;
use std::sync::Arc;

use cirrus_core::domain::token::hint;
use cirrus_core::{
    CloudError, CloudResult, GeneralData, Hints, Item, PageData, ProviderKind, Range, Token,
};
use cirrus_engine::{
    AuthCallback, AuthSnapshot, CloudAccess, CloudHandle, ConsentStatus, EventLoop, Operation,
    OperationSet, ProviderAdapter,
};
use cirrus_http::{HttpRequestSpec, HttpResponse, Transport};
use wiremock::{Request, Respond, ResponseTemplate};

/// Consent callback that always refuses interactive flows.
pub struct NoConsent;

impl AuthCallback for NoConsent {
    fn user_consent_required(&self, _kind: ProviderKind) -> ConsentStatus {
        ConsentStatus::None
    }
}

/// Adapter over a trivial JSON protocol:
/// - `POST /token` refreshes the bearer, returning `{"access_token": ...}`
/// - `GET /list?id=..&page=..` lists one page as `{"items": [...], "next": ..}`
/// - `GET /item?id=..` returns one item
/// - `GET /file/<id>` serves content, honoring `Range`
/// - `PUT /upload?name=..` stores content, returning the new item
/// - `DELETE /delete?id=..` removes an item
pub struct TestAdapter;

fn endpoint(auth: &AuthSnapshot) -> String {
    auth.hint("endpoint").unwrap_or_default().to_string()
}

fn authed(auth: &AuthSnapshot, spec: HttpRequestSpec) -> CloudResult<HttpRequestSpec> {
    Ok(spec.header("Authorization", format!("Bearer {}", auth.bearer()?)))
}

impl ProviderAdapter for TestAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn supported_operations(&self) -> OperationSet {
        OperationSet::empty()
            .with(Operation::ExchangeCode)
            .with(Operation::GetItemUrl)
            .with(Operation::ListDirectoryPage)
            .with(Operation::ListDirectory)
            .with(Operation::GetItem)
            .with(Operation::GetItemData)
            .with(Operation::DownloadFile)
            .with(Operation::UploadFile)
            .with(Operation::DeleteItem)
            .with(Operation::CreateDirectory)
            .with(Operation::MoveItem)
            .with(Operation::RenameItem)
            .with(Operation::GetFileDaemonUrl)
    }

    fn root_directory(&self) -> Item {
        Item::directory("/", "root")
    }

    fn authorize_url(&self, auth: &AuthSnapshot) -> String {
        format!("{}/login", endpoint(auth))
    }

    fn reauthorize(&self, status: u16, _headers: &HashMap<String, String>) -> bool {
        status == 401
    }

    fn refresh_request(&self, auth: &AuthSnapshot) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(Some(HttpRequestSpec::post(format!(
            "{}/token",
            endpoint(auth)
        ))))
    }

    fn refresh_response(&self, auth: &AuthSnapshot, response: &HttpResponse) -> CloudResult<Token> {
        let json: serde_json::Value = serde_json::from_slice(&response.body)?;
        let access = json["access_token"]
            .as_str()
            .ok_or_else(|| CloudError::failure("no access_token"))?;
        Ok(Token::new(
            auth.token.clone().unwrap_or_default(),
            access,
        ))
    }

    fn list_page_request(
        &self,
        auth: &AuthSnapshot,
        directory: &Item,
        page_token: &str,
    ) -> CloudResult<HttpRequestSpec> {
        authed(
            auth,
            HttpRequestSpec::get(format!("{}/list", endpoint(auth)))
                .query_param("id", &directory.id)
                .query_param("page", page_token),
        )
    }

    fn list_page_response(
        &self,
        _auth: &AuthSnapshot,
        _directory: &Item,
        response: &HttpResponse,
    ) -> CloudResult<PageData> {
        let json: serde_json::Value = serde_json::from_slice(&response.body)?;
        let items: Vec<Item> = serde_json::from_value(json["items"].clone())?;
        let next_token = json["next"].as_str().map(str::to_string);
        Ok(PageData { items, next_token })
    }

    fn item_data_request(&self, auth: &AuthSnapshot, id: &str) -> CloudResult<HttpRequestSpec> {
        authed(
            auth,
            HttpRequestSpec::get(format!("{}/item", endpoint(auth))).query_param("id", id),
        )
    }

    fn item_data_response(
        &self,
        _auth: &AuthSnapshot,
        _id: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        Ok(serde_json::from_slice(&response.body)?)
    }

    fn item_url_request(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(None)
    }

    fn item_url_response(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        _response: &HttpResponse,
    ) -> CloudResult<String> {
        Ok(format!("{}/file/{}", endpoint(auth), item.id))
    }

    fn download_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        range: Range,
    ) -> CloudResult<HttpRequestSpec> {
        let mut spec =
            HttpRequestSpec::get(format!("{}/file/{}", endpoint(auth), item.id));
        if let Some(value) = range.http_header_value() {
            spec = spec.header("Range", value);
        }
        authed(auth, spec)
    }

    fn upload_request(
        &self,
        auth: &AuthSnapshot,
        _parent: &Item,
        filename: &str,
        _size: u64,
    ) -> CloudResult<HttpRequestSpec> {
        authed(
            auth,
            HttpRequestSpec::put(format!("{}/upload", endpoint(auth)))
                .query_param("name", filename),
        )
    }

    fn upload_response(
        &self,
        _auth: &AuthSnapshot,
        _parent: &Item,
        _filename: &str,
        _size: u64,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        Ok(serde_json::from_slice(&response.body)?)
    }

    fn delete_request(&self, auth: &AuthSnapshot, item: &Item) -> CloudResult<HttpRequestSpec> {
        authed(
            auth,
            HttpRequestSpec::delete(format!("{}/delete", endpoint(auth)))
                .query_param("id", &item.id),
        )
    }

    fn move_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        destination: &Item,
    ) -> CloudResult<HttpRequestSpec> {
        authed(
            auth,
            HttpRequestSpec::post(format!("{}/move", endpoint(auth)))
                .query_param("id", &item.id)
                .query_param("to", &destination.id),
        )
    }

    fn move_response(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
        _destination: &Item,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        Ok(serde_json::from_slice(&response.body)?)
    }

    fn rename_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        authed(
            auth,
            HttpRequestSpec::post(format!("{}/rename", endpoint(auth)))
                .query_param("id", &item.id)
                .query_param("name", name),
        )
    }

    fn rename_response(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
        _name: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        Ok(serde_json::from_slice(&response.body)?)
    }

    fn create_directory_request(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        authed(
            auth,
            HttpRequestSpec::post(format!("{}/mkdir", endpoint(auth)))
                .query_param("id", &parent.id)
                .query_param("name", name),
        )
    }

    fn create_directory_response(
        &self,
        _auth: &AuthSnapshot,
        _parent: &Item,
        _name: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        Ok(serde_json::from_slice(&response.body)?)
    }

    fn general_data_request(
        &self,
        _auth: &AuthSnapshot,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(None)
    }

    fn general_data_response(
        &self,
        _auth: &AuthSnapshot,
        _response: &HttpResponse,
    ) -> CloudResult<GeneralData> {
        Ok(GeneralData {
            username: "tester".into(),
            space_used: None,
            space_total: None,
        })
    }
}

/// Builds an authorized handle speaking the test protocol against `base`.
pub fn test_handle(base: &str, state: &str) -> Arc<CloudHandle> {
    let mut hints = Hints::new();
    hints.insert("endpoint".into(), base.trim_end_matches('/').to_string());
    hints.insert(hint::STATE.into(), state.to_string());
    hints.insert(
        hint::FILE_URL.into(),
        format!("{}/{state}", base.trim_end_matches('/')),
    );
    Arc::new(CloudHandle::new(
        Box::new(TestAdapter),
        Transport::new(),
        Arc::new(NoConsent),
        Some(Token::new("refresh-0", "bearer-0")),
        hints,
    ))
}

/// Wraps a handle as a callback-flavored access with its own event loop.
pub fn test_access(handle: Arc<CloudHandle>) -> (CloudAccess, EventLoop) {
    let events = EventLoop::new();
    let access = CloudAccess::new(
        handle,
        tokio::runtime::Handle::current(),
        events.clone(),
    );
    (access, events)
}

/// A mount over the test protocol, labelled for the filesystem root.
pub fn test_mount(base: &str, state: &str, label: &str) -> cirrus_fs::ProviderMount {
    let (access, _events) = test_access(test_handle(base, state));
    cirrus_fs::ProviderMount {
        label: label.to_string(),
        access,
    }
}

/// Responds to `GET /file/...` honoring single `Range` headers over a
/// fixed byte object.
pub struct RangeResponder {
    pub content: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.content.len() as u64;
        match request.headers.get("range") {
            Some(value) => {
                let header = value.to_str().unwrap_or_default();
                let range = match Range::parse_http(header) {
                    Ok(range) => range.clip(len),
                    Err(_) => return ResponseTemplate::new(416),
                };
                if range.size == 0 && range.start >= len {
                    return ResponseTemplate::new(416);
                }
                let start = range.start as usize;
                let end = (range.start + range.size) as usize;
                ResponseTemplate::new(206)
                    .append_header("Content-Range", range.content_range(len))
                    .set_body_bytes(self.content[start..end].to_vec())
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.content.clone()),
        }
    }
}

/// Serializes an item the way the test protocol does.
pub fn item_json(item: &Item) -> serde_json::Value {
    serde_json::to_value(item).expect("items serialize")
}

pub fn file_item(name: &str, id: &str, size: u64) -> Item {
    Item::new(name, id, cirrus_core::FileType::from_extension(name)).with_size(size)
}
