//! WebDAV adapter.
//!
//! No OAuth: the authorization code is an opaque credential blob, a compact
//! JSON of `{username, password, webdav_url}` collected by the login page.
//! Ids are server paths relative to the endpoint (`/dir/file.ext`, with a
//! trailing slash for collections). Listings are `PROPFIND` multistatus
//! documents parsed with quick-xml.

use cirrus_core::{
    CloudError, CloudResult, FileType, GeneralData, Item, PageData, ProviderKind, Range, Token,
};
use cirrus_http::{HttpRequestSpec, HttpResponse, Method};
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

use crate::adapter::{AuthSnapshot, Operation, OperationSet, ProviderAdapter};

pub struct WebDav;

#[derive(Debug, Clone, Deserialize)]
struct Credentials {
    username: String,
    password: String,
    webdav_url: String,
}

fn credentials(auth: &AuthSnapshot) -> CloudResult<Credentials> {
    let blob = auth
        .token
        .as_deref()
        .ok_or_else(|| CloudError::unauthorized("no credentials"))?;
    serde_json::from_str(blob)
        .map_err(|_| CloudError::unauthorized("malformed credentials"))
}

fn basic_auth(creds: &Credentials) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", creds.username, creds.password))
    )
}

fn dav_request(auth: &AuthSnapshot, method: Method, id: &str) -> CloudResult<HttpRequestSpec> {
    let creds = credentials(auth)?;
    let url = format!("{}{}", creds.webdav_url.trim_end_matches('/'), id);
    Ok(HttpRequestSpec::new(url, method).header("Authorization", basic_auth(&creds)))
}

/// One `<d:response>` of a multistatus document.
#[derive(Debug, Default)]
struct DavEntry {
    href: String,
    display_name: Option<String>,
    content_length: Option<u64>,
    last_modified: Option<String>,
    is_collection: bool,
}

/// Parses a PROPFIND multistatus body into entries, namespace-insensitively.
fn parse_multistatus(body: &str) -> CloudResult<Vec<DavEntry>> {
    let mut reader = Reader::from_str(body);
    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut element: Vec<u8> = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_slice() {
                    b"response" => current = Some(DavEntry::default()),
                    b"collection" => {
                        if let Some(entry) = current.as_mut() {
                            entry.is_collection = true;
                        }
                    }
                    _ => element = local,
                }
            }
            Ok(Event::Empty(ref e)) => {
                if local_name(e.name().as_ref()) == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(ref t)) => {
                if let Some(entry) = current.as_mut() {
                    let text = t.unescape().unwrap_or_default().into_owned();
                    match element.as_slice() {
                        b"href" => entry.href = text,
                        b"displayname" if !text.is_empty() => entry.display_name = Some(text),
                        b"getcontentlength" => entry.content_length = text.parse().ok(),
                        b"getlastmodified" => entry.last_modified = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if local_name(e.name().as_ref()) == b"response" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                element.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(CloudError::failure(format!("malformed multistatus: {e}"))),
        }
    }
    Ok(entries)
}

fn local_name(qualified: &[u8]) -> Vec<u8> {
    match qualified.iter().rposition(|&b| b == b':') {
        Some(idx) => qualified[idx + 1..].to_vec(),
        None => qualified.to_vec(),
    }
}

fn entry_to_item(entry: &DavEntry, endpoint_path: &str) -> Option<Item> {
    // Hrefs may be absolute URLs or absolute paths; reduce to a path.
    let path = match entry.href.find("://") {
        Some(idx) => {
            let rest = &entry.href[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => entry.href.as_str(),
    };
    let id = path.strip_prefix(endpoint_path).unwrap_or(path).to_string();
    let id = if id.starts_with('/') { id } else { format!("/{id}") };
    let decoded = percent_decode_str(&id).decode_utf8().ok()?.into_owned();
    let name = entry.display_name.clone().unwrap_or_else(|| {
        decoded
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    });
    if name.is_empty() {
        return None;
    }
    let file_type = if entry.is_collection {
        FileType::Directory
    } else {
        FileType::from_extension(&name)
    };
    let mut item = Item::new(name, decoded, file_type);
    if !entry.is_collection {
        item.size = entry.content_length;
    }
    item.timestamp = entry
        .last_modified
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc2822(t).ok())
        .map(|t| t.with_timezone(&chrono::Utc));
    Some(item)
}

impl ProviderAdapter for WebDav {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WebDav
    }

    fn supported_operations(&self) -> OperationSet {
        OperationSet::empty()
            .with(Operation::ExchangeCode)
            .with(Operation::GetItemUrl)
            .with(Operation::ListDirectoryPage)
            .with(Operation::ListDirectory)
            .with(Operation::GetItem)
            .with(Operation::DownloadFile)
            .with(Operation::UploadFile)
            .with(Operation::DeleteItem)
            .with(Operation::CreateDirectory)
            .with(Operation::MoveItem)
            .with(Operation::RenameItem)
            .with(Operation::GetGeneralData)
            .with(Operation::GetFileDaemonUrl)
    }

    fn root_directory(&self) -> Item {
        Item::directory("/", "/")
    }

    fn authorize_url(&self, auth: &AuthSnapshot) -> String {
        // No consent page upstream; the embedded server's login page
        // collects the credential blob.
        let base = auth
            .redirect_uri
            .strip_suffix(&format!("/{}", ProviderKind::WebDav.name()))
            .unwrap_or(&auth.redirect_uri);
        format!("{base}/{}/login?state={}", ProviderKind::WebDav.name(), auth.state)
    }

    fn exchange_code_request(
        &self,
        _auth: &AuthSnapshot,
        _code: &str,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        // The code is the credential blob; nothing to exchange on the wire.
        Ok(None)
    }

    fn exchange_code_response(
        &self,
        _auth: &AuthSnapshot,
        code: &str,
        _response: &HttpResponse,
    ) -> CloudResult<Token> {
        let creds: Credentials = serde_json::from_str(code)
            .map_err(|_| CloudError::failure("invalid credential blob"))?;
        if creds.username.is_empty() || creds.webdav_url.is_empty() {
            return Err(CloudError::failure("incomplete credentials"));
        }
        Ok(Token::new(code, code))
    }

    fn refresh_request(&self, _auth: &AuthSnapshot) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(None)
    }

    fn list_page_request(
        &self,
        auth: &AuthSnapshot,
        directory: &Item,
        _page_token: &str,
    ) -> CloudResult<HttpRequestSpec> {
        Ok(
            dav_request(auth, Method::from_bytes(b"PROPFIND").unwrap(), &directory.id)?
                .header("Depth", "1"),
        )
    }

    fn list_page_response(
        &self,
        auth: &AuthSnapshot,
        directory: &Item,
        response: &HttpResponse,
    ) -> CloudResult<PageData> {
        let creds = credentials(auth)?;
        let endpoint_path = url::Url::parse(&creds.webdav_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        let body = String::from_utf8_lossy(&response.body).into_owned();
        let entries = parse_multistatus(&body)?;
        let items = entries
            .iter()
            .filter_map(|entry| entry_to_item(entry, &endpoint_path))
            // The first response describes the listed collection itself.
            .filter(|item| item.id != directory.id)
            .collect();
        Ok(PageData {
            items,
            next_token: None,
        })
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
        let creds = credentials(auth)?;
        Ok(format!(
            "{}{}",
            creds.webdav_url.trim_end_matches('/'),
            item.id
        ))
    }

    fn download_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        range: Range,
    ) -> CloudResult<HttpRequestSpec> {
        let mut spec = dav_request(auth, Method::GET, &item.id)?;
        if let Some(value) = range.http_header_value() {
            spec = spec.header("Range", value);
        }
        Ok(spec)
    }

    fn upload_request(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        filename: &str,
        _size: u64,
    ) -> CloudResult<HttpRequestSpec> {
        let id = format!("{}/{}", parent.id.trim_end_matches('/'), filename);
        dav_request(auth, Method::PUT, &id)
    }

    fn upload_response(
        &self,
        _auth: &AuthSnapshot,
        parent: &Item,
        filename: &str,
        size: u64,
        _response: &HttpResponse,
    ) -> CloudResult<Item> {
        let id = format!("{}/{}", parent.id.trim_end_matches('/'), filename);
        Ok(Item::new(filename, id, FileType::from_extension(filename))
            .with_size(size)
            .with_timestamp(chrono::Utc::now()))
    }

    fn delete_request(&self, auth: &AuthSnapshot, item: &Item) -> CloudResult<HttpRequestSpec> {
        dav_request(auth, Method::DELETE, &item.id)
    }

    fn create_directory_request(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let id = format!("{}/{}/", parent.id.trim_end_matches('/'), name);
        dav_request(auth, Method::from_bytes(b"MKCOL").unwrap(), &id)
    }

    fn create_directory_response(
        &self,
        _auth: &AuthSnapshot,
        parent: &Item,
        name: &str,
        _response: &HttpResponse,
    ) -> CloudResult<Item> {
        let id = format!("{}/{}/", parent.id.trim_end_matches('/'), name);
        Ok(Item::directory(name, id))
    }

    fn move_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        destination: &Item,
    ) -> CloudResult<HttpRequestSpec> {
        let creds = credentials(auth)?;
        let target = format!(
            "{}{}/{}",
            creds.webdav_url.trim_end_matches('/'),
            destination.id.trim_end_matches('/'),
            item.filename
        );
        Ok(dav_request(auth, Method::from_bytes(b"MOVE").unwrap(), &item.id)?
            .header("Destination", target))
    }

    fn move_response(
        &self,
        _auth: &AuthSnapshot,
        item: &Item,
        destination: &Item,
        _response: &HttpResponse,
    ) -> CloudResult<Item> {
        let mut moved = item.clone();
        moved.id = format!(
            "{}/{}",
            destination.id.trim_end_matches('/'),
            item.filename
        );
        Ok(moved)
    }

    fn rename_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let creds = credentials(auth)?;
        let parent = item
            .id
            .trim_end_matches('/')
            .rsplit_once('/')
            .map(|(p, _)| p)
            .unwrap_or("");
        let target = format!("{}{parent}/{name}", creds.webdav_url.trim_end_matches('/'));
        Ok(dav_request(auth, Method::from_bytes(b"MOVE").unwrap(), &item.id)?
            .header("Destination", target))
    }

    fn rename_response(
        &self,
        _auth: &AuthSnapshot,
        item: &Item,
        name: &str,
        _response: &HttpResponse,
    ) -> CloudResult<Item> {
        let parent = item
            .id
            .trim_end_matches('/')
            .rsplit_once('/')
            .map(|(p, _)| p)
            .unwrap_or("");
        let suffix = if item.is_directory() { "/" } else { "" };
        let mut renamed = item.renamed(name);
        renamed.id = format!("{parent}/{name}{suffix}");
        Ok(renamed)
    }

    fn general_data_request(
        &self,
        _auth: &AuthSnapshot,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(None)
    }

    fn general_data_response(
        &self,
        auth: &AuthSnapshot,
        _response: &HttpResponse,
    ) -> CloudResult<GeneralData> {
        let creds = credentials(auth)?;
        Ok(GeneralData {
            username: format!("{}@{}", creds.username, creds.webdav_url),
            space_used: None,
            space_total: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::Hints;

    fn auth() -> AuthSnapshot {
        let blob = r#"{"username":"u","password":"p","webdav_url":"https://dav.example.com/remote"}"#;
        AuthSnapshot {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: "http://localhost:8080/webdav".into(),
            state: "webdav-0".into(),
            access_token: Some(blob.into()),
            token: Some(blob.into()),
            hints: Hints::new(),
        }
    }

    const MULTISTATUS: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/remote/docs/</d:href>
    <d:propstat><d:prop>
      <d:resourcetype><d:collection/></d:resourcetype>
    </d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote/docs/sub/</d:href>
    <d:propstat><d:prop>
      <d:displayname>sub</d:displayname>
      <d:resourcetype><d:collection/></d:resourcetype>
    </d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote/docs/notes%20v2.txt</d:href>
    <d:propstat><d:prop>
      <d:getcontentlength>42</d:getcontentlength>
      <d:getlastmodified>Tue, 01 Jul 2025 10:00:00 GMT</d:getlastmodified>
      <d:resourcetype/>
    </d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn multistatus_parses_and_skips_self() {
        let response = HttpResponse {
            status: 207,
            headers: Default::default(),
            body: bytes::Bytes::from_static(MULTISTATUS.as_bytes()),
        };
        let directory = Item::directory("docs", "/docs/");
        let page = WebDav
            .list_page_response(&auth(), &directory, &response)
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].filename, "sub");
        assert!(page.items[0].is_directory());
        assert_eq!(page.items[1].filename, "notes v2.txt");
        assert_eq!(page.items[1].id, "/docs/notes v2.txt");
        assert_eq!(page.items[1].size, Some(42));
        assert!(page.items[1].timestamp.is_some());
    }

    #[test]
    fn credential_blob_round_trip() {
        let blob = r#"{"username":"u","password":"p","webdav_url":"https://d/r"}"#;
        let empty = HttpResponse {
            status: 200,
            headers: Default::default(),
            body: bytes::Bytes::new(),
        };
        let token = WebDav.exchange_code_response(&auth(), blob, &empty).unwrap();
        assert_eq!(token.token, blob);

        let err = WebDav
            .exchange_code_response(&auth(), "not json", &empty)
            .unwrap_err();
        assert_eq!(err.code, cirrus_core::code::FAILURE);
    }

    #[test]
    fn requests_carry_basic_auth() {
        let spec = WebDav
            .download_request(
                &auth(),
                &Item::new("a.txt", "/a.txt", FileType::Unknown),
                Range::full(),
            )
            .unwrap();
        assert_eq!(spec.url, "https://dav.example.com/remote/a.txt");
        assert!(spec
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v.starts_with("Basic ")));
    }

    #[test]
    fn move_sets_destination_header() {
        let item = Item::new("a.txt", "/docs/a.txt", FileType::Unknown);
        let dest = Item::directory("archive", "/archive/");
        let spec = WebDav.move_request(&auth(), &item, &dest).unwrap();
        assert!(spec.headers.iter().any(|(k, v)| {
            k == "Destination" && v == "https://dav.example.com/remote/archive/a.txt"
        }));
    }

    #[test]
    fn rename_rewrites_last_segment() {
        let item = Item::directory("docs", "/top/docs/");
        let renamed = WebDav
            .rename_response(
                &auth(),
                &item,
                "papers",
                &HttpResponse {
                    status: 201,
                    headers: Default::default(),
                    body: bytes::Bytes::new(),
                },
            )
            .unwrap();
        assert_eq!(renamed.id, "/top/papers/");
        assert_eq!(renamed.filename, "papers");
    }
}
