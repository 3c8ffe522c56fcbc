//! S3-compatible bucket adapter.
//!
//! Credentials arrive as a compact JSON blob `{username, password, bucket,
//! endpoint?}` (access key id and secret ride in the generic username and
//! password slots). Ids are object keys; "directories" are key prefixes
//! ending in `/`, materialized as zero-byte marker objects. Every request
//! is presigned with AWS signature v4 in the query string, unsigned
//! payload. Mutations on directories fan out one wire call per descendant,
//! which the runtime drives through its depth-first traversal and the
//! single-object `copy_request` here.

use std::collections::HashMap;

use cirrus_core::domain::token::hint;
use cirrus_core::{
    CloudError, CloudResult, FileType, GeneralData, Item, PageData, ProviderKind, Range, Token,
};
use cirrus_http::{HttpRequestSpec, HttpResponse, Method};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::adapter::{AuthSnapshot, Operation, OperationSet, ProviderAdapter};

const DEFAULT_ENDPOINT: &str = "https://s3.amazonaws.com";
const DEFAULT_REGION: &str = "us-east-1";

/// AWS-unreserved characters stay literal; everything else is escaped.
const AWS_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct AmazonS3;

#[derive(Debug, Clone, Deserialize)]
struct Credentials {
    /// Access key id.
    username: String,
    /// Secret access key.
    password: String,
    bucket: String,
    #[serde(default)]
    endpoint: Option<String>,
}

fn credentials(auth: &AuthSnapshot) -> CloudResult<Credentials> {
    let blob = auth
        .token
        .as_deref()
        .ok_or_else(|| CloudError::unauthorized("no credentials"))?;
    serde_json::from_str(blob)
        .map_err(|_| CloudError::unauthorized("malformed credentials"))
}

fn region(auth: &AuthSnapshot) -> String {
    auth.hint(hint::REGION)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REGION)
        .to_string()
}

/// Base URL addressing the bucket, honoring a rewritten endpoint hint.
fn bucket_url(auth: &AuthSnapshot, creds: &Credentials) -> String {
    if let Some(rewritten) = auth.hint(hint::REWRITTEN_ENDPOINT) {
        if !rewritten.is_empty() {
            return rewritten.trim_end_matches('/').to_string();
        }
    }
    let endpoint = creds
        .endpoint
        .as_deref()
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_ENDPOINT);
    format!("{}/{}", endpoint.trim_end_matches('/'), creds.bucket)
}

fn escape(value: &str) -> String {
    utf8_percent_encode(value, AWS_ESCAPE).to_string()
}

/// Escapes an object key, keeping `/` separators literal.
fn escape_path(key: &str) -> String {
    key.split('/').map(escape).collect::<Vec<_>>().join("/")
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(message: &[u8]) -> String {
    hex::encode(Sha256::digest(message))
}

/// Presigns a request with AWS signature v4 query parameters, unsigned
/// payload. Headers present on the spec at this point are signed; anything
/// appended afterwards (like `Range`) is not.
fn sign(
    auth: &AuthSnapshot,
    creds: &Credentials,
    mut spec: HttpRequestSpec,
) -> CloudResult<HttpRequestSpec> {
    let region = region(auth);
    let url = url::Url::parse(&spec.url)
        .map_err(|e| CloudError::failure(format!("bad endpoint url: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| CloudError::failure("endpoint url without host"))?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let now = chrono::Utc::now();
    let date = now.format("%Y%m%d").to_string();
    let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
    let scope = format!("{date}/{region}/s3/aws4_request");

    spec = spec.header("host", host.clone());
    spec = spec
        .query_param("X-Amz-Algorithm", "AWS4-HMAC-SHA256")
        .query_param("X-Amz-Credential", format!("{}/{scope}", creds.username))
        .query_param("X-Amz-Date", &timestamp)
        .query_param("X-Amz-Expires", "86400");

    let mut headers: Vec<(String, String)> = spec
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();
    headers.sort();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    spec = spec.query_param("X-Amz-SignedHeaders", &signed_headers);

    let mut query: Vec<(String, String)> = spec.query.clone();
    query.sort();
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
        .collect::<Vec<_>>()
        .join("&");

    let mut canonical_request = format!("{}\n{}\n{canonical_query}\n", spec.method, url.path());
    for (name, value) in &headers {
        canonical_request.push_str(&format!("{name}:{value}\n"));
    }
    canonical_request.push('\n');
    canonical_request.push_str(&signed_headers);
    canonical_request.push_str("\nUNSIGNED-PAYLOAD");

    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{timestamp}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );
    let key = hmac_sha256(
        &hmac_sha256(
            &hmac_sha256(
                &hmac_sha256(format!("AWS4{}", creds.password).as_bytes(), date.as_bytes()),
                region.as_bytes(),
            ),
            b"s3",
        ),
        b"aws4_request",
    );
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    // Fold the query into the URL with exactly the escaping that was
    // signed, so the transport cannot re-encode it differently.
    let mut final_query = canonical_query;
    if !final_query.is_empty() {
        final_query.push('&');
    }
    final_query.push_str(&format!("X-Amz-Signature={signature}"));
    spec.url = format!("{}?{final_query}", spec.url);
    spec.query.clear();
    Ok(spec)
}

fn signed_request(
    auth: &AuthSnapshot,
    method: Method,
    key_path: &str,
) -> CloudResult<(Credentials, HttpRequestSpec)> {
    let creds = credentials(auth)?;
    let url = format!("{}/{}", bucket_url(auth, &creds), key_path);
    Ok((creds, HttpRequestSpec::new(url, method)))
}

fn filename_of(key: &str) -> &str {
    let trimmed = key.strip_suffix('/').unwrap_or(key);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[derive(Debug, Default, Clone)]
struct ListedObject {
    key: String,
    size: Option<u64>,
    modified: Option<String>,
}

#[derive(Debug, Default)]
struct ListingDocument {
    objects: Vec<ListedObject>,
    prefixes: Vec<String>,
    truncated: bool,
    next_token: Option<String>,
    has_name: bool,
}

fn parse_listing(body: &str) -> CloudResult<ListingDocument> {
    let mut reader = Reader::from_str(body);
    let mut doc = ListingDocument::default();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut current = ListedObject::default();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                path.push(e.name().as_ref().to_vec());
                if e.name().as_ref() == b"Contents" {
                    current = ListedObject::default();
                }
            }
            Ok(Event::Text(ref t)) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                let in_contents = path.iter().any(|p| p == b"Contents");
                let in_prefixes = path.iter().any(|p| p == b"CommonPrefixes");
                match path.last().map(|v| v.as_slice()) {
                    Some(b"Name") => doc.has_name = true,
                    Some(b"Key") if in_contents => current.key = text,
                    Some(b"Size") if in_contents => current.size = text.parse().ok(),
                    Some(b"LastModified") if in_contents => current.modified = Some(text),
                    Some(b"Prefix") if in_prefixes => doc.prefixes.push(text),
                    Some(b"IsTruncated") => doc.truncated = text == "true",
                    Some(b"NextContinuationToken") => doc.next_token = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Contents" {
                    doc.objects.push(current.clone());
                }
                path.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(CloudError::failure(format!("malformed listing: {e}"))),
        }
    }
    Ok(doc)
}

impl ProviderAdapter for AmazonS3 {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AmazonS3
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
            .with(Operation::GetGeneralData)
            .with(Operation::GetFileDaemonUrl)
    }

    fn root_directory(&self) -> Item {
        Item::directory("/", "")
    }

    fn authorize_url(&self, auth: &AuthSnapshot) -> String {
        // Credentials come from the embedded login page.
        let base = auth
            .redirect_uri
            .strip_suffix(&format!("/{}", ProviderKind::AmazonS3.name()))
            .unwrap_or(&auth.redirect_uri);
        format!(
            "{base}/{}/login?state={}",
            ProviderKind::AmazonS3.name(),
            auth.state
        )
    }

    fn is_success(&self, status: u16, _headers: &HashMap<String, String>) -> bool {
        status != 301 && (200..300).contains(&status)
    }

    fn reauthorize(&self, status: u16, _headers: &HashMap<String, String>) -> bool {
        status == 401 || status == 403 || status == 301
    }

    fn recursive_operations(&self) -> bool {
        true
    }

    fn exchange_code_request(
        &self,
        _auth: &AuthSnapshot,
        _code: &str,
    ) -> CloudResult<Option<HttpRequestSpec>> {
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
        if creds.username.is_empty() || creds.password.is_empty() || creds.bucket.is_empty() {
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
        page_token: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let (creds, spec) = signed_request(auth, Method::GET, "")?;
        let mut spec = spec
            .query_param("list-type", "2")
            .query_param("prefix", &directory.id)
            .query_param("delimiter", "/");
        if !page_token.is_empty() {
            spec = spec.query_param("continuation-token", page_token);
        }
        sign(auth, &creds, spec)
    }

    fn list_page_response(
        &self,
        _auth: &AuthSnapshot,
        directory: &Item,
        response: &HttpResponse,
    ) -> CloudResult<PageData> {
        let body = String::from_utf8_lossy(&response.body).into_owned();
        let doc = parse_listing(&body)?;
        let mut items = Vec::new();
        if doc.has_name {
            for object in &doc.objects {
                // The marker object of the listed prefix is not a child.
                if object.size == Some(0) && object.key == directory.id {
                    continue;
                }
                let mut item = Item::new(
                    filename_of(&object.key),
                    object.key.clone(),
                    FileType::from_extension(filename_of(&object.key)),
                );
                item.size = object.size;
                item.timestamp = object
                    .modified
                    .as_deref()
                    .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&chrono::Utc));
                items.push(item);
            }
            for prefix in &doc.prefixes {
                items.push(Item::directory(filename_of(prefix), prefix.clone()));
            }
        }
        let next_token = if doc.truncated { doc.next_token } else { None };
        Ok(PageData { items, next_token })
    }

    fn item_data_request(&self, auth: &AuthSnapshot, id: &str) -> CloudResult<HttpRequestSpec> {
        let (creds, spec) = signed_request(auth, Method::GET, "")?;
        let spec = spec
            .query_param("list-type", "2")
            .query_param("prefix", id)
            .query_param("delimiter", "/");
        sign(auth, &creds, spec)
    }

    fn item_data_response(
        &self,
        _auth: &AuthSnapshot,
        id: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        if id.is_empty() {
            return Ok(self.root_directory());
        }
        let body = String::from_utf8_lossy(&response.body).into_owned();
        let doc = parse_listing(&body)?;
        let file_type = if id.ends_with('/') {
            FileType::Directory
        } else {
            FileType::from_extension(filename_of(id))
        };
        let mut item = Item::new(filename_of(id), id, file_type);
        if file_type != FileType::Directory {
            if let Some(object) = doc.objects.iter().find(|o| o.key == id).or(doc.objects.first()) {
                item.size = object.size;
                item.timestamp = object
                    .modified
                    .as_deref()
                    .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&chrono::Utc));
            }
        }
        Ok(item)
    }

    fn item_url_request(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        // Presigned URLs are derivable locally.
        Ok(None)
    }

    fn item_url_response(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        _response: &HttpResponse,
    ) -> CloudResult<String> {
        let (creds, spec) = signed_request(auth, Method::GET, &escape_path(&item.id))?;
        Ok(sign(auth, &creds, spec)?.url)
    }

    fn download_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        range: Range,
    ) -> CloudResult<HttpRequestSpec> {
        let (creds, spec) = signed_request(auth, Method::GET, &escape_path(&item.id))?;
        let mut spec = sign(auth, &creds, spec)?;
        // Range stays outside the signature; only host is a signed header.
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
        let key = format!("{}{}", parent.id, filename);
        let (creds, spec) = signed_request(auth, Method::PUT, &escape_path(&key))?;
        sign(auth, &creds, spec)
    }

    fn upload_response(
        &self,
        _auth: &AuthSnapshot,
        parent: &Item,
        filename: &str,
        size: u64,
        _response: &HttpResponse,
    ) -> CloudResult<Item> {
        let key = format!("{}{}", parent.id, filename);
        Ok(
            Item::new(filename, key, FileType::from_extension(filename))
                .with_size(size)
                .with_timestamp(chrono::Utc::now()),
        )
    }

    fn delete_request(&self, auth: &AuthSnapshot, item: &Item) -> CloudResult<HttpRequestSpec> {
        let (creds, spec) = signed_request(auth, Method::DELETE, &escape_path(&item.id))?;
        sign(auth, &creds, spec)
    }

    fn copy_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        new_id: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let (creds, spec) = signed_request(auth, Method::PUT, &escape_path(new_id))?;
        let spec = if item.is_directory() {
            // Directory markers are re-created empty, not server-side copied.
            spec
        } else {
            spec.header(
                "x-amz-copy-source",
                format!("{}/{}", creds.bucket, escape_path(&item.id)),
            )
        };
        sign(auth, &creds, spec)
    }

    fn create_directory_request(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let key = format!("{}{}/", parent.id, name);
        let (creds, spec) = signed_request(auth, Method::PUT, &escape_path(&key))?;
        sign(auth, &creds, spec)
    }

    fn create_directory_response(
        &self,
        _auth: &AuthSnapshot,
        parent: &Item,
        name: &str,
        _response: &HttpResponse,
    ) -> CloudResult<Item> {
        let key = format!("{}{}/", parent.id, name);
        Ok(Item::directory(name, key).with_size(0))
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
        let endpoint = creds.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let username = if endpoint == DEFAULT_ENDPOINT {
            creds.bucket.clone()
        } else {
            format!("{endpoint}/{}", creds.bucket)
        };
        Ok(GeneralData {
            username,
            space_used: None,
            space_total: None,
        })
    }
}
