//! pCloud adapter.
//!
//! Ids are decimal folder/file ids (root folder id `0`). The API reports
//! failures as HTTP 200 with a nonzero `result` field and an `x-error`
//! response header, so success detection reads headers, not just the
//! status. Content downloads go through a resolved link
//! (`getfilelink`), which the runtime fetches as a subrequest.

use std::collections::HashMap;

use cirrus_core::{
    CloudError, CloudResult, FileType, GeneralData, Item, PageData, ProviderKind, Range, Token,
};
use cirrus_http::{HttpRequestSpec, HttpResponse};

use crate::adapter::{AuthSnapshot, Operation, OperationSet, ProviderAdapter};

const DEFAULT_ENDPOINT: &str = "https://api.pcloud.com";

pub struct PCloud;

fn endpoint(auth: &AuthSnapshot) -> String {
    auth.hint(cirrus_core::domain::token::hint::REWRITTEN_ENDPOINT)
        .unwrap_or(DEFAULT_ENDPOINT)
        .trim_end_matches('/')
        .to_string()
}

fn api_call(auth: &AuthSnapshot, path: &str) -> CloudResult<HttpRequestSpec> {
    Ok(HttpRequestSpec::get(format!("{}{path}", endpoint(auth)))
        .header("Authorization", format!("Bearer {}", auth.bearer()?)))
}

/// Parses a pCloud envelope, converting a nonzero `result` into an error.
fn parse_envelope(response: &HttpResponse) -> CloudResult<serde_json::Value> {
    let json: serde_json::Value = serde_json::from_slice(&response.body)?;
    match json["result"].as_u64() {
        Some(0) | None => Ok(json),
        Some(code) => Err(CloudError::failure(format!(
            "api error {code}: {}",
            json["error"].as_str().unwrap_or("unknown")
        ))),
    }
}

fn to_item(value: &serde_json::Value) -> Item {
    let name = value["name"].as_str().unwrap_or_default();
    let is_folder = value["isfolder"].as_bool().unwrap_or(false);
    let id = if is_folder {
        value["folderid"].as_u64().unwrap_or_default().to_string()
    } else {
        value["fileid"].as_u64().unwrap_or_default().to_string()
    };
    let file_type = if is_folder {
        FileType::Directory
    } else {
        match value["category"].as_u64() {
            Some(1) => FileType::Image,
            Some(2) => FileType::Video,
            Some(3) => FileType::Audio,
            _ => FileType::from_extension(name),
        }
    };
    let mut item = Item::new(name, id, file_type);
    item.size = value["size"].as_u64();
    if let Some(modified) = value["modified"].as_str() {
        item.timestamp = chrono::DateTime::parse_from_rfc2822(modified)
            .map(|t| t.with_timezone(&chrono::Utc))
            .ok();
    }
    if let Some(mime) = value["contenttype"].as_str() {
        item.mime_type = Some(mime.to_string());
    }
    item
}

impl ProviderAdapter for PCloud {
    fn kind(&self) -> ProviderKind {
        ProviderKind::PCloud
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
        Item::directory("/", "0")
    }

    fn authorize_url(&self, auth: &AuthSnapshot) -> String {
        format!(
            "https://my.pcloud.com/oauth2/authorize?response_type=code&client_id={}&redirect_uri={}&state={}",
            auth.client_id, auth.redirect_uri, auth.state
        )
    }

    fn is_success(&self, status: u16, headers: &HashMap<String, String>) -> bool {
        (200..300).contains(&status) && !headers.contains_key("x-error")
    }

    fn reauthorize(&self, status: u16, headers: &HashMap<String, String>) -> bool {
        status == 401
            || status == 400
            || headers
                .get("x-error")
                .and_then(|v| v.parse::<u32>().ok())
                .map(|code| (1000..3000).contains(&code))
                .unwrap_or(false)
    }

    fn download_via_url(&self) -> bool {
        true
    }

    fn exchange_code_request(
        &self,
        auth: &AuthSnapshot,
        code: &str,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(Some(
            HttpRequestSpec::get(format!("{}/oauth2_token", endpoint(auth)))
                .query_param("client_id", &auth.client_id)
                .query_param("client_secret", &auth.client_secret)
                .query_param("code", code),
        ))
    }

    fn exchange_code_response(
        &self,
        _auth: &AuthSnapshot,
        _code: &str,
        response: &HttpResponse,
    ) -> CloudResult<Token> {
        let json = parse_envelope(response)?;
        let access_token = json["access_token"]
            .as_str()
            .ok_or_else(|| CloudError::failure("token response without access_token"))?;
        // pCloud access tokens do not expire; the token doubles as the
        // persistable credential.
        Ok(Token::new(access_token, access_token))
    }

    fn refresh_request(&self, _auth: &AuthSnapshot) -> CloudResult<Option<HttpRequestSpec>> {
        // The stored token is the long-lived bearer; revalidate as-is.
        Ok(None)
    }

    fn list_page_request(
        &self,
        auth: &AuthSnapshot,
        directory: &Item,
        _page_token: &str,
    ) -> CloudResult<HttpRequestSpec> {
        Ok(api_call(auth, "/listfolder")?
            .query_param("folderid", &directory.id)
            .query_param("timeformat", "timestamp"))
    }

    fn list_page_response(
        &self,
        _auth: &AuthSnapshot,
        _directory: &Item,
        response: &HttpResponse,
    ) -> CloudResult<PageData> {
        let json = parse_envelope(response)?;
        let items = json["metadata"]["contents"]
            .as_array()
            .map(|entries| entries.iter().map(to_item).collect())
            .unwrap_or_default();
        Ok(PageData {
            items,
            next_token: None,
        })
    }

    fn item_data_request(&self, auth: &AuthSnapshot, id: &str) -> CloudResult<HttpRequestSpec> {
        // Works for files; folders resolve through checksumfile-less stat.
        Ok(api_call(auth, "/stat")?.query_param("fileid", id))
    }

    fn item_data_response(
        &self,
        _auth: &AuthSnapshot,
        _id: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let json = parse_envelope(response)?;
        Ok(to_item(&json["metadata"]))
    }

    fn item_url_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(Some(
            api_call(auth, "/getfilelink")?.query_param("fileid", &item.id),
        ))
    }

    fn item_url_response(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
        response: &HttpResponse,
    ) -> CloudResult<String> {
        let json = parse_envelope(response)?;
        let host = json["hosts"][0]
            .as_str()
            .ok_or_else(|| CloudError::failure("file link response without hosts"))?;
        let path = json["path"]
            .as_str()
            .ok_or_else(|| CloudError::failure("file link response without path"))?;
        Ok(format!("https://{host}{path}"))
    }

    fn download_request(
        &self,
        _auth: &AuthSnapshot,
        item: &Item,
        range: Range,
    ) -> CloudResult<HttpRequestSpec> {
        let url = item
            .url
            .as_ref()
            .ok_or_else(|| CloudError::failure("no resolved content link"))?;
        let mut spec = HttpRequestSpec::get(url.clone());
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
        Ok(
            HttpRequestSpec::put(format!("{}/uploadfile", endpoint(auth)))
                .header("Authorization", format!("Bearer {}", auth.bearer()?))
                .query_param("folderid", &parent.id)
                .query_param("filename", filename)
                .query_param("nopartial", "1"),
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
        let json = parse_envelope(response)?;
        let metadata = json["metadata"]
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| CloudError::failure("upload response without metadata"))?;
        Ok(to_item(metadata))
    }

    fn delete_request(&self, auth: &AuthSnapshot, item: &Item) -> CloudResult<HttpRequestSpec> {
        if item.is_directory() {
            Ok(api_call(auth, "/deletefolderrecursive")?.query_param("folderid", &item.id))
        } else {
            Ok(api_call(auth, "/deletefile")?.query_param("fileid", &item.id))
        }
    }

    fn create_directory_request(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        Ok(api_call(auth, "/createfolder")?
            .query_param("folderid", &parent.id)
            .query_param("name", name))
    }

    fn create_directory_response(
        &self,
        _auth: &AuthSnapshot,
        _parent: &Item,
        _name: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let json = parse_envelope(response)?;
        Ok(to_item(&json["metadata"]))
    }

    fn move_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        destination: &Item,
    ) -> CloudResult<HttpRequestSpec> {
        if item.is_directory() {
            Ok(api_call(auth, "/renamefolder")?
                .query_param("folderid", &item.id)
                .query_param("tofolderid", &destination.id))
        } else {
            Ok(api_call(auth, "/renamefile")?
                .query_param("fileid", &item.id)
                .query_param("tofolderid", &destination.id))
        }
    }

    fn move_response(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
        _destination: &Item,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let json = parse_envelope(response)?;
        Ok(to_item(&json["metadata"]))
    }

    fn rename_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        if item.is_directory() {
            Ok(api_call(auth, "/renamefolder")?
                .query_param("folderid", &item.id)
                .query_param("toname", name))
        } else {
            Ok(api_call(auth, "/renamefile")?
                .query_param("fileid", &item.id)
                .query_param("toname", name))
        }
    }

    fn rename_response(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
        _name: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let json = parse_envelope(response)?;
        Ok(to_item(&json["metadata"]))
    }

    fn general_data_request(
        &self,
        auth: &AuthSnapshot,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(Some(api_call(auth, "/userinfo")?))
    }

    fn general_data_response(
        &self,
        _auth: &AuthSnapshot,
        response: &HttpResponse,
    ) -> CloudResult<GeneralData> {
        let json = parse_envelope(response)?;
        Ok(GeneralData {
            username: json["email"].as_str().unwrap_or_default().to_string(),
            space_used: json["usedquota"].as_u64(),
            space_total: json["quota"].as_u64(),
        })
    }
}
