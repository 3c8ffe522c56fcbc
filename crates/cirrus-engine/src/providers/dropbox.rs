//! Dropbox adapter.
//!
//! Ids are display paths (`/dir/file.ext`); the root id is the empty
//! string. Metadata lives on `api.dropboxapi.com`, content on
//! `content.dropboxapi.com` where the JSON arguments ride in the
//! `Dropbox-API-Arg` header.

use cirrus_core::{
    CloudError, CloudResult, FileType, GeneralData, Item, PageData, ProviderKind, Range, Token,
};
use cirrus_http::{HttpRequestSpec, HttpResponse};
use serde_json::json;

use crate::adapter::{AuthSnapshot, Operation, OperationSet, ProviderAdapter};

const API: &str = "https://api.dropboxapi.com";
const CONTENT: &str = "https://content.dropboxapi.com";

pub struct Dropbox;

fn to_item(value: &serde_json::Value) -> Item {
    let name = value["name"].as_str().unwrap_or_default();
    let id = value["path_display"].as_str().unwrap_or_default();
    let file_type = if value[".tag"] == "folder" {
        FileType::Directory
    } else {
        match value["media_info"]["metadata"][".tag"].as_str() {
            Some("video") => FileType::Video,
            Some("photo") => FileType::Image,
            _ => FileType::from_extension(name),
        }
    };
    let mut item = Item::new(name, id, file_type);
    if let Some(size) = value["size"].as_u64() {
        item.size = Some(size);
    }
    if let Some(modified) = value["server_modified"].as_str() {
        item.timestamp = modified.parse().ok();
    }
    item
}

fn api_call(auth: &AuthSnapshot, path: &str, body: serde_json::Value) -> CloudResult<HttpRequestSpec> {
    Ok(HttpRequestSpec::post(format!("{API}{path}"))
        .header("Authorization", format!("Bearer {}", auth.bearer()?))
        .body_json(&body))
}

fn content_call(auth: &AuthSnapshot, path: &str, arg: serde_json::Value) -> CloudResult<HttpRequestSpec> {
    Ok(HttpRequestSpec::post(format!("{CONTENT}{path}"))
        .header("Authorization", format!("Bearer {}", auth.bearer()?))
        .header("Dropbox-API-Arg", arg.to_string()))
}

fn parse_json(response: &HttpResponse) -> CloudResult<serde_json::Value> {
    Ok(serde_json::from_slice(&response.body)?)
}

impl ProviderAdapter for Dropbox {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dropbox
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
            .with(Operation::GetThumbnail)
            .with(Operation::GetFileDaemonUrl)
    }

    fn root_directory(&self) -> Item {
        Item::directory("/", "")
    }

    fn authorize_url(&self, auth: &AuthSnapshot) -> String {
        format!(
            "https://www.dropbox.com/oauth2/authorize?response_type=code&client_id={}&redirect_uri={}&token_access_type=offline&state={}",
            auth.client_id, auth.redirect_uri, auth.state
        )
    }

    fn reauthorize(&self, status: u16, _headers: &std::collections::HashMap<String, String>) -> bool {
        status == 400 || status == 401
    }

    fn exchange_code_request(
        &self,
        auth: &AuthSnapshot,
        code: &str,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(Some(
            HttpRequestSpec::post(format!("{API}/oauth2/token"))
                .query_param("grant_type", "authorization_code")
                .query_param("code", code)
                .query_param("client_id", &auth.client_id)
                .query_param("client_secret", &auth.client_secret)
                .query_param("redirect_uri", &auth.redirect_uri),
        ))
    }

    fn exchange_code_response(
        &self,
        _auth: &AuthSnapshot,
        _code: &str,
        response: &HttpResponse,
    ) -> CloudResult<Token> {
        let json = parse_json(response)?;
        let access_token = json["access_token"]
            .as_str()
            .ok_or_else(|| CloudError::failure("token response without access_token"))?;
        let refresh_token = json["refresh_token"].as_str().unwrap_or(access_token);
        Ok(Token::new(refresh_token, access_token))
    }

    fn refresh_request(&self, auth: &AuthSnapshot) -> CloudResult<Option<HttpRequestSpec>> {
        let refresh = auth
            .token
            .as_deref()
            .ok_or_else(|| CloudError::unauthorized("no refresh token"))?;
        Ok(Some(
            HttpRequestSpec::post(format!("{API}/oauth2/token"))
                .query_param("grant_type", "refresh_token")
                .query_param("refresh_token", refresh)
                .query_param("client_id", &auth.client_id)
                .query_param("client_secret", &auth.client_secret),
        ))
    }

    fn refresh_response(&self, auth: &AuthSnapshot, response: &HttpResponse) -> CloudResult<Token> {
        let json = parse_json(response)?;
        let access_token = json["access_token"]
            .as_str()
            .ok_or_else(|| CloudError::failure("refresh response without access_token"))?;
        let refresh = json["refresh_token"]
            .as_str()
            .map(str::to_string)
            .or_else(|| auth.token.clone())
            .unwrap_or_else(|| access_token.to_string());
        Ok(Token::new(refresh, access_token))
    }

    fn list_page_request(
        &self,
        auth: &AuthSnapshot,
        directory: &Item,
        page_token: &str,
    ) -> CloudResult<HttpRequestSpec> {
        if page_token.is_empty() {
            api_call(
                auth,
                "/2/files/list_folder",
                json!({"path": directory.id, "include_media_info": true}),
            )
        } else {
            api_call(
                auth,
                "/2/files/list_folder/continue",
                json!({"cursor": page_token}),
            )
        }
    }

    fn list_page_response(
        &self,
        _auth: &AuthSnapshot,
        _directory: &Item,
        response: &HttpResponse,
    ) -> CloudResult<PageData> {
        let json = parse_json(response)?;
        let items = json["entries"]
            .as_array()
            .map(|entries| entries.iter().map(to_item).collect())
            .unwrap_or_default();
        let next_token = if json["has_more"].as_bool().unwrap_or(false) {
            json["cursor"].as_str().map(str::to_string)
        } else {
            None
        };
        Ok(PageData { items, next_token })
    }

    fn item_data_request(&self, auth: &AuthSnapshot, id: &str) -> CloudResult<HttpRequestSpec> {
        api_call(
            auth,
            "/2/files/get_metadata",
            json!({"path": id, "include_media_info": true}),
        )
    }

    fn item_data_response(
        &self,
        _auth: &AuthSnapshot,
        _id: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        Ok(to_item(&parse_json(response)?))
    }

    fn item_url_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(Some(api_call(
            auth,
            "/2/files/get_temporary_link",
            json!({"path": item.id}),
        )?))
    }

    fn item_url_response(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
        response: &HttpResponse,
    ) -> CloudResult<String> {
        let json = parse_json(response)?;
        json["link"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::failure("temporary link response without link"))
    }

    fn download_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        range: Range,
    ) -> CloudResult<HttpRequestSpec> {
        let mut spec = content_call(auth, "/2/files/download", json!({"path": item.id}))?;
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
        let path = format!("{}/{}", parent.id, filename);
        Ok(content_call(
            auth,
            "/2/files/upload",
            json!({"path": path, "mode": "overwrite"}),
        )?
        .header("Content-Type", "application/octet-stream"))
    }

    fn upload_response(
        &self,
        _auth: &AuthSnapshot,
        _parent: &Item,
        _filename: &str,
        _size: u64,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        Ok(to_item(&parse_json(response)?))
    }

    fn thumbnail_request(&self, auth: &AuthSnapshot, item: &Item) -> CloudResult<HttpRequestSpec> {
        content_call(
            auth,
            "/2/files/get_thumbnail_v2",
            json!({
                "resource": {".tag": "path", "path": item.id},
                "format": "jpeg",
                "size": "w256h256"
            }),
        )
    }

    fn delete_request(&self, auth: &AuthSnapshot, item: &Item) -> CloudResult<HttpRequestSpec> {
        api_call(auth, "/2/files/delete_v2", json!({"path": item.id}))
    }

    fn create_directory_request(
        &self,
        auth: &AuthSnapshot,
        parent: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        api_call(
            auth,
            "/2/files/create_folder_v2",
            json!({"path": format!("{}/{}", parent.id, name)}),
        )
    }

    fn create_directory_response(
        &self,
        _auth: &AuthSnapshot,
        _parent: &Item,
        name: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        let json = parse_json(response)?;
        let metadata = &json["metadata"];
        let mut item = to_item(metadata);
        if item.filename.is_empty() {
            item.filename = name.to_string();
        }
        item.file_type = FileType::Directory;
        Ok(item)
    }

    fn move_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        destination: &Item,
    ) -> CloudResult<HttpRequestSpec> {
        api_call(
            auth,
            "/2/files/move_v2",
            json!({
                "from_path": item.id,
                "to_path": format!("{}/{}", destination.id, item.filename)
            }),
        )
    }

    fn move_response(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
        _destination: &Item,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        Ok(to_item(&parse_json(response)?["metadata"]))
    }

    fn rename_request(
        &self,
        auth: &AuthSnapshot,
        item: &Item,
        name: &str,
    ) -> CloudResult<HttpRequestSpec> {
        let parent = item.id.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        api_call(
            auth,
            "/2/files/move_v2",
            json!({
                "from_path": item.id,
                "to_path": format!("{parent}/{name}")
            }),
        )
    }

    fn rename_response(
        &self,
        _auth: &AuthSnapshot,
        _item: &Item,
        _name: &str,
        response: &HttpResponse,
    ) -> CloudResult<Item> {
        Ok(to_item(&parse_json(response)?["metadata"]))
    }

    fn general_data_request(
        &self,
        auth: &AuthSnapshot,
    ) -> CloudResult<Option<HttpRequestSpec>> {
        Ok(Some(
            HttpRequestSpec::post(format!("{API}/2/users/get_current_account"))
                .header("Authorization", format!("Bearer {}", auth.bearer()?)),
        ))
    }

    fn general_data_response(
        &self,
        _auth: &AuthSnapshot,
        response: &HttpResponse,
    ) -> CloudResult<GeneralData> {
        let json = parse_json(response)?;
        let username = json["email"]
            .as_str()
            .or_else(|| json["name"]["display_name"].as_str())
            .unwrap_or_default()
            .to_string();
        Ok(GeneralData {
            username,
            space_used: None,
            space_total: None,
        })
    }
}
