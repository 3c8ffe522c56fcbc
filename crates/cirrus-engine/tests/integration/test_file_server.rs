//! The range-streaming endpoint: payload validation, range negotiation,
//! content equality, the metadata cache.

use std::sync::Arc;

use cirrus_core::{encode_file_url, FilePayload};
use cirrus_engine::FileServer;
use cirrus_http::HttpServerFactory;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{file_item, item_json, test_handle, RangeResponder};

struct Fixture {
    /// Upstream provider mock.
    upstream: MockServer,
    /// Base URL of the embedded server.
    base: String,
    _file_server: FileServer,
}

async fn fixture(content: Vec<u8>, id: &str, name: &str) -> Fixture {
    let upstream = MockServer::start().await;
    let item = file_item(name, id, content.len() as u64);
    Mock::given(method("GET"))
        .and(path("/item"))
        .and(query_param("id", id))
        .respond_with(ResponseTemplate::new(200).set_body_json(item_json(&item)))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/file/{id}")))
        .respond_with(RangeResponder { content })
        .mount(&upstream)
        .await;

    let (server, addr) = HttpServerFactory::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let handle = test_handle(&upstream.uri(), "stream-0");
    let file_server = FileServer::create(
        Arc::clone(&handle),
        &server,
        tokio::runtime::Handle::current(),
    );
    Fixture {
        upstream,
        base: format!("http://{addr}"),
        _file_server: file_server,
    }
}

fn stream_url(fixture: &Fixture, state: &str, id: &str, name: &str, size: u64) -> String {
    encode_file_url(
        &format!("{}/{state}", fixture.base),
        &FilePayload {
            state: state.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            size,
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_get_streams_the_whole_object() {
    let content: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let fixture = fixture(content.clone(), "obj-1", "data.bin").await;
    let url = stream_url(&fixture, "stream-0", "obj-1", "data.bin", 4096);

    let response = reqwest::get(url).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("Accept-Ranges").unwrap(),
        "bytes"
    );
    assert_eq!(
        response.headers().get("Content-Type").unwrap(),
        "application/octet-stream"
    );
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], &content[..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bounded_range_returns_206_with_content_range() {
    let content = b"0123456789abcdef".to_vec();
    let fixture = fixture(content, "obj-2", "clip.mp4").await;
    let url = stream_url(&fixture, "stream-0", "obj-2", "clip.mp4", 16);

    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .header("Range", "bytes=0-7")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 206);
    assert_eq!(
        response.headers().get("Content-Range").unwrap(),
        "bytes 0-7/16"
    );
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"01234567");

    // Past the object: 416.
    let response = client
        .get(&url)
        .header("Range", "bytes=100-")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 416);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_state_is_rejected() {
    let fixture = fixture(b"xyz".to_vec(), "obj-3", "x.txt").await;
    // Payload signed for someone else's state, served under ours.
    let url = format!(
        "{}/stream-0/{}",
        fixture.base,
        stream_url(&fixture, "other-state", "obj-3", "x.txt", 3)
            .rsplit('/')
            .next()
            .unwrap()
    );
    let response = reqwest::get(url).await.unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metadata_cache_elides_item_round_trips() {
    let content = b"cache me".to_vec();
    let fixture = fixture(content, "obj-4", "c.txt").await;
    let url = stream_url(&fixture, "stream-0", "obj-4", "c.txt", 8);

    for _ in 0..3 {
        let body = reqwest::get(&url).await.unwrap().bytes().await.unwrap();
        assert_eq!(&body[..], b"cache me");
    }
    let item_fetches = fixture
        .upstream
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/item")
        .count();
    assert_eq!(item_fetches, 1, "item metadata must come from the cache");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn options_preflight_gets_cors_headers() {
    let fixture = fixture(b"x".to_vec(), "obj-5", "x.txt").await;
    let url = stream_url(&fixture, "stream-0", "obj-5", "x.txt", 1);
    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::OPTIONS, &url)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response
            .headers()
            .get("Access-Control-Allow-Origin")
            .unwrap(),
        "*"
    );
}
