//! Re-authorization policy: a 401 triggers one refresh pass and a retry;
//! concurrent 401s share the barrier; a second failure is terminal.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{item_json, test_handle};

/// First listing hits a stale bearer, the refresh mints `bearer-1`, the
/// replay succeeds.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_bearer_refreshes_once_and_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(header("Authorization", "Bearer bearer-0"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(header("Authorization", "Bearer bearer-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [item_json(&crate::common::file_item("a.txt", "/a.txt", 1))],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"access_token": "bearer-1"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let handle = test_handle(&server.uri(), "test-0");
    let items = handle
        .list_directory(&handle.root_directory(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(items.len(), 1);

    // One failed list, one token round-trip, one replayed list.
    let requests = server.received_requests().await.unwrap();
    let lists = requests.iter().filter(|r| r.url.path() == "/list").count();
    let tokens = requests.iter().filter(|r| r.url.path() == "/token").count();
    assert_eq!(lists, 2);
    assert_eq!(tokens, 1);
}

/// When the refresh itself is rejected, the original error surfaces and no
/// endless retry loop forms.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_refresh_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad refresh token"))
        .mount(&server)
        .await;

    let handle = test_handle(&server.uri(), "test-0");
    let err = handle
        .list_directory(&handle.root_directory(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, 401);

    let requests = server.received_requests().await.unwrap();
    let lists = requests.iter().filter(|r| r.url.path() == "/list").count();
    assert_eq!(lists, 1, "no replay without a successful refresh");
}

/// A burst of requests hitting 401 together performs a single token
/// round-trip through the barrier.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reauthorizations_share_the_barrier() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(header("Authorization", "Bearer bearer-0"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(header("Authorization", "Bearer bearer-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(std::time::Duration::from_millis(80))
                .set_body_json(serde_json::json!({"access_token": "bearer-1"})),
        )
        .mount(&server)
        .await;

    let handle = test_handle(&server.uri(), "test-0");
    let mut tasks = Vec::new();
    for _ in 0..6 {
        let handle = Arc::clone(&handle);
        tasks.push(tokio::spawn(async move {
            handle
                .list_directory(&handle.root_directory(), &CancellationToken::new())
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let requests = server.received_requests().await.unwrap();
    let tokens = requests.iter().filter(|r| r.url.path() == "/token").count();
    assert!(
        tokens <= 2,
        "barrier must collapse refreshes, saw {tokens}"
    );
}
