//! Runtime behavior: pagination, cancellation, unsupported operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cirrus_core::{CloudResult, Item};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{file_item, item_json, test_access, test_handle};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paging_flattens_to_the_full_listing() {
    let server = MockServer::start().await;
    let page1 = vec![file_item("a.txt", "/a.txt", 1), file_item("b.txt", "/b.txt", 2)];
    let page2 = vec![file_item("c.txt", "/c.txt", 3)];

    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("page", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": page1.iter().map(item_json).collect::<Vec<_>>(),
            "next": "page-2"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("page", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": page2.iter().map(item_json).collect::<Vec<_>>(),
        })))
        .mount(&server)
        .await;

    let handle = test_handle(&server.uri(), "test-0");
    let cancel = CancellationToken::new();
    let root = handle.root_directory();

    // Page-by-page drive, concatenated manually.
    let mut paged = Vec::new();
    let mut token = String::new();
    loop {
        let page = handle
            .list_directory_page(&root, &token, &cancel)
            .await
            .unwrap();
        paged.extend(page.items);
        match page.next_token {
            Some(next) if !next.is_empty() => token = next,
            _ => break,
        }
    }

    // The flat listing must be the same sequence.
    let flat = handle.list_directory(&root, &cancel).await.unwrap();
    assert_eq!(flat, paged);
    assert_eq!(flat.len(), 3);
    assert_eq!(flat[2].filename, "c.txt");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_listing_fires_exactly_once_with_aborted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(std::time::Duration::from_secs(60))
                .set_body_json(serde_json::json!({"items": []})),
        )
        .mount(&server)
        .await;

    let handle = test_handle(&server.uri(), "test-0");
    let (access, events) = test_access(Arc::clone(&handle));
    let fired = Arc::new(AtomicU32::new(0));
    let fired_cb = Arc::clone(&fired);

    let request = access.list_directory_async(handle.root_directory(), move |result| {
        assert!(result.unwrap_err().is_aborted());
        fired_cb.fetch_add(1, Ordering::SeqCst);
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    request.cancel();
    request.cancel();

    let waiter = request.clone();
    tokio::task::spawn_blocking(move || waiter.wait())
        .await
        .unwrap();
    events.process_events();
    // Give any (incorrect) second completion a chance to surface.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    events.process_events();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_operation_aborts_without_touching_the_wire() {
    let server = MockServer::start().await;
    let handle = test_handle(&server.uri(), "test-0");
    let cancel = CancellationToken::new();
    // The test adapter does not expose thumbnails or account data.
    let mut sink = cirrus_engine::VecSink::default();
    let item = file_item("a.jpg", "/a.jpg", 10);
    let err = handle
        .get_thumbnail(&item, &mut sink, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_aborted());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn path_walk_resolves_nested_items() {
    let server = MockServer::start().await;
    let docs = Item::directory("docs", "/docs");
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("id", "root"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [item_json(&docs)],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("id", "/docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [item_json(&file_item("notes.txt", "/docs/notes.txt", 7))],
        })))
        .mount(&server)
        .await;

    let handle = test_handle(&server.uri(), "test-0");
    let cancel = CancellationToken::new();
    let item = handle.get_item("/docs/notes.txt", &cancel).await.unwrap();
    assert_eq!(item.id, "/docs/notes.txt");
    assert_eq!(item.size, Some(7));

    let err = handle.get_item("/docs/missing.txt", &cancel).await.unwrap_err();
    assert_eq!(err.code, 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_daemon_url_round_trips_the_payload() {
    let server = MockServer::start().await;
    let handle = test_handle(&server.uri(), "test-0");
    let item = file_item("movie.mp4", "/movie.mp4", 1 << 20);
    let url = handle.get_file_daemon_url(&item).unwrap();
    assert!(url.starts_with(&format!("{}/test-0/", server.uri())));
    let segment = url.rsplit('/').next().unwrap();
    let payload = cirrus_core::decode_file_payload(segment).unwrap();
    assert_eq!(payload.state, "test-0");
    assert_eq!(payload.id, "/movie.mp4");
    assert_eq!(payload.name, "movie.mp4");
    assert_eq!(payload.size, 1 << 20);
}
