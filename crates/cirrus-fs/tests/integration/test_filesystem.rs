//! Filesystem scenarios: chunked reads, read past end, the write-then-sync
//! round trip, cross-provider rename refusal, remove semantics, the
//! authorize fallback.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use cirrus_core::CloudResult;
use cirrus_fs::{CloudFileSystem, NodeInfo, ROOT_INODE};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{file_item, item_json, test_mount, RangeResponder};

const RECV_TIMEOUT: Duration = Duration::from_secs(15);

/// Bridges a callback-style filesystem call into a blocking receive that
/// does not stall the async test runtime.
async fn wait<T: Send + 'static>(rx: mpsc::Receiver<T>) -> T {
    tokio::task::spawn_blocking(move || rx.recv_timeout(RECV_TIMEOUT).expect("callback fired"))
        .await
        .unwrap()
}

async fn readdir(fs: &Arc<CloudFileSystem>, inode: u64) -> CloudResult<Vec<NodeInfo>> {
    let (tx, rx) = mpsc::channel();
    fs.readdir(inode, move |result| {
        let _ = tx.send(result);
    });
    wait(rx).await
}

async fn read(fs: &Arc<CloudFileSystem>, inode: u64, offset: u64, size: u32) -> CloudResult<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    fs.read(inode, offset, size, move |result| {
        let _ = tx.send(result);
    });
    wait(rx).await
}

/// Resolves the inode of a mount under the root by label.
async fn mount_inode(fs: &Arc<CloudFileSystem>, label: &str) -> u64 {
    readdir(fs, ROOT_INODE)
        .await
        .unwrap()
        .into_iter()
        .find(|entry| entry.filename == label)
        .expect("mount present")
        .inode
}

async fn entry_named(
    fs: &Arc<CloudFileSystem>,
    parent: u64,
    name: &str,
) -> Option<NodeInfo> {
    readdir(fs, parent)
        .await
        .unwrap()
        .into_iter()
        .find(|entry| entry.filename == name)
}

/// One mount over a server holding a single 100-byte object.
async fn single_file_fixture(
    content: Vec<u8>,
) -> (MockServer, tempfile::TempDir, Arc<CloudFileSystem>) {
    let server = MockServer::start().await;
    let item = file_item("data.bin", "/data.bin", content.len() as u64);
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("id", "root"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [item_json(&item)],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file//data.bin"))
        .respond_with(RangeResponder { content })
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().unwrap();
    let fs = CloudFileSystem::new(
        vec![test_mount(&server.uri(), "mount-0", "drive")],
        tokio::runtime::Handle::current(),
        temp.path().to_path_buf(),
        None,
    );
    (server, temp, fs)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_read_and_chunk_cache_hit() {
    let content: Vec<u8> = (0..100u8).collect();
    let (server, _temp, fs) = single_file_fixture(content.clone()).await;

    let drive = mount_inode(&fs, "drive").await;
    let file = entry_named(&fs, drive, "data.bin").await.unwrap();
    assert_eq!(file.size, Some(100));

    let bytes = read(&fs, file.inode, 10, 20).await.unwrap();
    assert_eq!(bytes, &content[10..30]);

    // A contained follow-up is served from the chunk cache: the number of
    // upstream content fetches must not grow.
    let fetches_before = content_fetches(&server).await;
    let bytes = read(&fs, file.inode, 15, 10).await.unwrap();
    assert_eq!(bytes, &content[15..25]);
    assert_eq!(content_fetches(&server).await, fetches_before);

    fs.shutdown();
}

async fn content_fetches(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().starts_with("/file/"))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_past_end_returns_the_tail() {
    let content: Vec<u8> = (0..100u8).collect();
    let (_server, _temp, fs) = single_file_fixture(content.clone()).await;

    let drive = mount_inode(&fs, "drive").await;
    let file = entry_named(&fs, drive, "data.bin").await.unwrap();
    let bytes = read(&fs, file.inode, 90, 50).await.unwrap();
    assert_eq!(bytes.len(), 10);
    assert_eq!(bytes, &content[90..100]);

    fs.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_then_fsync_rebinds_and_lists() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload"))
        .and(query_param("name", "note.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(item_json(&file_item(
            "note.txt",
            "/note.txt",
            5,
        ))))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().unwrap();
    let fs = CloudFileSystem::new(
        vec![test_mount(&server.uri(), "mount-0", "drive")],
        tokio::runtime::Handle::current(),
        temp.path().to_path_buf(),
        None,
    );

    let drive = mount_inode(&fs, "drive").await;
    // Populate the directory cache before creating the local file.
    assert!(readdir(&fs, drive).await.unwrap().is_empty());

    let inode = fs.mknod(drive, "note.txt").expect("mknod");
    assert_eq!(fs.write(inode, b"hello", 0), 5);

    let (tx, rx) = mpsc::channel();
    fs.fsync(inode, move |result| {
        let _ = tx.send(result);
    });
    wait(rx).await.unwrap();

    // The upload body reached the provider.
    let uploads: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/upload")
        .collect();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].body, b"hello");

    // The inode is rebound to the server item and shows up in the parent.
    let entry = entry_named(&fs, drive, "note.txt").await.unwrap();
    assert_eq!(entry.inode, inode);
    assert_eq!(entry.size, Some(5));

    fs.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_provider_rename_is_refused() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    for server in [&server_a, &server_b] {
        Mock::given(method("GET"))
            .and(path("/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [item_json(&file_item("a.txt", "/a.txt", 1))],
            })))
            .mount(server)
            .await;
    }

    let temp = tempfile::tempdir().unwrap();
    let fs = CloudFileSystem::new(
        vec![
            test_mount(&server_a.uri(), "mount-0", "first"),
            test_mount(&server_b.uri(), "mount-1", "second"),
        ],
        tokio::runtime::Handle::current(),
        temp.path().to_path_buf(),
        None,
    );

    let first = mount_inode(&fs, "first").await;
    let second = mount_inode(&fs, "second").await;

    let (tx, rx) = mpsc::channel();
    fs.rename(first, "a.txt", second, "a.txt", move |result| {
        let _ = tx.send(result);
    });
    let err = wait(rx).await.unwrap_err();
    assert_eq!(err.code, cirrus_core::code::SERVICE_UNAVAILABLE);

    fs.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_provider_rename_rebinds_the_inode() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [item_json(&file_item("old.txt", "/old.txt", 3))],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rename"))
        .and(query_param("name", "new.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(item_json(&file_item(
            "new.txt",
            "/new.txt",
            3,
        ))))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().unwrap();
    let fs = CloudFileSystem::new(
        vec![test_mount(&server.uri(), "mount-0", "drive")],
        tokio::runtime::Handle::current(),
        temp.path().to_path_buf(),
        None,
    );
    let drive = mount_inode(&fs, "drive").await;
    let before = entry_named(&fs, drive, "old.txt").await.unwrap();

    let (tx, rx) = mpsc::channel();
    fs.rename(drive, "old.txt", drive, "new.txt", move |result| {
        let _ = tx.send(result);
    });
    let renamed = wait(rx).await.unwrap();
    assert_eq!(renamed.inode, before.inode);
    assert_eq!(renamed.filename, "new.txt");

    fs.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_dispatches_delete_and_forgets_the_inode() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [item_json(&file_item("junk.txt", "/junk.txt", 4))],
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/delete"))
        .and(query_param("id", "/junk.txt"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().unwrap();
    let fs = CloudFileSystem::new(
        vec![test_mount(&server.uri(), "mount-0", "drive")],
        tokio::runtime::Handle::current(),
        temp.path().to_path_buf(),
        None,
    );
    let drive = mount_inode(&fs, "drive").await;
    assert!(entry_named(&fs, drive, "junk.txt").await.is_some());

    let (tx, rx) = mpsc::channel();
    fs.remove(drive, "junk.txt", move |result| {
        let _ = tx.send(result);
    });
    wait(rx).await.unwrap();
    assert!(entry_named(&fs, drive, "junk.txt").await.is_none());

    fs.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_first_listing_surfaces_the_authorize_node() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("nope"))
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().unwrap();
    let fs = CloudFileSystem::new(
        vec![test_mount(&server.uri(), "mount-0", "drive")],
        tokio::runtime::Handle::current(),
        temp.path().to_path_buf(),
        None,
    );
    let drive = mount_inode(&fs, "drive").await;
    let entries = readdir(&fs, drive).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].filename, "authorize.html");

    // Reading the authorize node yields the redirect page.
    let bytes = read(&fs, entries[0].inode, 0, 4096).await.unwrap();
    let html = String::from_utf8(bytes).unwrap();
    assert!(html.contains("window.location.href"));
    assert!(html.contains("/login"));

    fs.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listing_cache_survives_a_remount() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [item_json(&file_item("seen.txt", "/seen.txt", 9))],
        })))
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().unwrap();
    let cache_path = temp.path().join("listings.db");
    {
        let fs = CloudFileSystem::new(
            vec![test_mount(&server.uri(), "mount-0", "drive")],
            tokio::runtime::Handle::current(),
            temp.path().to_path_buf(),
            Some(cache_path.clone()),
        );
        let drive = mount_inode(&fs, "drive").await;
        assert!(entry_named(&fs, drive, "seen.txt").await.is_some());
        fs.shutdown();
    }

    // A fresh mount over a now-unreachable provider still shows the
    // persisted listing.
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let fs = CloudFileSystem::new(
        vec![test_mount(&server.uri(), "mount-0", "drive")],
        tokio::runtime::Handle::current(),
        temp.path().to_path_buf(),
        Some(cache_path),
    );
    let drive = mount_inode(&fs, "drive").await;
    let entries = readdir(&fs, drive).await.unwrap();
    assert!(entries.iter().any(|entry| entry.filename == "seen.txt"));

    fs.shutdown();
}
