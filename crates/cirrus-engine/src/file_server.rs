//! Range-streaming file server.
//!
//! One instance per provider handle, registered on the embedded server
//! under the handle's state. A GET decodes the trailing
//! base64 `{state, id, name, size}` payload, validates the state and the
//! requested byte range, then streams the object through a bounded
//! pipeline: the provider is driven in `CHUNK_SIZE` windows and the next
//! window is only issued once the response buffer has drained below half a
//! window, so a stalled client stops upstream fetching instead of growing
//! the buffer.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cirrus_core::{decode_file_payload, mime_type_for, Item, LruCache, Range};
use cirrus_http::{
    BodyWriter, ByteQueueBody, HttpServerFactory, RequestHandler, ServerHandle, ServerKind,
    ServerRequest, ServerResponse,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::access::{CloudHandle, DownloadSink};

/// Window size for upstream fetches.
pub const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Capacity of the per-server item metadata cache.
pub const CACHE_SIZE: usize = 128;

type ItemCache = Arc<Mutex<LruCache<String, Item>>>;

/// Registers and owns the streaming endpoint of one provider handle.
pub struct FileServer {
    _registration: ServerHandle,
}

impl FileServer {
    /// Registers the endpoint under the handle's state; dropping the
    /// returned server unregisters it.
    pub fn create(
        handle: Arc<CloudHandle>,
        server: &HttpServerFactory,
        runtime: tokio::runtime::Handle,
    ) -> FileServer {
        let state = handle.state().to_string();
        let handler = Arc::new(StreamHandler {
            handle,
            cache: Arc::new(Mutex::new(LruCache::new(CACHE_SIZE))),
            runtime,
        });
        FileServer {
            _registration: server.create(state, ServerKind::FileProvider, handler),
        }
    }
}

struct StreamHandler {
    handle: Arc<CloudHandle>,
    /// Item metadata by id, to elide a round-trip per request.
    cache: ItemCache,
    runtime: tokio::runtime::Handle,
}

fn cors(response: ServerResponse) -> ServerResponse {
    response
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
}

impl RequestHandler for StreamHandler {
    fn handle(&self, request: &ServerRequest) -> ServerResponse {
        if request.method == "OPTIONS" {
            return cors(ServerResponse::ok(""));
        }
        let payload = match decode_file_payload(request.last_segment()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(path = %request.path, error = %err, "invalid stream request");
                return ServerResponse::bad_request("invalid request");
            }
        };
        if payload.state != self.handle.state() {
            return ServerResponse::bad_request("invalid state");
        }

        let mut status = 200u16;
        let mut range = Range::new(0, payload.size);
        let mut content_range = None;
        if let Some(header) = request.header("range") {
            let parsed = match Range::parse_http(header) {
                Ok(parsed) => parsed,
                Err(_) => return ServerResponse::with_status(416, "invalid range"),
            };
            let mut requested = parsed;
            if requested.is_full() {
                if requested.start > payload.size {
                    return ServerResponse::with_status(416, "invalid range");
                }
                requested.size = payload.size - requested.start;
            }
            if requested.start + requested.size > payload.size {
                return ServerResponse::with_status(416, "invalid range");
            }
            status = 206;
            content_range = Some(requested.content_range(payload.size));
            range = requested;
        }

        let (body, writer) = ByteQueueBody::channel(Some(range.size));
        let mut response = cors(ServerResponse::streaming(status, body))
            .header("Content-Type", mime_type_for(&payload.name))
            .header("Accept-Ranges", "bytes")
            .header(
                "Content-Disposition",
                format!("inline; filename=\"{}\"", payload.name),
            );
        if let Some(value) = content_range {
            response = response.header("Content-Range", value);
        }

        let handle = Arc::clone(&self.handle);
        let cache = Arc::clone(&self.cache);
        let cancel = handle.child_token();
        let id = payload.id;
        self.runtime.spawn(async move {
            stream_pipeline(handle, cache, id, range, writer, cancel).await;
        });
        response
    }
}

struct WriterSink<'a> {
    writer: &'a BodyWriter,
}

impl DownloadSink for WriterSink<'_> {
    fn received(&mut self, data: &[u8]) {
        self.writer.push(Bytes::copy_from_slice(data));
    }
}

async fn stream_pipeline(
    handle: Arc<CloudHandle>,
    cache: ItemCache,
    id: String,
    range: Range,
    writer: BodyWriter,
    cancel: CancellationToken,
) {
    let cached = cache.lock().unwrap().get(&id).cloned();
    let item = match cached {
        Some(item) => item,
        None => match handle.get_item_data(&id, &cancel).await {
            Ok(item) => {
                cache.lock().unwrap().put(id.clone(), item.clone());
                item
            }
            Err(err) => {
                warn!(id, error = %err, "could not resolve item for streaming");
                writer.abort();
                return;
            }
        },
    };
    if let Some(size) = item.size {
        if range.start + range.size > size {
            warn!(id, start = range.start, len = range.size, "invalid stream range");
            writer.abort();
            return;
        }
    }
    // Resolve a direct link once for backends that stream through URLs.
    let item = if handle.adapter().download_via_url() && item.url.is_none() {
        match handle.get_item_url(&item, &cancel).await {
            Ok(url) => item.with_url(url),
            Err(err) => {
                warn!(id, error = %err, "could not resolve content link");
                writer.abort();
                return;
            }
        }
    } else {
        item
    };

    let mut start = range.start;
    let mut remaining = range.size;
    while remaining > 0 {
        // Flow control: defer the next window until the client drained the
        // buffer below half a window.
        writer.drained_below((CHUNK_SIZE / 2) as usize).await;
        if writer.is_closed() {
            debug!(id, "client went away, stopping stream");
            cancel.cancel();
            return;
        }
        let window = remaining.min(CHUNK_SIZE);
        let mut sink = WriterSink { writer: &writer };
        if let Err(err) = handle
            .download_file(&item, Range::new(start, window), &mut sink, &cancel)
            .await
        {
            if !err.is_aborted() {
                warn!(id, error = %err, "stream download failed");
            }
            writer.abort();
            return;
        }
        start += window;
        remaining -= window;
    }
    writer.finish();
}
