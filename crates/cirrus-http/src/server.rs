//! Embedded HTTP server.
//!
//! One TCP listener serves every logical endpoint. Requests are routed by
//! their first path segment (the session id: a provider wire name for OAuth
//! redirects, a handle state for file streaming, or a static-asset bucket)
//! to handlers registered through [`HttpServerFactory::create`]. Dropping
//! the returned [`ServerHandle`] unregisters the route.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::body::ByteQueueBody;

/// What a logical endpoint is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    /// Receives the OAuth redirect carrying `code` / `error`.
    Authorization,
    /// Serves streaming file content and static assets.
    FileProvider,
    /// Plain 200 acknowledgement endpoint.
    Callback,
}

/// An inbound request as seen by a handler.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    pub method: String,
    /// Full decoded path, e.g. `/dropbox-0/AbCd123`.
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
}

impl ServerRequest {
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// The path with the leading session segment removed.
    pub fn subpath(&self) -> &str {
        let trimmed = self.path.trim_start_matches('/');
        match trimmed.find('/') {
            Some(idx) => &trimmed[idx..],
            None => "",
        }
    }

    /// The last path segment.
    pub fn last_segment(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

/// Response produced by a handler.
pub struct ServerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

pub enum ResponseBody {
    Full(Bytes),
    /// Streamed body fed by a [`crate::BodyWriter`] from another task.
    Stream(ByteQueueBody),
}

impl ServerResponse {
    pub fn with_status(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Full(body.into()),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::with_status(200, body)
    }

    pub fn not_found() -> Self {
        Self::with_status(404, "Not found")
    }

    pub fn bad_request(message: impl Into<Bytes>) -> Self {
        Self::with_status(400, message)
    }

    pub fn html(status: u16, body: impl Into<Bytes>) -> Self {
        Self::with_status(status, body).header("Content-Type", "text/html; charset=utf-8")
    }

    pub fn streaming(status: u16, body: ByteQueueBody) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Stream(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Per-session request handler.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &ServerRequest) -> ServerResponse;
}

impl<F> RequestHandler for F
where
    F: Fn(&ServerRequest) -> ServerResponse + Send + Sync,
{
    fn handle(&self, request: &ServerRequest) -> ServerResponse {
        self(request)
    }
}

struct Route {
    kind: ServerKind,
    handler: Arc<dyn RequestHandler>,
}

struct FactoryState {
    routes: DashMap<String, Route>,
    shutdown: CancellationToken,
}

/// Creates logical endpoints multiplexed over a single listener.
#[derive(Clone)]
pub struct HttpServerFactory {
    state: Arc<FactoryState>,
    base_url: String,
}

/// Keeps a route registered; dropping it unregisters the session.
pub struct ServerHandle {
    session_id: String,
    state: Arc<FactoryState>,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.state.routes.remove(&self.session_id);
    }
}

impl HttpServerFactory {
    /// Binds the shared listener and spawns the accept loop.
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<(Self, SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let state = Arc::new(FactoryState {
            routes: DashMap::new(),
            shutdown: CancellationToken::new(),
        });
        let factory = Self {
            state: Arc::clone(&state),
            base_url: format!("http://{local}"),
        };
        info!(%local, "embedded http server listening");
        tokio::spawn(accept_loop(listener, state));
        Ok((factory, local))
    }

    /// The externally visible base URL of this server.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Registers a handler for `session_id`; requests whose first path
    /// segment equals the session id are dispatched to it.
    pub fn create(
        &self,
        session_id: impl Into<String>,
        kind: ServerKind,
        handler: Arc<dyn RequestHandler>,
    ) -> ServerHandle {
        let session_id = session_id.into();
        self.state
            .routes
            .insert(session_id.clone(), Route { kind, handler });
        ServerHandle {
            session_id,
            state: Arc::clone(&self.state),
        }
    }

    /// Stops accepting connections.
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<FactoryState>) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| serve_one(Arc::clone(&state), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn serve_one(
    state: Arc<FactoryState>,
    req: hyper::Request<Incoming>,
) -> Result<hyper::Response<BoxBody<Bytes, std::io::Error>>, Infallible> {
    let request = to_server_request(&req);
    let session = request
        .path
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
        .to_string();
    debug!(method = %request.method, path = %request.path, "inbound request");

    let response = match state.routes.get(&session) {
        Some(route) => {
            if route.kind == ServerKind::Callback {
                ServerResponse::ok("OK")
            } else {
                route.handler.handle(&request)
            }
        }
        None => ServerResponse::not_found(),
    };

    let mut builder = hyper::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    let body: BoxBody<Bytes, std::io::Error> = match response.body {
        ResponseBody::Full(bytes) => Full::new(bytes)
            .map_err(|never: Infallible| match never {})
            .boxed(),
        ResponseBody::Stream(queue) => queue.boxed(),
    };
    Ok(builder
        .body(body)
        .expect("response construction from validated parts"))
}

fn to_server_request(req: &hyper::Request<Incoming>) -> ServerRequest {
    let uri = req.uri();
    let query = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    ServerRequest {
        method: req.method().to_string(),
        path: uri.path().to_string(),
        query,
        headers,
    }
}
