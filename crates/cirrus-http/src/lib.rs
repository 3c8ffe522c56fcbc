//! Cirrus HTTP - transport and embedded server
//!
//! Two halves:
//! - [`transport`] issues outbound requests with streamed request/response
//!   bodies, header and query manipulation, progress reporting and
//!   cooperative cancellation.
//! - [`server`] accepts inbound connections for OAuth redirect callbacks and
//!   the file-streaming endpoint, routing by the first path segment to
//!   registered per-session handlers.

pub mod body;
pub mod server;
pub mod transport;

pub use body::{ByteQueueBody, BodyWriter};
pub use server::{
    HttpServerFactory, RequestHandler, ServerHandle, ServerKind, ServerRequest, ServerResponse,
};
pub use transport::{HttpRequestSpec, HttpResponse, Method, RequestBody, Transport};
