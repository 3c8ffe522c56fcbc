//! Cirrus engine - asynchronous provider runtime
//!
//! The engine turns the uniform operation vocabulary (list, read-range,
//! upload, move, rename, delete, url-of) into wire requests through
//! pluggable provider adapters, and layers on top:
//!
//! - a cancellable request runtime with re-authorization on failure and
//!   internalized listing pagination ([`access`], [`runtime`]);
//! - an authorization state machine whose refresh barrier serializes
//!   concurrent token round-trips ([`auth`]);
//! - a range-streaming file server projecting remote objects as
//!   byte-range-addressable HTTP streams ([`file_server`]);
//! - a factory that constructs handles, persists accounts and dispatches
//!   completions onto a user-facing event loop ([`factory`],
//!   [`event_loop`]).
//!
//! Adapters for dropbox, pcloud, webdav and amazons3 ship in
//! [`providers`]; the remaining kinds are recognized but refused at the
//! factory with an aborted-operation error.

pub mod access;
pub mod adapter;
pub mod auth;
pub mod event_loop;
pub mod factory;
pub mod file_server;
pub mod pages;
pub mod providers;
pub mod runtime;

pub use access::{BytesSource, CloudAccess, CloudHandle, DownloadSink, UploadSource, VecSink};
pub use adapter::{AuthSnapshot, Operation, OperationSet, ProviderAdapter};
pub use auth::{AuthCallback, ConsentStatus};
pub use event_loop::EventLoop;
pub use factory::{
    CloudFactory, FactoryCallback, FactoryInit, Permission, ProviderInitData,
};
pub use file_server::FileServer;
pub use runtime::RequestHandle;
