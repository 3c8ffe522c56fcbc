//! Supporting utilities: path sanitization, MIME lookup, file-URL payloads
//! and a small LRU cache.

pub mod file_url;
pub mod lru;
pub mod mime;
pub mod sanitize;
