//! Wire-level integration tests for the provider engine.

mod common;
mod test_file_server;
mod test_reauth;
mod test_runtime;
