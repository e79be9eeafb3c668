//! End-to-end tests across publish and bootstrap.
//!
//! Each test file covers a specific scenario: one or more sessions open a
//! manager, write through index storages, publish, and a later session
//! reads the result back from the manifest.

#![cfg(test)]

mod helpers;

mod test_concurrent_writers;
mod test_forward_index;
mod test_incremental_sessions;
mod test_publish_bootstrap;
