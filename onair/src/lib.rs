#![cfg_attr(
    test,
    allow(
        clippy::disallowed_methods,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )
)]
// On-air index storage.
//
// Indices are copy-on-write B-trees. Pages written during a session live in
// the novelty buffer; publishing copies them into content-addressed durable
// storage and records the roots in a manifest. The next session starts from
// that manifest and layers its own writes on top at a new revision.
//
// Components:
//  - storage: addresses, novelty, durable backends, pages and the B-tree
//  - index: value containers, write-back cache, inverted and forward indices
//  - config: environment-driven settings for the manager

pub mod config;
mod e2e_tests;
pub mod index;
pub mod storage;
