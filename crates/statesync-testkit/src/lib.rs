//! # Statesync Testkit
//!
//! Testing utilities for statesync.
//!
//! ## Fixtures
//!
//! Quickly set up test scenarios:
//!
//! ```rust,ignore
//! use statesync_testkit::fixtures::wired_pair;
//! use statesync_core::StreamReference;
//!
//! let (host, client) = wired_pair(StreamReference::collection("people")).await;
//! ```
//!
//! ## Property testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use statesync_testkit::generators::tree;
//! use statesync_core::diff;
//!
//! proptest! {
//!     #[test]
//!     fn roundtrip(old in tree(), new in tree()) {
//!         prop_assert_eq!(diff(&old, &new).apply(&old).unwrap(), new);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    init_tracing, key, people_registry, people_store, record, wired_host, wired_pair, Person,
    WiredHost,
};
