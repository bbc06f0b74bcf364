//! Common test infrastructure
//!
//! This module provides everything end-to-end harvest tests need: an isolated
//! data directory, a scripted source and generated image fixtures.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{bar_png, Harness, ScriptedSource, MUSEUM};
//!
//! #[tokio::test]
//! async fn test_single_download() {
//!     let harness = Harness::new();
//!     let source = ScriptedSource::new(MUSEUM).with_image("https://a/1.png", bar_png(0xaa, 90, 80));
//!     let report = harness.run(vec![std::sync::Arc::new(source)]).await;
//!     assert_eq!(report.total_downloaded(), 1);
//! }
//! ```

#![allow(dead_code)]

mod constants;
mod fixtures;
mod harness;
mod source;

// Public API - this is what tests import
pub use constants::*;
pub use fixtures::{bar_jpeg, bar_png};
pub use harness::Harness;
pub use source::ScriptedSource;
