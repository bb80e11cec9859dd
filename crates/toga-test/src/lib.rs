//! # TOGA Test
//!
//! Test doubles for the TOGA offline worker. Only ever a dev-dependency.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use toga_test::MockFetcher;
//!
//! let fetcher = Arc::new(MockFetcher::new());
//! fetcher.respond(&url, 200, "body");
//! fetcher.pause();
//! ```

pub mod fetcher;

pub use fetcher::MockFetcher;
