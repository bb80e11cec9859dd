//! # TOGA Offline Worker
//!
//! Offline caching layer of the TOGA plant catalogue's service worker.
//!
//! ## Features
//!
//! - **Partitions**: versioned cache partitions (`{version}-{tag}`), optionally durable
//! - **Lifecycle**: install (precache), activate (garbage-collect), message-gated skip-waiting
//! - **Fetch interception**: classify each request and run one of four strategies
//! - **Offline navigation**: every page load resolves to a known page or a synthesized 503
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       └── scope
//!     └── OfflineWorker (one per version)
//!             ├── install  → precache   → app-shell partition
//!             ├── activate → gc         → delete other versions
//!             ├── fetch    → Classifier → StrategyEngine
//!             └── message  → SKIP_WAITING
//!
//! CacheStorage
//!     └── Cache ({version}-app-shell | assets | images | api)
//!             └── Request → Response
//! ```

use thiserror::Error;
use toga_common::CommonError;
use toga_net::NetError;

pub mod classify;
pub mod event;
pub mod gc;
pub mod lifecycle;
pub mod navigation;
pub mod partition;
pub mod precache;
pub mod storage;
pub mod strategy;
pub mod worker;

pub use classify::{Classifier, Route, Strategy};
pub use event::{FetchEvent, LifetimeExtender};
pub use gc::collect_garbage;
pub use lifecycle::{
    ServiceWorker, ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerId,
    ServiceWorkerRegistration, ServiceWorkerState,
};
pub use navigation::Page;
pub use partition::{PartitionNames, PartitionTag};
pub use precache::{precache, PrecacheReport};
pub use storage::{Cache, CacheEntry, CacheStorage};
pub use strategy::{offline_response, StrategyEngine, OFFLINE_BODY};
pub use worker::{
    EventOutcome, FetchOutcome, LifecycleEvent, MessageOutcome, OfflineWorker, SKIP_WAITING,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] CommonError),
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
