//! Request classifier.
//!
//! Rules apply in fixed priority order; destination-based rules win over
//! origin-based ones, so a cross-origin stylesheet is still revalidated in the
//! background instead of going network-first.

use http::Method;
use toga_common::WorkerConfig;
use toga_net::{Destination, Origin, Request};
use tracing::trace;

use crate::partition::PartitionTag;

/// Caching algorithm applied to an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    /// Fresh document with page-level offline fallback.
    Navigation,
}

/// Classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted; the request goes to the network untouched.
    Passthrough,
    Handle {
        strategy: Strategy,
        partition: PartitionTag,
    },
}

impl Route {
    fn handle(strategy: Strategy, partition: PartitionTag) -> Self {
        Route::Handle { strategy, partition }
    }
}

/// Assigns requests to strategies. Holds only immutable tables.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Origin,
    api_host_fragments: Vec<String>,
}

impl Classifier {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            origin: Origin::from_url(&config.scope),
            api_host_fragments: config.api_host_fragments.clone(),
        }
    }

    pub fn classify(&self, request: &Request) -> Route {
        let route = self.route(request);
        trace!(url = %request.url, method = %request.method, ?route, "Classified request");
        route
    }

    fn route(&self, request: &Request) -> Route {
        if request.method != Method::GET {
            return Route::Passthrough;
        }

        if request.is_navigation() {
            return Route::handle(Strategy::Navigation, PartitionTag::AppShell);
        }

        if request.destination == Destination::Image {
            return Route::handle(Strategy::StaleWhileRevalidate, PartitionTag::Images);
        }

        if request.destination.is_static_asset() {
            return Route::handle(Strategy::StaleWhileRevalidate, PartitionTag::Assets);
        }

        if self.is_api_host(request) {
            return Route::handle(Strategy::NetworkFirst, PartitionTag::Api);
        }

        if Origin::from_url(&request.url).same_origin(&self.origin) {
            return Route::handle(Strategy::CacheFirst, PartitionTag::Assets);
        }

        Route::handle(Strategy::NetworkFirst, PartitionTag::Assets)
    }

    fn is_api_host(&self, request: &Request) -> bool {
        let Some(host) = request.url.host_str() else {
            return false;
        };
        self.api_host_fragments
            .iter()
            .any(|fragment| host.contains(fragment.as_str()))
    }
}
