//! Extendable events.
//!
//! A handler may return its response before all of its work is done. Any work
//! that outlives the response is handed to [`LifetimeExtender::wait_until`];
//! the host awaits [`LifetimeExtender::settled`] before it considers the event
//! finished and is free to shut the worker down.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use toga_net::Request;
use tracing::warn;

/// Keeps an event pending until registered background work has settled.
#[derive(Debug, Clone, Default)]
pub struct LifetimeExtender {
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl LifetimeExtender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` and keep the event alive until it completes.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track(tokio::spawn(work));
    }

    /// Keep the event alive until an already spawned task completes.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.lock().push(handle);
    }

    /// Number of registered tasks not yet awaited by [`settled`](Self::settled).
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait for every registered task, including ones registered while waiting.
    pub async fn settled(&self) {
        loop {
            let batch: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock());
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background task did not complete");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,

    /// Controlled page that issued the request.
    pub client_id: Option<String>,

    lifetime: LifetimeExtender,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
            lifetime: LifetimeExtender::new(),
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Extend this event's lifetime until `work` completes.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.lifetime.wait_until(work);
    }

    pub fn lifetime(&self) -> &LifetimeExtender {
        &self.lifetime
    }

    /// Resolve once all extended work has finished.
    pub async fn settled(&self) {
        self.lifetime.settled().await;
    }
}
