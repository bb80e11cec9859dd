//! One deployed worker version and its event handlers.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use toga_common::WorkerConfig;
use toga_net::{Fetch, Response};
use tracing::{debug, info};

use crate::classify::{Classifier, Route};
use crate::event::{FetchEvent, LifetimeExtender};
use crate::gc::collect_garbage;
use crate::partition::PartitionNames;
use crate::precache::{precache, PrecacheReport};
use crate::storage::CacheStorage;
use crate::strategy::StrategyEngine;
use crate::Result;

/// `type` value of the control message that activates a waiting worker.
pub const SKIP_WAITING: &str = "SKIP_WAITING";

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ControlMessage {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

/// The fixed set of events a worker handles.
#[derive(Debug)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Message(JsonValue),
}

/// Result of a dispatched event.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(PrecacheReport),
    /// Partitions deleted by garbage collection.
    Activated(Vec<String>),
    /// The response is ready; background work may still be running under
    /// `lifetime`, which the host awaits before retiring the event.
    Fetch {
        outcome: FetchOutcome,
        lifetime: LifetimeExtender,
    },
    Message(MessageOutcome),
}

/// Result of intercepting a request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Declined; the host performs the request itself.
    Passthrough,
    Respond(Response),
}

impl FetchOutcome {
    pub fn response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::Passthrough => None,
        }
    }
}

/// Result of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    SkipWaiting,
    Ignored,
}

/// Handlers for one worker version. Holds only immutable tables plus shared storage.
pub struct OfflineWorker {
    config: Arc<WorkerConfig>,
    names: PartitionNames,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetch>,
    classifier: Classifier,
    engine: StrategyEngine,
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("version", &self.config.version)
            .field("scope", &self.config.scope.as_str())
            .finish_non_exhaustive()
    }
}

impl OfflineWorker {
    pub fn new(config: Arc<WorkerConfig>, storage: CacheStorage, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            names: PartitionNames::new(config.version.clone()),
            classifier: Classifier::new(&config),
            engine: StrategyEngine::new(Arc::clone(&config), storage.clone(), Arc::clone(&fetcher)),
            config,
            storage,
            fetcher,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn partition_names(&self) -> &PartitionNames {
        &self.names
    }

    /// Route an event to its handler.
    pub async fn dispatch(&self, event: LifecycleEvent) -> Result<EventOutcome> {
        match event {
            LifecycleEvent::Install => self.install().await.map(EventOutcome::Installed),
            LifecycleEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            LifecycleEvent::Fetch(event) => {
                let outcome = self.handle_fetch(&event).await?;
                Ok(EventOutcome::Fetch {
                    outcome,
                    lifetime: event.lifetime().clone(),
                })
            }
            LifecycleEvent::Message(message) => {
                Ok(EventOutcome::Message(self.handle_message(&message)))
            }
        }
    }

    /// Install handler: precache the app shell. This version's partitions may
    /// be recreated again even if an earlier activation deleted them.
    pub async fn install(&self) -> Result<PrecacheReport> {
        info!(version = %self.config.version, "Installing");
        self.storage.revive(&self.names.allowlist()).await;
        precache(&self.config, &self.storage, self.fetcher.as_ref()).await
    }

    /// Activate handler: drop partitions from other versions.
    pub async fn activate(&self) -> Result<Vec<String>> {
        info!(version = %self.config.version, "Activating");
        collect_garbage(&self.storage, &self.names).await
    }

    /// Fetch handler. Background work stays registered on `event`; the host
    /// awaits [`FetchEvent::settled`] before considering the event done.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> Result<FetchOutcome> {
        match self.classifier.classify(&event.request) {
            Route::Passthrough => {
                debug!(url = %event.request.url, method = %event.request.method, "Not intercepted");
                Ok(FetchOutcome::Passthrough)
            }
            Route::Handle {
                strategy,
                partition,
            } => self
                .engine
                .respond(event, strategy, partition)
                .await
                .map(FetchOutcome::Respond),
        }
    }

    /// Message handler. Anything but `{"type": "SKIP_WAITING"}` is ignored.
    pub fn handle_message(&self, message: &JsonValue) -> MessageOutcome {
        match ControlMessage::deserialize(message) {
            Ok(ControlMessage::SkipWaiting) => MessageOutcome::SkipWaiting,
            Err(_) => {
                debug!(%message, "Ignoring message");
                MessageOutcome::Ignored
            }
        }
    }
}
