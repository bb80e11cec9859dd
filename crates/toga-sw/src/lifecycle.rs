//! Registration lifecycle: installing → waiting → active.
//!
//! A newly installed worker only takes over by itself when nothing is active
//! yet or when no client is controlled by the old one. Otherwise it waits for
//! an explicit `SKIP_WAITING` message; the host never skips waiting on its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use toga_common::{WorkerConfig, DEFAULT_FETCH_TIMEOUT_MS};
use toga_net::{
    fetch_with_timeout, Fetch, HttpFetcher, LoaderConfig, NetError, Request, Response,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::event::FetchEvent;
use crate::precache::PrecacheReport;
use crate::storage::CacheStorage;
use crate::worker::{FetchOutcome, MessageOutcome, OfflineWorker};
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    handlers: Arc<OfflineWorker>,
}

impl ServiceWorker {
    fn new(handlers: Arc<OfflineWorker>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            handlers,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Deployment version this worker serves.
    pub fn version(&self) -> &str {
        self.handlers.version()
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Transition installing to waiting. A previously waiting worker becomes redundant.
    pub fn install_complete(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.set_state(ServiceWorkerState::Installed);
            if let Some(mut superseded) = self.waiting.replace(worker) {
                superseded.set_state(ServiceWorkerState::Redundant);
            }
        }
    }

    /// Promote the waiting worker; the old active worker becomes redundant.
    pub fn activate(&mut self) {
        if let Some(mut worker) = self.waiting.take() {
            if let Some(mut old) = self.active.take() {
                old.set_state(ServiceWorkerState::Redundant);
            }
            worker.set_state(ServiceWorkerState::Activated);
            self.active = Some(worker);
        }
    }
}

/// Service worker events, observed by the page-side update prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// A new version began installing.
    UpdateFound { version: String },
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by a different worker and should reload.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

// ==================== Container ====================

/// Host side of the worker: owns the registration, the shared partitions and
/// the set of controlled clients.
pub struct ServiceWorkerContainer {
    registration: RwLock<ServiceWorkerRegistration>,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetch>,
    clients: RwLock<HashSet<String>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        scope: Url,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetch>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope)),
                storage,
                fetcher,
                clients: RwLock::new(HashSet::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Create a container from a loaded configuration: a network fetcher
    /// sending the configured user agent, and durable partitions under
    /// `storage_dir` when one is set.
    pub async fn from_config(
        config: &WorkerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>)> {
        config.validate()?;
        let fetcher = HttpFetcher::new(LoaderConfig {
            user_agent: config.user_agent.clone(),
            ..LoaderConfig::default()
        })?;
        let storage = match config.storage_dir {
            Some(ref dir) => CacheStorage::open_dir(dir).await?,
            None => CacheStorage::new(),
        };
        Ok(Self::new(config.scope.clone(), storage, Arc::new(fetcher)))
    }

    /// Shared partitions.
    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    /// Install a worker version. It activates right away only when there is no
    /// active worker or no controlled client; otherwise it is left waiting.
    pub async fn register(&self, config: WorkerConfig) -> Result<(ServiceWorkerId, PrecacheReport)> {
        config.validate()?;
        let scope = self.registration.read().await.scope.clone();
        if config.scope != scope {
            return Err(ServiceWorkerError::StateError(format!(
                "worker scope {} does not match registration scope {}",
                config.scope, scope
            )));
        }

        let handlers = Arc::new(OfflineWorker::new(
            Arc::new(config),
            self.storage.clone(),
            Arc::clone(&self.fetcher),
        ));
        let version = handlers.version().to_string();
        let mut worker = ServiceWorker::new(Arc::clone(&handlers));
        let id = worker.id;
        worker.set_state(ServiceWorkerState::Installing);
        self.registration.write().await.installing = Some(worker);

        self.emit(ServiceWorkerEvent::UpdateFound {
            version: version.clone(),
        });
        self.emit_state(id, &version, ServiceWorkerState::Installing);

        let report = match handlers.install().await {
            Ok(report) => report,
            Err(e) => {
                let mut registration = self.registration.write().await;
                if let Some(mut failed) = registration.installing.take() {
                    failed.set_state(ServiceWorkerState::Redundant);
                }
                drop(registration);
                warn!(version = %version, error = %e, "Install failed");
                self.emit_state(id, &version, ServiceWorkerState::Redundant);
                return Err(e);
            }
        };

        let has_active = {
            let mut registration = self.registration.write().await;
            registration.install_complete();
            registration.active.is_some()
        };
        self.emit_state(id, &version, ServiceWorkerState::Installed);

        if !has_active || self.clients.read().await.is_empty() {
            self.activate_waiting().await?;
        } else {
            info!(version = %version, "Installed, waiting for controlled clients");
        }

        Ok((id, report))
    }

    /// Deliver a control message to the waiting worker, or to the active one
    /// when nothing is waiting.
    pub async fn post_message(&self, message: &JsonValue) -> Result<MessageOutcome> {
        let target = {
            let registration = self.registration.read().await;
            registration
                .waiting
                .as_ref()
                .or(registration.active.as_ref())
                .map(|w| Arc::clone(&w.handlers))
        };
        let Some(target) = target else {
            return Ok(MessageOutcome::Ignored);
        };

        let outcome = target.handle_message(message);
        if outcome == MessageOutcome::SkipWaiting {
            self.activate_waiting().await?;
        }
        Ok(outcome)
    }

    /// Route an intercepted request to the active worker. Without one,
    /// nothing is intercepted.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> Result<FetchOutcome> {
        if let Some(ref client_id) = event.client_id {
            self.clients.write().await.insert(client_id.clone());
        }

        let active = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| Arc::clone(&w.handlers));
        match active {
            Some(worker) => worker.handle_fetch(event).await,
            None => Ok(FetchOutcome::Passthrough),
        }
    }

    /// Page-side data load. The request goes through the active worker like
    /// any other page fetch and is abandoned after the worker's fetch timeout.
    pub async fn load_data(&self, url: Url) -> Result<Response> {
        let timeout = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| w.handlers.config().fetch_timeout())
            .unwrap_or(Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS));

        let event = FetchEvent::new(Request::get(url));
        let outcome = tokio::time::timeout(timeout, self.handle_fetch(&event))
            .await
            .map_err(|_| {
                debug!(url = %event.request.url, ?timeout, "Data load aborted");
                NetError::Timeout(timeout)
            })??;

        match outcome {
            FetchOutcome::Respond(response) => Ok(response),
            FetchOutcome::Passthrough => {
                Ok(fetch_with_timeout(self.fetcher.as_ref(), &event.request, timeout).await?)
            }
        }
    }

    /// [`load_data`](Self::load_data) and decode a 2xx JSON body.
    pub async fn load_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.load_data(url).await?;
        if !response.ok() {
            return Err(NetError::RequestFailed(format!(
                "HTTP {} for {}",
                response.status, response.url
            ))
            .into());
        }
        Ok(response.json()?)
    }

    /// A page came under this registration's control.
    pub async fn add_client(&self, client_id: impl Into<String>) {
        self.clients.write().await.insert(client_id.into());
    }

    /// A page closed. When the last one goes, a waiting worker activates.
    pub async fn remove_client(&self, client_id: &str) -> Result<()> {
        let now_empty = {
            let mut clients = self.clients.write().await;
            clients.remove(client_id);
            clients.is_empty()
        };
        if now_empty {
            self.activate_waiting().await?;
        }
        Ok(())
    }

    /// Number of controlled clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// State of the waiting worker, if any.
    pub async fn waiting(&self) -> Option<(ServiceWorkerId, String)> {
        let registration = self.registration.read().await;
        registration
            .waiting
            .as_ref()
            .map(|w| (w.id, w.version().to_string()))
    }

    /// State of the active worker, if any.
    pub async fn active(&self) -> Option<(ServiceWorkerId, String)> {
        let registration = self.registration.read().await;
        registration
            .active
            .as_ref()
            .map(|w| (w.id, w.version().to_string()))
    }

    /// Activate the waiting worker: garbage-collect, promote, claim clients.
    /// Returns `false` when nothing was waiting.
    async fn activate_waiting(&self) -> Result<bool> {
        let (id, handlers) = {
            let mut registration = self.registration.write().await;
            let Some(worker) = registration.waiting.as_mut() else {
                return Ok(false);
            };
            worker.set_state(ServiceWorkerState::Activating);
            (worker.id, Arc::clone(&worker.handlers))
        };
        let version = handlers.version().to_string();
        self.emit_state(id, &version, ServiceWorkerState::Activating);

        // Leftover partitions are retried on the next activation.
        if let Err(e) = handlers.activate().await {
            warn!(version = %version, error = %e, "Garbage collection failed");
        }

        {
            let mut registration = self.registration.write().await;
            if registration.waiting.as_ref().map(|w| w.id) != Some(id) {
                return Ok(false);
            }
            if let Some(ref old) = registration.active {
                self.emit_state(old.id, old.version(), ServiceWorkerState::Redundant);
            }
            registration.activate();
        }
        self.emit_state(id, &version, ServiceWorkerState::Activated);
        info!(version = %version, "Activated");

        for client_id in self.clients.read().await.iter() {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: id,
            });
        }
        Ok(true)
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, version: &str, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            version: version.to_string(),
            new_state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // No observer is fine.
        let _ = self.event_tx.send(event);
    }
}
