//! Service worker container (`navigator.serviceWorker`): the host side that
//! installs, activates and routes events to workers.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use shellcache_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::event::{
    EventOutcome, FetchEvent, MessageEvent, NotificationClickEvent, PushEvent, SyncEvent,
    WorkerEvent,
};
use crate::notification::{Notification, NotificationCenter, NotificationId};
use crate::registration::{
    ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
use crate::scope::WorkerScope;
use crate::worker::OfflineCacheWorker;
use crate::ServiceWorkerError;

/// Service worker events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Update found.
    UpdateFound { registration_scope: String },
    /// Controller changed.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// A worker showed a notification.
    NotificationShown { id: NotificationId, title: String },
    /// Activation deleted a cache.
    CacheDeleted { name: String },
}

/// Service worker container for one scope.
pub struct ServiceWorkerContainer {
    /// Registration for the scope.
    registration: RwLock<ServiceWorkerRegistration>,

    /// Workers held by the registration.
    workers: RwLock<HashMap<ServiceWorkerId, Arc<OfflineCacheWorker>>>,

    /// Host services shared with every worker.
    scope: WorkerScope,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        scope_url: Url,
        caches: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope_url)),
                workers: RwLock::new(HashMap::new()),
                scope: WorkerScope::new(caches, fetcher),
                event_tx,
            },
            event_rx,
        )
    }

    // ==================== Lifecycle ====================

    /// Install a worker built from `config`.
    ///
    /// On success the worker is waiting, or already active if nothing held it
    /// back. On failure it is redundant and the active worker keeps running.
    pub async fn register(&self, config: WorkerConfig) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let worker = self.build_worker(config).await?;
        let id = worker.id();
        let scope = self.scope_string().await;

        let replaced = self
            .registration
            .write()
            .await
            .start_install(ServiceWorker::new(id, worker.namespace().clone()));
        if let Some(replaced) = replaced {
            self.retire(&scope, replaced).await;
        }
        self.workers.write().await.insert(id, Arc::clone(&worker));
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope.clone(),
        });
        self.emit_state(&scope, id, ServiceWorkerState::Installing);

        match worker.dispatch(WorkerEvent::Install).await {
            Ok(_) => {
                let replaced = self.registration.write().await.install_complete()?;
                if let Some(replaced) = replaced {
                    self.retire(&scope, replaced).await;
                }
                self.emit_state(&scope, id, ServiceWorkerState::Installed);
            }
            Err(e) => {
                error!(worker = id.raw(), error = %e, "Install failed");
                self.registration.write().await.install_failed(e.to_string());
                self.workers.write().await.remove(&id);
                self.emit_state(&scope, id, ServiceWorkerState::Redundant);
                return Err(e);
            }
        }

        self.try_activate_waiting().await?;
        Ok(id)
    }

    /// Re-attach the worker for `config` as active without installing it.
    ///
    /// Its cache must already be in the store, as after a host restart with a
    /// persisted store.
    pub async fn resume(&self, config: WorkerConfig) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let worker = self.build_worker(config).await?;
        let namespace = worker.namespace().to_string();
        if !self.scope.caches.has(&namespace).await {
            return Err(ServiceWorkerError::NotFound(format!("cache {namespace}")));
        }

        let id = worker.id();
        let retired = self
            .registration
            .write()
            .await
            .restore_active(ServiceWorker::new(id, worker.namespace().clone()));
        let scope = self.scope_string().await;
        if let Some(retired) = retired {
            self.retire(&scope, retired).await;
        }
        self.workers.write().await.insert(id, worker);

        info!(worker = id.raw(), cache = %namespace, "Resumed active worker");
        self.emit_state(&scope, id, ServiceWorkerState::Activated);
        Ok(id)
    }

    /// Activate the waiting worker if nothing holds it back.
    ///
    /// A waiting worker activates when it asked to skip waiting, when there is
    /// no active worker, or when the active worker controls no clients.
    pub async fn try_activate_waiting(&self) -> Result<bool, ServiceWorkerError> {
        let (waiting_id, active_id) = {
            let registration = self.registration.read().await;
            match registration.waiting.as_ref() {
                Some(waiting) => (waiting.id, registration.active.as_ref().map(|a| a.id)),
                None => return Ok(false),
            }
        };
        let worker = self.worker(waiting_id).await?;

        let held_by = match active_id {
            Some(active) if !worker.scope().skip_waiting_requested() => {
                self.scope.clients.read().await.controlled_by(active)
            }
            _ => 0,
        };
        if held_by > 0 {
            debug!(worker = waiting_id.raw(), clients = held_by, "Worker waiting");
            return Ok(false);
        }

        let scope = self.scope_string().await;
        let retired = self.registration.write().await.begin_activation()?;
        if let Some(retired) = retired {
            self.retire(&scope, retired).await;
        }
        self.emit_state(&scope, waiting_id, ServiceWorkerState::Activating);

        if let EventOutcome::Activated(report) = worker.dispatch(WorkerEvent::Activate).await? {
            for name in report.deleted {
                self.emit(ServiceWorkerEvent::CacheDeleted { name });
            }
            for client_id in report.claimed {
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    worker_id: waiting_id,
                });
            }
        }

        self.registration.write().await.finish_activation()?;
        self.emit_state(&scope, waiting_id, ServiceWorkerState::Activated);
        Ok(true)
    }

    /// Unregister: every worker becomes redundant. Caches are kept.
    pub async fn unregister(&self) -> bool {
        let scope = self.scope_string().await;
        let removed = self.registration.write().await.unregister();
        let any = !removed.is_empty();
        for worker in removed {
            self.retire(&scope, worker).await;
        }
        any
    }

    // ==================== Events ====================

    /// Fetch through the active worker, or straight from the network when
    /// there is none or it passes the request through.
    pub async fn handle_fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        if let Some(worker) = self.active_worker().await {
            let event = FetchEvent::new(request.clone(), self.scope.lifetime.clone());
            if let EventOutcome::Respond(response) = worker.dispatch(WorkerEvent::Fetch(event)).await? {
                return Ok(response);
            }
        }
        Ok(self.scope.fetcher.fetch(&request).await?)
    }

    /// Deliver a push message to the active worker.
    pub async fn push(&self, data: Option<Bytes>) -> Result<Option<Notification>, ServiceWorkerError> {
        let worker = self.require_active().await?;
        let outcome = worker.dispatch(WorkerEvent::Push(PushEvent { data })).await?;

        let EventOutcome::Notified(id) = outcome else {
            return Ok(None);
        };
        let shown = self.scope.notifications.get(id).await;
        if let Some(ref notification) = shown {
            self.emit(ServiceWorkerEvent::NotificationShown {
                id,
                title: notification.title.clone(),
            });
        }
        Ok(shown)
    }

    /// Deliver a click on notification `id` (or one of its actions).
    pub async fn notification_click(
        &self,
        id: NotificationId,
        action: Option<&str>,
    ) -> Result<(), ServiceWorkerError> {
        let worker = self.require_active().await?;
        let notification = self
            .scope
            .notifications
            .get(id)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {}", id.raw())))?;

        worker
            .dispatch(WorkerEvent::NotificationClick(NotificationClickEvent {
                notification,
                action: action.map(str::to_string),
            }))
            .await?;
        Ok(())
    }

    /// Post a message to the waiting worker, or the active one if none is
    /// waiting, then activate the waiting worker if the message released it.
    pub async fn post_message(
        &self,
        data: serde_json::Value,
        source: Option<String>,
    ) -> Result<(), ServiceWorkerError> {
        let target = {
            let registration = self.registration.read().await;
            registration
                .waiting
                .as_ref()
                .or(registration.active.as_ref())
                .map(|w| w.id)
        };
        let target =
            target.ok_or_else(|| ServiceWorkerError::StateError("no worker to message".to_string()))?;

        self.worker(target)
            .await?
            .dispatch(WorkerEvent::Message(MessageEvent { data, source }))
            .await?;
        self.try_activate_waiting().await?;
        Ok(())
    }

    /// Fire a background sync on the active worker.
    pub async fn sync(&self, tag: &str, last_chance: bool) -> Result<(), ServiceWorkerError> {
        self.require_active()
            .await?
            .dispatch(WorkerEvent::Sync(SyncEvent {
                tag: tag.to_string(),
                last_chance,
            }))
            .await?;
        Ok(())
    }

    // ==================== Clients ====================

    /// Open a page at `url`; it is controlled by the active worker when in scope.
    pub async fn add_client(&self, url: Url) -> Client {
        let mut client = Client::window(url);
        let registration = self.registration.read().await;
        if let Some(active) = registration.active.as_ref() {
            if client.in_scope(&registration.scope) {
                client.controller = Some(active.id);
            }
        }
        drop(registration);

        debug!(client = %client.id, controller = ?client.controller, "Client added");
        self.scope.clients.write().await.add(client.clone());
        client
    }

    /// Close a page. Closing the last page of the active worker may let a
    /// waiting worker activate.
    pub async fn remove_client(&self, id: &str) -> Result<Option<Client>, ServiceWorkerError> {
        let removed = self.scope.clients.write().await.remove(id);
        if removed.is_some() {
            self.try_activate_waiting().await?;
        }
        Ok(removed)
    }

    /// Wait for every extended event lifetime (cache write-backs) to settle.
    pub async fn wait_idle(&self) -> usize {
        self.scope.lifetime.settle().await
    }

    // ==================== Accessors ====================

    pub async fn active_id(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.active.as_ref().map(|w| w.id)
    }

    pub async fn waiting_id(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.waiting.as_ref().map(|w| w.id)
    }

    /// State of a worker still held by the registration.
    pub async fn state_of(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        self.registration.read().await.state_of(id)
    }

    pub fn caches(&self) -> &Arc<CacheStorage> {
        &self.scope.caches
    }

    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.scope.clients
    }

    pub fn notifications(&self) -> &Arc<NotificationCenter> {
        &self.scope.notifications
    }

    // ==================== Helpers ====================

    async fn build_worker(
        &self,
        config: WorkerConfig,
    ) -> Result<Arc<OfflineCacheWorker>, ServiceWorkerError> {
        let scope_url = self.registration.read().await.scope.clone();
        if config.scope != scope_url {
            return Err(ServiceWorkerError::Config(format!(
                "worker scope {} does not match container scope {scope_url}",
                config.scope
            )));
        }
        Ok(Arc::new(OfflineCacheWorker::new(
            config,
            self.scope.for_new_worker(),
        )?))
    }

    async fn worker(&self, id: ServiceWorkerId) -> Result<Arc<OfflineCacheWorker>, ServiceWorkerError> {
        self.workers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker {}", id.raw())))
    }

    async fn active_worker(&self) -> Option<Arc<OfflineCacheWorker>> {
        let id = self.active_id().await?;
        self.workers.read().await.get(&id).cloned()
    }

    async fn require_active(&self) -> Result<Arc<OfflineCacheWorker>, ServiceWorkerError> {
        self.active_worker()
            .await
            .ok_or_else(|| ServiceWorkerError::StateError("no active worker".to_string()))
    }

    async fn retire(&self, scope: &str, worker: ServiceWorker) {
        info!(worker = worker.id.raw(), cache = %worker.namespace, "Worker redundant");
        self.workers.write().await.remove(&worker.id);
        self.emit_state(scope, worker.id, ServiceWorkerState::Redundant);
    }

    async fn scope_string(&self) -> String {
        self.registration.read().await.scope.to_string()
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}
