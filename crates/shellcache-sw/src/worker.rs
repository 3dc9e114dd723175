//! The offline cache worker.
//!
//! Cache-first for GET requests that are not excluded: a hit is served from
//! the current namespace, a miss goes to the network and same-origin 200
//! responses are written back in the background. When the network fails,
//! navigations get the cached app shell and everything else a plain-text 503.

use std::sync::Arc;

use futures::future::BoxFuture;
use hashbrown::HashMap;
use http::Method;
use shellcache_common::RetryConfig;
use shellcache_net::{Request, Response, ResponseType};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::cache::RequestKey;
use crate::config::WorkerConfig;
use crate::event::{
    ActivationReport, EventKind, EventOutcome, FetchEvent, MessageEvent, NotificationClickEvent,
    PushEvent, SyncEvent, WorkerEvent,
};
use crate::namespace::CacheNamespace;
use crate::notification::{NotificationAction, NotificationOptions};
use crate::registration::ServiceWorkerId;
use crate::scope::WorkerScope;
use crate::ServiceWorkerError;

/// An event handler in the dispatch table.
pub type Handler = for<'a> fn(
    &'a OfflineCacheWorker,
    WorkerEvent,
) -> BoxFuture<'a, Result<EventOutcome, ServiceWorkerError>>;

/// Offline cache worker for one release of the app.
pub struct OfflineCacheWorker {
    id: ServiceWorkerId,
    config: WorkerConfig,
    namespace: CacheNamespace,
    cache_name: String,
    precache: Vec<Url>,
    app_shell: RequestKey,
    open_url: Url,
    notification: NotificationOptions,
    retry: RetryConfig,
    scope: WorkerScope,
    handlers: HashMap<EventKind, Handler>,
}

impl OfflineCacheWorker {
    /// Build a worker from `config`. Every URL in the config is resolved here.
    pub fn new(config: WorkerConfig, scope: WorkerScope) -> Result<Self, ServiceWorkerError> {
        config.validate()?;

        let namespace = config.namespace()?;
        let precache = config.precache_urls()?;
        let app_shell = RequestKey::get(&config.resolve(&config.app_shell)?);
        let open_url = config.resolve(&config.notification.open_url)?;
        let notification = notification_template(&config)?;
        let retry = config.precache_retry.to_retry_config();

        Ok(Self {
            id: ServiceWorkerId::new(),
            cache_name: namespace.to_string(),
            namespace,
            precache,
            app_shell,
            open_url,
            notification,
            retry,
            config,
            scope,
            handlers: handler_table(),
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn namespace(&self) -> &CacheNamespace {
        &self.namespace
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn scope(&self) -> &WorkerScope {
        &self.scope
    }

    /// Events this worker has a handler for.
    pub fn handles(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Route an event to its handler.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        let kind = event.kind();
        let handler = self.handlers.get(&kind).ok_or_else(|| {
            ServiceWorkerError::StateError(format!("no handler for {kind:?} events"))
        })?;
        trace!(worker = self.id.raw(), ?kind, "Dispatching event");
        handler(self, event).await
    }

    // ==================== Lifecycle ====================

    /// Precache the manifest into this release's cache.
    ///
    /// Nothing is stored unless every URL was fetched. On failure the cache
    /// created for this release is removed again and the error is returned.
    pub async fn on_install(&self) -> Result<usize, ServiceWorkerError> {
        info!(
            cache = %self.cache_name,
            urls = self.precache.len(),
            "Installing worker"
        );

        let caches = &self.scope.caches;
        let created = caches.open(&self.cache_name).await;
        let requests = self.precache.iter().cloned().map(Request::get).collect();

        let stored = match caches
            .add_all(&self.cache_name, self.scope.fetcher.as_ref(), requests, &self.retry)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                error!(cache = %self.cache_name, error = %e, "Precache failed");
                if created {
                    caches.delete(&self.cache_name).await;
                }
                return Err(ServiceWorkerError::InstallFailed {
                    namespace: self.cache_name.clone(),
                    source: Box::new(e),
                });
            }
        };

        info!(cache = %self.cache_name, stored, "Precache complete");
        if self.config.skip_waiting_on_install {
            self.scope.skip_waiting();
        }
        Ok(stored)
    }

    /// Delete every cache but the current one, then claim open clients.
    pub async fn on_activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        let caches = &self.scope.caches;
        let mut deleted = Vec::new();

        for name in caches.keys().await {
            if name != self.cache_name && caches.delete(&name).await {
                info!(cache = %name, "Deleted stale cache");
                deleted.push(name);
            }
        }

        let claimed = self
            .scope
            .clients
            .write()
            .await
            .claim(self.id, &self.config.scope);
        info!(
            cache = %self.cache_name,
            deleted = deleted.len(),
            claimed = claimed.len(),
            "Worker activated"
        );

        Ok(ActivationReport { deleted, claimed })
    }

    // ==================== Fetch ====================

    /// Answer a fetch: passthrough, cached response, network response or fallback.
    pub async fn on_fetch(&self, event: FetchEvent) -> EventOutcome {
        let request = &event.request;

        if request.method != Method::GET {
            trace!(method = %request.method, url = %request.url, "Not a GET, passing through");
            return EventOutcome::Passthrough;
        }
        if let Some(pattern) = self.config.exclusions.find_match(&request.url) {
            debug!(url = %request.url, pattern = pattern.as_str(), "Excluded, passing through");
            return EventOutcome::Passthrough;
        }

        let key = RequestKey::for_request(request);
        if let Some(cached) = self.scope.caches.match_in(&self.cache_name, &key).await {
            debug!(%key, "Cache hit");
            return EventOutcome::Respond(cached);
        }

        match self.scope.fetcher.fetch(request).await {
            Ok(response) => {
                if is_cacheable(&response) {
                    let caches = Arc::clone(&self.scope.caches);
                    let cache_name = self.cache_name.clone();
                    let stored = response.clone();
                    event.wait_until(async move {
                        match caches.put(&cache_name, key.clone(), &stored).await {
                            Ok(()) => debug!(%key, "Cached network response"),
                            Err(e) => warn!(%key, error = %e, "Cache write-back failed"),
                        }
                    });
                } else {
                    debug!(
                        %key,
                        status = response.status,
                        response_type = ?response.response_type,
                        "Response not cacheable"
                    );
                }
                EventOutcome::Respond(response)
            }
            Err(e) => {
                warn!(%key, error = %e, "Network fetch failed, serving fallback");
                EventOutcome::Respond(self.offline_fallback(request).await)
            }
        }
    }

    async fn offline_fallback(&self, request: &Request) -> Response {
        if request.is_navigation() {
            if let Some(shell) = self
                .scope
                .caches
                .match_in(&self.cache_name, &self.app_shell)
                .await
            {
                return shell;
            }
            warn!(shell = %self.app_shell, "App shell missing from cache");
        }
        Response::plain_text(503, "Service Unavailable", self.config.offline_message.as_str())
    }

    // ==================== Push, click, message, sync ====================

    /// Show a notification for a push message.
    pub async fn on_push(&self, event: PushEvent) -> EventOutcome {
        let body = event
            .text()
            .unwrap_or_else(|| self.config.notification.default_body.clone());

        let mut options = self.notification.clone();
        options.body = body;
        options.data = serde_json::json!({
            "date_of_arrival": crate::cache::now_millis(),
            "primary_key": 1,
        });

        let shown = self
            .scope
            .notifications
            .show(&self.config.notification.title, options)
            .await;
        info!(id = shown.id.raw(), "Push notification shown");
        EventOutcome::Notified(shown.id)
    }

    /// Close the notification; the view action opens the app.
    pub async fn on_notification_click(
        &self,
        event: NotificationClickEvent,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        self.scope.notifications.close(event.notification.id).await;

        if event.action.as_deref() == Some(self.config.notification.view_action.as_str()) {
            let (client, opened) = self
                .scope
                .clients
                .write()
                .await
                .open_or_focus(&self.open_url)?;
            debug!(client = %client.id, opened, "Notification view action");
        }
        Ok(EventOutcome::Completed)
    }

    /// Handle control messages.
    pub async fn on_message(&self, event: MessageEvent) -> EventOutcome {
        match event.message_type() {
            Some(kind) if kind == self.config.skip_waiting_message => {
                info!(worker = self.id.raw(), "Skip waiting requested by message");
                self.scope.skip_waiting();
            }
            other => debug!(message_type = ?other, "Ignoring message"),
        }
        EventOutcome::Completed
    }

    /// Run background sync for the configured tag.
    pub async fn on_sync(&self, event: SyncEvent) -> Result<EventOutcome, ServiceWorkerError> {
        if event.tag == self.config.sync_tag {
            self.do_background_sync().await?;
        } else {
            debug!(tag = %event.tag, "Ignoring sync");
        }
        Ok(EventOutcome::Completed)
    }

    /// Background sync routine. There is nothing queued to replay yet.
    pub async fn do_background_sync(&self) -> Result<(), ServiceWorkerError> {
        debug!(tag = %self.config.sync_tag, "Background sync");
        Ok(())
    }
}

/// Only same-origin, non-redirected 200 responses are written back.
fn is_cacheable(response: &Response) -> bool {
    response.status == 200 && response.response_type == ResponseType::Basic && !response.redirected
}

fn notification_template(config: &WorkerConfig) -> Result<NotificationOptions, ServiceWorkerError> {
    let settings = &config.notification;
    let actions = settings
        .actions
        .iter()
        .map(|action| {
            Ok(NotificationAction {
                action: action.action.clone(),
                title: action.title.clone(),
                icon: action.icon.as_deref().map(|i| config.resolve(i)).transpose()?,
            })
        })
        .collect::<Result<Vec<_>, ServiceWorkerError>>()?;

    Ok(NotificationOptions {
        body: settings.default_body.clone(),
        icon: Some(config.resolve(&settings.icon)?),
        badge: Some(config.resolve(&settings.badge)?),
        vibrate: settings.vibrate.clone(),
        actions,
        ..NotificationOptions::default()
    })
}

// ==================== Dispatch table ====================

fn handler_table() -> HashMap<EventKind, Handler> {
    let mut table: HashMap<EventKind, Handler> = HashMap::new();
    table.insert(EventKind::Install, install as Handler);
    table.insert(EventKind::Activate, activate as Handler);
    table.insert(EventKind::Fetch, fetch as Handler);
    table.insert(EventKind::Push, push as Handler);
    table.insert(EventKind::NotificationClick, notification_click as Handler);
    table.insert(EventKind::Message, message as Handler);
    table.insert(EventKind::Sync, sync as Handler);
    table
}

fn mismatched<'a>(
    expected: EventKind,
    event: WorkerEvent,
) -> BoxFuture<'a, Result<EventOutcome, ServiceWorkerError>> {
    let message = format!("{:?} handler received a {:?} event", expected, event.kind());
    Box::pin(async move { Err(ServiceWorkerError::StateError(message)) })
}

fn install(
    worker: &OfflineCacheWorker,
    _event: WorkerEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    Box::pin(async move { worker.on_install().await.map(EventOutcome::Installed) })
}

fn activate(
    worker: &OfflineCacheWorker,
    _event: WorkerEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    Box::pin(async move { worker.on_activate().await.map(EventOutcome::Activated) })
}

fn fetch(
    worker: &OfflineCacheWorker,
    event: WorkerEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    match event {
        WorkerEvent::Fetch(event) => Box::pin(async move { Ok(worker.on_fetch(event).await) }),
        other => mismatched(EventKind::Fetch, other),
    }
}

fn push(
    worker: &OfflineCacheWorker,
    event: WorkerEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    match event {
        WorkerEvent::Push(event) => Box::pin(async move { Ok(worker.on_push(event).await) }),
        other => mismatched(EventKind::Push, other),
    }
}

fn notification_click(
    worker: &OfflineCacheWorker,
    event: WorkerEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    match event {
        WorkerEvent::NotificationClick(event) => {
            Box::pin(async move { worker.on_notification_click(event).await })
        }
        other => mismatched(EventKind::NotificationClick, other),
    }
}

fn message(
    worker: &OfflineCacheWorker,
    event: WorkerEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    match event {
        WorkerEvent::Message(event) => Box::pin(async move { Ok(worker.on_message(event).await) }),
        other => mismatched(EventKind::Message, other),
    }
}

fn sync(
    worker: &OfflineCacheWorker,
    event: WorkerEvent,
) -> BoxFuture<'_, Result<EventOutcome, ServiceWorkerError>> {
    match event {
        WorkerEvent::Sync(event) => Box::pin(async move { worker.on_sync(event).await }),
        other => mismatched(EventKind::Sync, other),
    }
}
