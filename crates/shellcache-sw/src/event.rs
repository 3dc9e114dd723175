//! Events delivered to a worker and what handling them produced.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use shellcache_net::{Request, Response};
use tokio::task::JoinSet;
use tracing::warn;

use crate::notification::{Notification, NotificationId};

// ==================== Lifetime ====================

/// Work that must finish after an event handler has returned.
///
/// Tasks registered with [`Lifetime::wait_until`] run on the tokio runtime; the
/// host keeps the worker alive until [`Lifetime::settle`] has drained them.
/// Clones share the same task set.
#[derive(Debug, Clone, Default)]
pub struct Lifetime {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the lifetime until `task` completes.
    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        reap(&mut tasks);
        tasks.spawn(task);
    }

    /// Tasks still running.
    pub fn pending(&self) -> usize {
        let mut tasks = self.lock();
        reap(&mut tasks);
        tasks.len()
    }

    /// Wait for every registered task, including ones registered while
    /// waiting. Returns how many settled.
    pub async fn settle(&self) -> usize {
        let mut settled = 0;
        loop {
            let mut tasks = std::mem::take(&mut *self.lock());
            if tasks.is_empty() {
                return settled;
            }
            while let Some(result) = tasks.join_next().await {
                settled += 1;
                if let Err(e) = result {
                    warn!(error = %e, "Extended task did not complete");
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drop finished tasks so the set only holds in-flight work.
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            warn!(error = %e, "Extended task did not complete");
        }
    }
}

// ==================== Events ====================

/// A fetch event.
#[derive(Debug)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    lifetime: Lifetime,
}

impl FetchEvent {
    pub fn new(request: Request, lifetime: Lifetime) -> Self {
        Self { request, lifetime }
    }

    /// Keep the worker alive until `task` completes, without delaying the response.
    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.lifetime.wait_until(task);
    }
}

/// A push message.
#[derive(Debug, Clone, Default)]
pub struct PushEvent {
    pub data: Option<Bytes>,
}

impl PushEvent {
    /// Payload as text, if present and valid UTF-8.
    pub fn text(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|data| std::str::from_utf8(data).ok())
            .map(str::to_string)
    }
}

/// A click on a notification or one of its actions.
#[derive(Debug, Clone)]
pub struct NotificationClickEvent {
    pub notification: Notification,
    /// Action clicked; `None` for the notification body.
    pub action: Option<String>,
}

/// A message posted to the worker.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: serde_json::Value,
    /// Posting client ID.
    pub source: Option<String>,
}

impl MessageEvent {
    /// The `type` field of an object payload.
    pub fn message_type(&self) -> Option<&str> {
        self.data.get("type").and_then(serde_json::Value::as_str)
    }
}

/// A background sync.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub tag: String,
    /// No further retries will follow.
    pub last_chance: bool,
}

/// Every event a worker can receive.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Push(PushEvent),
    NotificationClick(NotificationClickEvent),
    Message(MessageEvent),
    Sync(SyncEvent),
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Push(_) => EventKind::Push,
            WorkerEvent::NotificationClick(_) => EventKind::NotificationClick,
            WorkerEvent::Message(_) => EventKind::Message,
            WorkerEvent::Sync(_) => EventKind::Sync,
        }
    }
}

/// Event type, the key of a worker's dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Push,
    NotificationClick,
    Message,
    Sync,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Install,
        EventKind::Activate,
        EventKind::Fetch,
        EventKind::Push,
        EventKind::NotificationClick,
        EventKind::Message,
        EventKind::Sync,
    ];
}

// ==================== Outcomes ====================

/// What handling an event produced.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Handled, nothing to report.
    Completed,
    /// Precache stored this many entries.
    Installed(usize),
    /// Not handled; the host should use default network handling.
    Passthrough,
    /// Answer the fetch with this response.
    Respond(Response),
    /// A notification was shown.
    Notified(NotificationId),
    /// Activation finished.
    Activated(ActivationReport),
}

/// Result of activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Caches deleted.
    pub deleted: Vec<String>,
    /// Clients whose controller changed.
    pub claimed: Vec<String>,
}
