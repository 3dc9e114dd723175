//! # shellcache service worker
//!
//! Offline support for a small web app, written as a service worker against a
//! minimal host runtime.
//!
//! ## Features
//!
//! - **Precache**: the app shell and pinned third-party scripts are stored at install
//! - **Cache-first fetch**: GET requests are served from the cache, then the network,
//!   then an offline fallback
//! - **Versioned caches**: a new namespace on every release; stale ones are dropped on activate
//! - **Lifecycle**: install, skip-waiting, activate, claim
//! - **Push / notification click / message / sync** handlers
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing
//!     │       ├── waiting
//!     │       └── active ──► OfflineCacheWorker
//!     │                          └── dispatch table: EventKind → handler
//!     │
//!     └── WorkerScope (shared with every worker)
//!             ├── CacheStorage ── Cache ── RequestKey → CacheEntry
//!             ├── Fetcher
//!             ├── Clients
//!             └── NotificationCenter
//! ```

use shellcache_common::ShellCacheError;
use shellcache_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod event;
pub mod namespace;
pub mod notification;
pub mod registration;
pub mod scope;
pub mod worker;

pub use cache::{CacheEntry, CacheStorage, RequestKey};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use config::{NotificationConfig, PrecacheRetry, WorkerConfig};
pub use container::{ServiceWorkerContainer, ServiceWorkerEvent};
pub use event::{
    ActivationReport, EventKind, EventOutcome, FetchEvent, Lifetime, MessageEvent,
    NotificationClickEvent, PushEvent, SyncEvent, WorkerEvent,
};
pub use namespace::CacheNamespace;
pub use notification::{
    Notification, NotificationAction, NotificationCenter, NotificationId, NotificationOptions,
};
pub use registration::{
    ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
pub use scope::WorkerScope;
pub use worker::OfflineCacheWorker;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install of {namespace} failed: {source}")]
    InstallFailed {
        namespace: String,
        #[source]
        source: Box<ServiceWorkerError>,
    },

    #[error("Precache of {url} failed: {source}")]
    Precache {
        url: String,
        #[source]
        source: NetError,
    },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl From<ServiceWorkerError> for ShellCacheError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Config(message) => ShellCacheError::config(message),
            ServiceWorkerError::NotFound(what) => ShellCacheError::NotFound(what),
            ServiceWorkerError::Io(e) => ShellCacheError::Io(e),
            ServiceWorkerError::Snapshot(e) => ShellCacheError::Json(e),
            ServiceWorkerError::Network(e) => e.into(),
            e @ (ServiceWorkerError::CacheError(_) | ServiceWorkerError::QuotaExceeded { .. }) => {
                ShellCacheError::cache_with_source("cache store rejected the operation", e)
            }
            e => ShellCacheError::lifecycle_with_source("worker lifecycle failed", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_categories() {
        let quota: ShellCacheError = ServiceWorkerError::QuotaExceeded {
            needed: 10,
            available: 1,
        }
        .into();
        assert_eq!(quota.category(), "cache");

        let install: ShellCacheError = ServiceWorkerError::InstallFailed {
            namespace: "calc-v1.0.0".into(),
            source: Box::new(ServiceWorkerError::Network(NetError::Offline(
                "https://calc.example/".into(),
            ))),
        }
        .into();
        assert_eq!(install.category(), "lifecycle");

        let missing: ShellCacheError = ServiceWorkerError::NotFound("app-v1.0.0".into()).into();
        assert_eq!(missing.category(), "not_found");
    }
}
