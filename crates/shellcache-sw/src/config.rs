//! Worker configuration.
//!
//! Every field has a default matching the calculator app's deployment, so an
//! empty JSON object is a valid config file.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellcache_common::RetryConfig;
use shellcache_net::ExclusionList;
use url::Url;

use crate::namespace::CacheNamespace;
use crate::ServiceWorkerError;

/// Scope served when the config file names none.
const DEFAULT_SCOPE: &str = "http://localhost:8080/";

fn default_scope() -> Url {
    static SCOPE: OnceLock<Url> = OnceLock::new();
    SCOPE
        .get_or_init(|| Url::parse(DEFAULT_SCOPE).expect("DEFAULT_SCOPE is a valid URL"))
        .clone()
}

/// Immutable configuration injected into an [`OfflineCacheWorker`](crate::OfflineCacheWorker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Application name, the first half of the cache namespace.
    pub app_name: String,

    /// Release version (semver), the second half of the cache namespace.
    pub version: String,

    /// Scope URL; relative URLs below resolve against it.
    pub scope: Url,

    /// URLs stored at install time, in order.
    pub precache: Vec<String>,

    /// Requests matching any of these are never handled by the worker.
    pub exclusions: ExclusionList,

    /// Document served to navigations while offline.
    pub app_shell: String,

    /// Body of the synthetic 503 response.
    pub offline_message: String,

    /// Ask to activate as soon as install succeeds.
    pub skip_waiting_on_install: bool,

    /// `type` of the control message that forces a waiting worker to activate.
    pub skip_waiting_message: String,

    /// Background sync tag handled by the worker.
    pub sync_tag: String,

    /// Push notification presentation.
    pub notification: NotificationConfig,

    /// Retry policy for precache fetches.
    pub precache_retry: PrecacheRetry,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_name: "hesaplayicilar".to_string(),
            version: "1.0.0".to_string(),
            scope: default_scope(),
            precache: vec![
                "./".to_string(),
                "./index.html".to_string(),
                "./manifest.json".to_string(),
                "https://cdnjs.cloudflare.com/ajax/libs/firebase/9.23.0/firebase-app-compat.min.js"
                    .to_string(),
                "https://cdnjs.cloudflare.com/ajax/libs/firebase/9.23.0/firebase-auth-compat.min.js"
                    .to_string(),
                "https://cdnjs.cloudflare.com/ajax/libs/firebase/9.23.0/firebase-firestore-compat.min.js"
                    .to_string(),
            ],
            exclusions: ExclusionList::substrings([
                "firebase",
                "googleapis",
                "google",
                "admob",
                "googlesyndication",
            ]),
            app_shell: "./index.html".to_string(),
            offline_message: "Offline - check your internet connection".to_string(),
            skip_waiting_on_install: true,
            skip_waiting_message: "SKIP_WAITING".to_string(),
            sync_tag: "background-sync".to_string(),
            notification: NotificationConfig::default(),
            precache_retry: PrecacheRetry::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            ServiceWorkerError::Config(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every derived value can be built.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        self.namespace()?;
        self.precache_urls()?;
        self.resolve(&self.app_shell)?;
        self.resolve(&self.notification.open_url)?;
        if self.precache_retry.max_attempts == 0 {
            return Err(ServiceWorkerError::Config(
                "precache_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The cache namespace for this release.
    pub fn namespace(&self) -> Result<CacheNamespace, ServiceWorkerError> {
        CacheNamespace::new(&self.app_name, &self.version)
    }

    /// Resolve a possibly relative URL against the scope.
    pub fn resolve(&self, url: &str) -> Result<Url, ServiceWorkerError> {
        self.scope
            .join(url)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid URL {url:?}: {e}")))
    }

    /// Precache manifest resolved against the scope.
    pub fn precache_urls(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        self.precache.iter().map(|u| self.resolve(u)).collect()
    }
}

/// One action button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationActionConfig {
    pub action: String,
    pub title: String,
    pub icon: Option<String>,
}

/// How push messages are presented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    /// Body used when the push message carries no text.
    pub default_body: String,
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    pub actions: Vec<NotificationActionConfig>,
    /// Action that opens the app.
    pub view_action: String,
    /// Window opened by the view action.
    pub open_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Hesaplayicilar".to_string(),
            default_body: "A new calculation result is ready!".to_string(),
            icon: "./icon-192.png".to_string(),
            badge: "./icon-96.png".to_string(),
            vibrate: vec![100, 50, 100],
            actions: vec![
                NotificationActionConfig {
                    action: "view".to_string(),
                    title: "View".to_string(),
                    icon: Some("./icon-192.png".to_string()),
                },
                NotificationActionConfig {
                    action: "dismiss".to_string(),
                    title: "Dismiss".to_string(),
                    icon: Some("./icon-192.png".to_string()),
                },
            ],
            view_action: "view".to_string(),
            open_url: "/".to_string(),
        }
    }
}

/// Retry policy for precache fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecacheRetry {
    /// Attempts per URL (1 = no retry).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub initial_delay_ms: u64,
}

impl Default for PrecacheRetry {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 200,
        }
    }
}

impl PrecacheRetry {
    pub fn to_retry_config(self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            ..RetryConfig::default()
        }
    }
}
