//! Notifications shown by the worker.
//!
//! The host has no OS notification UI; the center records what is showing so
//! a host can render it and tests can inspect it.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// Unique identifier for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// An action button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: Option<Url>,
}

/// Options passed to `show`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: Option<Url>,
    pub badge: Option<Url>,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    /// Arbitrary data handed back on click.
    pub data: serde_json::Value,
    pub actions: Vec<NotificationAction>,
    pub tag: Option<String>,
}

/// A notification currently showing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub options: NotificationOptions,
}

impl Notification {
    /// Find an action by name.
    pub fn action(&self, action: &str) -> Option<&NotificationAction> {
        self.options.actions.iter().find(|a| a.action == action)
    }
}

/// Notifications currently showing.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    showing: RwLock<HashMap<NotificationId, Notification>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a notification. One with the same tag is replaced.
    pub async fn show(&self, title: &str, options: NotificationOptions) -> Notification {
        let notification = Notification {
            id: NotificationId::new(),
            title: title.to_string(),
            options,
        };

        let mut showing = self.showing.write().await;
        if let Some(tag) = notification.options.tag.as_deref() {
            showing.retain(|_, n| n.options.tag.as_deref() != Some(tag));
        }
        debug!(id = notification.id.raw(), title, "Showing notification");
        showing.insert(notification.id, notification.clone());
        notification
    }

    /// Close a notification. Returns it if it was showing.
    pub async fn close(&self, id: NotificationId) -> Option<Notification> {
        self.showing.write().await.remove(&id)
    }

    pub async fn get(&self, id: NotificationId) -> Option<Notification> {
        self.showing.read().await.get(&id).cloned()
    }

    /// Everything showing, oldest first.
    pub async fn list(&self) -> Vec<Notification> {
        let mut list: Vec<_> = self.showing.read().await.values().cloned().collect();
        list.sort_by_key(|n| n.id);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_show_and_close() {
        let center = NotificationCenter::new();
        let shown = center
            .show(
                "Result",
                NotificationOptions {
                    body: "42".to_string(),
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(center.get(shown.id).await, Some(shown.clone()));
        assert_eq!(center.close(shown.id).await, Some(shown.clone()));
        assert!(center.close(shown.id).await.is_none());
        assert!(center.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_tag_replaces() {
        let center = NotificationCenter::new();
        let tagged = || NotificationOptions {
            tag: Some("result".to_string()),
            ..Default::default()
        };
        center.show("first", tagged()).await;
        let second = center.show("second", tagged()).await;
        center.show("untagged", NotificationOptions::default()).await;

        let list = center.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], second);
    }
}
