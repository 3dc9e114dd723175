//! The host services a worker runs against (its global scope).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shellcache_net::Fetcher;
use tokio::sync::RwLock;

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::event::Lifetime;
use crate::notification::NotificationCenter;

/// Handles shared by the host and its workers.
///
/// Everything except the skip-waiting flag is shared between workers; each
/// worker gets its own flag through [`WorkerScope::for_new_worker`].
#[derive(Clone)]
pub struct WorkerScope {
    /// Cache storage (the `caches` global).
    pub caches: Arc<CacheStorage>,

    /// Network access.
    pub fetcher: Arc<dyn Fetcher>,

    /// Controlled pages.
    pub clients: Arc<RwLock<Clients>>,

    /// Notifications shown by any worker.
    pub notifications: Arc<NotificationCenter>,

    /// Extended event lifetimes.
    pub lifetime: Lifetime,

    skip_waiting: Arc<AtomicBool>,
}

impl WorkerScope {
    pub fn new(caches: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            caches,
            fetcher,
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(NotificationCenter::new()),
            lifetime: Lifetime::new(),
            skip_waiting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Same host services, fresh skip-waiting flag.
    pub fn for_new_worker(&self) -> Self {
        Self {
            skip_waiting: Arc::new(AtomicBool::new(false)),
            ..self.clone()
        }
    }

    /// Ask to activate without waiting for controlled clients to close.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shellcache_net::MemoryFetcher;
    use url::Url;

    #[test]
    fn test_skip_waiting_flag_is_per_worker() {
        let origin = Url::parse("https://calc.example/").unwrap();
        let scope = WorkerScope::new(
            Arc::new(CacheStorage::new()),
            Arc::new(MemoryFetcher::new(&origin)),
        );
        let next = scope.for_new_worker();

        next.skip_waiting();
        assert!(next.skip_waiting_requested());
        assert!(!scope.skip_waiting_requested());
        assert!(Arc::ptr_eq(&scope.caches, &next.caches));
        assert!(Arc::ptr_eq(&scope.clients, &next.clients));
    }
}
