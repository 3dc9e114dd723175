//! In-memory fetcher.
//!
//! Serves responses from a route table instead of the network. Used by offline
//! hosts and throughout the test suites, where it also records every URL it was
//! asked for.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::{strip_fragment, Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Route {
    Respond(Response),
    Redirect(Url),
}

/// A [`Fetcher`] backed by a route table.
///
/// Unrouted URLs answer 404. URLs marked with [`MemoryFetcher::fail`], or every
/// URL while offline, fail with [`NetError::Offline`].
pub struct MemoryFetcher {
    origin: url::Origin,
    routes: Mutex<HashMap<String, Route>>,
    failing: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    /// Create a fetcher for pages served from `origin_url`.
    pub fn new(origin_url: &Url) -> Self {
        Self {
            origin: origin_url.origin(),
            routes: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Serve `response` for `url`.
    pub fn route(&self, url: &Url, response: Response) {
        self.lock_routes()
            .insert(strip_fragment(url), Route::Respond(response));
    }

    /// Redirect `from` to `to`.
    pub fn redirect(&self, from: &Url, to: &Url) {
        self.lock_routes()
            .insert(strip_fragment(from), Route::Redirect(to.clone()));
    }

    /// Make fetches of `url` fail.
    pub fn fail(&self, url: &Url) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(strip_fragment(url));
    }

    /// Toggle whole-network failure.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// URLs fetched so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of fetches so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_failing(&self, key: &str) -> bool {
        self.offline.load(Ordering::SeqCst)
            || self
                .failing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(key)
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let key = strip_fragment(&request.url);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());

        let mut final_url = request.url.clone();
        let mut current = key;
        // Redirect chains stop after 10 hops.
        for _ in 0..10 {
            if self.is_failing(&current) {
                debug!(url = %current, "Memory fetch failing");
                return Err(NetError::Offline(current));
            }

            let route = self.lock_routes().get(&current).cloned();
            match route {
                Some(Route::Respond(response)) => {
                    return Ok(response.tainted(request, &final_url, &self.origin));
                }
                Some(Route::Redirect(target)) => {
                    current = strip_fragment(&target);
                    final_url = target;
                }
                None => {
                    return Ok(Response::new(404, "").tainted(request, &final_url, &self.origin));
                }
            }
        }

        Err(NetError::RequestFailed(format!(
            "too many redirects for {}",
            request.url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResponseType;

    fn url(path: &str) -> Url {
        Url::parse("https://calc.example/").unwrap().join(path).unwrap()
    }

    #[tokio::test]
    async fn test_routes_and_call_log() {
        let fetcher = MemoryFetcher::new(&url("/"));
        fetcher.route(&url("/index.html"), Response::new(200, "<html>"));

        let hit = fetcher.fetch(&Request::get(url("/index.html"))).await.unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.response_type, ResponseType::Basic);

        let miss = fetcher.fetch(&Request::get(url("/nope"))).await.unwrap();
        assert_eq!(miss.status, 404);

        assert_eq!(fetcher.call_count(), 2);
        assert_eq!(fetcher.calls()[0], "https://calc.example/index.html");
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let fetcher = MemoryFetcher::new(&url("/"));
        fetcher.route(&url("/a.js"), Response::new(200, "a"));
        fetcher.fail(&url("/b.js"));

        assert!(matches!(
            fetcher.fetch(&Request::get(url("/b.js"))).await,
            Err(NetError::Offline(_))
        ));

        fetcher.set_offline(true);
        assert!(fetcher.fetch(&Request::get(url("/a.js"))).await.is_err());

        fetcher.set_offline(false);
        assert!(fetcher.fetch(&Request::get(url("/a.js"))).await.is_ok());
    }

    #[tokio::test]
    async fn test_redirect_is_flagged() {
        let fetcher = MemoryFetcher::new(&url("/"));
        fetcher.redirect(&url("/old"), &url("/new"));
        fetcher.route(&url("/new"), Response::new(200, "moved"));

        let response = fetcher.fetch(&Request::get(url("/old"))).await.unwrap();
        assert!(response.redirected);
        assert_eq!(response.url, Some(url("/new")));
        assert_eq!(response.text().unwrap(), "moved");
    }
}
