//! # shellcache net
//!
//! Request/response model and network access for the shellcache service worker.
//!
//! ## Design Goals
//!
//! 1. **Buffered bodies**: responses carry their body as [`Bytes`], so a response
//!    can be handed to a page and written to a cache without re-reading a stream
//! 2. **Fetch seam**: everything that touches the network goes through [`Fetcher`]
//! 3. **Response tainting**: responses are classified as basic, cors or opaque
//!    relative to the fetching origin, the way a browser does
//! 4. **URL patterns**: coarse substring and stricter domain matching for
//!    request exclusion lists

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use mime::Mime;
use serde::{Deserialize, Serialize};
use shellcache_common::ShellCacheError;
use thiserror::Error;
use url::Url;

pub mod http_fetcher;
pub mod memory;
pub mod pattern;

pub use http_fetcher::{HttpFetcher, LoaderConfig};
pub use memory::MemoryFetcher;
pub use pattern::{ExclusionList, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("Unexpected status {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<NetError> for ShellCacheError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Timeout(duration) => ShellCacheError::Timeout(duration),
            NetError::InvalidUrl(url) => ShellCacheError::InvalidArgument(url),
            other => ShellCacheError::network_with_source("fetch failed", other),
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// What kind of resource a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestDestination {
    /// `fetch()`/XHR and anything without a more specific type.
    #[default]
    Empty,
    /// Top-level document navigation.
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
}

/// Request mode, which decides how cross-origin responses are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Cross-origin responses are readable (`cors` tainting).
    #[default]
    Cors,
    /// Cross-origin responses are opaque.
    NoCors,
    /// Only same-origin URLs are allowed.
    SameOrigin,
    /// A navigation.
    Navigate,
}

/// A request as seen by the service worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub destination: RequestDestination,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            destination: RequestDestination::Empty,
            mode: RequestMode::Cors,
        }
    }

    /// Create a top-level document navigation.
    pub fn navigate(url: Url) -> Self {
        Self {
            destination: RequestDestination::Document,
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Set the mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this request is a top-level document load.
    pub fn is_navigation(&self) -> bool {
        self.destination == RequestDestination::Document
    }
}

/// How a response is exposed to the page that fetched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    Basic,
    /// Cross-origin response fetched in cors mode.
    Cors,
    /// Cross-origin response fetched in no-cors mode; status 0, nothing readable.
    Opaque,
    /// Constructed by the worker rather than fetched.
    #[default]
    Default,
    /// Network error.
    Error,
}

/// A fully buffered HTTP response.
///
/// Cloning shares the body buffer, so the same response can be returned to a
/// page and persisted to a cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Final URL after redirects, `None` for constructed responses.
    pub url: Option<Url>,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
    /// Whether at least one redirect was followed.
    pub redirected: bool,
}

impl Response {
    /// Construct a response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        let status_text = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self {
            url: None,
            status,
            status_text,
            headers: HeaderMap::new(),
            body: body.into(),
            response_type: ResponseType::Default,
            redirected: false,
        }
    }

    /// Construct a `text/plain` response with an explicit reason phrase.
    pub fn plain_text(status: u16, status_text: &str, body: impl Into<String>) -> Self {
        let mut response = Self::new(status, Bytes::from(body.into()));
        response.status_text = status_text.to_string();
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        response
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parsed `Content-Type`.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Apply response tainting for a fetch of `request` that ended at `final_url`.
    ///
    /// Opaque responses lose their status, headers and body.
    pub fn tainted(mut self, request: &Request, final_url: &Url, origin: &url::Origin) -> Self {
        self.response_type = classify(request, final_url, origin);
        self.redirected = strip_fragment(final_url) != strip_fragment(&request.url);
        self.url = Some(final_url.clone());
        if self.response_type == ResponseType::Opaque {
            self.status = 0;
            self.status_text.clear();
            self.headers.clear();
            self.body = Bytes::new();
        }
        self
    }
}

/// Decide the response type for a fetch that ended at `final_url`.
pub fn classify(request: &Request, final_url: &Url, origin: &url::Origin) -> ResponseType {
    if final_url.origin() == *origin {
        ResponseType::Basic
    } else if request.mode == RequestMode::NoCors {
        ResponseType::Opaque
    } else {
        ResponseType::Cors
    }
}

/// URL string without its fragment; fragments never reach the network or a cache key.
pub fn strip_fragment(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// Something that can perform a network fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a request. Non-2xx statuses are responses, not errors.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
