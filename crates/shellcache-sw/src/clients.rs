//! Clients API: the pages a worker controls.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::registration::ServiceWorkerId;
use crate::ServiceWorkerError;

/// A client (controlled page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Frame type.
    pub frame_type: FrameType,

    /// Visibility state.
    pub visibility_state: VisibilityState,

    /// Whether focused.
    pub focused: bool,

    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Auxiliary,
    TopLevel,
    Nested,
    None,
}

/// Visibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    Hidden,
    Visible,
}

impl Client {
    /// A visible, unfocused, uncontrolled top-level window at `url`.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            frame_type: FrameType::TopLevel,
            visibility_state: VisibilityState::Visible,
            focused: false,
            controller: None,
        }
    }

    /// Focus the client.
    pub fn focus(&mut self) -> Result<(), ServiceWorkerError> {
        if self.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }
        self.focused = true;
        self.visibility_state = VisibilityState::Visible;
        Ok(())
    }

    /// Whether the client's URL falls under `scope`.
    pub fn in_scope(&self, scope: &Url) -> bool {
        self.url.as_str().starts_with(scope.as_str())
    }
}

/// Options for `Clients::match_all`.
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Match clients, sorted by ID.
    ///
    /// `controller` restricts the result to clients of one worker unless
    /// `include_uncontrolled` is set.
    pub fn match_all(
        &self,
        controller: Option<ServiceWorkerId>,
        options: &ClientMatchOptions,
    ) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller == controller)
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Open a focused window at `url`.
    pub fn open_window(&mut self, url: &Url) -> Client {
        let mut client = Client::window(url.clone());
        client.focused = true;
        debug!(client = %client.id, url = %url, "Opening window");
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Focus an existing window at `url`, or open one.
    ///
    /// Returns the client and whether a new window was opened.
    pub fn open_or_focus(&mut self, url: &Url) -> Result<(Client, bool), ServiceWorkerError> {
        let existing = self
            .clients
            .values_mut()
            .filter(|c| c.client_type == ClientType::Window && c.url == *url)
            .min_by(|a, b| a.id.cmp(&b.id));

        match existing {
            Some(client) => {
                client.focus()?;
                debug!(client = %client.id, url = %url, "Focusing window");
                Ok((client.clone(), false))
            }
            None => Ok((self.open_window(url), true)),
        }
    }

    /// Focus a client by ID.
    pub fn focus(&mut self, id: &str) -> Result<(), ServiceWorkerError> {
        self.clients
            .get_mut(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))?
            .focus()
    }

    /// Make `worker` the controller of every client in `scope`.
    ///
    /// Returns the IDs of clients whose controller changed, sorted.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.in_scope(scope) && c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    /// Number of clients controlled by `worker`.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:08}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Url {
        Url::parse("https://calc.example/").unwrap()
    }

    #[test]
    fn test_open_window() {
        let mut clients = Clients::new();
        let client = clients.open_window(&scope());

        assert!(client.focused);
        assert_eq!(client.client_type, ClientType::Window);
        assert_eq!(clients.get(&client.id), Some(&client));
    }

    #[test]
    fn test_open_or_focus_reuses_window() {
        let mut clients = Clients::new();
        let mut page = Client::window(scope());
        page.visibility_state = VisibilityState::Hidden;
        let id = page.id.clone();
        clients.add(page);

        let (client, opened) = clients.open_or_focus(&scope()).unwrap();
        assert!(!opened);
        assert_eq!(client.id, id);
        assert!(client.focused);
        assert_eq!(clients.len(), 1);

        let other = scope().join("/history").unwrap();
        let (_, opened) = clients.open_or_focus(&other).unwrap();
        assert!(opened);
        assert_eq!(clients.len(), 2);
    }

    #[test]
    fn test_focus_non_window_fails() {
        let mut clients = Clients::new();
        let mut worker = Client::window(scope());
        worker.client_type = ClientType::Worker;
        let id = worker.id.clone();
        clients.add(worker);

        assert!(matches!(
            clients.focus(&id),
            Err(ServiceWorkerError::StateError(_))
        ));
        assert!(matches!(
            clients.focus("client-missing"),
            Err(ServiceWorkerError::NotFound(_))
        ));
    }

    #[test]
    fn test_claim_only_in_scope() {
        let mut clients = Clients::new();
        let inside = Client::window(scope().join("/index.html").unwrap());
        let outside = Client::window(Url::parse("https://other.example/").unwrap());
        let inside_id = inside.id.clone();
        clients.add(inside);
        clients.add(outside);

        let worker = ServiceWorkerId::new();
        assert_eq!(clients.claim(worker, &scope()), vec![inside_id.clone()]);
        assert_eq!(clients.controlled_by(worker), 1);

        // Claiming again changes nothing.
        assert!(clients.claim(worker, &scope()).is_empty());
    }

    #[test]
    fn test_match_all_filters_by_controller() {
        let mut clients = Clients::new();
        clients.add(Client::window(scope()));
        clients.add(Client::window(scope()));
        let worker = ServiceWorkerId::new();

        let options = ClientMatchOptions::default();
        assert!(clients.match_all(Some(worker), &options).is_empty());

        clients.claim(worker, &scope());
        assert_eq!(clients.match_all(Some(worker), &options).len(), 2);

        let all = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::All,
        };
        assert_eq!(clients.match_all(None, &all).len(), 2);
    }
}
