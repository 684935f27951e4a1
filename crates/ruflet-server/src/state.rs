//! Server shared state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use ruflet_core::Page;
use ruflet_core::config::Config;
use ruflet_core::page::Outbox;
use ruflet_core::props::{IconLookup, NumericIcons};

/// Application entry point, invoked once per registered session.
pub type App = Arc<dyn Fn(&mut Page) -> anyhow::Result<()> + Send + Sync>;

/// A session's page, shared between its worker and broadcast callers.
pub type SharedPage = Arc<Mutex<Page>>;

/// Box an application closure as an [`App`].
pub fn make_app<F>(f: F) -> App
where
    F: Fn(&mut Page) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Shared server state accessible from every connection worker.
pub struct ServerState {
    pub config: Arc<Config>,
    app: App,
    icons: Arc<dyn IconLookup>,
    connections: Mutex<HashMap<String, ConnectionState>>,
    sessions: Mutex<HashMap<String, SharedPage>>,
    shutdown: CancellationToken,
}

/// Per-connection state.
#[derive(Clone)]
pub struct ConnectionState {
    pub conn_key: String,
    pub outbox: Outbox,
    pub cancel: CancellationToken,
}

impl ConnectionState {
    /// Ask the worker to stop reading. Repeated calls are no-ops.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ServerState {
    pub fn new(config: Arc<Config>, app: App) -> Self {
        Self {
            config,
            app,
            icons: Arc::new(NumericIcons),
            connections: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Icon resolver handed to every page registered on this server.
    pub fn with_icons(mut self, icons: Arc<dyn IconLookup>) -> Self {
        self.icons = icons;
        self
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn icons(&self) -> &Arc<dyn IconLookup> {
        &self.icons
    }

    /// Token cancelled when the server stops; connection tokens are children of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn add_connection(&self, conn: ConnectionState) {
        lock(&self.connections).insert(conn.conn_key.clone(), conn);
    }

    /// Drop a connection and its session. Returns whether it was tracked.
    pub fn remove_connection(&self, conn_key: &str) -> bool {
        let removed = lock(&self.connections).remove(conn_key).is_some();
        lock(&self.sessions).remove(conn_key);
        removed
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Copy of the connection table, taken under the lock.
    pub fn snapshot_connections(&self) -> Vec<ConnectionState> {
        lock(&self.connections).values().cloned().collect()
    }

    pub fn set_session(&self, conn_key: &str, page: SharedPage) {
        lock(&self.sessions).insert(conn_key.to_string(), page);
    }

    pub fn session(&self, conn_key: &str) -> Option<SharedPage> {
        lock(&self.sessions).get(conn_key).cloned()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Signal every tracked connection to close.
    pub fn close_all(&self) {
        self.shutdown.cancel();
        for conn in self.snapshot_connections() {
            conn.close();
        }
    }
}
