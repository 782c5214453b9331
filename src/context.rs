use crate::cache::ResultCache;
use crate::command::Command;
use crate::config::ClientSettings;
use crate::events::{ClientEvent, Observer};
use crate::networking::connection::Connection;
use crate::poll::PollScheduler;
use crate::request::RequestTracker;
use crate::util::lock;
use crate::storage::SessionStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{event, Level};

///
/// What the server has told us about itself and our login, shared by every
/// connection of a client.
///
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerState {
    pub connected: bool,
    pub accepted: bool,
    pub guest_allowed: bool,
    pub version: String,
    pub debug: bool,
    pub locales: Value,
    pub translations: Value,
    /// set once the server confirmed a connect or reconnect
    pub startup_update: bool,
}

///
/// The process wide registries of one client: request ids and the result
/// cache, the poll scheduler, the shared server state, the active-command
/// registry and the connections. Created by `Client::connect` and torn down
/// with `shutdown`.
///
pub struct ClientContext {
    settings: ClientSettings,
    requests: RequestTracker,
    scheduler: PollScheduler,
    observer: Arc<dyn Observer>,
    state: RwLock<ServerState>,
    commands: Mutex<HashMap<u64, Command>>,
    next_command_key: AtomicU64,
    connections: Mutex<Vec<Weak<Connection>>>,
    session: Mutex<SessionStore>,
}

impl ClientContext {
    pub fn new(
        settings: ClientSettings,
        observer: Arc<dyn Observer>,
        session: SessionStore,
    ) -> Arc<Self> {
        let cache = ResultCache::new(settings.cache_capacity);
        let requests = RequestTracker::new(cache, settings.cache_default_ttl());
        Arc::new(ClientContext {
            settings,
            requests,
            scheduler: PollScheduler::new(),
            observer,
            state: RwLock::new(ServerState::default()),
            commands: Mutex::new(HashMap::new()),
            next_command_key: AtomicU64::new(0),
            connections: Mutex::new(vec![]),
            session: Mutex::new(session),
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn requests(&self) -> &RequestTracker {
        &self.requests
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn next_id(&self) -> u64 {
        self.requests.next_id()
    }

    pub fn notify(&self, client_event: ClientEvent) {
        self.observer.notify(&client_event);
    }

    pub fn server_state(&self) -> ServerState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_state<F: FnOnce(&mut ServerState)>(&self, f: F) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }

    pub fn is_accepted(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .accepted
    }

    pub fn session_id(&self) -> String {
        lock(&self.session).session_id.clone()
    }

    pub fn locale(&self) -> Option<String> {
        lock(&self.session).locale.clone()
    }

    pub fn set_locale(&self, locale: &str) -> std::io::Result<()> {
        lock(&self.session).set_locale(locale)
    }

    pub(crate) fn next_command_key(&self) -> u64 {
        self.next_command_key.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register_command(&self, key: u64, command: Command) {
        lock(&self.commands).insert(key, command);
    }

    pub fn deregister_command(&self, key: u64) -> bool {
        lock(&self.commands).remove(&key).is_some()
    }

    pub fn is_command_active(&self, key: u64) -> bool {
        lock(&self.commands).contains_key(&key)
    }

    pub fn active_commands(&self) -> Vec<Command> {
        lock(&self.commands).values().cloned().collect()
    }

    pub fn register_connection(&self, connection: &Arc<Connection>) {
        let mut connections = lock(&self.connections);
        connections.retain(|weak| weak.strong_count() > 0);
        connections.push(Arc::downgrade(connection));
    }

    /// Every connection of this client which is still alive.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.connections)
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }

    ///
    /// Stop every poll loop, drop the active commands and clear each
    /// connection's pending handlers without running them.
    ///
    pub fn shutdown(&self) {
        event!(Level::INFO, "shutting down client context");
        self.scheduler.shutdown();
        let commands: Vec<Command> = lock(&self.commands).drain().map(|(_, cmd)| cmd).collect();
        for command in commands {
            command.cancel_polling();
        }
        for connection in self.connections() {
            connection.teardown();
        }
    }
}
