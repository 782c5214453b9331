use crate::error::ServerError;
use crate::util::lock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{event, Level};

///
/// Things the connection layer tells the front-end about. Nothing here
/// needs an answer, observers only display or record them.
///
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// the first connected reply from the server
    Connected,
    /// connected again after a drop
    Reconnected,
    Disconnected,
    /// another connect attempt was sent, the next one follows in `retry_in`
    Reconnecting { retry_in: Duration },
    /// a control reply which did not start a session
    LoginChanged { accepted: bool },
    ServerError(ServerError),
}

pub trait Observer: Send + Sync {
    fn notify(&self, event: &ClientEvent);
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn notify(&self, client_event: &ClientEvent) {
        match client_event {
            ClientEvent::Connected => event!(Level::INFO, "connection to server has been established"),
            ClientEvent::Reconnected => event!(Level::INFO, "connection to server has been re-established"),
            ClientEvent::Disconnected => event!(Level::WARN, "disconnected from the server"),
            ClientEvent::Reconnecting { retry_in } => event!(
                Level::INFO,
                "trying to establish server connection, trying again in {} seconds",
                retry_in.as_secs()
            ),
            ClientEvent::LoginChanged { accepted } => event!(Level::INFO, "login accepted: {}", accepted),
            ClientEvent::ServerError(err) => event!(Level::ERROR, "{}", err),
        }
    }
}

/// Keeps every event it sees, in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ClientEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, wanted: &ClientEvent) -> usize {
        lock(&self.events)
            .iter()
            .filter(|seen| *seen == wanted)
            .count()
    }
}

impl Observer for RecordingObserver {
    fn notify(&self, client_event: &ClientEvent) {
        lock(&self.events).push(client_event.clone());
    }
}
