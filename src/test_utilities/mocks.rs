use crate::config::ClientSettings;
use crate::context::ClientContext;
use crate::error::TransportError;
use crate::events::RecordingObserver;
use crate::networking::api_message::{
    ControlCommand, ControlMessage, ControlReply, OutboundFrame, RpcEnvelope, RpcReply,
    RpcReplyBody,
};
use crate::networking::connection::Connection;
use crate::networking::transport::Transport;
use crate::util::lock;
use crate::storage::SessionStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Records every frame it is asked to send. A closed mock refuses frames.
#[derive(Debug)]
pub struct MockTransport {
    open: AtomicBool,
    frames: Mutex<Vec<OutboundFrame>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            open: AtomicBool::new(true),
            frames: Mutex::new(vec![]),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<OutboundFrame> {
        lock(&self.frames).clone()
    }

    pub fn server_calls(&self) -> Vec<RpcEnvelope> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::ServerCall(envelope) => Some(envelope),
                OutboundFrame::Command(_) => None,
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<ControlMessage> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Command(message) => Some(message),
                OutboundFrame::ServerCall(_) => None,
            })
            .collect()
    }

    /// The last call sent for `fname`.
    pub fn last_call(&self, fname: &str) -> Option<RpcEnvelope> {
        self.server_calls()
            .into_iter()
            .rev()
            .find(|envelope| envelope.msg.data.iter().any(|call| call.fname == fname))
    }

    pub fn clear(&self) {
        lock(&self.frames).clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        lock(&self.frames).push(frame);
        Ok(())
    }
}

pub fn test_context() -> (Arc<ClientContext>, RecordingObserver) {
    test_context_with(ClientSettings::default())
}

pub fn test_context_with(settings: ClientSettings) -> (Arc<ClientContext>, RecordingObserver) {
    let observer = RecordingObserver::new();
    let context = ClientContext::new(
        settings,
        Arc::new(observer.clone()),
        SessionStore::ephemeral(),
    );
    (context, observer)
}

pub fn mock_connection(
    context: &Arc<ClientContext>,
    name: &str,
    primary: bool,
) -> (Arc<Connection>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let connection = Connection::new(name, primary, context.clone(), transport.clone());
    (connection, transport)
}

pub fn control_reply(id: u64, command: ControlCommand, status: bool, accepted: bool) -> ControlReply {
    ControlReply {
        id,
        command: Some(command),
        status,
        accepted,
        guest_allowed: false,
        version: "1.0".to_string(),
    }
}

/// A batch reply carrying one result for `fname`.
pub fn rpc_reply(id: u64, fname: &str, data: Value) -> RpcReply {
    RpcReply {
        id,
        msg: Some(RpcReplyBody {
            session: String::new(),
            error: None,
            data: json!([{ "fname": fname, "data": data }]),
        }),
    }
}

/// Open the socket and have the server confirm an accepted connection.
pub fn accept(connection: &Arc<Connection>) {
    connection.on_open();
    connection.on_command(control_reply(0, ControlCommand::Connect, true, true));
}
