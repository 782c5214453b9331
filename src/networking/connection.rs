use crate::context::ClientContext;
use crate::error::ServerError;
use crate::events::ClientEvent;
use crate::networking::api_message::{
    ControlCommand, ControlMessage, ControlReply, ExceptionEvent, FunctionCall, FunctionResult,
    InboundFrame, OutboundFrame, RpcEnvelope, RpcMessage, RpcReply, RpcReplyBody,
};
use crate::networking::reconnect::ReconnectSchedule;
use crate::networking::transport::{Transport, TransportEvent};
use crate::poll::PollHandle;
use crate::request::{Callback, Memoize, Request};
use crate::util::lock;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{event, Level};

/// Run once with the reply to the control message it was registered for.
pub type ControlCallback = Box<dyn FnOnce(&ControlReply) + Send>;

const AUTHENTICATED: &str = "Authenticated";

struct ConnectionState {
    session: String,
    connected: bool,
    socket_connected: bool,
    initial_socket_connection: bool,
    first_connect: bool,
    disconnected_once: bool,
    reconnecting: bool,
    bootstrapped: bool,
    pending: HashMap<u64, Arc<Request>>,
    queue: VecDeque<RpcEnvelope>,
    control_callbacks: HashMap<u64, ControlCallback>,
    schedule: ReconnectSchedule,
    reconnect_loop: Option<PollHandle>,
    heartbeat: Option<PollHandle>,
}

///
/// One logical channel to the server: the session, the handshake and
/// reconnect protocol, pending requests by id and the queue of calls made
/// while the channel was not usable.
///
/// The primary connection drives the heartbeat and the reconnect loop and
/// runs the bootstrap calls after a handshake. Control replies update the
/// connected flag of every connection of the client.
///
pub struct Connection {
    name: String,
    primary: bool,
    context: Arc<ClientContext>,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn new(
        name: &str,
        primary: bool,
        context: Arc<ClientContext>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let schedule = ReconnectSchedule::new(context.settings().retry_intervals());
        let connection = Arc::new(Connection {
            name: name.to_string(),
            primary,
            context: context.clone(),
            transport,
            state: Mutex::new(ConnectionState {
                session: String::new(),
                connected: false,
                socket_connected: false,
                initial_socket_connection: false,
                first_connect: true,
                disconnected_once: false,
                reconnecting: false,
                bootstrapped: false,
                pending: HashMap::new(),
                queue: VecDeque::new(),
                control_callbacks: HashMap::new(),
                schedule,
                reconnect_loop: None,
                heartbeat: None,
            }),
        });
        context.register_connection(&connection);
        connection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    pub fn session(&self) -> String {
        lock(&self.state).session.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn is_socket_connected(&self) -> bool {
        lock(&self.state).socket_connected
    }

    pub fn is_reconnecting(&self) -> bool {
        lock(&self.state).reconnecting
    }

    /// connected, accepted and with an open socket
    pub fn is_ready(&self) -> bool {
        let accepted = self.context.is_accepted();
        let state = lock(&self.state);
        accepted && state.connected && state.socket_connected
    }

    pub fn queued(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    pub fn handle_event(self: &Arc<Self>, transport_event: TransportEvent) {
        match transport_event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Closed => self.on_close(),
            TransportEvent::Frame(InboundFrame::Command(data)) => {
                match serde_json::from_value::<ControlReply>(data) {
                    Ok(reply) => self.on_command(reply),
                    Err(err) => event!(Level::WARN, "{}: dropping malformed control reply: {}", self.name, err),
                }
            }
            TransportEvent::Frame(InboundFrame::ServerCall(data)) => {
                match serde_json::from_value::<RpcReply>(data) {
                    Ok(reply) => self.on_server_call(reply),
                    Err(err) => event!(Level::WARN, "{}: dropping malformed reply: {}", self.name, err),
                }
            }
            TransportEvent::Frame(InboundFrame::Exception(data)) => {
                match serde_json::from_value::<ExceptionEvent>(data) {
                    Ok(exception) => self.on_error(exception),
                    Err(err) => event!(Level::WARN, "{}: dropping malformed exception: {}", self.name, err),
                }
            }
        }
    }

    /// Feed transport events into this connection until the transport or
    /// the client shuts down.
    pub fn spawn_dispatch(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let connection = self.clone();
        let mut shutdown = self.context.scheduler().subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    transport_event = events.recv() => match transport_event {
                        Some(transport_event) => connection.handle_event(transport_event),
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            event!(Level::DEBUG, "{}: dispatch loop ended", connection.name);
        })
    }

    pub fn on_open(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            state.socket_connected = true;
            state.initial_socket_connection = true;
        }
        event!(Level::INFO, "{}: socket connected", self.name);
        if self.primary {
            self.send_command(ControlCommand::Connect, Map::new(), None);
        }
        self.flush_queue();
    }

    pub fn on_close(&self) {
        {
            let mut state = lock(&self.state);
            state.connected = false;
            state.socket_connected = false;
            state.disconnected_once = true;
            state.bootstrapped = false;
            state.session.clear();
        }
        self.context.update_state(|state| state.connected = false);
        event!(Level::WARN, "{}: socket disconnected", self.name);
        if self.primary {
            self.context.notify(ClientEvent::Disconnected);
        }
        for command in self.context.active_commands() {
            command.stop_local();
        }
    }

    /// Start the heartbeat on this connection. Only the primary connection
    /// runs one.
    pub fn start_heartbeat(self: &Arc<Self>) {
        if !self.primary {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = self.context.scheduler().poll_func(
            move || match weak.upgrade() {
                Some(connection) => {
                    connection.heartbeat();
                    false
                }
                None => true,
            },
            self.context.settings().heartbeat_timeout(),
            self.context.settings().heartbeat_interval(),
        );
        if let Some(previous) = lock(&self.state).heartbeat.replace(handle) {
            previous.cancel();
        }
    }

    ///
    /// Ask the server for its status and, if the last reply said we are not
    /// connected, start the reconnect loop unless one is already running.
    ///
    pub fn heartbeat(self: &Arc<Self>) {
        self.send_command(ControlCommand::Status, Map::new(), None);
        let mut state = lock(&self.state);
        if state.connected || state.reconnecting || !state.initial_socket_connection {
            return;
        }
        event!(Level::INFO, "{}: starting reconnection", self.name);
        state.reconnecting = true;
        let weak: Weak<Connection> = Arc::downgrade(self);
        let handle = self.context.scheduler().poll_func_stagger(
            move || weak.upgrade().and_then(|connection| connection.reconnect_tick()),
            self.context.settings().heartbeat_timeout(),
            self.context.settings().heartbeat_interval(),
        );
        state.reconnect_loop = Some(handle);
    }

    fn reconnect_tick(&self) -> Option<Duration> {
        let retry_in = {
            let mut state = lock(&self.state);
            if state.connected {
                state.reconnecting = false;
                state.reconnect_loop = None;
                return None;
            }
            state.schedule.next_interval()
        };
        event!(Level::INFO, "{}: reconnecting", self.name);
        self.send_command(ControlCommand::Connect, Map::new(), None);
        self.context.notify(ClientEvent::Reconnecting { retry_in });
        Some(retry_in)
    }

    pub fn on_command(self: &Arc<Self>, reply: ControlReply) {
        let connected = reply.status;
        for connection in self.context.connections() {
            connection.set_connected(connected);
        }
        self.context.update_state(|state| {
            state.connected = connected;
            state.accepted = reply.accepted;
            state.guest_allowed = reply.guest_allowed;
            state.version = reply.version.clone();
            if connected && reply.command.map_or(false, |command| command.is_connect()) {
                state.startup_update = true;
            }
        });

        let handshake = reply.command.map_or(false, |command| command.is_handshake());
        let (starts_session, bootstrap, announce, reconnect_loop, callback) = {
            let mut state = lock(&self.state);
            let starts_session = handshake || (connected && state.first_connect);
            let bootstrap = starts_session && reply.accepted && self.primary && !state.bootstrapped;
            if bootstrap {
                state.bootstrapped = true;
            }
            let mut announce = None;
            let mut reconnect_loop = None;
            if connected {
                if state.first_connect {
                    announce = Some(ClientEvent::Connected);
                } else if state.disconnected_once {
                    announce = Some(ClientEvent::Reconnected);
                }
                state.first_connect = false;
                state.disconnected_once = false;
                state.reconnecting = false;
                state.schedule.reset();
                reconnect_loop = state.reconnect_loop.take();
            } else {
                state.disconnected_once = true;
            }
            let callback = state.control_callbacks.remove(&reply.id);
            (starts_session, bootstrap, announce, reconnect_loop, callback)
        };

        if let Some(handle) = reconnect_loop {
            handle.cancel();
        }
        if bootstrap {
            self.bootstrap();
        } else if !starts_session && self.primary {
            self.context.notify(ClientEvent::LoginChanged {
                accepted: reply.accepted,
            });
        }
        if let Some(client_event) = announce.filter(|_| self.primary) {
            self.context.notify(client_event);
        }
        if connected && reply.accepted {
            for connection in self.context.connections() {
                connection.flush_queue();
            }
        }
        if let Some(callback) = callback {
            callback(&reply);
        }
    }

    pub fn on_server_call(self: &Arc<Self>, reply: RpcReply) {
        let request = lock(&self.state).pending.remove(&reply.id);
        let request = match request {
            Some(request) => request,
            None => {
                event!(Level::WARN, "{}: reply for unknown request {}", self.name, reply.id);
                return;
            }
        };
        let body = match reply.msg {
            Some(body) => body,
            None => {
                event!(Level::WARN, "{}: reply {} has no body", self.name, reply.id);
                return;
            }
        };
        lock(&self.state).session = body.session.clone();

        if let Some(err) = &body.error {
            self.context.notify(ClientEvent::ServerError(err.clone()));
            if err.is_session_expired() {
                self.send_command(ControlCommand::Rehandshake, Map::new(), None);
            }
        }
        if body.data.as_str() == Some(AUTHENTICATED) {
            self.resend(request);
            return;
        }

        let fname = match request.func_name() {
            Some(fname) => fname.to_string(),
            None => {
                request.resolve(Some(raw_body(&body)), None);
                return;
            }
        };
        match body.data {
            Value::Null => request.resolve(None, body.error),
            Value::Array(results) => {
                for result in results {
                    let result = match serde_json::from_value::<FunctionResult>(result) {
                        Ok(result) => result,
                        Err(err) => {
                            event!(Level::WARN, "{}: skipping malformed result: {}", self.name, err);
                            continue;
                        }
                    };
                    if let Some(err) = &result.error {
                        self.context.notify(ClientEvent::ServerError(err.clone()));
                    }
                    if result.fname == fname {
                        request.resolve(Some(result.data), result.error);
                        return;
                    }
                }
                event!(Level::WARN, "{}: reply {} has no result for {}", self.name, reply.id, fname);
            }
            single => request.resolve(Some(single), body.error),
        }
    }

    pub fn on_error(&self, exception: ExceptionEvent) {
        let expired = exception.error.is_session_expired();
        self.context.notify(ClientEvent::ServerError(exception.error));
        if expired {
            self.send_command(ControlCommand::Rehandshake, Map::new(), None);
        }
    }

    /// Build a request for one function and send or queue it.
    pub fn call_func(
        &self,
        call: FunctionCall,
        callback: Option<Callback>,
        memoize: Memoize,
    ) -> Arc<Request> {
        let request = self.context.requests().prepare(call, callback, memoize);
        self.call(request)
    }

    /// Send a batch of calls, the callback receives the whole reply body.
    pub fn call_raw(&self, payload: Vec<FunctionCall>, callback: Option<Callback>) -> Arc<Request> {
        let request = self.context.requests().prepare_raw(payload, callback);
        self.call(request)
    }

    ///
    /// Register the request by id and send it if the connection is ready,
    /// otherwise queue it until the connection becomes usable. A request
    /// which was already dispatched or resolved is returned untouched.
    ///
    pub fn call(&self, request: Arc<Request>) -> Arc<Request> {
        if !request.mark_called() {
            return request;
        }
        let envelope = self.envelope_for(&request);
        request.set_envelope(envelope.clone());
        {
            // decided under the state lock, a flush after accept waits for the push
            let mut state = lock(&self.state);
            state.pending.insert(request.id(), request.clone());
            let ready = self.context.is_accepted() && state.connected && state.socket_connected;
            if !ready {
                event!(Level::DEBUG, "{}: queueing request {}", self.name, request.id());
                state.queue.push_back(envelope);
                return request;
            }
        }
        if let Err(err) = self.transport.send(OutboundFrame::ServerCall(envelope.clone())) {
            event!(Level::WARN, "{}: queueing request {}: {}", self.name, request.id(), err);
            lock(&self.state).queue.push_back(envelope);
        }
        request
    }

    fn resend(&self, request: Arc<Request>) {
        let envelope = self.envelope_for(&request);
        request.set_envelope(envelope.clone());
        let socket_connected = {
            let mut state = lock(&self.state);
            state.pending.insert(request.id(), request.clone());
            state.socket_connected
        };
        event!(Level::DEBUG, "{}: resending request {}", self.name, request.id());
        if !socket_connected {
            lock(&self.state).queue.push_back(envelope);
            return;
        }
        if let Err(err) = self.transport.send(OutboundFrame::ServerCall(envelope.clone())) {
            event!(Level::WARN, "{}: queueing request {}: {}", self.name, request.id(), err);
            lock(&self.state).queue.push_back(envelope);
        }
    }

    fn envelope_for(&self, request: &Request) -> RpcEnvelope {
        RpcEnvelope {
            session_id: self.context.session_id(),
            id: request.id(),
            msg: RpcMessage {
                session: self.session(),
                name: self.name.clone(),
                data: request.payload().to_vec(),
            },
        }
    }

    /// Send queued calls in the order they were made. Stops at the first
    /// failure and keeps the rest queued.
    pub fn flush_queue(&self) {
        let mut queued = {
            let mut state = lock(&self.state);
            if !state.socket_connected || state.queue.is_empty() {
                return;
            }
            std::mem::take(&mut state.queue)
        };
        event!(Level::DEBUG, "{}: flushing {} queued calls", self.name, queued.len());
        while let Some(envelope) = queued.pop_front() {
            if let Err(err) = self.transport.send(OutboundFrame::ServerCall(envelope.clone())) {
                event!(Level::WARN, "{}: flush interrupted: {}", self.name, err);
                queued.push_front(envelope);
                let mut state = lock(&self.state);
                while let Some(envelope) = queued.pop_back() {
                    state.queue.push_front(envelope);
                }
                return;
            }
        }
    }

    ///
    /// Send a control message and return its id. A callback is run once
    /// with the reply carrying the same id.
    ///
    pub fn send_command(
        &self,
        command: ControlCommand,
        extra: Map<String, Value>,
        callback: Option<ControlCallback>,
    ) -> u64 {
        let id = self.context.next_id();
        {
            let mut state = lock(&self.state);
            if let Some(callback) = callback {
                state.control_callbacks.insert(id, callback);
            }
            if command.is_handshake() {
                state.bootstrapped = false;
            }
        }
        let message = ControlMessage {
            id,
            command,
            session_id: self.context.session_id(),
            extra,
        };
        if let Err(err) = self.transport.send(OutboundFrame::Command(message)) {
            event!(Level::DEBUG, "{}: could not send {:?}: {}", self.name, command, err);
        }
        id
    }

    /// Log in. The server answers with a handshake reply.
    pub fn handshake(&self, username: &str, password: &str, callback: Option<ControlCallback>) -> u64 {
        let mut extra = Map::new();
        extra.insert("username".to_string(), Value::String(username.to_string()));
        extra.insert("password".to_string(), Value::String(password.to_string()));
        self.send_command(ControlCommand::Handshake, extra, callback)
    }

    pub fn disconnect(&self) -> u64 {
        self.send_command(ControlCommand::Disconnect, Map::new(), None)
    }

    /// Forget pending requests, queued calls and control callbacks without
    /// running any of them, and stop this connection's timers.
    pub fn teardown(&self) {
        let (reconnect_loop, heartbeat) = {
            let mut state = lock(&self.state);
            state.pending.clear();
            state.queue.clear();
            state.control_callbacks.clear();
            state.reconnecting = false;
            (state.reconnect_loop.take(), state.heartbeat.take())
        };
        for handle in reconnect_loop.into_iter().chain(heartbeat) {
            handle.cancel();
        }
    }

    ///
    /// The calls which follow an accepted handshake: debug flag, locales
    /// (and the stored locale), update check and translations.
    ///
    fn bootstrap(self: &Arc<Self>) {
        event!(Level::INFO, "{}: session accepted, loading server settings", self.name);
        let context = self.context.clone();
        self.call_func(
            FunctionCall::new("get_config").arg("cfg", json!({"core.debug": false})),
            Some(Callback::plain(move |data, error| match (data, error) {
                (Some(data), None) => {
                    let debug = data.get("core.debug").and_then(Value::as_bool).unwrap_or(false);
                    context.update_state(|state| state.debug = debug);
                }
                (_, error) => event!(Level::WARN, "could not read server config: {:?}", error),
            })),
            Memoize::Off,
        );

        let weak = Arc::downgrade(self);
        self.call_func(
            FunctionCall::new("get_locales"),
            Some(Callback::plain(move |data, error| {
                let connection = match weak.upgrade() {
                    Some(connection) => connection,
                    None => return,
                };
                if let Some(error) = error {
                    event!(Level::WARN, "could not read locales: {}", error);
                    return;
                }
                let locales = data.unwrap_or(Value::Null);
                connection.context.update_state(|state| state.locales = locales);
                if let Some(locale) = connection.context.locale() {
                    connection.call_func(
                        FunctionCall::new("set_config")
                            .arg("cfg", json!({ "client.translation_locale": locale })),
                        None,
                        Memoize::Off,
                    );
                }
            })),
            Memoize::Off,
        );

        self.call_func(FunctionCall::new("check_update").arg("push", true), None, Memoize::Off);
        self.get_translations(None);
    }

    pub fn get_translations(&self, locale: Option<String>) -> Arc<Request> {
        let context = self.context.clone();
        self.call_func(
            FunctionCall::new("get_translations").arg_opt("locale", locale),
            Some(Callback::plain(move |data, error| match (data, error) {
                (Some(data), None) => context.update_state(|state| state.translations = data),
                (_, error) => event!(Level::WARN, "could not read translations: {:?}", error),
            })),
            Memoize::Off,
        )
    }
}

fn raw_body(body: &RpcReplyBody) -> Value {
    let mut map = Map::new();
    map.insert("session".to_string(), Value::String(body.session.clone()));
    if let Some(error) = &body.error {
        map.insert("error".to_string(), error_value(error));
    }
    map.insert("data".to_string(), body.data.clone());
    Value::Object(map)
}

fn error_value(error: &ServerError) -> Value {
    let mut map = Map::new();
    map.insert("code".to_string(), Value::from(error.code));
    map.insert("msg".to_string(), Value::String(error.msg.clone()));
    Value::Object(map)
}
