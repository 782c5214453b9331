use crate::command::{Command, CommandIds};
use crate::config::ClientSettings;
use crate::context::{ClientContext, ServerState};
use crate::events::Observer;
use crate::networking::api_message::FunctionCall;
use crate::networking::connection::{Connection, ControlCallback};
use crate::networking::socket::WsTransport;
use crate::request::{Callback, Memoize, Request};
use crate::storage::SessionStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{event, Level};

const LOGIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

///
/// A connected client: the default connection (primary, runs the heartbeat
/// and bootstrap), the push notification channel and the command channel,
/// all sharing one `ClientContext`.
///
pub struct Client {
    context: Arc<ClientContext>,
    default: Arc<Connection>,
    push: Arc<Connection>,
    command: Arc<Connection>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    ///
    /// Load the session store, open the three websocket connections and
    /// start the heartbeat. With credentials in the settings the client
    /// logs in once the server answered the first connect.
    ///
    pub async fn connect(settings: ClientSettings, observer: Arc<dyn Observer>) -> crate::Result<Self> {
        let session = SessionStore::load_or_create(&settings.data_dir)?;
        event!(Level::INFO, "connecting to {} as {}", settings.server_url, session.session_id);
        let context = ClientContext::new(settings.clone(), observer, session);

        let mut tasks = vec![];
        let default = open_connection(&context, &settings.client_name, true, "", &mut tasks)?;
        let push = open_connection(&context, "push", false, &settings.push_namespace, &mut tasks)?;
        let command = open_connection(&context, "command", false, &settings.command_namespace, &mut tasks)?;

        let mut client = Client::from_parts(context, default, push, command);
        client.tasks = tasks;
        client.start();
        Ok(client)
    }

    /// Assemble a client from connections made elsewhere. Nothing runs
    /// until `start`.
    pub fn from_parts(
        context: Arc<ClientContext>,
        default: Arc<Connection>,
        push: Arc<Connection>,
        command: Arc<Connection>,
    ) -> Self {
        Client {
            context,
            default,
            push,
            command,
            tasks: vec![],
        }
    }

    pub fn start(&self) {
        self.default.start_heartbeat();
        let credentials = match self.context.settings().credentials.clone() {
            Some(credentials) => credentials,
            None => return,
        };
        let default = self.default.clone();
        self.context.scheduler().poll_func(
            move || {
                if !default.is_connected() {
                    return false;
                }
                default.handshake(&credentials.username, &credentials.password, None);
                true
            },
            self.context.settings().heartbeat_timeout(),
            LOGIN_POLL_INTERVAL,
        );
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    pub fn settings(&self) -> &ClientSettings {
        self.context.settings()
    }

    pub fn server_state(&self) -> ServerState {
        self.context.server_state()
    }

    pub fn default_connection(&self) -> &Arc<Connection> {
        &self.default
    }

    pub fn push_connection(&self) -> &Arc<Connection> {
        &self.push
    }

    pub fn command_connection(&self) -> &Arc<Connection> {
        &self.command
    }

    /// Call a server function on the default connection.
    pub fn call_func(
        &self,
        call: FunctionCall,
        callback: Option<Callback>,
        memoize: Memoize,
    ) -> Arc<Request> {
        self.default.call_func(call, callback, memoize)
    }

    pub fn call_raw(&self, payload: Vec<FunctionCall>, callback: Option<Callback>) -> Arc<Request> {
        self.default.call_raw(payload, callback)
    }

    /// Track jobs through the command channel.
    pub fn track(&self, ids: impl Into<CommandIds>) -> crate::Result<Command> {
        Command::new(ids, self.command.clone())
    }

    pub fn track_with(
        &self,
        ids: impl Into<CommandIds>,
        connection: Arc<Connection>,
    ) -> crate::Result<Command> {
        Command::new(ids, connection)
    }

    pub fn login(&self, username: &str, password: &str, callback: Option<ControlCallback>) -> u64 {
        self.default.handshake(username, password, callback)
    }

    pub fn logout(&self) -> u64 {
        self.default.disconnect()
    }

    ///
    /// Remember `locale` in the session store. When logged in the server is
    /// told right away and translations are reloaded.
    ///
    pub fn set_locale(&self, locale: &str) -> crate::Result<()> {
        self.context.set_locale(locale)?;
        if self.context.is_accepted() {
            self.default.call_func(
                FunctionCall::new("set_config").arg("cfg", json!({ "client.translation_locale": locale })),
                None,
                Memoize::Off,
            );
            self.default.get_translations(Some(locale.to_string()));
        }
        Ok(())
    }

    /// Stop all loops and sockets and wait for their tasks to end.
    pub async fn shutdown(self) {
        self.context.shutdown();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    event!(Level::ERROR, "client task failed: {}", err);
                }
            }
        }
        event!(Level::INFO, "client shut down");
    }
}

fn open_connection(
    context: &Arc<ClientContext>,
    name: &str,
    primary: bool,
    namespace: &str,
    tasks: &mut Vec<JoinHandle<()>>,
) -> crate::Result<Arc<Connection>> {
    let url = context.settings().url_for(namespace)?;
    let (transport, events, socket) = WsTransport::spawn(
        url,
        context.settings().socket_redial(),
        context.scheduler().subscribe(),
    );
    let connection = Connection::new(name, primary, context.clone(), transport);
    tasks.push(socket);
    tasks.push(connection.spawn_dispatch(events));
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::networking::api_message::ControlCommand;
    use crate::test_utilities::mocks::{
        accept, mock_connection, rpc_reply, test_context, test_context_with, MockTransport,
    };
    use serde_json::Value;
    use std::sync::Mutex;

    fn mock_client(
        context: Arc<crate::context::ClientContext>,
    ) -> (Client, Arc<MockTransport>, Arc<MockTransport>) {
        let (default, default_transport) = mock_connection(&context, "webclient", true);
        let (push, _) = mock_connection(&context, "push", false);
        let (command, command_transport) = mock_connection(&context, "command", false);
        (
            Client::from_parts(context, default, push, command),
            default_transport,
            command_transport,
        )
    }

    #[tokio::test]
    async fn calls_and_commands_use_their_channels() {
        let (context, _) = test_context();
        let (client, default_transport, command_transport) = mock_client(context);
        accept(client.default_connection());
        accept(client.command_connection());
        default_transport.clear();

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        client.call_func(
            FunctionCall::new("list_files").arg("path", "/"),
            Some(Callback::plain(move |data, _| *sink.lock().unwrap() = data)),
            Memoize::Off,
        );
        let envelope = default_transport.last_call("list_files").unwrap();
        assert_eq!(envelope.msg.name, "webclient");
        client
            .default_connection()
            .on_server_call(rpc_reply(envelope.id, "list_files", json!(["a"])));
        assert_eq!(*seen.lock().unwrap(), Some(json!(["a"])));

        let command = client.track(vec![3u64, 4]).unwrap();
        command.check_status();
        let envelope = command_transport.last_call("get_command_state").unwrap();
        assert_eq!(envelope.msg.name, "command");
        assert!(client.track(Vec::<u64>::new()).is_err());
    }

    #[tokio::test]
    async fn locale_is_sent_when_logged_in() {
        let (context, _) = test_context();
        let (client, default_transport, _) = mock_client(context);
        client.set_locale("de").unwrap();
        assert!(default_transport.last_call("set_config").is_none());
        assert_eq!(client.context().locale().as_deref(), Some("de"));

        accept(client.default_connection());
        default_transport.clear();
        client.set_locale("fr").unwrap();
        let envelope = default_transport.last_call("set_config").unwrap();
        assert_eq!(
            envelope.msg.data[0].args["cfg"],
            json!({"client.translation_locale": "fr"})
        );
        let envelope = default_transport.last_call("get_translations").unwrap();
        assert_eq!(envelope.msg.data[0].args["locale"], Value::from("fr"));
    }

    #[tokio::test(start_paused = true)]
    async fn configured_credentials_log_in_after_connect() {
        let mut settings = ClientSettings::default();
        settings.credentials = Some(Credentials {
            username: "admin".to_string(),
            password: "secret".to_string(),
        });
        let (context, _) = test_context_with(settings);
        let (client, default_transport, _) = mock_client(context);
        client.start();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let handshakes = |transport: &MockTransport| {
            transport
                .commands()
                .into_iter()
                .filter(|message| message.command == ControlCommand::Handshake)
                .collect::<Vec<_>>()
        };
        assert!(handshakes(&default_transport).is_empty());

        accept(client.default_connection());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = handshakes(&default_transport);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].extra["username"], json!("admin"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handshakes(&default_transport).len(), 1);
        client.shutdown().await;
    }
}
