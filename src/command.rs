use crate::error::{ClientError, ServerError};
use crate::networking::api_message::{CommandState, FunctionCall};
use crate::networking::connection::Connection;
use crate::poll::PollHandle;
use crate::request::{Callback, Memoize};
use crate::util::lock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{event, Level};

/// Called when a command completes or its polling fails.
pub type CommandCallback = Arc<dyn Fn(&Command, Result<(), ClientError>) + Send + Sync>;

const BLOCKING_SPIN: Duration = Duration::from_millis(10);
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(3000);

///
/// Runs when values arrive. `Each` gets every id with its value as soon as
/// it is fetched, and `None` for ids which ended stopped or failed. `Batch`
/// gets the command once per fetched batch.
///
#[derive(Clone)]
pub enum ValueCallback {
    Each(Arc<dyn Fn(u64, Option<Value>) + Send + Sync>),
    Batch(Arc<dyn Fn(&Command) + Send + Sync>),
}

impl ValueCallback {
    fn on_each(&self) -> bool {
        matches!(self, ValueCallback::Each(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandIds {
    Single(u64),
    Many(Vec<u64>),
}

impl From<u64> for CommandIds {
    fn from(id: u64) -> Self {
        CommandIds::Single(id)
    }
}

impl From<Vec<u64>> for CommandIds {
    fn from(ids: Vec<u64>) -> Self {
        CommandIds::Many(ids)
    }
}

impl From<&[u64]> for CommandIds {
    fn from(ids: &[u64]) -> Self {
        CommandIds::Many(ids.to_vec())
    }
}

/// Values or progress of a command. A command made from a single id reads
/// as a single value.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandValue {
    Single(Option<Value>),
    Many(BTreeMap<u64, Value>),
}

#[derive(Default)]
struct CommandInner {
    states: HashMap<u64, CommandState>,
    progress: HashMap<u64, Value>,
    values: HashMap<u64, Value>,
    value_callback: Option<ValueCallback>,
    getting_value: bool,
    stopped: bool,
    error: Option<ServerError>,
    completion: Option<CommandCallback>,
    awaiting_completion: bool,
    completed: bool,
    progress_callback: Option<CommandCallback>,
    polling_progress: bool,
    notified: HashSet<u64>,
    poll: Option<PollHandle>,
    progress_poll: Option<PollHandle>,
}

impl CommandInner {
    fn finished(&self, ids: &[u64], any: bool) -> bool {
        if self.stopped {
            return true;
        }
        let terminal = |id: &u64| self.states.get(id).map_or(false, |state| state.is_terminal());
        if any {
            ids.iter().any(terminal)
        } else {
            ids.iter().all(terminal)
        }
    }

    fn on_each(&self) -> bool {
        self.value_callback.as_ref().map_or(false, ValueCallback::on_each)
    }

    /// every id which finished has its value
    fn values_settled(&self, ids: &[u64]) -> bool {
        self.stopped
            || ids.iter().all(|id| {
                self.states.get(id) != Some(&CommandState::Finished) || self.values.contains_key(id)
            })
    }

    fn apply_states(&mut self, ids: &[u64], data: &Value) {
        for id in ids {
            let reported = match data.get(id.to_string().as_str()) {
                Some(reported) => reported,
                None => continue,
            };
            match CommandState::from_value(reported) {
                Some(reported) => {
                    let current = self.states.get(id).copied();
                    self.states.insert(*id, CommandState::advance(current, reported));
                }
                None => event!(Level::WARN, "unknown state {} for command {}", reported, id),
            }
        }
    }

    fn mark_all(&mut self, ids: &[u64], state: CommandState) {
        for id in ids {
            let current = self.states.get(id).copied();
            self.states.insert(*id, CommandState::advance(current, state));
        }
    }
}

///
/// One or more server side jobs tracked together. Cloning gives another
/// handle to the same command.
///
/// Status, progress and values are fetched through the command's
/// connection, replies update the command from their callbacks. While a
/// completion poll runs, the command sits in the client's active-command
/// registry.
///
#[derive(Clone)]
pub struct Command {
    key: u64,
    ids: Arc<Vec<u64>>,
    single: bool,
    connection: Arc<Connection>,
    inner: Arc<Mutex<CommandInner>>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("key", &self.key)
            .field("ids", &self.ids)
            .field("connection", &self.connection.name())
            .finish()
    }
}

impl Command {
    pub fn new(ids: impl Into<CommandIds>, connection: Arc<Connection>) -> crate::Result<Self> {
        let (ids, single) = match ids.into() {
            CommandIds::Single(id) => (vec![id], true),
            CommandIds::Many(ids) if ids.is_empty() => return Err(ClientError::EmptyCommand),
            CommandIds::Many(ids) => {
                let mut seen = HashSet::new();
                let ids = ids.into_iter().filter(|id| seen.insert(*id)).collect();
                (ids, false)
            }
        };
        Ok(Command {
            key: connection.context().next_command_key(),
            ids: Arc::new(ids),
            single,
            connection,
            inner: Arc::new(Mutex::new(CommandInner::default())),
        })
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// `None` until the server reported a state for `id`.
    pub fn state(&self, id: u64) -> Option<CommandState> {
        lock(&self.inner).states.get(&id).copied()
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.inner).stopped
    }

    pub fn has_error(&self) -> bool {
        lock(&self.inner).error.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.connection.context().is_command_active(self.key)
    }

    ///
    /// True once a stop was requested, or when every id (`any`: at least one
    /// id) is finished, stopped or failed.
    ///
    pub fn finished(&self, any: bool) -> bool {
        lock(&self.inner).finished(&self.ids, any)
    }

    /// every id has a value
    pub fn done(&self) -> bool {
        lock(&self.inner).values.len() == self.ids.len()
    }

    pub fn set_callback(&self, callback: ValueCallback) {
        lock(&self.inner).value_callback = Some(callback);
    }

    fn ids_arg(ids: &[u64]) -> Value {
        Value::from(ids.to_vec())
    }

    fn call(&self, fname: &str, ids: &[u64], on_reply: fn(&Command, Option<Value>, Option<ServerError>)) {
        let command = self.clone();
        self.connection.call_func(
            FunctionCall::new(fname).arg("command_ids", Command::ids_arg(ids)),
            Some(Callback::plain(move |data, error| on_reply(&command, data, error))),
            Memoize::Off,
        );
    }

    /// Ask for the state of every id, unless the command already finished.
    pub fn check_status(&self) {
        if self.finished(false) {
            return;
        }
        self.call("get_command_state", &self.ids, Command::on_status);
    }

    fn on_status(&self, data: Option<Value>, error: Option<ServerError>) {
        match (data, error) {
            (_, Some(err)) if err.is_missing_command() => {
                lock(&self.inner).mark_all(&self.ids, CommandState::Stopped)
            }
            (_, Some(err)) => return self.fail(err),
            (Some(data), None) => lock(&self.inner).apply_states(&self.ids, &data),
            (None, None) => event!(Level::DEBUG, "empty status reply for {:?}", self.ids),
        }
        self.notify_terminal();
    }

    /// Per-id callbacks get `None` for ids which ended stopped or failed.
    fn notify_terminal(&self) {
        let (callback, ids) = {
            let mut inner = lock(&self.inner);
            let callback = match &inner.value_callback {
                Some(ValueCallback::Each(callback)) => callback.clone(),
                _ => return,
            };
            let ids: Vec<u64> = self
                .ids
                .iter()
                .copied()
                .filter(|id| {
                    matches!(
                        inner.states.get(id),
                        Some(CommandState::Stopped) | Some(CommandState::Failed)
                    ) && !inner.values.contains_key(id)
                        && !inner.notified.contains(id)
                })
                .collect();
            inner.notified.extend(ids.iter().copied());
            (callback, ids)
        };
        for id in ids {
            callback(id, None);
        }
    }

    ///
    /// Ask the server to stop every id. Does nothing if a stop was already
    /// requested or the command finished. Ids the server no longer knows
    /// about count as stopped.
    ///
    pub fn stop(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.stopped || inner.finished(&self.ids, false) {
                return;
            }
            inner.stopped = true;
        }
        self.connection.context().deregister_command(self.key);
        event!(Level::INFO, "stopping command {:?}", self.ids);
        self.call("stop_command", &self.ids, Command::on_stop);
    }

    ///
    /// Mark the command stopped without telling the server. Used when the
    /// socket drops, the jobs keep running server side.
    ///
    pub(crate) fn stop_local(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.stopped || inner.finished(&self.ids, false) {
                return;
            }
            inner.stopped = true;
        }
        self.connection.context().deregister_command(self.key);
        event!(Level::DEBUG, "command {:?} stopped locally", self.ids);
    }

    fn on_stop(&self, data: Option<Value>, error: Option<ServerError>) {
        match (data, error) {
            (_, Some(err)) if err.is_missing_command() => {
                lock(&self.inner).mark_all(&self.ids, CommandState::Stopped)
            }
            (_, Some(err)) => event!(Level::WARN, "could not stop command {:?}: {}", self.ids, err),
            (Some(data), None) => lock(&self.inner).apply_states(&self.ids, &data),
            (None, None) => {}
        }
        self.notify_terminal();
    }

    ///
    /// Fetch values of ids which finished and have no value yet, or of
    /// `ids` when given. Only runs once the command finished (with per-id
    /// callbacks: once any id finished) and no other fetch is in flight.
    ///
    pub fn fetch_value(&self, ids: Option<Vec<u64>>) {
        let (fetch, notify, callback) = {
            let mut inner = lock(&self.inner);
            let on_each = inner.on_each();
            if !inner.finished(&self.ids, on_each) || inner.getting_value || inner.stopped {
                return;
            }
            let mut notify = vec![];
            let fetch = match ids {
                Some(ids) => ids
                    .into_iter()
                    .filter(|id| {
                        !matches!(
                            inner.states.get(id),
                            Some(CommandState::Stopped) | Some(CommandState::Failed)
                        )
                    })
                    .collect(),
                None => {
                    let mut fetch = vec![];
                    for id in self.ids.iter() {
                        if inner.values.contains_key(id) {
                            continue;
                        }
                        match inner.states.get(id) {
                            Some(CommandState::Finished) => fetch.push(*id),
                            Some(CommandState::Stopped) | Some(CommandState::Failed)
                                if on_each && !inner.notified.contains(id) =>
                            {
                                notify.push(*id)
                            }
                            _ => {}
                        }
                    }
                    fetch
                }
            };
            inner.notified.extend(notify.iter().copied());
            if !fetch.is_empty() {
                inner.getting_value = true;
            }
            (fetch, notify, inner.value_callback.clone())
        };
        if let Some(ValueCallback::Each(callback)) = &callback {
            for id in notify {
                callback(id, None);
            }
        }
        if !fetch.is_empty() {
            self.call("get_command_value", &fetch, Command::on_value);
        }
    }

    fn on_value(&self, data: Option<Value>, error: Option<ServerError>) {
        if let Some(err) = error {
            if !err.is_missing_command() {
                return self.fail(err);
            }
            {
                let mut inner = lock(&self.inner);
                inner.getting_value = false;
                inner.mark_all(&self.ids, CommandState::Stopped);
            }
            self.notify_terminal();
            self.check_completion();
            return;
        }
        let data = data.unwrap_or(Value::Null);
        let (each, batch) = {
            let mut inner = lock(&self.inner);
            let mut arrived = vec![];
            for id in self.ids.iter() {
                if let Some(value) = data.get(id.to_string().as_str()) {
                    inner.values.insert(*id, value.clone());
                    arrived.push((*id, value.clone()));
                }
            }
            inner.getting_value = false;
            match inner.value_callback.clone() {
                Some(ValueCallback::Each(callback)) => {
                    inner.notified.extend(arrived.iter().map(|(id, _)| *id));
                    (Some((callback, arrived)), None)
                }
                Some(ValueCallback::Batch(callback)) => (None, Some(callback)),
                None => (None, None),
            }
        };
        if let Some((callback, arrived)) = each {
            for (id, value) in arrived {
                callback(id, Some(value));
            }
        }
        if let Some(callback) = batch {
            callback(self);
        }
        self.check_completion();
    }

    pub fn fetch_progress(&self) {
        self.call("get_command_progress", &self.ids, Command::on_progress);
    }

    fn on_progress(&self, data: Option<Value>, error: Option<ServerError>) {
        match (data, error) {
            (_, Some(err)) if err.is_missing_command() => {
                lock(&self.inner).mark_all(&self.ids, CommandState::Stopped);
                self.notify_terminal();
            }
            (_, Some(err)) => self.fail(err),
            (Some(data), None) => {
                let mut inner = lock(&self.inner);
                for id in self.ids.iter() {
                    if let Some(progress) = data.get(id.to_string().as_str()) {
                        inner.progress.insert(*id, progress.clone());
                    }
                }
            }
            (None, None) => {}
        }
    }

    ///
    /// A fetch failed: polling stops and the completion and progress
    /// callbacks are told once.
    ///
    fn fail(&self, err: ServerError) {
        let (completion, progress) = {
            let mut inner = lock(&self.inner);
            inner.error = Some(err.clone());
            inner.getting_value = false;
            let completion = if inner.awaiting_completion && !inner.completed {
                inner.awaiting_completion = false;
                inner.completed = true;
                inner.completion.clone()
            } else {
                None
            };
            let progress = if inner.polling_progress {
                inner.polling_progress = false;
                inner.progress_callback.clone()
            } else {
                None
            };
            (completion, progress)
        };
        event!(Level::WARN, "command {:?} failed: {}", self.ids, err);
        self.connection.context().deregister_command(self.key);
        if let Some(callback) = completion {
            callback(self, Err(ClientError::CommandFetch(err.clone())));
        }
        if let Some(callback) = progress {
            callback(self, Err(ClientError::CommandFetch(err)));
        }
    }

    /// Poll with the configured interval and timeout.
    pub fn poll_until_complete(&self, callback: Option<CommandCallback>) {
        let settings = self.connection.context().settings();
        self.poll_until_complete_with(
            settings.command_poll_interval(),
            settings.command_poll_timeout(),
            callback,
        );
    }

    ///
    /// Poll the command until it finished and its values arrived, then run
    /// `callback` once. While the connection is down ticks do nothing. A
    /// command which already finished completes right away.
    ///
    pub fn poll_until_complete_with(
        &self,
        interval: Duration,
        timeout: Duration,
        callback: Option<CommandCallback>,
    ) {
        if !self.arm_completion(callback) {
            self.fetch_value(None);
            self.check_completion();
            return;
        }
        let command = self.clone();
        let handle = self
            .connection
            .context()
            .scheduler()
            .poll_func(move || command.completion_tick(), timeout, interval);
        if let Some(previous) = lock(&self.inner).poll.replace(handle) {
            previous.cancel();
        }
    }

    /// Set up completion and register the command. Returns whether a poll
    /// loop is needed.
    pub(crate) fn arm_completion(&self, callback: Option<CommandCallback>) -> bool {
        let needs_loop = {
            let mut inner = lock(&self.inner);
            inner.completion = callback;
            inner.awaiting_completion = true;
            inner.completed = false;
            !inner.finished(&self.ids, false)
        };
        if needs_loop {
            self.connection.context().register_command(self.key, self.clone());
        }
        needs_loop
    }

    /// One tick of the completion poll. Returns true once the loop is done.
    pub(crate) fn completion_tick(&self) -> bool {
        {
            let inner = lock(&self.inner);
            if inner.completed || !inner.awaiting_completion || inner.error.is_some() {
                return true;
            }
        }
        if !self.connection.is_connected() {
            return false;
        }
        self.fetch_value(None);
        if !self.finished(false) {
            self.check_status();
            return false;
        }
        self.check_completion()
    }

    fn check_completion(&self) -> bool {
        let callback = {
            let mut inner = lock(&self.inner);
            if inner.completed {
                return true;
            }
            if !inner.awaiting_completion
                || !inner.finished(&self.ids, false)
                || (inner.getting_value && !inner.stopped)
            {
                return false;
            }
            inner.completed = true;
            inner.awaiting_completion = false;
            inner.completion.clone()
        };
        self.connection.context().deregister_command(self.key);
        event!(Level::DEBUG, "command {:?} complete", self.ids);
        if let Some(callback) = callback {
            callback(self, Ok(()));
        }
        true
    }

    /// Poll progress with the configured interval and timeout.
    pub fn poll_progress(&self, callback: Option<CommandCallback>) {
        let settings = self.connection.context().settings();
        self.poll_progress_with(
            settings.progress_poll_interval(),
            settings.command_poll_timeout(),
            callback,
        );
    }

    ///
    /// Fetch progress on every tick and run `callback` after each one, until
    /// the command finished.
    ///
    pub fn poll_progress_with(
        &self,
        interval: Duration,
        timeout: Duration,
        callback: Option<CommandCallback>,
    ) {
        let finished = {
            let mut inner = lock(&self.inner);
            inner.progress_callback = callback.clone();
            let finished = inner.finished(&self.ids, false);
            if !finished {
                inner.polling_progress = true;
            }
            finished
        };
        if finished {
            self.fetch_progress();
            if let Some(callback) = callback {
                callback(self, Ok(()));
            }
            return;
        }
        let command = self.clone();
        let handle = self
            .connection
            .context()
            .scheduler()
            .poll_func(move || command.progress_tick(), timeout, interval);
        if let Some(previous) = lock(&self.inner).progress_poll.replace(handle) {
            previous.cancel();
        }
    }

    pub(crate) fn progress_tick(&self) -> bool {
        {
            let inner = lock(&self.inner);
            if !inner.polling_progress || inner.error.is_some() {
                return true;
            }
        }
        if !self.connection.is_connected() {
            return false;
        }
        if !self.finished(false) {
            self.check_status();
        }
        self.fetch_progress();
        let callback = lock(&self.inner).progress_callback.clone();
        if let Some(callback) = callback {
            callback(self, Ok(()));
        }
        let mut inner = lock(&self.inner);
        let finished = inner.finished(&self.ids, false);
        if finished {
            inner.polling_progress = false;
        }
        finished
    }

    /// Stop both poll loops without reporting anything.
    pub fn cancel_polling(&self) {
        let handles = {
            let mut inner = lock(&self.inner);
            inner.awaiting_completion = false;
            inner.polling_progress = false;
            (inner.poll.take(), inner.progress_poll.take())
        };
        for handle in handles.0.into_iter().chain(handles.1) {
            handle.cancel();
        }
        self.connection.context().deregister_command(self.key);
    }

    fn snapshot(&self, source: &HashMap<u64, Value>) -> CommandValue {
        if self.single {
            CommandValue::Single(source.get(&self.ids[0]).cloned())
        } else {
            CommandValue::Many(source.iter().map(|(id, value)| (*id, value.clone())).collect())
        }
    }

    ///
    /// The values fetched so far. Missing values for `ids` (all ids when
    /// `None`) are requested, they show up in a later read.
    ///
    pub fn get_value(&self, ids: Option<&[u64]>) -> CommandValue {
        let wanted = ids.map(<[u64]>::to_vec).unwrap_or_else(|| self.ids.to_vec());
        let missing: Vec<u64> = {
            let inner = lock(&self.inner);
            wanted
                .into_iter()
                .filter(|id| !inner.values.contains_key(id))
                .collect()
        };
        if !missing.is_empty() {
            self.fetch_value(Some(missing));
        }
        let inner = lock(&self.inner);
        self.snapshot(&inner.values)
    }

    ///
    /// Like `get_value`, but waits until the command finished and its values
    /// arrived. This spins on a short sleep rather than waiting on a signal,
    /// so only use it where blocking the caller is acceptable.
    ///
    pub async fn get_value_blocking(
        &self,
        ids: Option<&[u64]>,
        timeout: Duration,
    ) -> crate::Result<CommandValue> {
        let started = Instant::now();
        self.get_value(ids);
        let needs_poll = {
            let inner = lock(&self.inner);
            !inner.finished(&self.ids, false) && !inner.awaiting_completion
        };
        if needs_poll {
            let poll_timeout = self.connection.context().settings().command_poll_timeout();
            self.poll_until_complete_with(BLOCKING_POLL_INTERVAL, poll_timeout, None);
        }
        loop {
            {
                let inner = lock(&self.inner);
                if let Some(err) = &inner.error {
                    return Err(ClientError::CommandFetch(err.clone()));
                }
                if inner.finished(&self.ids, false)
                    && !inner.getting_value
                    && inner.values_settled(&self.ids)
                {
                    break;
                }
            }
            if started.elapsed() >= timeout {
                return Err(ClientError::Timeout(timeout));
            }
            sleep(BLOCKING_SPIN).await;
        }
        Ok(self.get_value(ids))
    }

    /// Progress read so far. Requests fresh progress if any id has none yet.
    pub fn get_progress(&self, ids: Option<&[u64]>) -> CommandValue {
        let wanted = ids.map(<[u64]>::to_vec).unwrap_or_else(|| self.ids.to_vec());
        let missing = {
            let inner = lock(&self.inner);
            wanted.iter().any(|id| !inner.progress.contains_key(id))
        };
        if missing {
            self.fetch_progress();
        }
        let inner = lock(&self.inner);
        self.snapshot(&inner.progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::api_message::ControlCommand;
    use crate::test_utilities::mocks::{
        accept, control_reply, mock_connection, rpc_reply, test_context, MockTransport,
    };
    use crate::networking::api_message::{RpcReply, RpcReplyBody};
    use serde_json::json;

    fn command_channel() -> (Arc<Connection>, Arc<MockTransport>) {
        let (context, _) = test_context();
        let (connection, transport) = mock_connection(&context, "command", false);
        accept(&connection);
        transport.clear();
        (connection, transport)
    }

    fn reply(connection: &Arc<Connection>, transport: &MockTransport, fname: &str, data: Value) {
        let envelope = transport.last_call(fname).unwrap();
        connection.on_server_call(rpc_reply(envelope.id, fname, data));
    }

    fn reply_error(connection: &Arc<Connection>, transport: &MockTransport, fname: &str, code: i64, msg: &str) {
        let envelope = transport.last_call(fname).unwrap();
        connection.on_server_call(RpcReply {
            id: envelope.id,
            msg: Some(RpcReplyBody {
                session: String::new(),
                error: None,
                data: json!([{"fname": fname, "data": null, "error": {"code": code, "msg": msg}}]),
            }),
        });
    }

    fn count(transport: &MockTransport, fname: &str) -> usize {
        transport
            .server_calls()
            .iter()
            .filter(|envelope| envelope.msg.data[0].fname == fname)
            .count()
    }

    fn completions() -> (Arc<Mutex<Vec<bool>>>, CommandCallback) {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        (
            seen,
            Arc::new(move |_: &Command, result: Result<(), ClientError>| {
                sink.lock().unwrap().push(result.is_ok())
            }),
        )
    }

    #[tokio::test]
    async fn empty_commands_are_rejected() {
        let (connection, _) = command_channel();
        assert!(matches!(
            Command::new(Vec::<u64>::new(), connection),
            Err(ClientError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn finished_is_all_or_any_terminal() {
        let (connection, transport) = command_channel();
        let command = Command::new(vec![1u64, 2, 3], connection.clone()).unwrap();
        assert!(!command.finished(false));
        assert!(!command.finished(true));

        command.check_status();
        reply(&connection, &transport, "get_command_state", json!({"1": "finished", "2": 3, "3": "in_queue"}));
        assert_eq!(command.state(2), Some(CommandState::Started));
        assert!(!command.finished(false));
        assert!(command.finished(true));

        command.check_status();
        reply(&connection, &transport, "get_command_state", json!({"1": "finished", "2": "failed", "3": "stopped"}));
        assert!(command.finished(false));

        // no status query once finished
        command.check_status();
        assert_eq!(count(&transport, "get_command_state"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_command_completes_after_its_value_arrives() {
        let (connection, transport) = command_channel();
        let command = Command::new(5u64, connection.clone()).unwrap();
        let (seen, callback) = completions();
        command.poll_until_complete_with(Duration::from_secs(5), Duration::from_secs(7200), Some(callback));
        assert!(command.is_active());

        // tick 1
        sleep(Duration::from_secs(1)).await;
        assert_eq!(count(&transport, "get_command_state"), 1);
        reply(&connection, &transport, "get_command_state", json!({"5": "started"}));

        // tick 2
        sleep(Duration::from_secs(5)).await;
        assert_eq!(count(&transport, "get_command_state"), 2);
        reply(&connection, &transport, "get_command_state", json!({"5": "finished"}));

        // tick 3
        sleep(Duration::from_secs(5)).await;
        assert_eq!(count(&transport, "get_command_value"), 1);
        assert_eq!(transport.last_call("get_command_value").unwrap().msg.data[0].args["command_ids"], json!([5]));
        assert!(seen.lock().unwrap().is_empty());
        reply(&connection, &transport, "get_command_value", json!({"5": {"path": "/tmp/a"}}));

        assert_eq!(*seen.lock().unwrap(), vec![true]);
        assert!(!command.is_active());
        assert!(command.done());
        assert_eq!(command.get_value(None), CommandValue::Single(Some(json!({"path": "/tmp/a"}))));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(count(&transport, "get_command_state"), 2);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn per_id_callbacks_fire_as_ids_end() {
        let (connection, transport) = command_channel();
        let command = Command::new(vec![5u64, 6], connection.clone()).unwrap();
        let calls = Arc::new(Mutex::new(vec![]));
        let sink = calls.clone();
        command.set_callback(ValueCallback::Each(Arc::new(move |id: u64, value: Option<Value>| {
            sink.lock().unwrap().push((id, value))
        })));
        assert!(command.arm_completion(None));

        assert!(!command.completion_tick());
        reply(&connection, &transport, "get_command_state", json!({"5": "finished", "6": "started"}));

        assert!(!command.completion_tick());
        reply(&connection, &transport, "get_command_value", json!({"5": 10}));
        assert_eq!(*calls.lock().unwrap(), vec![(5, Some(json!(10)))]);
        assert!(!command.finished(false));
        assert!(command.finished(true));

        reply(&connection, &transport, "get_command_state", json!({"5": "finished", "6": "failed"}));
        assert_eq!(*calls.lock().unwrap(), vec![(5, Some(json!(10))), (6, None)]);
        assert!(command.finished(false));

        assert!(command.completion_tick());
        assert!(!command.is_active());
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(command.get_value(None), CommandValue::Many(BTreeMap::from([(5, json!(10))])));
        assert!(!command.done());
    }

    #[tokio::test]
    async fn batch_callback_runs_once_per_batch() {
        let (connection, transport) = command_channel();
        let command = Command::new(vec![1u64, 2], connection.clone()).unwrap();
        let batches = Arc::new(Mutex::new(0));
        let sink = batches.clone();
        command.set_callback(ValueCallback::Batch(Arc::new(move |command: &Command| {
            assert!(command.done());
            *sink.lock().unwrap() += 1;
        })));
        command.check_status();
        reply(&connection, &transport, "get_command_state", json!({"1": "finished", "2": "finished"}));
        command.fetch_value(None);
        // a second fetch waits for the first
        command.fetch_value(None);
        assert_eq!(count(&transport, "get_command_value"), 1);
        reply(&connection, &transport, "get_command_value", json!({"1": "a", "2": "b"}));
        assert_eq!(*batches.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (connection, transport) = command_channel();
        let command = Command::new(vec![1u64, 2], connection.clone()).unwrap();
        command.arm_completion(None);
        assert!(command.is_active());

        command.stop();
        command.stop();
        assert_eq!(count(&transport, "stop_command"), 1);
        assert!(command.is_stopped());
        assert!(command.finished(false));
        assert!(!command.is_active());

        let done = Command::new(3u64, connection.clone()).unwrap();
        done.check_status();
        reply(&connection, &transport, "get_command_state", json!({"3": "finished"}));
        done.stop();
        assert!(!done.is_stopped());
        assert_eq!(count(&transport, "stop_command"), 1);
    }

    #[tokio::test]
    async fn missing_commands_count_as_stopped() {
        let (connection, transport) = command_channel();
        let command = Command::new(vec![8u64, 9], connection.clone()).unwrap();
        command.stop();
        reply_error(&connection, &transport, "stop_command", 400, "Command with id 8 does not exist");
        assert_eq!(command.state(8), Some(CommandState::Stopped));
        assert_eq!(command.state(9), Some(CommandState::Stopped));
        assert!(!command.has_error());

        let unknown = Command::new(11u64, connection.clone()).unwrap();
        unknown.check_status();
        reply_error(&connection, &transport, "get_command_state", 400, "does not exist");
        assert!(unknown.finished(false));
        assert!(!unknown.has_error());
    }

    #[tokio::test]
    async fn fetch_errors_are_reported_once_and_end_polling() {
        let (connection, transport) = command_channel();
        let command = Command::new(4u64, connection.clone()).unwrap();
        let (seen, callback) = completions();
        command.arm_completion(Some(callback));

        assert!(!command.completion_tick());
        reply_error(&connection, &transport, "get_command_state", 500, "boom");
        assert!(command.has_error());
        assert_eq!(*seen.lock().unwrap(), vec![false]);
        assert!(!command.is_active());

        assert!(command.completion_tick());
        assert_eq!(count(&transport, "get_command_state"), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ticks_do_nothing_while_disconnected() {
        let (connection, transport) = command_channel();
        let command = Command::new(4u64, connection.clone()).unwrap();
        command.arm_completion(None);
        connection.on_close();
        // closing the socket stops every active command on this side only
        assert!(command.is_stopped());
        assert!(!command.is_active());
        assert_eq!(connection.queued(), 0);

        let other = Command::new(5u64, connection.clone()).unwrap();
        other.arm_completion(None);
        assert!(!other.completion_tick());
        assert_eq!(count(&transport, "get_command_state"), 0);
    }

    #[tokio::test]
    async fn socket_drop_does_not_stop_server_jobs() {
        let (connection, transport) = command_channel();
        let command = Command::new(42u64, connection.clone()).unwrap();
        command.arm_completion(None);

        connection.on_close();
        connection.on_open();
        connection.on_command(control_reply(0, ControlCommand::Connect, true, true));

        assert!(command.is_stopped());
        assert_eq!(connection.queued(), 0);
        assert_eq!(count(&transport, "stop_command"), 0);
    }

    #[tokio::test]
    async fn missing_value_counts_as_stopped() {
        let (connection, transport) = command_channel();
        let command = Command::new(5u64, connection.clone()).unwrap();
        command.check_status();
        reply(&connection, &transport, "get_command_state", json!({"5": "finished"}));
        command.fetch_value(None);
        reply_error(&connection, &transport, "get_command_value", 400, "Command with id 5 does not exist");

        assert_eq!(command.state(5), Some(CommandState::Stopped));
        assert!(!command.has_error());
        let value = command
            .get_value_blocking(None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, CommandValue::Single(None));
    }

    #[tokio::test]
    async fn duplicate_ids_are_tracked_once() {
        let (connection, transport) = command_channel();
        let command = Command::new(vec![5u64, 7, 5], connection.clone()).unwrap();
        assert_eq!(command.ids(), &[5, 7]);

        command.check_status();
        reply(&connection, &transport, "get_command_state", json!({"5": "finished", "7": "finished"}));
        command.fetch_value(None);
        assert_eq!(transport.last_call("get_command_value").unwrap().msg.data[0].args["command_ids"], json!([5, 7]));
        reply(&connection, &transport, "get_command_value", json!({"5": 1, "7": 2}));
        assert!(command.done());
    }

    #[tokio::test]
    async fn finished_commands_complete_immediately() {
        let (connection, transport) = command_channel();
        let command = Command::new(7u64, connection.clone()).unwrap();
        command.check_status();
        reply(&connection, &transport, "get_command_state", json!({"7": "failed"}));

        let (seen, callback) = completions();
        command.poll_until_complete(Some(callback));
        assert_eq!(*seen.lock().unwrap(), vec![true]);
        assert_eq!(count(&transport, "get_command_value"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_polled_until_finished() {
        let (connection, transport) = command_channel();
        let command = Command::new(5u64, connection.clone()).unwrap();
        let (seen, callback) = completions();
        command.poll_progress_with(Duration::from_secs(3), Duration::from_secs(7200), Some(callback));

        sleep(Duration::from_secs(1)).await;
        assert_eq!(count(&transport, "get_command_progress"), 1);
        reply(&connection, &transport, "get_command_progress", json!({"5": 40}));
        reply(&connection, &transport, "get_command_state", json!({"5": "finished"}));
        assert_eq!(command.get_progress(None), CommandValue::Single(Some(json!(40))));

        sleep(Duration::from_secs(3)).await;
        assert_eq!(count(&transport, "get_command_progress"), 2);
        assert_eq!(count(&transport, "get_command_state"), 1);
        assert_eq!(*seen.lock().unwrap(), vec![true, true]);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(count(&transport, "get_command_progress"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_reads_wait_for_values() {
        let (connection, transport) = command_channel();
        let command = Command::new(5u64, connection.clone()).unwrap();
        command.check_status();
        reply(&connection, &transport, "get_command_state", json!({"5": "finished"}));
        assert_eq!(command.get_value(None), CommandValue::Single(None));
        reply(&connection, &transport, "get_command_value", json!({"5": "ok"}));

        let value = command
            .get_value_blocking(None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, CommandValue::Single(Some(json!("ok"))));

        let slow = Command::new(6u64, connection.clone()).unwrap();
        let result = slow.get_value_blocking(None, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }
}
