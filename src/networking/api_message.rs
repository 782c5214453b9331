use crate::error::ServerError;
use macros::TryFromByte;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::convert::TryFrom;

///
/// Control channel commands. They travel as their numeric code.
///
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromByte)]
#[serde(try_from = "u8", into = "u8")]
pub enum ControlCommand {
    Connect = 1,
    Reconnect = 2,
    Disconnect = 3,
    Status = 4,
    Handshake = 5,
    Rehandshake = 6,
}

impl ControlCommand {
    pub fn is_handshake(&self) -> bool {
        matches!(self, ControlCommand::Handshake | ControlCommand::Rehandshake)
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, ControlCommand::Connect | ControlCommand::Reconnect)
    }
}

///
/// Lifecycle of a server side job. The server may report either the
/// numeric code or the snake_case name.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromByte)]
pub enum CommandState {
    OutOfService = 0,
    InService = 1,
    InQueue = 2,
    Started = 3,
    Finished = 4,
    Stopped = 5,
    Failed = 6,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::OutOfService => "out_of_service",
            CommandState::InService => "in_service",
            CommandState::InQueue => "in_queue",
            CommandState::Started => "started",
            CommandState::Finished => "finished",
            CommandState::Stopped => "stopped",
            CommandState::Failed => "failed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let state = match name {
            "out_of_service" => CommandState::OutOfService,
            "in_service" => CommandState::InService,
            "in_queue" => CommandState::InQueue,
            "started" => CommandState::Started,
            "finished" => CommandState::Finished,
            "stopped" => CommandState::Stopped,
            "failed" => CommandState::Failed,
            _ => return None,
        };
        Some(state)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) => CommandState::from_name(name),
            Value::Number(code) => code
                .as_u64()
                .and_then(|code| u8::try_from(code).ok())
                .and_then(|code| CommandState::try_from(code).ok()),
            _ => None,
        }
    }

    /// finished, stopped or failed
    pub fn is_terminal(&self) -> bool {
        *self >= CommandState::Finished
    }

    /// Apply a reported state on top of the known one. Stopped and failed
    /// are never left, every other state only moves forward, so a finished
    /// job can still turn out stopped.
    pub fn advance(current: Option<CommandState>, reported: CommandState) -> CommandState {
        match current {
            Some(current @ (CommandState::Stopped | CommandState::Failed)) => current,
            Some(current) if reported < current => current,
            _ => reported,
        }
    }
}

///
/// One function call in a batch: the function name plus its keyword
/// arguments, flattened next to `fname` on the wire.
///
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub fname: String,
    #[serde(flatten)]
    pub args: BTreeMap<String, Value>,
}

impl FunctionCall {
    pub fn new(fname: impl Into<String>) -> Self {
        FunctionCall {
            fname: fname.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.args.insert(name.to_string(), value.into());
        self
    }

    /// Absent optionals are left out of the payload entirely.
    pub fn arg_opt<T: Into<Value>>(self, name: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.arg(name, value),
            None => self,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("fname".to_string(), Value::String(self.fname.clone()));
        for (name, value) in &self.args {
            map.insert(name.clone(), value.clone());
        }
        Value::Object(map)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub id: u64,
    pub command: ControlCommand,
    pub session_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ControlReply {
    pub id: u64,
    pub command: Option<ControlCommand>,
    pub status: bool,
    pub accepted: bool,
    pub guest_allowed: bool,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcMessage {
    pub session: String,
    pub name: String,
    pub data: Vec<FunctionCall>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcEnvelope {
    pub session_id: String,
    pub id: u64,
    pub msg: RpcMessage,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub id: u64,
    #[serde(default)]
    pub msg: Option<RpcReplyBody>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct RpcReplyBody {
    pub session: String,
    pub error: Option<ServerError>,
    pub data: Value,
}

/// One entry of a batched reply.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionResult {
    pub fname: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<ServerError>,
}

/// Out-of-band error pushed by the server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExceptionEvent {
    pub error: ServerError,
}

///
/// A frame written to the socket.
///
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundFrame {
    Command(ControlMessage),
    ServerCall(RpcEnvelope),
}

impl OutboundFrame {
    pub fn serialize(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

///
/// A frame read from the socket. Payloads stay untyped until the
/// connection decodes them, so a malformed body only drops that one reply.
///
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundFrame {
    Command(Value),
    ServerCall(Value),
    Exception(Value),
}

impl InboundFrame {
    pub fn deserialize(text: &str) -> serde_json::Result<InboundFrame> {
        serde_json::from_str(text)
    }
}
