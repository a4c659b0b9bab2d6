//! # Protocol Messages
//!
//! Defines every message that crosses the pipe between the orchestrator and
//! an execution unit.
//!
//! ## Invariants
//! - **Exhaustive**: a message is exactly one of the four shapes below; receivers
//!   match on all of them and reject the shapes that are invalid in their direction.
//! - **Per-task order**: messages for one task id are meaningful only in the
//!   order the transport delivered them.

use crate::ids::ChannelId;
use crate::ids::TaskId;
use crate::value::WireValue;

/// Initiates a plain, async or generator call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub module: String,
    pub function: String,
    pub args: Vec<WireValue>,
    /// `None` for a detached call that expects no response.
    pub task_id: Option<TaskId>,
}

/// Which generator operation a control message requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Next,
    Return,
    Throw,
}

impl ControlKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::Return => "return",
            Self::Throw => "throw",
        }
    }
}

/// Drives a generator that the remote side has already started.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorControl {
    pub kind: ControlKind,
    pub args: Vec<WireValue>,
    pub task_id: TaskId,
}

impl GeneratorControl {
    pub fn new(kind: ControlKind, task_id: TaskId, args: Vec<WireValue>) -> Self {
        Self { kind, args, task_id }
    }

    /// The single operand carried by the control, or `Null`.
    pub fn operand(&self) -> WireValue {
        self.args.first().cloned().unwrap_or(WireValue::Null)
    }
}

/// The payload of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// The call completed with a value.
    Return(WireValue),
    /// The generator produced a value; `done` marks its final one.
    Yield { value: WireValue, done: bool },
    /// The call failed. The payload is usually an error envelope.
    Error(WireValue),
    /// The call produced a generator that is ready for its first `next`.
    Gen,
}

/// A result flowing back from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub task_id: Option<TaskId>,
    pub body: ResponseBody,
}

impl CallResponse {
    pub fn new(task_id: TaskId, body: ResponseBody) -> Self {
        Self { task_id: Some(task_id), body }
    }

    /// True for responses after which no more messages are expected for the task.
    pub fn is_terminal(&self) -> bool {
        match &self.body {
            ResponseBody::Return(_) | ResponseBody::Error(_) => true,
            ResponseBody::Yield { done, .. } => *done,
            ResponseBody::Gen => false,
        }
    }
}

/// Relays one operation on a channel argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Send { channel_id: ChannelId, value: WireValue },
    /// `error` carries an error envelope when the channel was closed with one.
    Close { channel_id: ChannelId, error: Option<WireValue> },
}

impl ChannelMessage {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::Send { channel_id, .. } | Self::Close { channel_id, .. } => *channel_id,
        }
    }
}

/// Everything that can travel over the pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(CallRequest),
    Control(GeneratorControl),
    Response(CallResponse),
    Channel(ChannelMessage),
}

impl Message {
    /// The wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call(_) => "call",
            Self::Control(control) => control.kind.as_tag(),
            Self::Response(response) => match response.body {
                ResponseBody::Return(_) => "return",
                ResponseBody::Yield { .. } => "yield",
                ResponseBody::Error(_) => "error",
                ResponseBody::Gen => "gen",
            },
            Self::Channel(ChannelMessage::Send { .. }) => "send",
            Self::Channel(ChannelMessage::Close { .. }) => "close",
        }
    }

    /// The task this message concerns, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Call(call) => call.task_id,
            Self::Control(control) => Some(control.task_id),
            Self::Response(response) => response.task_id,
            Self::Channel(_) => None,
        }
    }
}
