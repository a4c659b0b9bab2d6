//! # Execution Unit Abstraction
//!
//! A minimal interface to an isolated worker that runs callables.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: a unit accepts [`Message`]s and reports back through
//!   an [`EventSink`]. It knows nothing about tasks, pools or proxies.
//! - **Fire-and-forget posts**: `send` only hands the message to the unit.
//!   Everything that comes back arrives asynchronously on the sink.

use std::sync::Arc;

use bytes::Bytes;
use exowire::Message;
use exowire::RemoteError;
use exowire::TaskId;
use tokio::sync::mpsc;

/// Strong type for execution unit identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnitId(pub u64);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Errors that occur while reaching an execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The unit could not be started.
    Spawn(String),
    /// The unit has already been terminated or has died.
    Terminated(UnitId),
    /// Generic failure of the underlying pipe.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(msg) => write!(f, "Failed to spawn unit: {}", msg),
            Self::Terminated(id) => write!(f, "Unit terminated: {}", id),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Something a unit reports to the dispatcher.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    Message(Message),
    /// An unrecoverable error. The unit is considered dead.
    Error(RemoteError),
    /// The unit stopped, with an exit code if it has one.
    Exit(Option<i32>),
}

/// Everything the dispatcher's pump consumes.
#[derive(Debug)]
pub(crate) enum PumpEvent {
    Unit(UnitId, UnitEvent),
    /// A task left the registry outside the pump and its unit slot must be freed.
    Release(UnitId, TaskId),
}

/// The return path from one unit to the dispatcher that owns it.
#[derive(Clone)]
pub struct EventSink {
    unit: UnitId,
    tx: mpsc::UnboundedSender<PumpEvent>,
}

impl EventSink {
    pub(crate) fn new(unit: UnitId, tx: mpsc::UnboundedSender<PumpEvent>) -> Self {
        Self { unit, tx }
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Delivers a message. Returns `false` once the dispatcher is gone.
    pub fn post(&self, message: Message) -> bool {
        self.emit(UnitEvent::Message(message))
    }

    /// Reports a fatal error.
    pub fn error(&self, error: RemoteError) -> bool {
        self.emit(UnitEvent::Error(error))
    }

    /// Reports that the unit stopped.
    pub fn exit(&self, code: Option<i32>) -> bool {
        self.emit(UnitEvent::Exit(code))
    }

    fn emit(&self, event: UnitEvent) -> bool {
        self.tx.send(PumpEvent::Unit(self.unit, event)).is_ok()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").field("unit", &self.unit).finish()
    }
}

/// A live, isolated worker.
///
/// This trait is designed to be object-safe (`Arc<dyn ExecutionUnit>`).
pub trait ExecutionUnit: Send + Sync + 'static {
    fn id(&self) -> UnitId;

    /// Posts a message to the unit.
    ///
    /// # invariants
    /// - Must not block on the unit processing the message.
    /// - Must return `Err(Error::Terminated)` once the unit is gone.
    /// - `transfer` lists buffers inside `message` that may be moved rather than copied.
    fn send(&self, message: Message, transfer: Vec<Bytes>) -> Result<()>;

    /// Marks whether the unit currently holds work and should keep the host alive.
    fn set_referenced(&self, referenced: bool);

    fn is_referenced(&self) -> bool;

    /// Stops the unit. Idempotent.
    fn terminate(&self);
}

/// Creates execution units on demand.
#[async_trait::async_trait]
pub trait UnitFactory: Send + Sync + 'static {
    /// Starts a unit that reports through `events`.
    ///
    /// Must resolve only once the unit is confirmed alive.
    async fn spawn(&self, id: UnitId, events: EventSink) -> Result<Arc<dyn ExecutionUnit>>;
}
