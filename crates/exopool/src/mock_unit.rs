//! Mock execution units for testing.
//!
//! These are used internally by the test suite and are not part of the public API.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use exowire::CallRequest;
use exowire::CallResponse;
use exowire::GeneratorControl;
use exowire::Message;
use exowire::ResponseBody;
use exowire::TaskId;
use tokio::sync::mpsc;

use crate::unit;
use crate::unit::EventSink;
use crate::unit::ExecutionUnit;
use crate::unit::UnitFactory;
use crate::unit::UnitId;

/// Reacts to every message a mock unit receives.
pub type Behavior = Arc<dyn Fn(&EventSink, &Message) + Send + Sync>;

/// A unit that records what it is sent and answers through a scripted behavior.
pub struct MockUnit {
    id: UnitId,
    events: EventSink,
    behavior: Behavior,
    sent: Mutex<Vec<Message>>,
    referenced: AtomicBool,
    terminated: AtomicBool,
}

impl MockUnit {
    pub fn new(id: UnitId, events: EventSink, behavior: Behavior) -> Self {
        Self {
            id,
            events,
            behavior,
            sent: Mutex::new(Vec::new()),
            referenced: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// A silent unit whose events go nowhere, for driving a `Pool` directly.
    pub fn detached(id: UnitId) -> Arc<Self> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Self::new(id, EventSink::new(id, tx), Arc::new(|_: &EventSink, _: &Message| {})))
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Posts a response as if the remote side had produced it.
    pub fn respond(&self, task: TaskId, body: ResponseBody) {
        self.events.post(Message::Response(CallResponse::new(task, body)));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<CallRequest> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::Call(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn controls(&self) -> Vec<GeneratorControl> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::Control(control) => Some(control),
                _ => None,
            })
            .collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl ExecutionUnit for MockUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn send(&self, message: Message, _transfer: Vec<Bytes>) -> unit::Result<()> {
        if self.is_terminated() {
            return Err(unit::Error::Terminated(self.id));
        }
        self.sent.lock().unwrap().push(message.clone());
        (self.behavior)(&self.events, &message);
        Ok(())
    }

    fn set_referenced(&self, referenced: bool) {
        self.referenced.store(referenced, Ordering::SeqCst);
    }

    fn is_referenced(&self) -> bool {
        self.referenced.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// Spawns [`MockUnit`]s sharing one behavior and keeps them for inspection.
pub struct MockFactory {
    behavior: Behavior,
    units: Mutex<Vec<Arc<MockUnit>>>,
    fail_spawns: AtomicBool,
}

impl MockFactory {
    pub fn new(behavior: impl Fn(&EventSink, &Message) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            behavior: Arc::new(behavior),
            units: Mutex::new(Vec::new()),
            fail_spawns: AtomicBool::new(false),
        })
    }

    /// Units that record messages and never answer.
    pub fn silent() -> Arc<Self> {
        Self::new(|_: &EventSink, _: &Message| {})
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    /// The `index`th unit spawned.
    pub fn unit(&self, index: usize) -> Arc<MockUnit> {
        self.units.lock().unwrap()[index].clone()
    }

    pub fn units(&self) -> Vec<Arc<MockUnit>> {
        self.units.lock().unwrap().clone()
    }

    pub fn spawned(&self) -> usize {
        self.units.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl UnitFactory for MockFactory {
    async fn spawn(&self, id: UnitId, events: EventSink) -> unit::Result<Arc<dyn ExecutionUnit>> {
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(unit::Error::Spawn("mock spawn failure".into()));
        }
        let unit = Arc::new(MockUnit::new(id, events, self.behavior.clone()));
        self.units.lock().unwrap().push(unit.clone());
        Ok(unit)
    }
}
