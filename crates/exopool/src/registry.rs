//! # Task Registry
//!
//! Bookkeeping for every in-flight remote call, keyed by task id.
//!
//! Each task carries three one-way pipes to its [`RemoteCall`](crate::call::RemoteCall):
//! - `settle`: the final outcome. A oneshot buffers it for a caller that has
//!   not started awaiting yet.
//! - `ready`: fired when the remote side announces a generator.
//! - `yields`: the generator's results, in arrival order.
//!
//! ## Invariants
//! - **Settle once**: a task leaves the map when it settles; later responses
//!   for its id are stale and ignored.
//! - **Release before delivery**: settling hands back a [`Settlement`] that the
//!   dispatcher delivers only after the unit slot is freed, so a caller that
//!   observes the outcome also observes the freed slot.

use dashmap::DashMap;
use exowire::CallResponse;
use exowire::Channel;
use exowire::ChannelId;
use exowire::ResponseBody;
use exowire::TaskId;
use exowire::Value;
use exowire::codec;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::call::Step;
use crate::error::CallError;
use crate::unit::UnitId;

type Outcome = Result<Value, CallError>;

struct TaskRecord {
    module: String,
    function: String,
    unit: UnitId,
    streaming: bool,
    settle: oneshot::Sender<Outcome>,
    ready: Option<oneshot::Sender<()>>,
    yields: Channel<Step, CallError>,
    outputs: Vec<ChannelId>,
}

/// The receiving ends handed to a new [`RemoteCall`](crate::call::RemoteCall).
pub(crate) struct Registration {
    pub settled: oneshot::Receiver<Outcome>,
    pub ready: oneshot::Receiver<()>,
    pub yields: Channel<Step, CallError>,
}

/// A settled task's outcome, waiting to be handed to its caller.
pub(crate) struct Settlement {
    tx: oneshot::Sender<Outcome>,
    yields: Channel<Step, CallError>,
    outcome: Outcome,
}

impl Settlement {
    pub fn deliver(self) {
        match &self.outcome {
            Ok(_) => self.yields.close(None),
            Err(e) => self.yields.close(Some(e.clone())),
        }
        // The caller may have dropped its proxy already.
        let _ = self.tx.send(self.outcome);
    }
}

/// What the dispatcher must do after a response has been applied.
pub(crate) enum Disposition {
    /// Nothing further.
    Continue,
    /// The task left the registry. Free its slot on `unit`, then deliver.
    Settled { task: TaskId, unit: UnitId, settlement: Settlement },
    /// A generator nobody will drive. Tell the sender to return it and free
    /// `release` if the task still held a slot.
    Orphaned { task: TaskId, release: Option<UnitId> },
    /// The id is not registered.
    Stale(TaskId),
    /// The response carried no task id.
    Unaddressed,
}

/// A failed task's output relays, which the far side will never close.
pub(crate) struct Failed {
    pub outputs: Vec<ChannelId>,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, TaskRecord>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pending task.
    pub(crate) fn register(
        &self,
        id: TaskId,
        module: &str,
        function: &str,
        unit: UnitId,
        outputs: Vec<ChannelId>,
    ) -> Registration {
        let (settle, settled) = oneshot::channel();
        let (ready_tx, ready) = oneshot::channel();
        let yields = Channel::unbounded();

        self.tasks.insert(id, TaskRecord {
            module: module.to_string(),
            function: function.to_string(),
            unit,
            streaming: false,
            settle,
            ready: Some(ready_tx),
            yields: yields.clone(),
            outputs,
        });
        trace!(task = %id, unit = %unit, module, function, "task registered");

        Registration { settled, ready, yields }
    }

    /// Applies one response.
    pub(crate) fn handle_response(&self, response: CallResponse) -> Disposition {
        let Some(id) = response.task_id else {
            return Disposition::Unaddressed;
        };

        match response.body {
            ResponseBody::Gen => self.announce(id),
            ResponseBody::Yield { value, done } => {
                let Some(mut record) = self.tasks.get_mut(&id) else {
                    return Disposition::Stale(id);
                };
                if !record.streaming {
                    warn!(task = %id, "yield before gen");
                    record.streaming = true;
                }
                let value = match codec::decode_plain(value) {
                    Ok(value) => value,
                    Err(e) => {
                        drop(record);
                        return self.settle(id, Err(CallError::Protocol(e)));
                    }
                };
                if !done {
                    let _ = record.yields.try_send(Step::yielded(value));
                    return Disposition::Continue;
                }
                // The final yield is also the call's result.
                let _ = record.yields.try_send(Step::done(value.clone()));
                drop(record);
                self.settle(id, Ok(value))
            }
            ResponseBody::Return(value) => {
                let outcome = codec::decode_plain(value).map_err(CallError::Protocol);
                self.settle(id, outcome)
            }
            ResponseBody::Error(payload) => {
                let Some(record) = self.tasks.get(&id) else {
                    return Disposition::Stale(id);
                };
                let origin = (record.module.as_str(), record.function.as_str());
                let error = codec::error_from_wire(&payload, Some(origin));
                drop(record);
                self.settle(id, Err(CallError::Remote(error)))
            }
        }
    }

    fn announce(&self, id: TaskId) -> Disposition {
        let Some(mut record) = self.tasks.get_mut(&id) else {
            return Disposition::Orphaned { task: id, release: None };
        };
        record.streaming = true;
        if let Some(ready) = record.ready.take() {
            let _ = ready.send(());
        }
        if !record.settle.is_closed() {
            return Disposition::Continue;
        }

        let unit = record.unit;
        drop(record);
        self.tasks.remove(&id);
        debug!(task = %id, "generator has no caller");
        Disposition::Orphaned { task: id, release: Some(unit) }
    }

    fn settle(&self, id: TaskId, outcome: Outcome) -> Disposition {
        let Some((_, record)) = self.tasks.remove(&id) else {
            return Disposition::Stale(id);
        };
        trace!(task = %id, ok = outcome.is_ok(), "task settled");
        Disposition::Settled {
            task: id,
            unit: record.unit,
            settlement: Settlement {
                tx: record.settle,
                yields: record.yields,
                outcome,
            },
        }
    }

    /// Fails a task as if an `error` response had arrived.
    pub(crate) fn fail(&self, id: TaskId, error: CallError) -> Option<Failed> {
        let (_, record) = self.tasks.remove(&id)?;
        let outputs = record.outputs.clone();
        Settlement {
            tx: record.settle,
            yields: record.yields,
            outcome: Err(error),
        }
        .deliver();
        Some(Failed { outputs })
    }

    /// Drops a task without settling it. Returns the unit it was assigned to.
    pub(crate) fn remove(&self, id: TaskId) -> Option<UnitId> {
        self.tasks.remove(&id).map(|(_, record)| record.unit)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
