//! # Remote Call Proxy
//!
//! [`RemoteCall`] is what a caller holds for one dispatched call. It serves
//! every call shape through one type:
//!
//! - `.await` it for the final value (driving a generator to completion),
//! - `next` / [`stream`](RemoteCall::stream) it to consume a generator,
//! - `return_value` / `throw` it to cancel.
//!
//! ## State machine
//!
//! ```text
//! Pending ──► Settled
//!    │           ▲
//!    └─► Streaming ─┘
//!    └────────┴────► Cancelled
//! ```
//!
//! No transition leaves `Settled` or `Cancelled`. `next` takes `&mut self`,
//! so calls on one proxy are serialized.

use std::future::IntoFuture;
use std::sync::Arc;

use exowire::Channel;
use exowire::ControlKind;
use exowire::GeneratorControl;
use exowire::Message;
use exowire::RemoteError;
use exowire::TaskId;
use exowire::Value;
use exowire::WireValue;
use exowire::codec;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::oneshot;
use tracing::trace;

use crate::dispatcher::Shared;
use crate::error::CallError;
use crate::error::Result;
use crate::registry::Registration;
use crate::unit::ExecutionUnit;
use crate::unit::PumpEvent;

/// One result of iterating a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub value: Value,
    pub done: bool,
}

impl Step {
    pub fn yielded(value: Value) -> Self {
        Self { value, done: false }
    }

    pub fn done(value: Value) -> Self {
        Self { value, done: true }
    }
}

/// What the remote callable turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A plain or async function: one outcome.
    Single,
    /// A generator: a series of yields, then an outcome.
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Streaming,
    Settled,
    Cancelled,
}

/// The caller's handle to one in-flight remote call.
pub struct RemoteCall {
    id: TaskId,
    unit: Arc<dyn ExecutionUnit>,
    shared: Arc<Shared>,
    state: State,
    kind: Option<CallKind>,
    ready: Option<oneshot::Receiver<()>>,
    settled: Option<oneshot::Receiver<Result<Value>>>,
    outcome: Option<Result<Value>>,
    yields: Channel<Step, CallError>,
}

impl RemoteCall {
    pub(crate) fn new(
        id: TaskId,
        unit: Arc<dyn ExecutionUnit>,
        shared: Arc<Shared>,
        registration: Registration,
    ) -> Self {
        Self {
            id,
            unit,
            shared,
            state: State::Pending,
            kind: None,
            ready: Some(registration.ready),
            settled: Some(registration.settled),
            outcome: None,
            yields: registration.yields,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// `None` until the first `next` (or await) has learned the call's shape.
    pub fn kind(&self) -> Option<CallKind> {
        self.kind
    }

    /// True once no further values can be produced.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Settled | State::Cancelled)
    }

    /// Advances the call.
    ///
    /// For a generator this sends `next(input)` (after the remote side has
    /// announced it) and waits for the next yielded value. For a plain call
    /// it waits for the outcome and reports it as the final step. Once
    /// finished, every further call returns `Step { value: Null, done: true }`.
    pub async fn next(&mut self, input: Value) -> Result<Step> {
        if self.is_finished() {
            return Ok(Step::done(Value::Null));
        }

        if let Some(ready) = self.ready.take() {
            if ready.await.is_err() {
                // Settled without ever becoming a generator.
                self.kind = Some(CallKind::Single);
                return self.outcome().await.map(Step::done);
            }
            self.kind = Some(CallKind::Streaming);
            self.state = State::Streaming;
        }

        let operand = codec::encode_value(input)?;
        self.control(ControlKind::Next, operand)?;

        match self.yields.recv().await {
            Ok(Some(step)) => {
                if step.done {
                    self.state = State::Settled;
                }
                Ok(step)
            }
            // Closed without a final yield: the outcome says why.
            Ok(None) => self.outcome().await.map(Step::done),
            Err(error) => {
                self.finish_with(Err(error.clone()));
                Err(error)
            }
        }
    }

    /// Cancels the call, completing it with `value`.
    ///
    /// Sends `return` to the remote side without waiting for it and removes
    /// the task; anything the remote side still sends for it is dropped.
    pub fn return_value(&mut self, value: Value) -> Result<Step> {
        if self.is_finished() {
            return Ok(Step::done(value));
        }
        let operand = codec::encode_value(value.clone()).unwrap_or(WireValue::Null);
        self.cancel(ControlKind::Return, operand, Ok(value.clone()));
        Ok(Step::done(value))
    }

    /// Cancels the call by raising `error` inside it.
    ///
    /// Like `return_value`, this does not wait for the remote side.
    pub fn throw(&mut self, error: RemoteError) -> Result<Step> {
        let failure = CallError::Remote(error.clone());
        if self.is_finished() {
            return Err(failure);
        }
        self.cancel(ControlKind::Throw, error.to_envelope(), Err(failure.clone()));
        Err(failure)
    }

    /// The yielded values as a stream. Ends after the final value; an error
    /// is yielded once and then ends the stream.
    pub fn stream(&mut self) -> BoxStream<'_, Result<Value>> {
        futures::stream::unfold(self, |call| async move {
            if call.is_finished() {
                return None;
            }
            match call.next(Value::Null).await {
                Ok(step) if step.done => None,
                Ok(step) => Some((Ok(step.value), call)),
                Err(error) => Some((Err(error), call)),
            }
        })
        .boxed()
    }

    /// Drives the call to completion, discarding yields, and returns the final value.
    pub async fn finish(&mut self) -> Result<Value> {
        while !self.is_finished() {
            let step = self.next(Value::Null).await?;
            if step.done {
                break;
            }
        }
        self.outcome().await
    }

    async fn outcome(&mut self) -> Result<Value> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.settled.take() {
            Some(rx) => rx.await.unwrap_or(Err(CallError::Cancelled)),
            None => Err(CallError::Cancelled),
        };
        self.finish_with(outcome.clone());
        outcome
    }

    fn finish_with(&mut self, outcome: Result<Value>) {
        if self.state != State::Cancelled {
            self.state = State::Settled;
        }
        self.outcome = Some(outcome);
    }

    fn control(&self, kind: ControlKind, operand: WireValue) -> Result<()> {
        let transfer = codec::collect_transfers(std::slice::from_ref(&operand));
        let message = Message::Control(GeneratorControl::new(kind, self.id, vec![operand]));
        self.unit.send(message, transfer).map_err(CallError::Dispatch)
    }

    fn cancel(&mut self, kind: ControlKind, operand: WireValue, outcome: Result<Value>) {
        if let Err(e) = self.control(kind, operand) {
            trace!(task = %self.id, error = %e, "cancel could not reach unit");
        }
        if let Some(unit) = self.shared.registry.remove(self.id) {
            let _ = self.shared.events.send(PumpEvent::Release(unit, self.id));
        }
        self.state = State::Cancelled;
        self.ready = None;
        self.settled = None;
        self.outcome = Some(outcome);
        trace!(task = %self.id, kind = kind.as_tag(), "call cancelled");
    }
}

impl IntoFuture for RemoteCall {
    type Output = Result<Value>;
    type IntoFuture = BoxFuture<'static, Result<Value>>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move { self.finish().await })
    }
}

impl Drop for RemoteCall {
    fn drop(&mut self) {
        // A generator mid-iteration, or one announced but never advanced,
        // would otherwise wait for `next` forever.
        let announced = self.state == State::Pending
            && self.ready.as_mut().is_some_and(|ready| ready.try_recv().is_ok());
        if self.state == State::Streaming || announced {
            self.cancel(ControlKind::Return, WireValue::Null, Err(CallError::Cancelled));
        }
    }
}

impl std::fmt::Debug for RemoteCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCall")
            .field("id", &self.id)
            .field("unit", &self.unit.id())
            .field("state", &self.state)
            .field("kind", &self.kind)
            .finish()
    }
}
