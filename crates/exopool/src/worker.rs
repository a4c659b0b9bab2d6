//! # Worker
//!
//! The remote side of the protocol: the loop that runs inside an execution
//! unit, resolves callables and streams their results back.
//!
//! ## Invariants
//! - **One terminal reply per task**: every call that carries a task id ends
//!   in exactly one `return`, `error` or final `yield`, unless the unit dies.
//! - **Detached calls are silent**: a call without a task id never replies.
//! - **Outputs close with the call**: channel arguments the callable writes to
//!   are closed when the call settles, with the call's error if it failed.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use exowire::CallRequest;
use exowire::CallResponse;
use exowire::Channel;
use exowire::ChannelBinder;
use exowire::ChannelRef;
use exowire::ControlKind;
use exowire::Direction;
use exowire::GeneratorControl;
use exowire::InboundRelays;
use exowire::Message;
use exowire::RemoteError;
use exowire::ResponseBody;
use exowire::TaskId;
use exowire::Value;
use exowire::codec;
use exowire::relay;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::module::CallResult;
use crate::module::Callable;
use crate::module::Generator;
use crate::module::GeneratorState;
use crate::module::Resolver;
use crate::unit::EventSink;

type Controls = Arc<DashMap<TaskId, mpsc::UnboundedSender<GeneratorControl>>>;

/// Runs calls for one execution unit.
///
/// Must be driven from within a tokio runtime: async callables and
/// generators are spawned onto it.
pub struct Worker {
    resolver: Arc<dyn Resolver>,
    events: EventSink,
    relays: InboundRelays,
    generators: Controls,
}

impl Worker {
    pub fn new(resolver: Arc<dyn Resolver>, events: EventSink) -> Self {
        Self {
            resolver,
            events,
            relays: InboundRelays::new(),
            generators: Arc::new(DashMap::new()),
        }
    }

    /// Processes messages in arrival order until the inbox closes.
    pub async fn run(self, mut inbox: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = inbox.recv().await {
            self.handle(message);
        }
        trace!(unit = %self.events.unit(), "worker inbox closed");
    }

    /// Handles one message. Plain callables run to completion before this returns.
    pub fn handle(&self, message: Message) {
        let kind = message.kind();
        match message {
            Message::Call(call) => self.call(call),
            Message::Control(control) => self.control(control),
            Message::Channel(op) => {
                if let Err(e) = self.relays.deliver(op) {
                    debug!(unit = %self.events.unit(), error = %e, "dropping relay message");
                }
            }
            Message::Response(_) => {
                warn!(unit = %self.events.unit(), kind, "unexpected message, dropping");
            }
        }
    }

    fn call(&self, call: CallRequest) {
        let CallRequest { module, function, args, task_id } = call;

        let mut binder = Binder {
            relays: &self.relays,
            events: &self.events,
            outputs: Vec::new(),
        };
        let decoded = args
            .into_iter()
            .map(|arg| codec::decode_value(arg, &mut binder))
            .collect::<exowire::Result<Vec<_>>>();
        let outputs = binder.outputs;

        let args = match decoded {
            Ok(args) => args,
            Err(e) => return settle(&self.events, task_id, Err(e.to_remote()), &outputs),
        };

        let callable = match self.lookup(&module, &function) {
            Ok(callable) => callable,
            Err(e) => return settle(&self.events, task_id, Err(e), &outputs),
        };

        trace!(task = ?task_id, module = %module, function = %function, "running call");

        match callable {
            Callable::Plain(f) => settle(&self.events, task_id, f(args), &outputs),
            Callable::Async(f) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(async move { f(args).await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(panic_error(panic)));
                    settle(&events, task_id, outcome, &outputs);
                });
            }
            Callable::Generator(make) => {
                let generator = match make(args) {
                    Ok(generator) => generator,
                    Err(e) => return settle(&self.events, task_id, Err(e), &outputs),
                };
                let Some(task) = task_id else {
                    // Nobody can ever drive it.
                    close_outputs(&outputs, None);
                    return;
                };

                let (tx, rx) = mpsc::unbounded_channel();
                self.generators.insert(task, tx);
                respond(&self.events, task, ResponseBody::Gen);
                tokio::spawn(drive(
                    task,
                    generator,
                    rx,
                    self.events.clone(),
                    outputs,
                    self.generators.clone(),
                ));
            }
        }
    }

    fn control(&self, control: GeneratorControl) {
        let task = control.task_id;
        match self.generators.get(&task) {
            Some(tx) => {
                if tx.send(control).is_err() {
                    trace!(task = %task, "generator already finished");
                }
            }
            None => {
                trace!(task = %task, kind = control.kind.as_tag(), "control for unknown generator")
            }
        }
    }

    fn lookup(&self, module: &str, function: &str) -> Result<Callable, RemoteError> {
        let resolved = self.resolver.resolve(module)?;
        resolved.get(function).cloned().ok_or_else(|| {
            RemoteError::new(format!("'{}' is not a function of module '{}'", function, module))
                .with_name("FunctionNotFound")
        })
    }
}

/// Drives one generator until it completes, fails, or its controls go away.
async fn drive(
    task: TaskId,
    mut generator: Box<dyn Generator>,
    mut controls: mpsc::UnboundedReceiver<GeneratorControl>,
    events: EventSink,
    outputs: Vec<Channel<Value>>,
    generators: Controls,
) {
    let run = AssertUnwindSafe(async {
        while let Some(control) = controls.recv().await {
            let state = match codec::decode_plain(control.operand()) {
                Err(e) => Err(e.to_remote()),
                Ok(input) => match control.kind {
                    ControlKind::Next => generator.resume(input).await,
                    ControlKind::Return => generator.finish(input).await,
                    ControlKind::Throw => generator.throw(into_error(input)).await,
                },
            };

            match state {
                Ok(GeneratorState::Yielded(value)) => match codec::encode_value(value) {
                    Ok(value) => respond(&events, task, ResponseBody::Yield { value, done: false }),
                    Err(e) => return Some(Err(e.to_remote())),
                },
                Ok(GeneratorState::Complete(value)) => return Some(Ok(value)),
                Err(error) => return Some(Err(error)),
            }
        }
        None
    });

    let outcome = run
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Some(Err(panic_error(panic))));
    generators.remove(&task);

    let Some(outcome) = outcome else {
        trace!(task = %task, "generator abandoned");
        close_outputs(&outputs, None);
        return;
    };

    let outcome = outcome.and_then(|value| codec::encode_value(value).map_err(|e| e.to_remote()));
    close_outputs(&outputs, outcome.as_ref().err());
    let body = match outcome {
        Ok(value) => ResponseBody::Yield { value, done: true },
        Err(error) => ResponseBody::Error(error.to_envelope()),
    };
    respond(&events, task, body);
}

fn settle(
    events: &EventSink,
    task: Option<TaskId>,
    outcome: CallResult,
    outputs: &[Channel<Value>],
) {
    let outcome = outcome.and_then(|value| codec::encode_value(value).map_err(|e| e.to_remote()));
    close_outputs(outputs, outcome.as_ref().err());

    let Some(task) = task else { return };
    let body = match outcome {
        Ok(value) => ResponseBody::Return(value),
        Err(error) => ResponseBody::Error(error.to_envelope()),
    };
    respond(events, task, body);
}

fn respond(events: &EventSink, task: TaskId, body: ResponseBody) {
    if !events.post(Message::Response(CallResponse::new(task, body))) {
        trace!(task = %task, "dispatcher gone, dropping response");
    }
}

fn close_outputs(outputs: &[Channel<Value>], error: Option<&RemoteError>) {
    for channel in outputs {
        channel.close(error.cloned());
    }
}

fn into_error(value: Value) -> RemoteError {
    match value {
        Value::Error(error) => error,
        Value::Str(message) => RemoteError::new(message),
        other => RemoteError::new(format!("{:?}", other)),
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> RemoteError {
    RemoteError::new(panic_message(panic.as_ref())).with_name("Panic")
}

/// Extracts the text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Materialises channel arguments on the remote side.
struct Binder<'a> {
    relays: &'a InboundRelays,
    events: &'a EventSink,
    outputs: Vec<Channel<Value>>,
}

impl ChannelBinder for Binder<'_> {
    fn bind(&mut self, reference: ChannelRef) -> exowire::Result<Channel<Value>> {
        let channel = Channel::unbounded();
        match reference.direction {
            Direction::Input => self.relays.install(reference.id, channel.clone()),
            Direction::Output => {
                let events = self.events.clone();
                let forward = relay::forward(reference.id, channel.clone(), move |message, _| {
                    events.post(message)
                });
                tokio::spawn(forward);
                self.outputs.push(channel.clone());
            }
        }
        Ok(channel)
    }
}
