//! # Thread Units
//!
//! The bundled execution unit: a named OS thread hosting a current-thread
//! tokio runtime that runs a [`Worker`].
//!
//! ## Lifecycle
//!
//! 1. `spawn` starts the thread and waits for the runtime to come up.
//! 2. Messages are handed over through an unbounded inbox.
//! 3. A panic that escapes the worker loop (a plain callable panicking) kills
//!    the unit and is reported as a unit error carrying the panic text.
//!    A normal stop is reported as an exit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use exowire::Message;
use exowire::RemoteError;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::module::Resolver;
use crate::unit;
use crate::unit::EventSink;
use crate::unit::ExecutionUnit;
use crate::unit::UnitFactory;
use crate::unit::UnitId;
use crate::worker::Worker;
use crate::worker::panic_message;

/// Spawns one [`ThreadUnit`] per request, all resolving modules through the same resolver.
pub struct ThreadUnitFactory {
    resolver: Arc<dyn Resolver>,
    name_prefix: String,
}

impl ThreadUnitFactory {
    pub fn new(resolver: impl Resolver) -> Self {
        Self::from_shared(Arc::new(resolver))
    }

    pub fn from_shared(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            name_prefix: "exopool".into(),
        }
    }

    /// Prefix of the OS thread names, followed by the unit number.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }
}

#[async_trait::async_trait]
impl UnitFactory for ThreadUnitFactory {
    async fn spawn(&self, id: UnitId, events: EventSink) -> unit::Result<Arc<dyn ExecutionUnit>> {
        let name = format!("{}-{}", self.name_prefix, id.0);
        let unit = ThreadUnit::spawn(id, name, self.resolver.clone(), events).await?;
        Ok(Arc::new(unit))
    }
}

/// An execution unit backed by a dedicated OS thread.
pub struct ThreadUnit {
    id: UnitId,
    inbox: mpsc::UnboundedSender<Message>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    referenced: AtomicBool,
    terminated: AtomicBool,
}

impl ThreadUnit {
    /// Starts the thread and resolves once its runtime is running.
    pub async fn spawn(
        id: UnitId,
        name: String,
        resolver: Arc<dyn Resolver>,
        events: EventSink,
    ) -> unit::Result<Self> {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let built = tokio::runtime::Builder::new_current_thread().enable_all().build();
                let runtime = match built {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let worker = Worker::new(resolver, events.clone());
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    runtime.block_on(async move {
                        tokio::select! {
                            _ = worker.run(inbox_rx) => {}
                            _ = shutdown_rx => {}
                        }
                    })
                }));
                drop(runtime);

                match outcome {
                    Ok(()) => {
                        debug!(unit = %id, "unit thread stopped");
                        events.exit(Some(0));
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        debug!(unit = %id, panic = %message, "unit thread panicked");
                        events.error(RemoteError::new(message).with_name("UnitPanic"));
                    }
                }
            })
            .map_err(|e| unit::Error::Spawn(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                id,
                inbox,
                shutdown: Mutex::new(Some(shutdown_tx)),
                referenced: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            }),
            Ok(Err(e)) => Err(unit::Error::Spawn(e)),
            Err(_) => Err(unit::Error::Spawn("unit thread exited during startup".into())),
        }
    }
}

impl ExecutionUnit for ThreadUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn send(&self, message: Message, _transfer: Vec<Bytes>) -> unit::Result<()> {
        // Buffers are reference counted, so a move within the process is free.
        if self.terminated.load(Ordering::Acquire) {
            return Err(unit::Error::Terminated(self.id));
        }
        self.inbox
            .send(message)
            .map_err(|_| unit::Error::Terminated(self.id))
    }

    /// Advisory only: a thread never keeps the process alive, so the flag is
    /// just recorded for `is_referenced`.
    fn set_referenced(&self, referenced: bool) {
        self.referenced.store(referenced, Ordering::Release);
    }

    fn is_referenced(&self) -> bool {
        self.referenced.load(Ordering::Acquire)
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
    }
}

impl Drop for ThreadUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}
