//! # Dispatcher
//!
//! The explicit owner of all dispatch state: task registry, unit pool,
//! inbound channel relays, id allocators, the message pump and the idle
//! sweeper. Construct one per process, or one per test.
//!
//! ## Architecture
//!
//! Every unit reports through an [`EventSink`] into one unbounded queue. A
//! single pump task drains that queue and is the only place responses are
//! applied, so per-task ordering is the transport's ordering. The pump and the
//! sweeper hold weak references: dropping the last [`Dispatcher`] handle
//! tears everything down.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use exowire::CallRequest;
use exowire::ChannelId;
use exowire::ChannelIds;
use exowire::ChannelMessage;
use exowire::ControlKind;
use exowire::Direction;
use exowire::GeneratorControl;
use exowire::InboundRelays;
use exowire::Message;
use exowire::RemoteError;
use exowire::TaskId;
use exowire::TaskIds;
use exowire::Value;
use exowire::WireValue;
use exowire::codec;
use exowire::relay;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::bound::BoundModule;
use crate::call::RemoteCall;
use crate::config::PoolConfig;
use crate::error::CallError;
use crate::error::Result;
use crate::pool::Assignment;
use crate::pool::Pool;
use crate::pool::PoolStats;
use crate::registry::Disposition;
use crate::registry::TaskRegistry;
use crate::unit::EventSink;
use crate::unit::ExecutionUnit;
use crate::unit::PumpEvent;
use crate::unit::UnitEvent;
use crate::unit::UnitFactory;
use crate::unit::UnitId;

/// Fluent builder for a [`Dispatcher`].
pub struct DispatcherBuilder {
    factory: Arc<dyn UnitFactory>,
    config: PoolConfig,
}

impl DispatcherBuilder {
    pub fn new(factory: Arc<dyn UnitFactory>) -> Self {
        Self {
            factory,
            config: PoolConfig::default(),
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the configuration with one read from the environment.
    pub fn from_env(self) -> Self {
        self.config(PoolConfig::from_env())
    }

    pub fn max_units(mut self, max_units: usize) -> Self {
        self.config = self.config.with_max_units(max_units);
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: std::time::Duration) -> Self {
        self.config = self.config.with_idle_timeout(idle_timeout);
        self
    }

    pub fn sweep_interval(mut self, sweep_interval: std::time::Duration) -> Self {
        self.config = self.config.with_sweep_interval(sweep_interval);
        self
    }

    /// Creates the dispatcher and starts its pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Dispatcher {
        Dispatcher::new(self.factory, self.config)
    }
}

/// State shared by dispatcher handles, the pump, the sweeper and live calls.
pub(crate) struct Shared {
    config: PoolConfig,
    factory: Arc<dyn UnitFactory>,
    pub(crate) registry: TaskRegistry,
    pool: tokio::sync::Mutex<Pool>,
    relays: InboundRelays,
    task_ids: TaskIds,
    channel_ids: ChannelIds,
    unit_ids: AtomicU64,
    pub(crate) events: mpsc::UnboundedSender<PumpEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// A cheap, cloneable handle to one dispatch domain.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn builder(factory: Arc<dyn UnitFactory>) -> DispatcherBuilder {
        DispatcherBuilder::new(factory)
    }

    /// Creates a dispatcher and starts its pump. Must be called from within a tokio runtime.
    pub fn new(factory: Arc<dyn UnitFactory>, config: PoolConfig) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pool: tokio::sync::Mutex::new(Pool::new(config.max_units)),
            config,
            factory,
            registry: TaskRegistry::new(),
            relays: InboundRelays::new(),
            task_ids: TaskIds::new(),
            channel_ids: ChannelIds::new(),
            unit_ids: AtomicU64::new(1),
            events,
            pump: Mutex::new(None),
            sweeper: Mutex::new(None),
        });

        let handle = tokio::spawn(pump(Arc::downgrade(&shared), rx));
        *lock(&shared.pump) = Some(handle);

        Self { shared }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Dispatches `module.function(args)` to a unit.
    ///
    /// Returns once the call has been posted. Channel arguments are relayed
    /// for the lifetime of the call.
    ///
    /// # Errors
    /// - `CallError::Protocol` if an argument cannot cross the boundary.
    /// - `CallError::Dispatch` if no unit could be spawned or reached; the
    ///   task is not registered.
    pub async fn call(&self, module: &str, function: &str, args: Vec<Value>) -> Result<RemoteCall> {
        let shared = &self.shared;
        let id = shared.task_ids.allocate(|id| shared.registry.contains(id));
        let encoded = codec::encode_args(args, &shared.channel_ids)?;
        let unit = shared.acquire(id).await?;

        let (inputs, outputs): (Vec<_>, Vec<_>) = encoded
            .channels
            .into_iter()
            .partition(|(reference, _)| reference.direction == Direction::Input);
        let output_ids: Vec<ChannelId> =
            outputs.iter().map(|(reference, _)| reference.id).collect();
        for (reference, channel) in outputs {
            shared.relays.install(reference.id, channel);
        }

        let registration =
            shared.registry.register(id, module, function, unit.id(), output_ids.clone());
        let request = Message::Call(CallRequest {
            module: module.to_string(),
            function: function.to_string(),
            args: encoded.values,
            task_id: Some(id),
        });

        if let Err(e) = unit.send(request, encoded.transfer) {
            debug!(task = %id, unit = %unit.id(), error = %e, "dispatch failed");
            shared.registry.remove(id);
            shared.release(unit.id(), id).await;
            let failure = CallError::Dispatch(e);
            shared.close_relays(&output_ids, &failure);
            return Err(failure);
        }

        // Inputs start flowing only once the far side knows the call.
        for (reference, channel) in inputs {
            shared.forward_input(reference.id, channel, unit.clone());
        }

        debug!(task = %id, unit = %unit.id(), module, function, "call dispatched");
        Ok(RemoteCall::new(id, unit, shared.clone(), registration))
    }

    /// Dispatches a call that expects no response.
    ///
    /// The unit slot is only held while the call is being posted.
    pub async fn post(&self, module: &str, function: &str, args: Vec<Value>) -> Result<()> {
        let shared = &self.shared;
        let slot = shared.task_ids.allocate(|id| shared.registry.contains(id));
        let encoded = codec::encode_args(args, &shared.channel_ids)?;
        let unit = shared.acquire(slot).await?;

        let mut inputs = Vec::new();
        let mut output_ids = Vec::new();
        for (reference, channel) in encoded.channels {
            match reference.direction {
                Direction::Input => inputs.push((reference.id, channel)),
                Direction::Output => {
                    shared.relays.install(reference.id, channel);
                    output_ids.push(reference.id);
                }
            }
        }

        let request = Message::Call(CallRequest {
            module: module.to_string(),
            function: function.to_string(),
            args: encoded.values,
            task_id: None,
        });
        let sent = unit.send(request, encoded.transfer);
        shared.release(unit.id(), slot).await;
        if let Err(e) = sent {
            debug!(unit = %unit.id(), error = %e, "detached dispatch failed");
            let failure = CallError::Dispatch(e);
            shared.close_relays(&output_ids, &failure);
            return Err(failure);
        }

        for (id, channel) in inputs {
            shared.forward_input(id, channel, unit.clone());
        }
        trace!(unit = %unit.id(), module, function, "detached call posted");
        Ok(())
    }

    /// Binds the named functions of `module` into an explicit caller table.
    pub fn bind<I, S>(&self, module: impl Into<String>, functions: I) -> BoundModule
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BoundModule::new(self.clone(), module.into(), functions)
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.shared.pool.lock().await.stats()
    }

    /// Number of calls that have not settled yet.
    pub fn pending_tasks(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn contains_task(&self, id: TaskId) -> bool {
        self.shared.registry.contains(id)
    }

    /// Stops the sweeper, fails every held task and terminates every unit.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if let Some(sweeper) = lock(&shared.sweeper).take() {
            sweeper.abort();
        }
        let drained = shared.pool.lock().await.drain();
        for (unit, tasks) in drained {
            unit.terminate();
            let failure = CallError::UnitFailed {
                unit: unit.id(),
                error: RemoteError::abort("dispatcher shut down"),
            };
            shared.fail_tasks(&tasks, &failure);
        }
        debug!("dispatcher shut down");
    }
}

impl Shared {
    /// Picks or spawns the unit that runs `task` and records the assignment.
    async fn acquire(self: &Arc<Self>, task: TaskId) -> Result<Arc<dyn ExecutionUnit>> {
        let mut pool = self.pool.lock().await;
        match pool.assign(task, Instant::now()) {
            Assignment::Idle(unit) | Assignment::Shared(unit) => Ok(unit),
            Assignment::Grow => {
                let id = UnitId(self.unit_ids.fetch_add(1, Ordering::Relaxed));
                let events = EventSink::new(id, self.events.clone());
                let unit = self.factory.spawn(id, events).await.map_err(|e| {
                    warn!(unit = %id, error = %e, "unit spawn failed");
                    CallError::Dispatch(e)
                })?;
                debug!(unit = %id, "unit spawned");
                pool.insert(unit.clone(), task, Instant::now());
                drop(pool);
                self.ensure_sweeper();
                Ok(unit)
            }
        }
    }

    async fn release(&self, unit: UnitId, task: TaskId) {
        if !self.pool.lock().await.release(unit, task, Instant::now()) {
            trace!(task = %task, unit = %unit, "release of unknown assignment");
        }
    }

    fn forward_input(
        &self,
        id: ChannelId,
        channel: exowire::Channel<Value>,
        unit: Arc<dyn ExecutionUnit>,
    ) {
        tokio::spawn(relay::forward(id, channel, move |message, transfer| {
            unit.send(message, transfer).is_ok()
        }));
    }

    /// Closes output relays the far side will never close.
    fn close_relays(&self, ids: &[ChannelId], failure: &CallError) {
        let error = failure.to_remote().to_envelope();
        for id in ids {
            let close = ChannelMessage::Close {
                channel_id: *id,
                error: Some(error.clone()),
            };
            // Already closed by the far side.
            let _ = self.relays.deliver(close);
        }
    }

    fn fail_tasks(&self, tasks: &[TaskId], failure: &CallError) {
        for task in tasks {
            if let Some(failed) = self.registry.fail(*task, failure.clone()) {
                self.close_relays(&failed.outputs, failure);
            }
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        let mut slot = lock(&self.sweeper);
        if slot.is_some() {
            return;
        }
        let interval = self.config.sweep_interval;
        *slot = Some(tokio::spawn(sweeper(Arc::downgrade(self), interval)));
        trace!(interval_ms = interval.as_millis() as u64, "idle sweeper started");
    }

    async fn sweep(&self) {
        let expired = self
            .pool
            .lock()
            .await
            .sweep(Instant::now(), self.config.idle_timeout);
        for unit in expired {
            debug!(unit = %unit.id(), "terminating idle unit");
            unit.terminate();
        }
    }

    async fn handle(&self, event: PumpEvent) {
        match event {
            PumpEvent::Unit(unit, UnitEvent::Message(message)) => {
                self.handle_message(unit, message).await
            }
            PumpEvent::Unit(unit, UnitEvent::Error(error)) => self.fail_unit(unit, error).await,
            PumpEvent::Unit(unit, UnitEvent::Exit(code)) => {
                let error = match code {
                    Some(code) => RemoteError::new(format!("unit exited with code {}", code)),
                    None => RemoteError::new("unit exited"),
                };
                self.fail_unit(unit, error.with_name("UnitExited")).await
            }
            PumpEvent::Release(unit, task) => self.release(unit, task).await,
        }
    }

    async fn handle_message(&self, unit: UnitId, message: Message) {
        let kind = message.kind();
        match message {
            Message::Response(response) => match self.registry.handle_response(response) {
                Disposition::Continue => {}
                Disposition::Settled { task, unit, settlement } => {
                    self.release(unit, task).await;
                    settlement.deliver();
                }
                Disposition::Orphaned { task, release } => {
                    self.return_orphan(unit, task).await;
                    if let Some(owner) = release {
                        self.release(owner, task).await;
                    }
                }
                Disposition::Stale(task) => {
                    trace!(task = %task, unit = %unit, kind, "dropping stale response")
                }
                Disposition::Unaddressed => {
                    debug!(unit = %unit, kind, "dropping response without task id")
                }
            },
            Message::Channel(op) => {
                if let Err(e) = self.relays.deliver(op) {
                    debug!(unit = %unit, error = %e, "dropping relay message");
                }
            }
            Message::Call(_) | Message::Control(_) => {
                warn!(unit = %unit, kind, "unexpected message from unit, dropping");
            }
        }
    }

    async fn return_orphan(&self, unit: UnitId, task: TaskId) {
        let Some(handle) = self.pool.lock().await.unit(unit) else {
            return;
        };
        let control = GeneratorControl::new(ControlKind::Return, task, vec![WireValue::Null]);
        if handle.send(Message::Control(control), Vec::new()).is_err() {
            trace!(task = %task, unit = %unit, "orphaned generator's unit is gone");
        }
    }

    async fn fail_unit(&self, unit: UnitId, error: RemoteError) {
        let Some((handle, tasks)) = self.pool.lock().await.remove(unit) else {
            trace!(unit = %unit, "event from a unit no longer in the pool");
            return;
        };
        warn!(unit = %unit, tasks = tasks.len(), error = %error, "unit failed");
        handle.terminate();
        self.fail_tasks(&tasks, &CallError::UnitFailed { unit, error });
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for (unit, _) in self.pool.get_mut().drain() {
            unit.terminate();
        }
        for slot in [&self.pump, &self.sweeper] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }
}

async fn pump(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<PumpEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle(event).await;
    }
}

async fn sweeper(shared: Weak<Shared>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.sweep().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
