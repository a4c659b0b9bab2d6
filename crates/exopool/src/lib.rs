//! # ExoPool
//!
//! Runs calls on a bounded pool of isolated execution units and hands the
//! caller back a [`RemoteCall`] to await or iterate.
//!
//! ## Architecture
//!
//! - **Orchestrator side**: [`Dispatcher`] owns the task registry, the unit
//!   pool and the pump that applies responses.
//! - **Remote side**: [`Worker`] runs inside a unit, resolving callables from
//!   [`Module`]s and streaming their results back.
//! - **Seam**: [`ExecutionUnit`] and [`UnitFactory`]. [`ThreadUnitFactory`]
//!   puts each unit on its own OS thread.

pub mod bound;
pub mod call;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod module;
pub mod pool;
pub mod registry;
pub mod thread;
pub mod unit;
pub mod worker;

pub use bound::BoundModule;
pub use bound::RemoteFn;
pub use call::CallKind;
pub use call::RemoteCall;
pub use call::Step;
pub use config::PoolConfig;
pub use dispatcher::Dispatcher;
pub use dispatcher::DispatcherBuilder;
pub use error::CallError;
pub use module::Generator;
pub use module::GeneratorState;
pub use module::IterGenerator;
pub use module::Module;
pub use module::ModuleRegistry;
pub use module::Resolver;
pub use module::StreamGenerator;
pub use pool::PoolStats;
pub use thread::ThreadUnitFactory;
pub use unit::EventSink;
pub use unit::ExecutionUnit;
pub use unit::UnitFactory;
pub use unit::UnitId;
pub use worker::Worker;

#[cfg(test)]
mod mock_unit;
