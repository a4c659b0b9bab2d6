//! # Bound Modules
//!
//! An explicit caller table for one remote module. The set of callable
//! names is fixed when the module is bound, so it can be listed up front
//! and a typo fails locally instead of on a unit.

use std::collections::BTreeMap;

use exowire::Value;

use crate::call::RemoteCall;
use crate::dispatcher::Dispatcher;
use crate::error::CallError;
use crate::error::Result;

/// A caller for one function of a bound module.
#[derive(Clone)]
pub struct RemoteFn {
    dispatcher: Dispatcher,
    module: String,
    name: String,
}

impl RemoteFn {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<RemoteCall> {
        self.dispatcher.call(&self.module, &self.name, args).await
    }

    /// Calls without expecting a response.
    pub async fn post(&self, args: Vec<Value>) -> Result<()> {
        self.dispatcher.post(&self.module, &self.name, args).await
    }
}

impl std::fmt::Debug for RemoteFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteFn({}.{})", self.module, self.name)
    }
}

#[derive(Clone)]
pub struct BoundModule {
    module: String,
    functions: BTreeMap<String, RemoteFn>,
}

impl BoundModule {
    pub(crate) fn new<I, S>(dispatcher: Dispatcher, module: String, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let functions = functions
            .into_iter()
            .map(|name| {
                let name = name.into();
                let caller = RemoteFn {
                    dispatcher: dispatcher.clone(),
                    module: module.clone(),
                    name: name.clone(),
                };
                (name, caller)
            })
            .collect();
        Self { module, functions }
    }

    pub fn name(&self) -> &str {
        &self.module
    }

    /// The bound function names, in sorted order.
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn function(&self, name: &str) -> Option<&RemoteFn> {
        self.functions.get(name)
    }

    /// Calls a bound function by name.
    ///
    /// # Errors
    /// Returns `CallError::UnknownFunction` without dispatching if `name` was not bound.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<RemoteCall> {
        let function = self.function(name).ok_or_else(|| CallError::UnknownFunction {
            module: self.module.clone(),
            function: name.to_string(),
        })?;
        function.call(args).await
    }
}

impl std::fmt::Debug for BoundModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundModule")
            .field("module", &self.module)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}
