//! # Modules
//!
//! What an execution unit can run. A [`Module`] is an explicit table from
//! function name to [`Callable`]; a [`Resolver`] finds modules by name.
//!
//! Callables come in three shapes:
//! - plain functions, run to completion inline,
//! - async functions, spawned on the unit's runtime,
//! - generators, which yield a series of values and may accept input on
//!   every resume.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use exowire::RemoteError;
use exowire::Value;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// The outcome of running a callable.
pub type CallResult = std::result::Result<Value, RemoteError>;

pub type PlainFn = Arc<dyn Fn(Vec<Value>) -> CallResult + Send + Sync>;
pub type AsyncFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, CallResult> + Send + Sync>;
pub type GeneratorFn =
    Arc<dyn Fn(Vec<Value>) -> std::result::Result<Box<dyn Generator>, RemoteError> + Send + Sync>;

#[derive(Clone)]
pub enum Callable {
    Plain(PlainFn),
    Async(AsyncFn),
    Generator(GeneratorFn),
}

impl Callable {
    pub fn is_generator(&self) -> bool {
        matches!(self, Self::Generator(_))
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => write!(f, "Callable::Plain"),
            Self::Async(_) => write!(f, "Callable::Async"),
            Self::Generator(_) => write!(f, "Callable::Generator"),
        }
    }
}

/// Where a generator stands after being resumed.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorState {
    Yielded(Value),
    Complete(Value),
}

/// A resumable computation driven by `next`/`return`/`throw` controls.
#[async_trait::async_trait]
pub trait Generator: Send + 'static {
    /// Runs until the next yield or completion. `input` is the value passed to `next`.
    async fn resume(&mut self, input: Value) -> std::result::Result<GeneratorState, RemoteError>;

    /// Asks the generator to stop early, completing with `value`.
    async fn finish(&mut self, value: Value) -> std::result::Result<GeneratorState, RemoteError> {
        Ok(GeneratorState::Complete(value))
    }

    /// Raises `error` at the generator's suspension point.
    async fn throw(
        &mut self,
        error: RemoteError,
    ) -> std::result::Result<GeneratorState, RemoteError> {
        Err(error)
    }
}

/// A synchronous generator over an iterator, completing with a fixed value.
pub struct IterGenerator<I> {
    iter: I,
    output: Option<Value>,
}

impl<I> IterGenerator<I>
where
    I: Iterator<Item = Value> + Send + 'static,
{
    pub fn new(values: impl IntoIterator<IntoIter = I>, output: Value) -> Self {
        Self {
            iter: values.into_iter(),
            output: Some(output),
        }
    }
}

#[async_trait::async_trait]
impl<I> Generator for IterGenerator<I>
where
    I: Iterator<Item = Value> + Send + 'static,
{
    async fn resume(&mut self, _input: Value) -> std::result::Result<GeneratorState, RemoteError> {
        Ok(match self.iter.next() {
            Some(value) => GeneratorState::Yielded(value),
            None => GeneratorState::Complete(self.output.take().unwrap_or(Value::Null)),
        })
    }
}

/// An async generator over a stream, completing with a fixed value.
///
/// An `Err` item fails the generator.
pub struct StreamGenerator {
    stream: BoxStream<'static, CallResult>,
    output: Option<Value>,
}

impl StreamGenerator {
    pub fn new<S>(stream: S, output: Value) -> Self
    where
        S: futures::Stream<Item = CallResult> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
            output: Some(output),
        }
    }
}

#[async_trait::async_trait]
impl Generator for StreamGenerator {
    async fn resume(&mut self, _input: Value) -> std::result::Result<GeneratorState, RemoteError> {
        match self.stream.next().await {
            Some(Ok(value)) => Ok(GeneratorState::Yielded(value)),
            Some(Err(error)) => Err(error),
            None => Ok(GeneratorState::Complete(self.output.take().unwrap_or(Value::Null))),
        }
    }
}

/// A named table of callables.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    functions: BTreeMap<String, Callable>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a plain function.
    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> CallResult + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Callable::Plain(Arc::new(f)));
        self
    }

    /// Adds an async function.
    pub fn async_function<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let f: AsyncFn =
            Arc::new(move |args| -> BoxFuture<'static, CallResult> { Box::pin(f(args)) });
        self.functions.insert(name.into(), Callable::Async(f));
        self
    }

    /// Adds a generator function. `f` builds a fresh generator per call.
    pub fn generator<F, G>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> std::result::Result<G, RemoteError> + Send + Sync + 'static,
        G: Generator,
    {
        let f: GeneratorFn =
            Arc::new(move |args| f(args).map(|g| Box::new(g) as Box<dyn Generator>));
        self.functions.insert(name.into(), Callable::Generator(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.functions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// Finds a module by name.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, module: &str) -> std::result::Result<Arc<Module>, RemoteError>;
}

/// A [`Resolver`] over a fixed set of modules.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, module: Module) -> Self {
        self.insert(module);
        self
    }

    pub fn insert(&mut self, module: Module) {
        self.modules.insert(module.name.clone(), Arc::new(module));
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Resolver for ModuleRegistry {
    fn resolve(&self, module: &str) -> std::result::Result<Arc<Module>, RemoteError> {
        self.modules.get(module).cloned().ok_or_else(|| {
            RemoteError::new(format!("Cannot find module '{}'", module)).with_name("ModuleNotFound")
        })
    }
}
