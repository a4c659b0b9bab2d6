//! Integration tests for exopool running calls on real thread units.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use exopool::CallError;
use exopool::CallKind;
use exopool::Dispatcher;
use exopool::Generator;
use exopool::GeneratorState;
use exopool::IterGenerator;
use exopool::Module;
use exopool::ModuleRegistry;
use exopool::StreamGenerator;
use exopool::ThreadUnitFactory;
use exowire::Channel;
use exowire::RemoteError;
use exowire::Value;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

/// Routes dispatcher logs to the test output when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn int(value: &Value) -> i64 {
    value.as_i64().unwrap_or_default()
}

/// Sums everything passed to `next` and yields the running total.
struct Accumulator {
    total: i64,
}

#[async_trait::async_trait]
impl Generator for Accumulator {
    async fn resume(&mut self, input: Value) -> Result<GeneratorState, RemoteError> {
        self.total += int(&input);
        Ok(GeneratorState::Yielded(Value::Int(self.total)))
    }

    async fn finish(&mut self, _value: Value) -> Result<GeneratorState, RemoteError> {
        Ok(GeneratorState::Complete(Value::Int(self.total)))
    }
}

fn modules() -> ModuleRegistry {
    let math = Module::new("math")
        .function("add", |args| Ok(Value::Int(args.iter().map(int).sum())))
        .function("fail", |_| {
            Err(RemoteError::new("out of range").with_name("RangeError").with_code("E_RANGE"))
        })
        .function("crash", |_| panic!("unit blew up"))
        .async_function("slow_double", |args| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Value::Int(args.first().map(int).unwrap_or_default() * 2))
        })
        .async_function("hang", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });

    let generators = Module::new("gen")
        .generator("count", |args| {
            let limit = args.first().map(int).unwrap_or(3);
            Ok(IterGenerator::new((1..=limit).map(Value::Int), Value::from("end")))
        })
        .generator("letters", |_| {
            let letters = futures::stream::iter(["a", "b"].map(|s| Ok(Value::from(s))));
            Ok(StreamGenerator::new(letters, Value::Null))
        })
        .generator("accumulate", |_| Ok(Accumulator { total: 0 }));

    let io = Module::new("io")
        .async_function("sum", |args| async move {
            let Some(input) = args.first().and_then(Value::as_channel) else {
                return Err(RemoteError::new("expected a channel").with_name("TypeError"));
            };
            let mut total = 0;
            while let Some(value) = input.channel.recv().await? {
                total += int(&value);
            }
            Ok(Value::Int(total))
        })
        .function("fill", |args| {
            if let Some(output) = args.first().and_then(Value::as_channel) {
                for i in 1..=3 {
                    let _ = output.channel.try_send(Value::Int(i));
                }
            }
            Ok(Value::Null)
        })
        .function("leak", |_| Ok(Value::output(Channel::unbounded())));

    ModuleRegistry::new().with(math).with(generators).with(io)
}

fn dispatcher(max_units: usize) -> Dispatcher {
    init_tracing();
    let factory = ThreadUnitFactory::new(modules()).name_prefix("exopool-test");
    Dispatcher::builder(Arc::new(factory)).max_units(max_units).build()
}

// --- Plain and async functions ---

#[tokio::test]
async fn test_add() -> anyhow::Result<()> {
    let dispatcher = dispatcher(2);

    let result = dispatcher
        .call("math", "add", vec![Value::Int(2), Value::Int(3)])
        .await?
        .await?;

    assert_eq!(result, Value::Int(5));
    assert_eq!(dispatcher.pending_tasks(), 0);
    assert_eq!(dispatcher.pool_stats().await.busy, 0);
    Ok(())
}

#[tokio::test]
async fn test_async_function_runs_concurrently() -> anyhow::Result<()> {
    let dispatcher = dispatcher(2);

    let mut calls = Vec::new();
    for i in 0..8 {
        calls.push(dispatcher.call("math", "slow_double", vec![Value::Int(i)]).await?);
    }
    let results = futures::future::join_all(calls.into_iter().map(IntoFuture::into_future)).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result?, Value::Int(i as i64 * 2));
    }
    assert!(dispatcher.pool_stats().await.units <= 2);
    Ok(())
}

#[tokio::test]
async fn test_error_keeps_name_and_code() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);

    let error = dispatcher.call("math", "fail", vec![]).await?.await.unwrap_err();
    let remote = error.remote().expect("remote error");

    assert_eq!(remote.name, "RangeError");
    assert_eq!(remote.code.as_deref(), Some("E_RANGE"));
    assert_eq!(remote.message, "out of range");
    Ok(())
}

#[tokio::test]
async fn test_missing_module_and_function() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);

    let error = dispatcher.call("nope", "f", vec![]).await?.await.unwrap_err();
    assert_eq!(error.remote().map(|e| e.name.as_str()), Some("ModuleNotFound"));

    let error = dispatcher.call("math", "nope", vec![]).await?.await.unwrap_err();
    assert_eq!(error.remote().map(|e| e.name.as_str()), Some("FunctionNotFound"));
    Ok(())
}

#[tokio::test]
async fn test_returning_a_channel_is_not_cloneable() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);

    let error = dispatcher.call("io", "leak", vec![]).await?.await.unwrap_err();
    let remote = error.remote().expect("remote error");

    assert_eq!(remote.name, "DataCloneError");
    assert!(remote.stack.as_deref().unwrap_or_default().contains("at leak (io)"));
    Ok(())
}

#[tokio::test]
async fn test_panic_fails_the_unit() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);

    match dispatcher.call("math", "crash", vec![]).await?.await {
        Err(CallError::UnitFailed { error, .. }) => {
            assert_eq!(error.name, "UnitPanic");
            assert!(error.message.contains("unit blew up"));
        }
        other => panic!("expected a unit failure, got {:?}", other),
    }

    // A fresh unit takes over.
    let result = dispatcher.call("math", "add", vec![Value::Int(1)]).await?.await?;
    assert_eq!(result, Value::Int(1));
    Ok(())
}

#[tokio::test]
async fn test_bound_module() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);
    let math = dispatcher.bind("math", ["add", "slow_double"]);

    let double = math.function("slow_double").expect("bound");
    assert_eq!(double.call(vec![Value::Int(21)]).await?.await?, Value::Int(42));

    let missing = math.call("mul", vec![]).await;
    assert!(matches!(missing, Err(CallError::UnknownFunction { .. })));
    Ok(())
}

// --- Generators ---

#[tokio::test]
async fn test_iterate_generator() -> anyhow::Result<()> {
    let dispatcher = dispatcher(2);

    let mut call = dispatcher.call("gen", "count", vec![Value::Int(4)]).await?;
    let values: Vec<Value> = call
        .stream()
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;

    assert_eq!(values, (1..=4).map(Value::Int).collect::<Vec<_>>());
    assert_eq!(call.kind(), Some(CallKind::Streaming));
    assert_eq!(call.await?, Value::from("end"));
    Ok(())
}

#[tokio::test]
async fn test_stream_generator() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);

    let mut call = dispatcher.call("gen", "letters", vec![]).await?;
    assert_eq!(call.next(Value::Null).await?.value, Value::from("a"));
    assert_eq!(call.next(Value::Null).await?.value, Value::from("b"));

    let last = call.next(Value::Null).await?;
    assert!(last.done);
    assert_eq!(last.value, Value::Null);
    Ok(())
}

#[tokio::test]
async fn test_two_way_generator() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);

    let mut call = dispatcher.call("gen", "accumulate", vec![]).await?;
    assert_eq!(call.next(Value::Int(5)).await?.value, Value::Int(5));
    assert_eq!(call.next(Value::Int(10)).await?.value, Value::Int(15));
    assert_eq!(call.next(Value::Int(-3)).await?.value, Value::Int(12));

    let step = call.return_value(Value::from("ignored"))?;
    assert!(step.done);
    assert!(call.is_finished());
    assert_eq!(dispatcher.pending_tasks(), 0);
    Ok(())
}

#[tokio::test]
async fn test_throw_into_generator() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);

    let mut call = dispatcher.call("gen", "count", vec![Value::Int(100)]).await?;
    assert_eq!(call.next(Value::Null).await?.value, Value::Int(1));

    let error = call.throw(RemoteError::new("stop")).unwrap_err();
    assert_eq!(error.remote().map(|e| e.message.as_str()), Some("stop"));
    assert!(call.is_finished());

    // The unit is still healthy.
    let result = dispatcher.call("math", "add", vec![Value::Int(2), Value::Int(2)]).await?.await?;
    assert_eq!(result, Value::Int(4));
    Ok(())
}

// --- Channels ---

#[tokio::test]
async fn test_input_channel() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);
    let input = Channel::unbounded();

    let call = dispatcher.call("io", "sum", vec![Value::input(input.clone())]).await?;
    for i in 0..10 {
        input.send(Value::Int(i)).await.expect("input open");
    }
    input.close(None);

    assert_eq!(call.await?, Value::Int(45));
    Ok(())
}

#[tokio::test]
async fn test_output_channel() -> anyhow::Result<()> {
    let dispatcher = dispatcher(1);
    let output = Channel::unbounded();

    let call = dispatcher.call("io", "fill", vec![Value::output(output.clone())]).await?;
    assert_eq!(call.await?, Value::Null);

    let mut received = Vec::new();
    while let Some(value) = output.recv().await? {
        received.push(value);
    }
    assert_eq!(received, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_terminates_units() -> anyhow::Result<()> {
    let dispatcher = dispatcher(2);

    let call = dispatcher.call("math", "hang", vec![]).await?;
    dispatcher.shutdown().await;

    assert!(matches!(call.await, Err(CallError::UnitFailed { .. })));
    assert_eq!(dispatcher.pool_stats().await.units, 0);
    Ok(())
}
