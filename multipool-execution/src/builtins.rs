//! Task functions shipped with the `multipool-worker` binary

use crate::registry::{TaskCall, TaskError, TaskRegistry, TaskResult};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

/// Registry used by the default worker executable
pub fn builtin_registry() -> TaskRegistry {
    TaskRegistry::new()
        .register_blocking("square", square)
        .register_blocking("add", add)
        .register_blocking("echo", echo)
        .register_blocking("fail", fail)
        .register_blocking("panic", panic_task)
        .register_blocking("pid", |_| Ok(json!(std::process::id())))
        .register_blocking("env", env)
        .register_blocking("abort", |_| std::process::abort())
        .register("sleep_ms", sleep_ms)
        .register_blocking("block_ms", block_ms)
        .with_initializer("set_env", set_env)
}

fn square(call: TaskCall) -> TaskResult {
    match call.arg::<i64>(0) {
        Ok(x) => x
            .checked_mul(x)
            .map(|v| json!(v))
            .ok_or_else(|| TaskError::new(format!("square: {} overflows", x))),
        Err(_) => {
            let x: f64 = call.arg(0)?;
            Ok(json!(x * x))
        }
    }
}

fn add(call: TaskCall) -> TaskResult {
    let ints: Result<Vec<i64>, _> = (0..call.args.len()).map(|i| call.arg::<i64>(i)).collect();
    if let Ok(ints) = ints {
        return Ok(json!(ints.iter().sum::<i64>()));
    }

    let mut total = 0.0;
    for i in 0..call.args.len() {
        total += call.arg::<f64>(i)?;
    }
    Ok(json!(total))
}

/// Returns the single positional argument, or all arguments when there are
/// several or any keyword arguments
fn echo(call: TaskCall) -> TaskResult {
    if call.args.len() == 1 && call.kwargs.is_empty() {
        return Ok(call.args[0].clone());
    }
    Ok(json!({ "args": call.args, "kwargs": call.kwargs }))
}

fn fail(call: TaskCall) -> TaskResult {
    let message: String = call.arg(0).unwrap_or_else(|_| "task failed".to_string());
    Err(TaskError::new(message))
}

fn panic_task(call: TaskCall) -> TaskResult {
    let message: String = call.arg(0).unwrap_or_else(|_| "task panicked".to_string());
    panic!("{}", message)
}

fn env(call: TaskCall) -> TaskResult {
    let name: String = call.arg(0)?;
    Ok(std::env::var(&name).map(JsonValue::String).unwrap_or(JsonValue::Null))
}

async fn sleep_ms(call: TaskCall) -> TaskResult {
    let millis: u64 = call.arg(0)?;
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(call.args.get(1).cloned().unwrap_or_else(|| json!(millis)))
}

/// Blocks the inner thread, then returns the thread's name
fn block_ms(call: TaskCall) -> TaskResult {
    let millis: u64 = call.arg(0)?;
    std::thread::sleep(Duration::from_millis(millis));
    let name = std::thread::current().name().unwrap_or_default().to_string();
    Ok(json!(name))
}

/// `set_env(name, value)`: export a variable to the whole worker process
fn set_env(args: &[JsonValue]) -> Result<(), TaskError> {
    match args {
        [JsonValue::String(name), value] => {
            let value = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            std::env::set_var(name, value);
            Ok(())
        }
        _ => Err(TaskError::new("set_env expects a name and a value")),
    }
}
