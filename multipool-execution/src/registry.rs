//! Named task functions compiled into the worker executable
//!
//! Functions cannot cross a process boundary, so submitted work names a
//! function and the worker looks it up here. The same registry carries the
//! optional process initializer, the failure handler and the hook that
//! prepares every inner runtime.

use futures::future::{BoxFuture, FutureExt};
use multipool_ipc::TaskEnvelope;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Arguments of one task invocation
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCall {
    pub function: String,
    pub args: Vec<JsonValue>,
    pub kwargs: Map<String, JsonValue>,
}

impl TaskCall {
    pub fn new(
        function: impl Into<String>,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
    ) -> Self {
        Self {
            function: function.into(),
            args,
            kwargs,
        }
    }

    /// Positional argument `index` decoded as `T`
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self.args.get(index).ok_or_else(|| {
            TaskError::new(format!(
                "{}: missing positional argument {}",
                self.function, index
            ))
        })?;

        serde_json::from_value(value.clone()).map_err(|e| {
            TaskError::new(format!("{}: argument {}: {}", self.function, index, e))
        })
    }

    /// Keyword argument `name` decoded as `T`, `None` when absent
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        match self.kwargs.get(name) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| TaskError::new(format!("{}: argument {}: {}", self.function, name, e))),
            None => Ok(None),
        }
    }
}

impl From<TaskEnvelope> for TaskCall {
    fn from(envelope: TaskEnvelope) -> Self {
        Self {
            function: envelope.function,
            args: envelope.args,
            kwargs: envelope.kwargs,
        }
    }
}

/// Error returned by a task function
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

pub type TaskResult = Result<JsonValue, TaskError>;

pub type TaskFn = Arc<dyn Fn(TaskCall) -> BoxFuture<'static, TaskResult> + Send + Sync>;
pub type InitializerFn = Arc<dyn Fn(&[JsonValue]) -> Result<(), TaskError> + Send + Sync>;
pub type FailureHandlerFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type LoopBootstrapFn = Arc<dyn Fn(&mut tokio::runtime::Builder) + Send + Sync>;

/// Registry of task functions and process hooks
#[derive(Clone, Default)]
pub struct TaskRegistry {
    functions: HashMap<String, TaskFn>,
    initializers: HashMap<String, InitializerFn>,
    failure_handler: Option<FailureHandlerFn>,
    loop_bootstrap: Option<LoopBootstrapFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async task function
    pub fn register<F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let task: TaskFn = Arc::new(move |call: TaskCall| func(call).boxed());
        self.functions.insert(name.into(), task);
        self
    }

    /// Register a synchronous task function. It runs on the inner thread and
    /// holds that thread's scheduler while it runs.
    pub fn register_blocking<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(TaskCall) -> TaskResult + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        let task: TaskFn = Arc::new(move |call: TaskCall| {
            let func = func.clone();
            async move { func(call) }.boxed()
        });
        self.functions.insert(name.into(), task);
        self
    }

    /// Register a named process initializer, run once before a worker
    /// accepts work
    pub fn with_initializer<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[JsonValue]) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.initializers.insert(name.into(), Arc::new(func));
        self
    }

    /// Handler invoked with the trace of every failed task
    pub fn with_failure_handler<F>(mut self, func: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.failure_handler = Some(Arc::new(func));
        self
    }

    /// Hook applied to every runtime builder before the runtime starts
    pub fn with_loop_bootstrap<F>(mut self, func: F) -> Self
    where
        F: Fn(&mut tokio::runtime::Builder) + Send + Sync + 'static,
    {
        self.loop_bootstrap = Some(Arc::new(func));
        self
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn initializer(&self, name: &str) -> Option<InitializerFn> {
        self.initializers.get(name).cloned()
    }

    pub fn failure_handler(&self) -> Option<FailureHandlerFn> {
        self.failure_handler.clone()
    }

    pub fn loop_bootstrap(&self) -> Option<LoopBootstrapFn> {
        self.loop_bootstrap.clone()
    }

    /// Registered function names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut initializers: Vec<&String> = self.initializers.keys().collect();
        initializers.sort_unstable();

        f.debug_struct("TaskRegistry")
            .field("functions", &self.names())
            .field("initializers", &initializers)
            .field("failure_handler", &self.failure_handler.is_some())
            .field("loop_bootstrap", &self.loop_bootstrap.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn call(function: &str, args: Vec<JsonValue>) -> TaskCall {
        TaskCall::new(function, args, Map::new())
    }

    #[test]
    fn test_typed_arguments() {
        let mut kwargs = Map::new();
        kwargs.insert("scale".to_string(), json!(2.5));
        let call = TaskCall::new("mul", vec![json!(3), json!("x")], kwargs);

        assert_eq!(call.arg::<i64>(0).unwrap(), 3);
        assert_eq!(call.arg::<String>(1).unwrap(), "x");
        assert!(call.arg::<i64>(1).is_err());
        assert!(call.arg::<i64>(5).unwrap_err().message().contains("missing positional argument 5"));
        assert_eq!(call.kwarg::<f64>("scale").unwrap(), Some(2.5));
        assert_eq!(call.kwarg::<f64>("offset").unwrap(), None);
    }

    async fn double(call: TaskCall) -> TaskResult {
        let x: i64 = call.arg(0)?;
        Ok(json!(x * 2))
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let registry = TaskRegistry::new()
            .register("double", double)
            .register_blocking("negate", |call| {
                let x: i64 = call.arg(0)?;
                Ok(json!(-x))
            });

        assert_eq!(registry.names(), vec!["double", "negate"]);
        assert!(registry.contains("double"));
        assert!(registry.get("missing").is_none());

        let double = registry.get("double").unwrap();
        assert_eq!(double(call("double", vec![json!(21)])).await.unwrap(), json!(42));

        let negate = registry.get("negate").unwrap();
        assert_eq!(negate(call("negate", vec![json!(5)])).await.unwrap(), json!(-5));
    }

    #[test]
    fn test_hooks() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();

        let registry = TaskRegistry::new()
            .with_initializer("check", |args| {
                if args.is_empty() {
                    Err(TaskError::new("initializer needs arguments"))
                } else {
                    Ok(())
                }
            })
            .with_failure_handler(move |_trace| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .with_loop_bootstrap(|builder| {
                builder.thread_name("bootstrapped");
            });

        let init = registry.initializer("check").unwrap();
        assert!(init(&[]).is_err());
        assert!(init(&[json!(1)]).is_ok());
        assert!(registry.initializer("other").is_none());

        (registry.failure_handler().unwrap())("boom");
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        let mut builder = tokio::runtime::Builder::new_current_thread();
        (registry.loop_bootstrap().unwrap())(&mut builder);
        assert!(builder.build().is_ok());
    }
}
