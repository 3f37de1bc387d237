//! Dispatcher (C6): submits a serialised envelope to the broker on a
//! queue chosen by command identity and awaits the serialised response.
//!
//! The broker itself is out of scope (spec §1); this crate defines the
//! [`Broker`] seam and ships [`InMemoryBroker`], an in-process request/
//! response router used by the workspace's end-to-end tests in place of a
//! real message broker.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use cmdproxy_error::CmdproxyError;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// A pending task handler's return value.
pub type TaskFuture = Pin<Box<dyn Future<Output = String> + Send>>;

/// A registered task handler: receives the JSON payload, returns the JSON
/// response.
pub type TaskHandler = Arc<dyn Fn(String) -> TaskFuture + Send + Sync>;

/// The broker seam. A single task name, `"run"`, is ever submitted (spec
/// §6); `queue` selects which worker pool receives it.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit `payload` as task `task_name` on `queue` and await the
    /// worker's response.
    async fn submit(
        &self,
        queue: &str,
        task_name: &str,
        payload: String,
    ) -> Result<String, CmdproxyError>;

    /// Register a handler for `task_name` on `queue`. Overwrites any
    /// previous registration for the same pair.
    fn register(&self, queue: &str, task_name: &str, handler: TaskHandler);
}

/// Submit `envelope_json` on `queue` via `broker`, optionally bounded by
/// `timeout`. This is the dispatcher's one operation (spec §4.6).
pub async fn dispatch(
    broker: &dyn Broker,
    queue: &str,
    envelope_json: String,
    timeout: Option<Duration>,
) -> Result<String, CmdproxyError> {
    let fut = broker.submit(queue, "run", envelope_json);
    match timeout {
        Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| {
            CmdproxyError::dispatch_failure(format!("broker submit timed out after {d:?}"))
        })?,
        None => fut.await,
    }
}

/// In-process `Broker` test double: a queue/task-keyed map of handlers.
/// `submit` invokes the matching handler directly, synchronously from the
/// caller's point of view — there is no real transport.
#[derive(Default, Clone)]
pub struct InMemoryBroker {
    handlers: Arc<Mutex<HashMap<(String, String), TaskHandler>>>,
}

impl InMemoryBroker {
    /// Create an empty broker with no registered handlers.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn submit(
        &self,
        queue: &str,
        task_name: &str,
        payload: String,
    ) -> Result<String, CmdproxyError> {
        let handler = {
            let handlers = self.handlers.lock().await;
            handlers
                .get(&(queue.to_string(), task_name.to_string()))
                .cloned()
        };
        let handler = handler.ok_or_else(|| {
            CmdproxyError::dispatch_failure(format!(
                "no handler registered for task '{task_name}' on queue '{queue}'"
            ))
        })?;
        debug!(queue, task_name, "submitting task to in-memory broker");
        Ok(handler(payload).await)
    }

    fn register(&self, queue: &str, task_name: &str, handler: TaskHandler) {
        let key = (queue.to_string(), task_name.to_string());
        let handlers = Arc::clone(&self.handlers);
        tokio::spawn(async move {
            handlers.lock().await.insert(key, handler);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_handler() -> TaskHandler {
        Arc::new(|payload| Box::pin(async move { format!("echo:{payload}") }))
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let broker = InMemoryBroker::new();
        broker.register("sh", "run", echo_handler());
        // registration is spawned; yield so it lands before dispatch.
        tokio::task::yield_now().await;
        let resp = dispatch(&broker, "sh", "hello".to_string(), None).await.unwrap();
        assert_eq!(resp, "echo:hello");
    }

    #[tokio::test]
    async fn missing_handler_is_dispatch_failure() {
        let broker = InMemoryBroker::new();
        let err = dispatch(&broker, "nope", "x".to_string(), None).await.unwrap_err();
        assert_eq!(err.code, cmdproxy_error::ErrorCode::DispatchFailure);
    }

    #[tokio::test]
    async fn timeout_elapses_as_dispatch_failure() {
        let broker = InMemoryBroker::new();
        broker.register(
            "slow",
            "run",
            Arc::new(|_| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "late".to_string()
                })
            }),
        );
        tokio::task::yield_now().await;
        let err = dispatch(
            &broker,
            "slow",
            "x".to_string(),
            Some(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, cmdproxy_error::ErrorCode::DispatchFailure);
    }
}
