//! Method routing with handler failure isolation
//!
//! Every invocation runs on its own tokio task, so a handler that returns an
//! error or panics is turned into an `ErrorInfo` instead of unwinding into the
//! endpoint loop.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{DispatchError, ErrorCode, HandlerError};
use crate::logging::{EventLog, TracingEventLog};
use crate::mcp::message::{ErrorInfo, Message, Notification, Request, Response};

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, params: Option<Value>) -> Result<Value, HandlerError>;
}

pub struct FnHandler<F>(F);

/// Wraps an async closure as a `Handler`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, params: Option<Value>) -> Result<Value, HandlerError> {
        (self.0)(params).await
    }
}

pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn Handler>>,
    allow_override: bool,
    event_log: Arc<dyn EventLog>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            allow_override: true,
            event_log: Arc::new(TracingEventLog),
        }
    }

    /// A dispatcher that refuses to replace an existing registration.
    pub fn strict() -> Self {
        Self {
            allow_override: false,
            ..Self::new()
        }
    }

    pub fn with_allow_override(mut self, allow_override: bool) -> Self {
        self.allow_override = allow_override;
        self
    }

    pub fn with_event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), DispatchError> {
        let method = method.into();
        if method.trim().is_empty() {
            return Err(DispatchError::EmptyMethod);
        }
        if !self.allow_override && self.handlers.contains_key(&method) {
            return Err(DispatchError::DuplicateMethod(method));
        }

        debug!(method = %method, "handler registered");
        self.handlers.insert(method, handler);
        Ok(())
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        method: impl Into<String>,
        f: F,
    ) -> Result<(), DispatchError>
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(method, Arc::new(handler_fn(f)))
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Routes one inbound message.
    ///
    /// Requests always produce exactly one `Response`. Notifications and stray
    /// responses never produce anything.
    pub async fn dispatch(&self, message: Message) -> Option<Response> {
        match message {
            Message::Request(request) => Some(self.dispatch_request(request).await),
            Message::Notification(notification) => {
                self.dispatch_notification(notification).await;
                None
            }
            Message::Response(response) => {
                self.event_log
                    .log(&format!("unexpected response: {}", response.id));
                None
            }
        }
    }

    async fn dispatch_request(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        let Some(handler) = self.handlers.get(&method) else {
            debug!(method = %method, id = %id, "method not found");
            return Response::failure(
                id,
                ErrorInfo::from_code(ErrorCode::MethodNotFound)
                    .with_data(serde_json::json!({ "method": method })),
            );
        };

        match invoke(Arc::clone(handler), params).await {
            Ok(result) => Response::success(id, result),
            Err(err) => {
                warn!(method = %method, id = %id, error = %err, "handler failed");
                Response::failure(id, ErrorInfo::from(err))
            }
        }
    }

    async fn dispatch_notification(&self, notification: Notification) {
        let Notification { method, params } = notification;
        let Some(handler) = self.handlers.get(&method) else {
            debug!(method = %method, "notification for unregistered method ignored");
            return;
        };

        if let Err(err) = invoke(Arc::clone(handler), params).await {
            warn!(method = %method, error = %err, "notification handler failed");
            self.event_log
                .log(&format!("notification handler failed: {method}: {err}"));
        }
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn invoke(handler: Arc<dyn Handler>, params: Option<Value>) -> Result<Value, HandlerError> {
    let task = tokio::spawn(async move { handler.call(params).await });
    // The caller may itself be aborted during drain; take the handler with it.
    let _guard = AbortOnDrop(task.abort_handle());
    match task.await {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => Err(HandlerError::Panicked),
        Err(err) => Err(HandlerError::internal(err.to_string())),
    }
}
