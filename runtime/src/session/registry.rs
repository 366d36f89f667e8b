//! Method-name to handler mapping.

use super::context::{NotificationContext, RequestContext};
use duplex_rpc_core::error::HandlerError;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handler for one request method.
pub type RequestHandlerFn =
    Arc<dyn Fn(RequestContext) -> BoxFuture<Result<Value, HandlerError>> + Send + Sync>;

/// Handler for one notification method.
pub type NotificationHandlerFn = Arc<dyn Fn(NotificationContext) -> BoxFuture<()> + Send + Sync>;

/// What a method name is bound to.
#[derive(Clone)]
pub enum MethodHandler {
    /// Spawned per request; its result becomes the response.
    Request(RequestHandlerFn),
    /// Awaited inline on the dispatch loop, in arrival order.
    Notification(NotificationHandlerFn),
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(_) => f.write_str("MethodHandler::Request"),
            Self::Notification(_) => f.write_str("MethodHandler::Notification"),
        }
    }
}

/// Shared values handed to every handler, keyed by type.
#[derive(Clone, Default)]
pub(crate) struct StateMap {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl StateMap {
    pub(crate) fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }
}

/// Handlers a session dispatches to.
///
/// Notification handlers run inline on the dispatch loop, which preserves
/// their order but means they must not await a response on the same
/// session. Request handlers each run in their own task.
///
/// # Example
///
/// ```
/// use duplex_rpc_runtime::session::HandlerRegistry;
/// use serde_json::json;
///
/// let mut registry = HandlerRegistry::new();
/// registry
///     .on_request("ping", |_cx| async { Ok(json!({})) })
///     .on_notification("notifications/initialized", |_cx| async {});
/// assert!(registry.contains("ping"));
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, MethodHandler>,
    fallback_notification: Option<NotificationHandlerFn>,
    state: StateMap,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a request handler to `method`, replacing any previous binding.
    pub fn on_request<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: RequestHandlerFn = Arc::new(move |cx| Box::pin(handler(cx)));
        self.handlers
            .insert(method.into(), MethodHandler::Request(handler));
        self
    }

    /// Bind a notification handler to `method`, replacing any previous binding.
    pub fn on_notification<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: NotificationHandlerFn = Arc::new(move |cx| Box::pin(handler(cx)));
        self.handlers
            .insert(method.into(), MethodHandler::Notification(handler));
        self
    }

    /// Handler for notifications with no binding. Without one they are
    /// dropped.
    pub fn on_unknown_notification<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.fallback_notification = Some(Arc::new(move |cx| Box::pin(handler(cx))));
        self
    }

    /// Share `state` with every handler; retrieve it with
    /// [`RequestContext::state`].
    pub fn with_state<T: Send + Sync + 'static>(&mut self, state: Arc<T>) -> &mut Self {
        self.state.values.insert(TypeId::of::<T>(), state);
        self
    }

    /// Whether `method` has a binding.
    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Binding for `method`.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<&MethodHandler> {
        self.handlers.get(method)
    }

    pub(crate) fn fallback_notification(&self) -> Option<&NotificationHandlerFn> {
        self.fallback_notification.as_ref()
    }

    pub(crate) fn state(&self) -> &StateMap {
        &self.state
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("methods", &methods)
            .field("fallback_notification", &self.fallback_notification.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counter(u32);

    #[test]
    fn later_bindings_replace_earlier_ones() {
        let mut registry = HandlerRegistry::new();
        registry
            .on_request("m", |_cx| async { Ok(json!(1)) })
            .on_notification("m", |_cx| async {});
        assert!(matches!(registry.get("m"), Some(MethodHandler::Notification(_))));
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn state_is_keyed_by_type() {
        let mut registry = HandlerRegistry::new();
        registry.with_state(Arc::new(Counter(3)));
        assert_eq!(registry.state().get::<Counter>().map(|c| c.0), Some(3));
        assert!(registry.state().get::<String>().is_none());
    }

    #[test]
    fn debug_lists_methods() {
        let mut registry = HandlerRegistry::new();
        registry
            .on_request("b", |_cx| async { Ok(json!(null)) })
            .on_request("a", |_cx| async { Ok(json!(null)) });
        let debug = format!("{registry:?}");
        assert!(debug.contains(r#"methods: ["a", "b"]"#));
    }
}
