//! Method-keyed message dispatch.

use fnv::FnvHashMap;
use http::Method;

/// Routes parsed requests to the handler registered for their method.
///
/// Handlers are registered once at startup; lookup is per message. The
/// generic parameters keep this usable for both the HTTP/1 and HTTP/2
/// front ends, which carry different request/response shapes.
pub struct MessageDispatcher<Req, Res> {
    handlers: FnvHashMap<Method, Box<dyn Fn(Req) -> Res + Send + Sync>>,
}

impl<Req, Res> Default for MessageDispatcher<Req, Res> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Res> MessageDispatcher<Req, Res> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: FnvHashMap::default(),
        }
    }

    /// Registers `handler` for `method`, replacing any previous one.
    pub fn add_handler<F>(&mut self, method: Method, handler: F)
    where
        F: Fn(Req) -> Res + Send + Sync + 'static,
    {
        self.handlers.insert(method, Box::new(handler));
    }

    #[must_use]
    pub fn has_handler(&self, method: &Method) -> bool {
        self.handlers.contains_key(method)
    }

    /// Dispatches one message; `None` means no handler is registered
    /// for the method (a 405 upstream).
    pub fn dispatch(&self, method: &Method, request: Req) -> Option<Res> {
        match self.handlers.get(method) {
            Some(handler) => Some(handler(request)),
            None => {
                tracing::debug!(%method, "no handler registered");
                None
            }
        }
    }
}

impl<Req, Res> std::fmt::Debug for MessageDispatcher<Req, Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
