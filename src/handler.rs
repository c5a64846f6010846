//! URL-bound request handlers and the per-worker registry.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::http::exchange::HttpExchange;
use crate::http::response::HttpResponse;

/// A request handler bound to a URL path.
///
/// `handle` runs on the worker thread owning the connection and must call
/// [`HttpExchange::connection`]'s `append_response` exactly once. Handlers
/// are shared across workers, so they must be `Send + Sync`; per-request
/// state lives in the exchange.
pub trait Handler: Send + Sync {
    /// Serves one request.
    fn handle(&self, exchange: HttpExchange);
}

impl<F> Handler for F
where
    F: Fn(HttpExchange) + Send + Sync,
{
    fn handle(&self, exchange: HttpExchange) {
        self(exchange);
    }
}

/// Worker-local mapping from URL path bytes to handlers.
///
/// Lookup is an exact match on [`HttpExchange::path_bytes`]. Updates arrive
/// as broadcast messages and are applied on the owning worker thread, so
/// the map is never concurrently mutated.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: HashMap<Vec<u8>, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `path` to `handler`, replacing any previous binding.
    pub fn insert(&mut self, path: impl Into<String>, handler: Arc<dyn Handler>) {
        self.routes.insert(path.into().into_bytes(), handler);
    }

    /// Looks up the handler bound to exactly `path`.
    #[must_use]
    pub fn lookup(&self, path: &[u8]) -> Option<&Arc<dyn Handler>> {
        self.routes.get(path)
    }

    /// Number of bound paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if no paths are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

/// The shared handler serving every unmatched path: `404 Not Found` with
/// an empty body. Initialized once at startup and shared across workers.
pub(crate) fn generic_not_found() -> &'static Arc<dyn Handler> {
    static HANDLER: OnceLock<Arc<dyn Handler>> = OnceLock::new();
    HANDLER.get_or_init(|| {
        Arc::new(|exchange: HttpExchange| {
            exchange
                .connection()
                .append_response(HttpResponse::not_found());
        })
    })
}
