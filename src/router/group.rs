use std::sync::{Arc, PoisonError, RwLock};

use super::Core;
use crate::BoxFuture;
use crate::context::{Context, PathParams};
use crate::error::Error;
use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::{Handler, Middleware, compose, handler};
use crate::mux::{Endpoint, Mux};

/// A set of routes sharing a path prefix and a middleware list.
///
/// Groups are cheap handles: every group created from a [`Router`](super::Router)
/// registers into the same multiplexer. Middleware is applied when a route is
/// registered, so only middleware added before a registration wraps it.
///
/// # Examples
///
/// ```rust
/// use teta::{Router, StatusCode};
/// use teta::middleware::request_logger;
///
/// let router = Router::new();
/// router.route("/api", |api| {
///     api.use_middleware(request_logger());
///     api.get("/items/{id}", |ctx| Box::pin(async move {
///         let id = ctx.path_param("id").unwrap_or_default().to_owned();
///         ctx.string(StatusCode::Ok, id)
///     }));
/// });
/// ```
#[derive(Clone)]
pub struct RouterGroup {
    prefix: String,
    mux: Arc<RwLock<Mux>>,
    middlewares: Vec<Middleware>,
    pub(super) core: Arc<Core>,
}

impl RouterGroup {
    pub(super) fn root(mux: Arc<RwLock<Mux>>, core: Arc<Core>) -> Self {
        Self {
            prefix: "/".to_owned(),
            mux,
            middlewares: Vec::new(),
            core,
        }
    }

    pub(super) fn mux(&self) -> &Arc<RwLock<Mux>> {
        &self.mux
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Calls `f` with a child group mounted at `prefix` below this one.
    ///
    /// The child starts with a copy of this group's middleware.
    pub fn route(&self, prefix: &str, f: impl FnOnce(&mut RouterGroup)) {
        let mut child = self.clone();
        child.prefix = clean_path(&format!("{}/{}", self.prefix, prefix));
        f(&mut child);
    }

    /// Calls `f` with a child group sharing this prefix, so middleware added
    /// inside stays local to the routes registered there.
    pub fn group(&self, f: impl FnOnce(&mut RouterGroup)) {
        let mut child = self.clone();
        f(&mut child);
    }

    /// Appends middleware to this group for routes registered afterwards.
    pub fn use_middleware(&mut self, middleware: impl Into<Middleware>) {
        self.middlewares.push(middleware.into());
    }

    /// Returns a sibling group with `middleware` appended. This group is left
    /// unchanged.
    #[must_use]
    pub fn with(&self, middleware: impl Into<Middleware>) -> RouterGroup {
        let mut sibling = self.clone();
        sibling.middlewares.push(middleware.into());
        sibling
    }

    /// Registers an already-erased [`Handler`] under `pattern`.
    ///
    /// `pattern` is `"METHOD /path"` or a bare `"/path"` that answers every
    /// method. The path is mounted below this group's prefix.
    ///
    /// # Panics
    ///
    /// Panics when the resulting pattern is malformed, e.g. an unclosed
    /// `{capture` or a `{rest...}` capture that is not the last segment.
    pub fn register(&self, pattern: &str, handler: Handler) {
        let pattern = self.full_pattern(pattern);
        let endpoint = self.endpoint(compose(&self.middlewares, handler));
        // OPTIONS requests for a method-bound route still pass through this
        // group's middleware, which may answer them (CORS preflight).
        let preflight = (pattern.contains(' ') && !self.middlewares.is_empty())
            .then(|| self.endpoint(compose(&self.middlewares, unmatched_method())));

        let registered = self
            .mux
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .handle_with_preflight(&pattern, endpoint, preflight);
        if let Err(err) = registered {
            panic!("invalid route pattern {pattern:?}: {err}");
        }
    }

    fn endpoint(&self, chain: Handler) -> Endpoint {
        let core = Arc::clone(&self.core);
        Arc::new(
            move |request: Request, params: PathParams| -> BoxFuture<'static, Response> {
                let chain = Arc::clone(&chain);
                let core = Arc::clone(&core);
                Box::pin(async move { core.run(&chain, request, params).await })
            },
        )
    }

    /// Registers `handler` under `pattern` (`"GET /items/{id}"` or `"/health"`).
    pub fn handle<F>(&self, pattern: &str, handler: F)
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
    {
        self.register(pattern, Arc::new(handler));
    }

    /// Registers `handler` for `method` requests to `path`.
    pub fn add<F>(&self, method: Method, path: &str, handler: F)
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
    {
        self.handle(&format!("{method} {path}"), handler);
    }

    /// Registers `handler` for `path` under every method.
    pub fn any<F>(&self, path: &str, handler: F)
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
    {
        self.handle(path, handler);
    }

    // Joins the method, prefix and path into the multiplexer's pattern syntax.
    fn full_pattern(&self, pattern: &str) -> String {
        match pattern.trim().split_once(' ') {
            Some((method, path)) => {
                format!("{method} {}", clean_path(&format!("{}/{}", self.prefix, path.trim())))
            }
            None => clean_path(&format!("{}/{}", self.prefix, pattern.trim())),
        }
    }
}

// Innermost handler of a preflight chain: the `405` the multiplexer would
// have sent. It completes the `Allow` header.
fn unmatched_method() -> Handler {
    handler(|ctx| {
        Box::pin(async move {
            ctx.string(StatusCode::MethodNotAllowed, "Method Not Allowed\n")
        })
    })
}

macro_rules! method_routes {
    ($($(#[$doc:meta])* $name:ident => $method:expr;)*) => {
        impl RouterGroup {
            $(
                $(#[$doc])*
                pub fn $name<F>(&self, path: &str, handler: F)
                where
                    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>>
                        + Send
                        + Sync
                        + 'static,
                {
                    self.add($method, path, handler);
                }
            )*
        }
    };
}

method_routes! {
    /// Registers a `GET` handler; it also answers `HEAD`.
    get => Method::Get;
    post => Method::Post;
    put => Method::Put;
    delete => Method::Delete;
    patch => Method::Patch;
    head => Method::Head;
    options => Method::Options;
    connect => Method::Connect;
    trace => Method::Trace;
}

/// Collapses repeated slashes, resolves `.` and `..` segments and drops the
/// trailing slash. The result always starts with `/`.
pub(crate) fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_normalizes() {
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("//api///items/"), "/api/items");
        assert_eq!(clean_path("/api/./v1/../items"), "/api/items");
        assert_eq!(clean_path("/../.."), "/");
        assert_eq!(clean_path("/files/{path...}"), "/files/{path...}");
    }
}
