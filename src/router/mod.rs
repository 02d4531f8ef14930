//! Request routing: route groups, middleware composition and error handling.
//!
//! [`Router`] owns the multiplexer and the shared request machinery (context
//! pool, validator, error handler and logger). It dereferences to its root
//! [`RouterGroup`], so routes are registered directly on it:
//!
//! ```rust,no_run
//! use teta::{HttpError, Router, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Router::new();
//!
//!     router.get("/ping", |ctx| Box::pin(async move {
//!         ctx.string(StatusCode::Ok, "pong")
//!     }));
//!
//!     router.get("/users/{id}", |ctx| Box::pin(async move {
//!         match ctx.path_param("id") {
//!             Some("0") => Err(HttpError::new(StatusCode::NotFound, "no such user").into()),
//!             _ => ctx.string(StatusCode::Ok, "found"),
//!         }
//!     }));
//!
//!     router.start("127.0.0.1:8080").await?;
//!     Ok(())
//! }
//! ```
//!
//! A handler error reaches the router's error handler, which by default logs
//! it and answers `{"message": "..."}` with the error's status (400 unless the
//! error is an [`HttpError`](crate::HttpError)).

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::context::{Context, ContextPool, PathParams};
use crate::error::{Error, ErrorMessage};
use crate::http::{Request, Response, StatusCode};
use crate::logger::Logger;
use crate::middleware::Handler;
use crate::mux::Mux;
use crate::server::{Server, ServerError};
use crate::validate::{DefaultValidator, Validator};

mod group;

pub use group::RouterGroup;

/// Turns a handler error into a response written on the context.
pub type ErrorHandler = Arc<dyn Fn(Error, &mut Context) + Send + Sync + 'static>;

// Machinery shared by every group of one router.
pub(crate) struct Core {
    pool: ContextPool,
    validator: RwLock<Arc<dyn Validator>>,
    error_handler: RwLock<ErrorHandler>,
    logger: Logger,
}

impl Core {
    // Runs one request through a composed handler chain on a pooled context.
    async fn run(&self, chain: &Handler, request: Request, params: PathParams) -> Response {
        let validator = Arc::clone(&self.validator.read().unwrap_or_else(PoisonError::into_inner));
        let mut ctx = self
            .pool
            .acquire(request, params, validator, self.logger.clone());

        if let Err(err) = chain(&mut *ctx).await {
            let on_error = Arc::clone(&self.error_handler.read().unwrap_or_else(PoisonError::into_inner));
            on_error(err, &mut *ctx);
        }

        ctx.take_response()
    }
}

/// The default [`ErrorHandler`].
///
/// Logs the error at error level with the request path, method, peer address
/// and resolved status, then writes `{"message": "..."}` as JSON.
pub fn default_error_handler(err: Error, ctx: &mut Context) {
    let err = err.into_http();
    let request = ctx.request();
    let ip = request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();

    ctx.logger().in_scope(|| {
        tracing::error!(
            error = %err,
            path = request.path(),
            method = %request.method(),
            ip = %ip,
            code = err.code().as_u16(),
            "Server error"
        );
    });

    let body = ErrorMessage {
        message: err.message(),
    };
    if let Err(encode) = ctx.json(err.code(), &body) {
        ctx.logger().error(&encode.to_string());
        ctx.send_status(StatusCode::InternalServerError);
    }
}

/// The application router.
///
/// Cloning a `Router` yields another handle to the same routes and settings.
#[derive(Clone)]
pub struct Router {
    root: RouterGroup,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates a router with the default validator, the default error
    /// handler, and a JSON logger on standard output.
    pub fn new() -> Self {
        let validator: Arc<dyn Validator> = Arc::new(DefaultValidator);
        let error_handler: ErrorHandler = Arc::new(default_error_handler);
        let core = Core {
            pool: ContextPool::default(),
            validator: RwLock::new(validator),
            error_handler: RwLock::new(error_handler),
            logger: Logger::stdout(),
        };
        Self {
            root: RouterGroup::root(Arc::new(RwLock::new(Mux::new())), Arc::new(core)),
        }
    }

    /// Replaces the validator used by [`Context::validate`] on every group.
    pub fn set_validator(&self, validator: impl Validator + 'static) {
        *self
            .root
            .core
            .validator
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(validator);
    }

    /// Replaces the handler that turns handler errors into responses.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(Error, &mut Context) + Send + Sync + 'static,
    {
        *self
            .root
            .core
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    /// The logger handed to every request context.
    pub fn logger(&self) -> &Logger {
        &self.root.core.logger
    }

    /// Answers one request: route lookup, middleware chain, error handling.
    ///
    /// Unmatched paths get `404 page not found`; paths registered only under
    /// other methods get `405` with an `Allow` header.
    pub async fn serve(&self, request: Request) -> Response {
        let lookup = self
            .root
            .mux()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(request.method(), request.path());
        lookup.respond(request).await
    }

    /// Serves requests accepted by an already bound `server`.
    pub async fn serve_on(self, server: Server) -> Result<(), ServerError> {
        let router = Arc::new(self);
        server
            .run(move |request| {
                let router = Arc::clone(&router);
                async move { router.serve(request).await }
            })
            .await
    }

    /// Binds `addr` and serves plain HTTP until the process ends.
    pub async fn start(self, addr: &str) -> Result<(), ServerError> {
        let server = Server::bind(addr).await?;
        self.serve_on(server).await
    }

    /// Binds `addr` and serves HTTPS with the PEM certificate chain and key.
    pub async fn start_tls(
        self,
        addr: &str,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), ServerError> {
        let server = Server::bind(addr).await?.with_tls(cert_path, key_path)?;
        self.serve_on(server).await
    }
}

impl Deref for Router {
    type Target = RouterGroup;

    fn deref(&self) -> &RouterGroup {
        &self.root
    }
}

impl DerefMut for Router {
    fn deref_mut(&mut self) -> &mut RouterGroup {
        &mut self.root
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http::mime;
    use crate::middleware::{Middleware, handler, middleware};
    use crate::{HttpError, bindable};

    fn quiet_router() -> Router {
        let router = Router::new();
        router.logger().set_output(std::io::sink());
        router
    }

    fn make_request(method: &str, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    fn body(res: &Response) -> &str {
        std::str::from_utf8(res.content()).unwrap()
    }

    fn tag(label: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Middleware {
        middleware(move |next: Handler| {
            let log = Arc::clone(&log);
            handler(move |ctx| {
                let next = Arc::clone(&next);
                let log = Arc::clone(&log);
                Box::pin(async move {
                    log.lock().unwrap().push(label);
                    next(ctx).await
                })
            })
        })
    }

    #[tokio::test]
    async fn ping_pong() {
        let router = quiet_router();
        router.get("/ping", |ctx| {
            Box::pin(async move { ctx.string(StatusCode::Ok, "pong") })
        });

        let res = router.serve(make_request("GET", "/ping")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(body(&res), "pong");
    }

    #[tokio::test]
    async fn plain_error_becomes_400_json() {
        let router = quiet_router();
        router.get("/boom", |_ctx| Box::pin(async { Err(Error::msg("boom")) }));

        let res = router.serve(make_request("GET", "/boom")).await;
        assert_eq!(res.status(), StatusCode::BadRequest);
        assert_eq!(res.headers().get("content-type"), Some(mime::APPLICATION_JSON));
        assert_eq!(body(&res), r#"{"message":"boom"}"#);
    }

    #[tokio::test]
    async fn http_error_keeps_its_status() {
        let router = quiet_router();
        router.get("/missing", |_ctx| {
            Box::pin(async { Err(HttpError::new(StatusCode::NotFound, "not found").into()) })
        });

        let res = router.serve(make_request("GET", "/missing")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
        assert_eq!(body(&res), r#"{"message":"not found"}"#);
    }

    #[tokio::test]
    async fn error_handler_logs_request_details() {
        #[derive(Clone, Default)]
        struct Capture(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for Capture {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let capture = Capture::default();
        let router = Router::new();
        router.logger().set_output(capture.clone());
        router.post("/fail", |_ctx| Box::pin(async { Err(Error::msg("bad input")) }));

        router.serve(make_request("POST", "/fail")).await;

        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(line["level"], "ERROR");
        assert_eq!(line["message"], "Server error");
        assert_eq!(line["error"], "bad input");
        assert_eq!(line["path"], "/fail");
        assert_eq!(line["method"], "POST");
        assert_eq!(line["code"], 400);
    }

    #[tokio::test]
    async fn custom_error_handler_replaces_default() {
        let router = quiet_router();
        router.set_error_handler(|err, ctx| {
            let _ = ctx.string(StatusCode::ServiceUnavailable, format!("custom: {err}"));
        });
        router.get("/x", |_ctx| Box::pin(async { Err(Error::msg("down")) }));

        let res = router.serve(make_request("GET", "/x")).await;
        assert_eq!(res.status(), StatusCode::ServiceUnavailable);
        assert_eq!(body(&res), "custom: down");
    }

    #[tokio::test]
    async fn unmatched_routes_get_404_and_405() {
        let router = quiet_router();
        router.post("/items", |ctx| Box::pin(async move { ctx.string(StatusCode::Created, "") }));

        let res = router.serve(make_request("GET", "/nothing")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
        assert_eq!(body(&res), "404 page not found\n");

        let res = router.serve(make_request("DELETE", "/items")).await;
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);
        assert_eq!(res.headers().get("allow"), Some("POST"));
    }

    #[tokio::test]
    async fn nested_routes_join_prefixes() {
        let router = quiet_router();
        router.route("/api", |api| {
            api.route("v1/", |v1| {
                v1.get("/items/{id}", |ctx| {
                    Box::pin(async move {
                        let id = ctx.path_param("id").unwrap_or_default().to_owned();
                        ctx.string(StatusCode::Ok, id)
                    })
                });
            });
        });

        let res = router.serve(make_request("GET", "/api/v1/items/7")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(body(&res), "7");
    }

    #[tokio::test]
    async fn middleware_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = quiet_router();
        router.use_middleware(tag("first", Arc::clone(&log)));
        router.use_middleware(tag("second", Arc::clone(&log)));
        router.get("/", |ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "root") }));

        router.serve(make_request("GET", "/")).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn with_does_not_leak_into_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = quiet_router();
        let plain = router.with(tag("plain", Arc::clone(&log)));
        let audited = plain.with(tag("audit", Arc::clone(&log)));

        plain.get("/a", |ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "a") }));
        audited.get("/b", |ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "b") }));
        router.get("/c", |ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "c") }));

        router.serve(make_request("GET", "/a")).await;
        assert_eq!(*log.lock().unwrap(), vec!["plain"]);

        log.lock().unwrap().clear();
        router.serve(make_request("GET", "/b")).await;
        assert_eq!(*log.lock().unwrap(), vec!["plain", "audit"]);

        log.lock().unwrap().clear();
        router.serve(make_request("GET", "/c")).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn group_middleware_stays_inside_group() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = quiet_router();
        router.group(|g| {
            g.use_middleware(tag("inner", Arc::clone(&log)));
            g.get("/inside", |ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "") }));
        });
        router.get("/outside", |ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "") }));

        router.serve(make_request("GET", "/outside")).await;
        assert!(log.lock().unwrap().is_empty());
        router.serve(make_request("GET", "/inside")).await;
        assert_eq!(*log.lock().unwrap(), vec!["inner"]);
    }

    #[tokio::test]
    async fn any_and_handle_register_patterns() {
        let router = quiet_router();
        router.any("/health", |ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "up") }));
        router.handle("PUT /things/{name}", |ctx| {
            Box::pin(async move { ctx.string(StatusCode::Accepted, "") })
        });

        for method in ["GET", "POST", "DELETE"] {
            let res = router.serve(make_request(method, "/health")).await;
            assert_eq!(body(&res), "up");
        }
        let res = router.serve(make_request("PUT", "/things/lamp")).await;
        assert_eq!(res.status(), StatusCode::Accepted);
    }

    #[tokio::test]
    async fn bind_errors_surface_as_400() {
        #[derive(Default)]
        struct Paging {
            page: u32,
        }
        bindable! { Paging { query "page" => page } }

        let router = quiet_router();
        router.get("/list", |ctx| {
            Box::pin(async move {
                let mut paging = Paging::default();
                ctx.bind(&mut paging)?;
                ctx.string(StatusCode::Ok, paging.page.to_string())
            })
        });

        let res = router.serve(make_request("GET", "/list?page=3")).await;
        assert_eq!(body(&res), "3");

        let res = router.serve(make_request("GET", "/list?page=abc")).await;
        assert_eq!(res.status(), StatusCode::BadRequest);
        let json: serde_json::Value = serde_json::from_slice(res.content()).unwrap();
        assert!(json["message"].as_str().unwrap().starts_with("query bind failed"));
    }

    #[tokio::test]
    async fn path_bind_errors_name_stage_and_field() {
        #[derive(Default)]
        struct ItemPath {
            id: u32,
        }
        bindable! { ItemPath { path "id" => id } }

        let router = quiet_router();
        router.get("/items/{id}", |ctx| {
            Box::pin(async move {
                let mut item = ItemPath::default();
                ctx.bind(&mut item)?;
                ctx.string(StatusCode::Ok, item.id.to_string())
            })
        });

        let res = router.serve(make_request("GET", "/items/42")).await;
        assert_eq!(body(&res), "42");

        let res = router.serve(make_request("GET", "/items/forty")).await;
        assert_eq!(res.status(), StatusCode::BadRequest);
        let json: serde_json::Value = serde_json::from_slice(res.content()).unwrap();
        let message = json["message"].as_str().unwrap();
        assert!(message.starts_with("path bind failed: field id:"), "{message}");
    }

    #[tokio::test]
    async fn cors_preflight_reaches_group_middleware() {
        let router = quiet_router();
        router.route("/api", |api| {
            api.use_middleware(crate::middleware::Cors::new().allow_origin("https://app.example"));
            api.post("/items", |ctx| {
                Box::pin(async move { ctx.string(StatusCode::Created, "made") })
            });
        });

        let raw = "OPTIONS /api/items HTTP/1.1\r\nOrigin: https://app.example\r\n\r\n";
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        let res = router.serve(req).await;
        assert_eq!(res.status(), StatusCode::NoContent);
        assert_eq!(
            res.headers().get("access-control-allow-origin"),
            Some("https://app.example")
        );
        assert!(res.headers().get("allow").is_none());

        // Without an allowed origin the group still answers 405 with `Allow`.
        let res = router.serve(make_request("OPTIONS", "/api/items")).await;
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);
        assert_eq!(res.headers().get("allow"), Some("POST"));
        assert_eq!(body(&res), "Method Not Allowed\n");
    }

    #[tokio::test]
    async fn values_do_not_leak_between_requests() {
        let router = quiet_router();
        router.get("/set", |ctx| {
            Box::pin(async move {
                let seen = ctx.get_string("secret").to_owned();
                ctx.set("secret", "s3cr3t");
                ctx.string(StatusCode::Ok, seen)
            })
        });

        for _ in 0..3 {
            let res = router.serve(make_request("GET", "/set")).await;
            assert_eq!(body(&res), "");
        }
    }

    #[test]
    #[should_panic(expected = "invalid route pattern")]
    fn malformed_pattern_panics() {
        let router = quiet_router();
        router.get("/broken/{id", |ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "") }));
    }
}
