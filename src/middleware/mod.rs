//! Handlers and middleware: the function types routes are built from.
//!
//! A [`Handler`] is an async function over `&mut Context` that writes its
//! response into the context and returns `Ok(())`, or returns an [`Error`]
//! for the router's error handler to turn into a JSON response.
//!
//! A [`Middleware`] takes the next handler and returns a wrapped one. When a
//! group holds several middleware, the first registered is the outermost: it
//! sees the request first and the result last.
//!
//! ## Core items
//!
//! - [`handler`] / [`middleware`]: build the type-erased values from closures.
//! - [`compose`]: wrap a handler in a middleware list.
//! - [`stack`]: fold several middleware into one.
//! - [`request_logger`]: built-in request/response logger.
//! - [`Cors`]: allow-listed cross-origin headers and preflight handling.

use std::sync::Arc;

use tokio::time::Instant;

use crate::BoxFuture;
use crate::context::Context;
use crate::error::Error;

mod cors;

pub use cors::Cors;

/// A type-erased, cheaply-cloneable async request handler.
///
/// # Examples
///
/// ```rust
/// use teta::StatusCode;
/// use teta::middleware::{Handler, handler};
///
/// let ping: Handler = handler(|ctx| Box::pin(async move {
///     ctx.string(StatusCode::Ok, "pong")
/// }));
/// ```
pub type Handler =
    Arc<dyn for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static>;

/// A function that wraps a [`Handler`] in another [`Handler`].
///
/// Middleware may run code before and after calling the inner handler,
/// short-circuit by writing a response without calling it, or rewrite the
/// returned error.
///
/// # Examples
///
/// ```rust
/// use teta::middleware::{Handler, handler, middleware};
///
/// let tag = middleware(|next: Handler| {
///     handler(move |ctx| {
///         let next = next.clone();
///         Box::pin(async move {
///             ctx.set("tagged", true);
///             next(ctx).await
///         })
///     })
/// });
/// ```
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync + 'static>;

/// Erases a closure into a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<(), Error>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Erases a closure into a [`Middleware`].
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps `handler` so that `middlewares[0]` runs outermost.
pub fn compose(middlewares: &[Middleware], handler: Handler) -> Handler {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware(next))
}

/// Folds several middleware into one, keeping their order.
pub fn stack(middlewares: impl IntoIterator<Item = Middleware>) -> Middleware {
    let middlewares: Vec<Middleware> = middlewares.into_iter().collect();
    middleware(move |next| compose(&middlewares, next))
}

/// Logs each request's method, path, status and duration through the
/// context's logger.
///
/// Successful requests log at info level. A handler error logs at warn level
/// with the error text and is passed on unchanged.
pub fn request_logger() -> Middleware {
    middleware(|next: Handler| {
        handler(move |ctx| {
            let next = next.clone();
            Box::pin(async move {
                let start = Instant::now();
                let method = ctx.request().method().to_string();
                let path = ctx.request().path().to_owned();

                let result = next(ctx).await;

                let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
                match &result {
                    Ok(()) => {
                        let status = ctx.response().status().as_u16();
                        ctx.logger().in_scope(|| {
                            tracing::info!(%method, %path, status, elapsed_ms, "request");
                        });
                    }
                    Err(err) => {
                        ctx.logger().in_scope(|| {
                            tracing::warn!(%method, %path, error = %err, elapsed_ms, "request failed");
                        });
                    }
                }

                result
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http::{Request, StatusCode};
    use crate::logger::Logger;

    fn ctx(raw: &str) -> Context {
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(req)
    }

    // Records `label` into a shared trace before and after the inner handler.
    fn trace(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Middleware {
        middleware(move |next: Handler| {
            let log = log.clone();
            handler(move |ctx| {
                let next = next.clone();
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{label}:in"));
                    let result = next(ctx).await;
                    log.lock().unwrap().push(format!("{label}:out"));
                    result
                })
            })
        })
    }

    fn ok() -> Handler {
        handler(|ctx| Box::pin(async move { ctx.string(StatusCode::Ok, "done") }))
    }

    #[tokio::test]
    async fn compose_runs_first_middleware_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = compose(
            &[trace("a", log.clone()), trace("b", log.clone())],
            ok(),
        );

        let mut c = ctx("GET / HTTP/1.1\r\n\r\n");
        chain(&mut c).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:in", "b:in", "b:out", "a:out"]
        );
    }

    #[tokio::test]
    async fn stack_preserves_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stacked = stack([trace("a", log.clone()), trace("b", log.clone())]);
        let chain = compose(&[stacked, trace("c", log.clone())], ok());

        let mut c = ctx("GET / HTTP/1.1\r\n\r\n");
        chain(&mut c).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:in", "b:in", "c:in", "c:out", "b:out", "a:out"]
        );
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let deny = middleware(|_next: Handler| {
            handler(|ctx| {
                Box::pin(async move {
                    ctx.send_status(StatusCode::Forbidden);
                    Ok(())
                })
            })
        });
        let chain = compose(&[deny], ok());

        let mut c = ctx("GET / HTTP/1.1\r\n\r\n");
        chain(&mut c).await.unwrap();
        assert_eq!(c.response().status(), StatusCode::Forbidden);
        assert!(c.response().content().is_empty());
    }

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

    #[tokio::test]
    async fn request_logger_records_status() {
        let capture = Capture::default();
        let (req, _) = Request::parse(b"GET /items HTTP/1.1\r\n\r\n").unwrap();
        let mut c = Context::assemble(
            req,
            Default::default(),
            Arc::new(crate::validate::DefaultValidator),
            Logger::new(capture.clone()),
            Default::default(),
        );

        let chain = compose(&[request_logger()], ok());
        chain(&mut c).await.unwrap();

        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["message"], "request");
        assert_eq!(line["method"], "GET");
        assert_eq!(line["path"], "/items");
        assert_eq!(line["status"], 200);
    }

    #[tokio::test]
    async fn request_logger_passes_errors_through() {
        let failing = handler(|_ctx| Box::pin(async { Err(Error::msg("boom")) }));
        let chain = compose(&[request_logger()], failing);

        let mut c = ctx("POST /x HTTP/1.1\r\n\r\n");
        let err = chain(&mut c).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
