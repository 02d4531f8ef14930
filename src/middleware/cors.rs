use std::sync::Arc;

use super::{Handler, Middleware, handler, middleware};
use crate::http::{Method, StatusCode, header};

/// Cross-Origin Resource Sharing middleware.
///
/// - Requests without an `Origin` header, or from an origin outside the
///   allow-list, pass through untouched.
/// - `OPTIONS` preflight requests from an allowed origin are answered with
///   `204 No Content` and the inner handler is not called.
/// - Other requests run normally and get the `Access-Control-*` headers on
///   their response, including responses written by the error handler.
/// - A specific (non-`*`) origin is echoed back with `Vary: Origin`.
///
/// # Examples
///
/// ```rust
/// use teta::middleware::Cors;
///
/// let cors = Cors::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Request-Id")
///     .into_middleware();
/// ```
#[derive(Debug, Clone)]
pub struct Cors {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age: u32,
}

impl Default for Cors {
    fn default() -> Self {
        Self::new()
    }
}

impl Cors {
    /// Starts with no allowed origins, the common methods and
    /// `Content-Type`/`Authorization` headers, and a one hour preflight cache.
    pub fn new() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE"]
                .map(str::to_owned)
                .to_vec(),
            allowed_headers: vec![header::CONTENT_TYPE.to_owned(), "Authorization".to_owned()],
            max_age: 3600,
        }
    }

    /// Allows every origin and answers with `Access-Control-Allow-Origin: *`.
    pub fn permissive() -> Self {
        Self::new().allow_origin("*")
    }

    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        let method = method.into();
        if !self.allowed_methods.contains(&method) {
            self.allowed_methods.push(method);
        }
        self
    }

    #[must_use]
    pub fn allow_header(mut self, name: impl Into<String>) -> Self {
        self.allowed_headers.push(name.into());
        self
    }

    /// Seconds a browser may cache a preflight answer.
    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self
    }

    // The `Access-Control-Allow-Origin` value for `origin`, if allowed.
    fn resolve(&self, origin: &str) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else if self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }

    pub fn into_middleware(self) -> Middleware {
        let policy = Arc::new(self);
        middleware(move |next: Handler| {
            let policy = policy.clone();
            handler(move |ctx| {
                let next = next.clone();
                let policy = policy.clone();
                Box::pin(async move {
                    let allow_origin = ctx
                        .request()
                        .headers()
                        .get(header::ORIGIN)
                        .and_then(|origin| policy.resolve(origin));
                    let Some(allow_origin) = allow_origin else {
                        return next(ctx).await;
                    };

                    let preflight = *ctx.request().method() == Method::Options;
                    let result = if preflight {
                        ctx.send_status(StatusCode::NoContent);
                        ctx.response_mut().set_header(
                            header::ACCESS_CONTROL_MAX_AGE,
                            policy.max_age.to_string(),
                        );
                        Ok(())
                    } else {
                        next(ctx).await
                    };

                    let response = ctx.response_mut();
                    response.set_header(header::ACCESS_CONTROL_ALLOW_METHODS, policy.allowed_methods.join(", "));
                    response.set_header(header::ACCESS_CONTROL_ALLOW_HEADERS, policy.allowed_headers.join(", "));
                    if allow_origin != "*" {
                        response.append_header(header::VARY, header::ORIGIN);
                    }
                    response.set_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);

                    result
                })
            })
        })
    }
}

impl From<Cors> for Middleware {
    fn from(cors: Cors) -> Self {
        cors.into_middleware()
    }
}
