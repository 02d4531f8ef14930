//! Request multiplexer: match `[METHOD ]/path` patterns to endpoints.
//!
//! | Pattern                 | Example match              | Captured params           |
//! |-------------------------|----------------------------|---------------------------|
//! | `GET /users`            | `GET /users`               | *(none)*                  |
//! | `GET /users/{id}`       | `GET /users/42`            | `id → "42"`               |
//! | `/files/{path...}`      | `PUT /files/docs/a.txt`    | `path → "docs/a.txt"`     |
//!
//! A pattern without a method matches every method, and `GET` patterns also
//! answer `HEAD`. Trailing slashes are ignored on both patterns and paths, and
//! captured segments are percent-decoded.
//!
//! When several patterns match a path, literal-only patterns win over
//! patterns with `{name}` captures, which win over `{name...}` patterns.
//! Patterns of the same kind are tried in registration order.
//!
//! An `OPTIONS` request for a path that only matches under other methods runs
//! the first matching route's preflight endpoint, when it has one, so group
//! middleware such as CORS can answer it. Whatever that endpoint leaves as a
//! `405` gets the `Allow` header.

use std::sync::Arc;

use crate::BoxFuture;
use crate::context::PathParams;
use crate::http::{Method, Request, Response, StatusCode, header, mime};

/// A type-erased endpoint stored in the [`Mux`].
pub type Endpoint = Arc<dyn Fn(Request, PathParams) -> BoxFuture<'static, Response> + Send + Sync>;

/// Errors returned when a route pattern cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern {0:?} must start with '/'")]
    MissingSlash(String),

    #[error("invalid capture segment {0:?}")]
    BadCapture(String),

    #[error("capture {0:?} appears twice")]
    DuplicateCapture(String),

    #[error("remainder capture {0:?} must be the final segment")]
    RemainderNotLast(String),
}

// A single path segment of a compiled pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
    Remainder(String),
}

// Match precedence, lowest value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Literal,
    Captures,
    Remainder,
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
struct Pattern {
    method: Option<Method>,
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(pattern: &str) -> Result<Self, PatternError> {
        let pattern = pattern.trim();
        let (method, path) = match pattern.split_once(' ') {
            Some((method, path)) => {
                let method: Method = match method.parse() {
                    Ok(method) => method,
                    Err(never) => match never {},
                };
                (Some(method), path.trim_start())
            }
            None => (None, pattern),
        };

        if !path.starts_with('/') {
            return Err(PatternError::MissingSlash(pattern.to_owned()));
        }

        let raw: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(raw.len());
        let mut names: Vec<&str> = Vec::new();

        for (i, seg) in raw.iter().enumerate() {
            let Some(inner) = seg.strip_prefix('{') else {
                if seg.contains(['{', '}']) {
                    return Err(PatternError::BadCapture((*seg).to_owned()));
                }
                segments.push(Segment::Literal((*seg).to_owned()));
                continue;
            };
            let inner = inner
                .strip_suffix('}')
                .ok_or_else(|| PatternError::BadCapture((*seg).to_owned()))?;

            let (name, remainder) = match inner.strip_suffix("...") {
                Some(name) => (name, true),
                None => (inner, false),
            };
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(PatternError::BadCapture((*seg).to_owned()));
            }
            if names.contains(&name) {
                return Err(PatternError::DuplicateCapture(name.to_owned()));
            }
            names.push(name);

            if remainder {
                if i + 1 != raw.len() {
                    return Err(PatternError::RemainderNotLast(name.to_owned()));
                }
                segments.push(Segment::Remainder(name.to_owned()));
            } else {
                segments.push(Segment::Capture(name.to_owned()));
            }
        }

        Ok(Self { method, segments })
    }

    fn rank(&self) -> Rank {
        let mut rank = Rank::Literal;
        for seg in &self.segments {
            match seg {
                Segment::Literal(_) => {}
                Segment::Capture(_) => rank = rank.max(Rank::Captures),
                Segment::Remainder(_) => rank = Rank::Remainder,
            }
        }
        rank
    }

    fn allows(&self, method: &Method) -> bool {
        match &self.method {
            None => true,
            Some(Method::Get) => matches!(method, Method::Get | Method::Head),
            Some(own) => own == method,
        }
    }

    // Try to match the split request path, returning captured params on success.
    fn matches(&self, path: &[&str]) -> Option<PathParams> {
        let mut params = PathParams::new();

        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Literal(literal) => {
                    let part = path.get(i)?;
                    if decode(part) != literal.as_str() {
                        return None;
                    }
                }
                Segment::Capture(name) => {
                    let part = path.get(i)?;
                    params.insert(name.clone(), decode(part));
                }
                Segment::Remainder(name) => {
                    let rest = path.get(i..).unwrap_or_default();
                    let value = rest.iter().map(|p| decode(p)).collect::<Vec<_>>().join("/");
                    params.insert(name.clone(), value);
                    return Some(params);
                }
            }
        }

        (path.len() == self.segments.len()).then_some(params)
    }
}

fn decode(segment: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(segment.as_bytes())).into_owned()
}

// A single registered route binding a pattern to an endpoint.
struct Route {
    pattern: Pattern,
    rank: Rank,
    endpoint: Endpoint,
    preflight: Option<Endpoint>,
}

/// Outcome of [`Mux::lookup`].
pub enum Lookup {
    /// A route matched both path and method.
    Found(Endpoint, PathParams),
    /// The path matched, but only under these methods.
    MethodNotAllowed(Vec<String>),
    /// An `OPTIONS` request for a path matched only under `allowed`; the
    /// route's preflight endpoint answers it.
    Preflight {
        endpoint: Endpoint,
        params: PathParams,
        allowed: Vec<String>,
    },
    NotFound,
}

/// Pattern-based request multiplexer.
#[derive(Default)]
pub struct Mux {
    routes: Vec<Route>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `endpoint` under `pattern`.
    ///
    /// Re-registering an identical pattern keeps the first endpoint reachable.
    pub fn handle(&mut self, pattern: &str, endpoint: Endpoint) -> Result<(), PatternError> {
        self.handle_with_preflight(pattern, endpoint, None)
    }

    /// Registers `endpoint` under `pattern`, with `preflight` answering
    /// `OPTIONS` requests the pattern's method does not cover.
    pub fn handle_with_preflight(
        &mut self,
        pattern: &str,
        endpoint: Endpoint,
        preflight: Option<Endpoint>,
    ) -> Result<(), PatternError> {
        let pattern = Pattern::parse(pattern)?;
        let rank = pattern.rank();
        // Keep routes sorted by rank; equal ranks stay in registration order.
        let at = self.routes.partition_point(|route| route.rank <= rank);
        self.routes.insert(
            at,
            Route {
                pattern,
                rank,
                endpoint,
                preflight,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Finds the endpoint for `method` and `path`.
    pub fn lookup(&self, method: &Method, path: &str) -> Lookup {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut allowed: Vec<String> = Vec::new();
        let mut preflight: Option<(Endpoint, PathParams)> = None;

        for route in &self.routes {
            let Some(params) = route.pattern.matches(&parts) else {
                continue;
            };
            if route.pattern.allows(method) {
                return Lookup::Found(route.endpoint.clone(), params);
            }
            if preflight.is_none() && *method == Method::Options {
                preflight = route.preflight.clone().map(|endpoint| (endpoint, params));
            }
            if let Some(own) = &route.pattern.method {
                allowed.push(own.as_str().to_owned());
                if *own == Method::Get {
                    allowed.push(Method::Head.as_str().to_owned());
                }
            }
        }

        if allowed.is_empty() {
            Lookup::NotFound
        } else {
            allowed.sort();
            allowed.dedup();
            match preflight {
                Some((endpoint, params)) => Lookup::Preflight {
                    endpoint,
                    params,
                    allowed,
                },
                None => Lookup::MethodNotAllowed(allowed),
            }
        }
    }

    /// Dispatches `request` to the matching endpoint or answers 404/405.
    pub async fn dispatch(&self, request: Request) -> Response {
        self.lookup(request.method(), request.path())
            .respond(request)
            .await
    }
}

impl Lookup {
    /// Runs the found endpoint, or builds the 404/405 answer.
    pub async fn respond(self, request: Request) -> Response {
        match self {
            Self::Found(endpoint, params) => endpoint(request, params).await,
            Self::MethodNotAllowed(allowed) => method_not_allowed(&allowed),
            Self::Preflight {
                endpoint,
                params,
                allowed,
            } => {
                let mut response = endpoint(request, params).await;
                if response.status() == StatusCode::MethodNotAllowed {
                    response.set_header(header::ALLOW, allowed.join(", "));
                }
                response
            }
            Self::NotFound => not_found(),
        }
    }
}

/// The plain-text `404 page not found` response.
pub fn not_found() -> Response {
    Response::new(StatusCode::NotFound)
        .header(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF8)
        .body("404 page not found\n")
}

/// A `405` response listing `allowed` in the `Allow` header.
pub fn method_not_allowed(allowed: &[String]) -> Response {
    Response::new(StatusCode::MethodNotAllowed)
        .header(header::ALLOW, allowed.join(", "))
        .header(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF8)
        .body("Method Not Allowed\n")
}
