//! Per-request context: request access, response writing, binding,
//! validation, and request-scoped state.
//!
//! A [`Context`] is handed to every handler and middleware as `&mut Context`.
//! Its reusable storage (the key-value store and the typed extensions) comes
//! from a [`ContextPool`] and is cleared before it is handed out again.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use validator::Validate;

use crate::binder::{self, Bindable};
use crate::error::Error;
use crate::http::{Request, Response, StatusCode, header, mime};
use crate::logger::Logger;
use crate::validate::{DefaultValidator, Validator};

mod pool;
pub mod value;

pub use pool::{ContextPool, PooledContext};
pub use value::Value;

/// Type-erased request extensions map, used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Get a value from the extensions map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Get a mutable reference to a value from the extensions map
    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Remove a value from the extensions map
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

/// Path parameters extracted from the matched route
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value into the parameters map
    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    /// Get a value from the parameters map
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|value| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// The pooled part of a context.
#[derive(Default)]
pub(crate) struct Storage {
    values: HashMap<String, Value>,
    extensions: Extensions,
}

impl Storage {
    fn clear(&mut self) {
        self.values.clear();
        self.extensions.clear();
    }
}

/// Per-request context.
///
/// # Examples
///
/// ```
/// use teta::context::Context;
/// use teta::http::{Request, StatusCode};
///
/// let (req, _) = Request::parse(b"GET /ping HTTP/1.1\r\n\r\n").unwrap();
/// let mut ctx = Context::new(req);
/// ctx.set("user", "ada");
/// assert_eq!(ctx.get_string("user"), "ada");
///
/// ctx.string(StatusCode::Ok, "pong").unwrap();
/// assert_eq!(ctx.response().content(), b"pong");
/// ```
pub struct Context {
    request: Request,
    params: PathParams,
    response: Response,
    validator: Arc<dyn Validator>,
    logger: Logger,
    storage: Storage,
}

impl Context {
    /// Creates a standalone context with the default validator and a logger
    /// that discards its output.
    ///
    /// The router builds its contexts through a [`ContextPool`] instead.
    pub fn new(request: Request) -> Self {
        Self::assemble(
            request,
            PathParams::new(),
            Arc::new(DefaultValidator),
            Logger::new(std::io::sink()),
            Storage::default(),
        )
    }

    pub(crate) fn assemble(
        request: Request,
        params: PathParams,
        validator: Arc<dyn Validator>,
        logger: Logger,
        storage: Storage,
    ) -> Self {
        Self {
            request,
            params,
            response: Response::default(),
            validator,
            logger,
            storage,
        }
    }

    /// Replaces the path parameters.
    pub fn with_params(mut self, params: PathParams) -> Self {
        self.params = params;
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Returns a `{name}` capture of the matched route.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.request.query_param(name)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.request.remote_addr()
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn extensions(&self) -> &Extensions {
        &self.storage.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.storage.extensions
    }

    // ── response ───────────────────────────────────────────────────────────

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub(crate) fn take_response(&mut self) -> Response {
        std::mem::take(&mut self.response)
    }

    /// Writes a plain-text response.
    pub fn string(&mut self, status: StatusCode, body: impl Into<String>) -> Result<(), Error> {
        self.response.set_status(status);
        self.response
            .set_header(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF8);
        self.response.set_body(body.into());
        Ok(())
    }

    /// Serializes `value` as the JSON response body.
    pub fn json<T: Serialize + ?Sized>(&mut self, status: StatusCode, value: &T) -> Result<(), Error> {
        let body = serde_json::to_vec(value)?;
        self.response.set_status(status);
        self.response
            .set_header(header::CONTENT_TYPE, mime::APPLICATION_JSON);
        self.response.set_body(body);
        Ok(())
    }

    /// Sets the status and clears the body.
    pub fn send_status(&mut self, status: StatusCode) {
        self.response.set_status(status);
        self.response.set_body(Vec::new());
    }

    // ── binding & validation ───────────────────────────────────────────────

    /// Binds query, path and (when the type takes one) body values onto `dest`.
    pub fn bind<T: Bindable>(&self, dest: &mut T) -> Result<(), Error> {
        Ok(binder::bind(&self.request, &self.params, dest)?)
    }

    pub fn bind_query<T: Bindable>(&self, dest: &mut T) -> Result<(), Error> {
        Ok(binder::bind_query(&self.request, dest)?)
    }

    pub fn bind_path<T: Bindable>(&self, dest: &mut T) -> Result<(), Error> {
        Ok(binder::bind_path(&self.params, dest)?)
    }

    pub fn bind_body<T: Bindable>(&self, dest: &mut T) -> Result<(), Error> {
        Ok(binder::bind_body(&self.request, dest)?)
    }

    /// Runs the router's validator over `value`.
    pub fn validate<T: Validate>(&self, value: &T) -> Result<(), Error> {
        Ok(self.validator.validate(value)?)
    }

    // ── key-value store ────────────────────────────────────────────────────

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.storage.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.storage.values.get(key)
    }

    /// Stored string, or `""`.
    pub fn get_string(&self, key: &str) -> &str {
        self.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    /// Stored integer; floats truncate, numeric strings parse. Otherwise `0`.
    pub fn get_int(&self, key: &str) -> i64 {
        self.get(key).and_then(Value::to_int).unwrap_or_default()
    }

    /// Stored boolean or boolean literal string. Otherwise `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::to_bool).unwrap_or_default()
    }

    /// Stored float; integers widen, numeric strings parse. Otherwise `0.0`.
    pub fn get_float(&self, key: &str) -> f64 {
        self.get(key).and_then(Value::to_float).unwrap_or_default()
    }

    /// Stored string list, or the string items of a JSON array. Otherwise empty.
    pub fn get_string_slice(&self, key: &str) -> Vec<String> {
        self.get(key).and_then(Value::to_strings).unwrap_or_default()
    }

    /// Stored JSON object. Otherwise an empty map.
    pub fn get_map(&self, key: &str) -> serde_json::Map<String, serde_json::Value> {
        self.get(key)
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default()
    }

    /// Stored time or RFC 3339 string. Otherwise the Unix epoch.
    pub fn get_time(&self, key: &str) -> DateTime<Utc> {
        self.get(key)
            .and_then(Value::to_time)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Stored duration, integer nanoseconds, or a string like `"1h30m"`.
    /// Otherwise zero.
    pub fn get_duration(&self, key: &str) -> Duration {
        self.get(key)
            .and_then(Value::to_duration)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(raw: &str) -> Context {
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(req)
    }

    #[test]
    fn typed_getters_convert_and_fall_back() {
        let mut c = ctx("GET / HTTP/1.1\r\n\r\n");
        c.set("name", "ada");
        c.set("count", "12");
        c.set("ratio", 3);
        c.set("flag", "true");
        c.set("tags", vec!["a".to_owned(), "b".to_owned()]);
        c.set("meta", serde_json::json!({"k": 1}));
        c.set("ttl", "1m30s");
        c.set("at", "2024-01-01T00:00:00Z");

        assert_eq!(c.get_string("name"), "ada");
        assert_eq!(c.get_int("count"), 12);
        assert_eq!(c.get_float("ratio"), 3.0);
        assert!(c.get_bool("flag"));
        assert_eq!(c.get_string_slice("tags"), vec!["a", "b"]);
        assert_eq!(c.get_map("meta")["k"], 1);
        assert_eq!(c.get_duration("ttl"), Duration::from_secs(90));
        assert_eq!(c.get_time("at").timestamp(), 1_704_067_200);

        assert_eq!(c.get_string("count_missing"), "");
        assert_eq!(c.get_int("name"), 0);
        assert!(!c.get_bool("name"));
        assert!(c.get_string_slice("name").is_empty());
        assert!(c.get_map("name").is_empty());
        assert_eq!(c.get_time("name"), DateTime::UNIX_EPOCH);
        assert_eq!(c.get_duration("name"), Duration::ZERO);
    }

    #[test]
    fn string_response_sets_plain_text() {
        let mut c = ctx("GET / HTTP/1.1\r\n\r\n");
        c.string(StatusCode::Ok, "pong").unwrap();
        let res = c.take_response();
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.headers().get("content-type"), Some(mime::TEXT_PLAIN_UTF8));
        assert_eq!(res.content(), b"pong");
    }

    #[test]
    fn json_response_serializes_value() {
        let mut c = ctx("GET / HTTP/1.1\r\n\r\n");
        c.json(StatusCode::Created, &serde_json::json!({"id": 7}))
            .unwrap();
        assert_eq!(c.response().status(), StatusCode::Created);
        assert_eq!(c.response().headers().get("content-type"), Some("application/json"));
        assert_eq!(c.response().content(), br#"{"id":7}"#);
    }

    #[test]
    fn send_status_clears_body() {
        let mut c = ctx("GET / HTTP/1.1\r\n\r\n");
        c.string(StatusCode::Ok, "x").unwrap();
        c.send_status(StatusCode::NoContent);
        assert_eq!(c.response().status(), StatusCode::NoContent);
        assert!(c.response().content().is_empty());
    }

    #[test]
    fn extensions_are_typed() {
        #[derive(Debug, PartialEq)]
        struct UserId(u64);

        let mut c = ctx("GET / HTTP/1.1\r\n\r\n");
        assert!(c.extensions_mut().insert(UserId(1)).is_none());
        assert_eq!(c.extensions_mut().insert(UserId(2)), Some(UserId(1)));
        assert_eq!(c.extensions().get::<UserId>(), Some(&UserId(2)));
        assert_eq!(c.extensions_mut().remove::<UserId>(), Some(UserId(2)));
        assert!(c.extensions().is_empty());
    }

    #[test]
    fn bind_goes_through_params() {
        #[derive(Default)]
        struct Lookup {
            id: u32,
            expand: bool,
        }
        crate::bindable! {
            Lookup {
                path "id" => id,
                query "expand" => expand,
            }
        }

        let mut params = PathParams::new();
        params.insert("id".into(), "5".into());
        let c = ctx("GET /items/5?expand=1 HTTP/1.1\r\n\r\n").with_params(params);

        let mut lookup = Lookup::default();
        c.bind(&mut lookup).unwrap();
        assert_eq!(lookup.id, 5);
        assert!(lookup.expand);
        assert_eq!(c.path_param("id"), Some("5"));
    }

    #[test]
    fn bind_error_is_a_handler_error() {
        #[derive(Default)]
        struct Paging {
            page: u32,
        }
        crate::bindable! { Paging { query "page" => page } }

        let c = ctx("GET /?page=abc HTTP/1.1\r\n\r\n");
        let err = c.bind(&mut Paging::default()).unwrap_err();
        assert!(matches!(err, Error::Bind(_)));
        assert_eq!(err.into_http().code(), StatusCode::BadRequest);
    }

    #[test]
    fn validate_surfaces_validator_errors() {
        #[derive(Validate)]
        struct Name {
            #[validate(length(min = 2))]
            value: String,
        }

        let c = ctx("GET / HTTP/1.1\r\n\r\n");
        assert!(c.validate(&Name { value: "ok".into() }).is_ok());
        let err = c.validate(&Name { value: "x".into() }).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(err.into_http().code(), StatusCode::BadRequest);
    }
}
