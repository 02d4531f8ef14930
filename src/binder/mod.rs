//! Request binding: populate a destination record from query parameters,
//! path parameters and the request body.
//!
//! Each destination type carries a field table ([`Bindable::FIELDS`]) built at
//! compile time by the [`bindable!`](crate::bindable) macro. The table names
//! the source of every bound field and the key to look up there; the binder
//! walks it, converts the raw string with [`FromParam`], and assigns.
//!
//! ```
//! use teta::bindable;
//!
//! #[derive(Default, serde::Serialize, serde::Deserialize)]
//! struct UpdateItem {
//!     id: u64,
//!     dry_run: bool,
//!     name: String,
//! }
//!
//! bindable! {
//!     UpdateItem {
//!         path "id" => id,
//!         query "dry_run" => dry_run,
//!     } json
//! }
//! ```
//!
//! | Source  | Looked up in                                      |
//! |---------|---------------------------------------------------|
//! | `query` | the URL query string (first value wins)           |
//! | `path`  | the `{name}` captures of the matched route        |
//! | `form`  | an `application/x-www-form-urlencoded` body       |
//! | `json`  | the whole body, decoded onto the existing value   |
//!
//! Empty or missing values leave the field untouched.

use std::fmt;
use std::num::{ParseFloatError, ParseIntError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::context::PathParams;
use crate::context::value::parse_bool;
use crate::http::{Request, mime};

mod macros;

/// Where a bound field takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Query,
    Path,
    Form,
}

/// One row of a type's field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Rust field name, used in error messages.
    pub field: &'static str,
    pub source: Source,
    /// Parameter name looked up in the source.
    pub key: &'static str,
}

impl FieldSpec {
    pub const fn query(field: &'static str, key: &'static str) -> Self {
        Self {
            field,
            source: Source::Query,
            key,
        }
    }

    pub const fn path(field: &'static str, key: &'static str) -> Self {
        Self {
            field,
            source: Source::Path,
            key,
        }
    }

    pub const fn form(field: &'static str, key: &'static str) -> Self {
        Self {
            field,
            source: Source::Form,
            key,
        }
    }
}

/// A record the binder can populate.
///
/// Implement it with [`bindable!`](crate::bindable) rather than by hand.
pub trait Bindable {
    /// The field table; the position of an entry is the index passed to
    /// [`set_field`](Self::set_field).
    const FIELDS: &'static [FieldSpec];

    /// `true` when the type accepts a JSON body.
    const ACCEPTS_JSON: bool = false;

    /// Assigns the raw value to the field at `index` in [`FIELDS`](Self::FIELDS).
    fn set_field(&mut self, index: usize, raw: &str) -> Result<(), ParamError>;

    /// Decodes a JSON body onto `self`.
    fn decode_json(&mut self, _body: &[u8]) -> Result<(), BindError> {
        Err(BindError::JsonNotAccepted {
            type_name: std::any::type_name::<Self>(),
        })
    }

    /// Whether the combined bind should look at the body at all.
    fn binds_body() -> bool {
        Self::ACCEPTS_JSON || Self::FIELDS.iter().any(|f| f.source == Source::Form)
    }
}

/// Failure converting one raw parameter string.
#[derive(Debug, Error)]
pub enum ParamError {
    #[error(transparent)]
    Int(#[from] ParseIntError),

    #[error(transparent)]
    Float(#[from] ParseFloatError),

    #[error("invalid boolean: {0:?}")]
    Bool(String),
}

/// Binding stage named in a wrapped [`BindError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Query,
    Path,
    Body,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Query => "query",
            Self::Path => "path",
            Self::Body => "body",
        })
    }
}

/// Errors produced while binding a request onto a record.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("{stage} bind failed: {source}")]
    Stage {
        stage: Stage,
        source: Box<BindError>,
    },

    #[error("field {field}: {source}")]
    Field {
        field: &'static str,
        #[source]
        source: ParamError,
    },

    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),

    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{type_name} does not accept a JSON body")]
    JsonNotAccepted { type_name: &'static str },
}

impl BindError {
    fn at(stage: Stage, err: BindError) -> Self {
        Self::Stage {
            stage,
            source: Box::new(err),
        }
    }

    /// Returns the innermost error, skipping stage wrappers.
    pub fn root(&self) -> &BindError {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Converts a raw parameter string into a field value.
pub trait FromParam {
    fn set_param(&mut self, raw: &str) -> Result<(), ParamError>;
}

impl FromParam for String {
    fn set_param(&mut self, raw: &str) -> Result<(), ParamError> {
        raw.clone_into(self);
        Ok(())
    }
}

impl FromParam for bool {
    fn set_param(&mut self, raw: &str) -> Result<(), ParamError> {
        *self = parse_bool(raw).ok_or_else(|| ParamError::Bool(raw.to_owned()))?;
        Ok(())
    }
}

macro_rules! from_param_parse {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromParam for $ty {
                fn set_param(&mut self, raw: &str) -> Result<(), ParamError> {
                    *self = raw.parse()?;
                    Ok(())
                }
            }
        )*
    };
}

from_param_parse!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl<T: FromParam + Default> FromParam for Option<T> {
    fn set_param(&mut self, raw: &str) -> Result<(), ParamError> {
        let mut value = T::default();
        value.set_param(raw)?;
        *self = Some(value);
        Ok(())
    }
}

/// Runs query, path and, when the type binds a body, body binding in that
/// order. The first failure is returned wrapped with its stage.
pub fn bind<T: Bindable>(
    request: &Request,
    params: &PathParams,
    dest: &mut T,
) -> Result<(), BindError> {
    bind_query(request, dest).map_err(|e| BindError::at(Stage::Query, e))?;
    bind_path(params, dest).map_err(|e| BindError::at(Stage::Path, e))?;
    if T::binds_body() {
        bind_body(request, dest).map_err(|e| BindError::at(Stage::Body, e))?;
    }
    Ok(())
}

/// Assigns every `query` field present in the URL query string.
pub fn bind_query<T: Bindable>(request: &Request, dest: &mut T) -> Result<(), BindError> {
    bind_source(dest, Source::Query, |key| request.query_param(key))
}

/// Assigns every `path` field captured by the matched route.
pub fn bind_path<T: Bindable>(params: &PathParams, dest: &mut T) -> Result<(), BindError> {
    bind_source(dest, Source::Path, |key| params.get(key))
}

/// Decodes the body according to its `Content-Type`.
///
/// - JSON bodies go through [`Bindable::decode_json`].
/// - Form-encoded bodies fill the `form` fields.
/// - Multipart bodies are accepted without mapping any field.
/// - Anything else is rejected.
pub fn bind_body<T: Bindable>(request: &Request, dest: &mut T) -> Result<(), BindError> {
    let content_type = request.content_type().unwrap_or_default();

    if content_type.contains(mime::APPLICATION_JSON) {
        dest.decode_json(request.body())
    } else if content_type.contains(mime::APPLICATION_FORM) {
        let form = request.form();
        bind_source(dest, Source::Form, |key| {
            form.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        })
    } else if content_type.contains(mime::MULTIPART_FORM) {
        Ok(())
    } else {
        Err(BindError::UnsupportedContentType(content_type.to_owned()))
    }
}

fn bind_source<'a, T: Bindable>(
    dest: &mut T,
    source: Source,
    lookup: impl Fn(&str) -> Option<&'a str>,
) -> Result<(), BindError> {
    for (index, spec) in T::FIELDS.iter().enumerate() {
        if spec.source != source || spec.key.is_empty() {
            continue;
        }
        let Some(raw) = lookup(spec.key).filter(|v| !v.is_empty()) else {
            continue;
        };
        dest.set_field(index, raw)
            .map_err(|err| BindError::Field {
                field: spec.field,
                source: err,
            })?;
    }
    Ok(())
}

/// Decodes `body` onto `dest`: keys present in the body overwrite, keys
/// absent keep the current value.
///
/// Fields that do not survive a serialize/deserialize round trip (for
/// example `#[serde(skip)]` ones) are reset to their serde default.
pub fn merge_json<T>(dest: &mut T, body: &[u8]) -> Result<(), BindError>
where
    T: Serialize + DeserializeOwned,
{
    let patch: serde_json::Value = serde_json::from_slice(body)?;
    let mut current = serde_json::to_value(&*dest)?;
    match (&mut current, patch) {
        (serde_json::Value::Object(fields), serde_json::Value::Object(incoming)) => {
            fields.extend(incoming);
        }
        (slot, incoming) => *slot = incoming,
    }
    *dest = serde_json::from_value(current)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindable;

    #[derive(Debug, Default, PartialEq, Serialize, serde::Deserialize)]
    struct Filter {
        term: String,
        page: u32,
        offset: i64,
        ratio: f64,
        exact: bool,
        limit: Option<u8>,
    }

    bindable! {
        Filter {
            query "q" => term,
            query "page" => page,
            query "offset" => offset,
            query "ratio" => ratio,
            query "exact" => exact,
            query "limit" => limit,
        }
    }

    #[derive(Debug, Default, PartialEq, Serialize, serde::Deserialize)]
    struct Item {
        id: u64,
        name: String,
        verbose: bool,
    }

    bindable! {
        Item {
            path "id" => id,
            query "verbose" => verbose,
        } json
    }

    #[derive(Debug, Default)]
    struct Login {
        user: String,
        remember: bool,
    }

    bindable! {
        Login {
            form "user" => user,
            form "remember" => remember,
        }
    }

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn post(content_type: &str, body: &str) -> Request {
        request(&format!(
            "POST /items/9?verbose=true HTTP/1.1\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ))
    }

    #[test]
    fn query_binds_every_supported_type() {
        let req = request(
            "GET /?q=rust&page=3&offset=-7&ratio=0.25&exact=T&limit=9 HTTP/1.1\r\n\r\n",
        );
        let mut filter = Filter::default();
        bind_query(&req, &mut filter).unwrap();
        assert_eq!(
            filter,
            Filter {
                term: "rust".into(),
                page: 3,
                offset: -7,
                ratio: 0.25,
                exact: true,
                limit: Some(9),
            }
        );
    }

    #[test]
    fn absent_and_empty_parameters_leave_defaults() {
        let req = request("GET /?q=&page= HTTP/1.1\r\n\r\n");
        let mut filter = Filter::default();
        bind_query(&req, &mut filter).unwrap();
        assert_eq!(filter, Filter::default());
    }

    #[test]
    fn malformed_value_names_the_field_and_keeps_earlier_fields() {
        let req = request("GET /?q=kept&page=abc HTTP/1.1\r\n\r\n");
        let mut filter = Filter::default();
        let err = bind_query(&req, &mut filter).unwrap_err();

        assert!(matches!(err, BindError::Field { field: "page", .. }));
        assert!(err.to_string().starts_with("field page: "));
        assert_eq!(filter.term, "kept");
        assert_eq!(filter.page, 0);
    }

    #[test]
    fn narrow_integer_overflow_is_an_error() {
        let req = request("GET /?limit=300 HTTP/1.1\r\n\r\n");
        let mut filter = Filter::default();
        let err = bind_query(&req, &mut filter).unwrap_err();
        assert!(matches!(err, BindError::Field { field: "limit", source: ParamError::Int(_) }));
    }

    #[test]
    fn bad_boolean_is_an_error() {
        let req = request("GET /?exact=maybe HTTP/1.1\r\n\r\n");
        let mut filter = Filter::default();
        let err = bind_query(&req, &mut filter).unwrap_err();
        assert_eq!(err.to_string(), r#"field exact: invalid boolean: "maybe""#);
    }

    #[test]
    fn path_binding_reads_params() {
        let mut params = PathParams::new();
        params.insert("id".into(), "42".into());
        let mut item = Item::default();
        bind_path(&params, &mut item).unwrap();
        assert_eq!(item.id, 42);
    }

    #[test]
    fn json_body_decodes_named_field() {
        let req = post("application/json", r#"{"name":"a"}"#);
        let mut item = Item::default();
        bind_body(&req, &mut item).unwrap();
        assert_eq!(item.name, "a");
    }

    #[test]
    fn text_plain_body_is_rejected() {
        let req = post("text/plain", "name=a");
        let mut item = Item::default();
        let err = bind_body(&req, &mut item).unwrap_err();
        assert!(matches!(&err, BindError::UnsupportedContentType(ct) if ct == "text/plain"));
        assert_eq!(err.to_string(), "unsupported content-type: text/plain");
    }

    #[test]
    fn missing_content_type_is_rejected() {
        let req = request("POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}");
        let mut item = Item::default();
        assert!(matches!(
            bind_body(&req, &mut item),
            Err(BindError::UnsupportedContentType(ct)) if ct.is_empty()
        ));
    }

    #[test]
    fn combined_bind_runs_all_stages_and_body_keeps_earlier_values() {
        let req = post("application/json; charset=utf-8", r#"{"name":"lamp"}"#);
        let mut params = PathParams::new();
        params.insert("id".into(), "9".into());

        let mut item = Item::default();
        bind(&req, &params, &mut item).unwrap();
        assert_eq!(
            item,
            Item {
                id: 9,
                name: "lamp".into(),
                verbose: true,
            }
        );
    }

    #[test]
    fn combined_bind_labels_the_failing_stage() {
        let req = post("application/json", "{not json");
        let mut item = Item::default();
        let err = bind(&req, &PathParams::new(), &mut item).unwrap_err();
        assert!(matches!(err, BindError::Stage { stage: Stage::Body, .. }));
        assert!(err.to_string().starts_with("body bind failed: json decode failed"));
        assert!(matches!(err.root(), BindError::Json(_)));
    }

    #[test]
    fn combined_bind_skips_body_for_query_only_types() {
        let req = request("POST /?q=x HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n");
        let mut filter = Filter::default();
        bind(&req, &PathParams::new(), &mut filter).unwrap();
        assert_eq!(filter.term, "x");
    }

    #[test]
    fn query_stage_error_is_labeled() {
        let req = request("GET /?page=-1 HTTP/1.1\r\n\r\n");
        let mut filter = Filter::default();
        let err = bind(&req, &PathParams::new(), &mut filter).unwrap_err();
        assert!(err.to_string().starts_with("query bind failed: field page: "));
    }

    #[test]
    fn path_stage_error_is_labeled_and_keeps_query_values() {
        let req = post("application/json", "{}");
        let mut params = PathParams::new();
        params.insert("id".to_owned(), "nine".to_owned());

        let mut item = Item::default();
        let err = bind(&req, &params, &mut item).unwrap_err();
        assert!(matches!(err, BindError::Stage { stage: Stage::Path, .. }));
        assert!(err.to_string().starts_with("path bind failed: field id: "));
        assert!(matches!(err.root(), BindError::Field { field: "id", .. }));
        // The query stage already ran.
        assert!(item.verbose);
    }

    #[test]
    fn form_body_fills_form_fields() {
        let req = post("application/x-www-form-urlencoded", "user=ada+l&remember=1");
        let mut login = Login::default();
        bind(&req, &PathParams::new(), &mut login).unwrap();
        assert_eq!(login.user, "ada l");
        assert!(login.remember);
    }

    #[test]
    fn multipart_is_accepted_without_mapping() {
        let req = post("multipart/form-data; boundary=x", "--x--");
        let mut login = Login::default();
        bind_body(&req, &mut login).unwrap();
        assert!(login.user.is_empty());
    }

    #[test]
    fn json_into_type_without_marker_is_refused() {
        let req = post("application/json", r#"{"user":"a"}"#);
        let mut login = Login::default();
        let err = bind_body(&req, &mut login).unwrap_err();
        assert!(matches!(err, BindError::JsonNotAccepted { .. }));
    }

    #[test]
    fn field_table_and_body_flags() {
        assert_eq!(Filter::FIELDS.len(), 6);
        assert_eq!(Filter::FIELDS[1], FieldSpec::query("page", "page"));
        assert!(!Filter::binds_body());
        assert!(Item::binds_body());
        assert!(Login::binds_body());
    }
}
