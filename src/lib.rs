//! # teta
//!
//! Route groups, middleware chaining, request binding and JSON error
//! responses on top of an async HTTP/1.1 server.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use teta::{Router, StatusCode, bindable};
//! use teta::middleware::request_logger;
//!
//! #[derive(Default, serde::Serialize, serde::Deserialize, validator::Validate)]
//! struct NewItem {
//!     #[validate(length(min = 1))]
//!     name: String,
//!     dry_run: bool,
//! }
//!
//! bindable! {
//!     NewItem {
//!         query "dry_run" => dry_run,
//!     } json
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.use_middleware(request_logger());
//!
//!     router.route("/api", |api| {
//!         api.post("/items", |ctx| Box::pin(async move {
//!             let mut item = NewItem::default();
//!             ctx.bind(&mut item)?;
//!             ctx.validate(&item)?;
//!             ctx.json(StatusCode::Created, &item)
//!         }));
//!     });
//!
//!     router.start("127.0.0.1:8080").await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod binder;
pub mod context;
pub mod error;
pub mod http;
pub mod logger;
pub mod middleware;
pub mod mux;
pub mod router;
pub mod server;
pub mod validate;

/// A heap-allocated, `Send` future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::{Context, Value};
pub use error::{Error, HandlerResult, HttpError};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use logger::Logger;
pub use middleware::{Handler, Middleware};
pub use router::{Router, RouterGroup};
pub use server::{Server, ServerConfig, ServerError};
pub use validate::Validator;
