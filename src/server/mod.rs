//! Async HTTP/1.1 server using Tokio.
//!
//! Accepts TCP (optionally TLS) connections and dispatches HTTP/1.1 requests to
//! a handler function. Persistent connections (keep-alive) are supported, and
//! requests on one connection are handled in order.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::http::{
    Method, StatusCode,
    request::{Request, RequestError, decode_chunked},
    response::Response,
};

mod tls;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read PEM file {path}: {source}")]
    Pem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
}

/// Connection limits.
///
/// Deserializable so it can live in an application's own config file; missing
/// fields take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest request (headers plus body) buffered before answering 413.
    pub max_request_size: usize,
    /// Initial read buffer capacity per connection.
    pub initial_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_request_size: 8 * 1024 * 1024,
            initial_buffer_size: 4096,
        }
    }
}

/// The HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function.
///
/// # Examples
///
/// ```rust,no_run
/// use teta::server::Server;
/// use teta::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config: ServerConfig::default(),
            tls: None,
        })
    }

    /// Replaces the connection limits.
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Serves every connection over TLS using the PEM certificate chain and
    /// private key at the given paths.
    ///
    /// # Errors
    ///
    /// Fails when either file cannot be read or holds no usable PEM item, or
    /// when the key does not match the certificate.
    pub fn with_tls(
        mut self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, ServerError> {
        self.tls = Some(tls::load_acceptor(cert_path.as_ref(), key_path.as_ref())?);
        Ok(self)
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler is wrapped in an [`Arc`] and shared across all spawned Tokio
    /// tasks, so it must be `Send + Sync + 'static`. Each request carries the
    /// peer address (see [`Request::remote_addr`]).
    ///
    /// This method runs until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let config = Arc::new(self.config);
        info!(address = %self.local_addr, tls = self.tls.is_some(), "teta listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let config = Arc::clone(&config);
            let tls = self.tls.clone();

            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => handle_connection(stream, peer_addr, &config, handler).await,
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                    None => handle_connection(stream, peer_addr, &config, handler).await,
                };
                if let Err(e) = result {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, answering one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`. Bytes past the current request stay buffered for the
/// next one.
async fn handle_connection<S, H, F>(
    mut stream: S,
    peer_addr: SocketAddr,
    config: &ServerConfig,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(config.initial_buffer_size);

    loop {
        // Parse what is buffered first; only read when more data is needed.
        let parsed = if buf.is_empty() {
            Err(RequestError::Incomplete)
        } else {
            Request::parse(&buf)
        };

        let (mut request, body_offset) = match parsed {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if read_more(&mut stream, &mut buf, peer_addr, config).await? {
                    continue;
                }
                break;
            }
            Err(e) => {
                let status = match e {
                    RequestError::UnsupportedTransferEncoding(_) => StatusCode::NotImplemented,
                    _ => StatusCode::BadRequest,
                };
                warn!(peer = %peer_addr, error = %e, status = status.as_u16(), "rejecting request");
                reject(&mut stream, status, format!("{}: {e}", status.canonical_reason())).await?;
                break;
            }
        };

        let total_needed = if request.is_chunked() {
            match decode_chunked(&buf[body_offset..]) {
                Ok((body, used)) => {
                    request.set_body(body);
                    body_offset + used
                }
                Err(RequestError::Incomplete) => {
                    if read_more(&mut stream, &mut buf, peer_addr, config).await? {
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad chunked body, sending 400");
                    reject(&mut stream, StatusCode::BadRequest, format!("Bad Request: {e}")).await?;
                    break;
                }
            }
        } else {
            // Refuse a declared body that could never fit before waiting for it.
            let declared = request.content_length().unwrap_or(0);
            let Some(total) = body_offset
                .checked_add(declared)
                .filter(|total| *total <= config.max_request_size)
            else {
                warn!(peer = %peer_addr, declared, "declared body too large, sending 413");
                reject(&mut stream, StatusCode::PayloadTooLarge, "Request entity too large").await?;
                break;
            };
            if buf.len() < total {
                if read_more(&mut stream, &mut buf, peer_addr, config).await? {
                    continue;
                }
                break;
            }
            total
        };

        request.set_remote_addr(peer_addr);
        let keep_alive = request.is_keep_alive();
        let head = *request.method() == Method::Head;

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = handler(request)
            .await
            .keep_alive(keep_alive)
            .head_only(head);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

// Reads into `buf`. Returns `false` when the connection should end: the peer
// closed it, or the request grew past the size limit (413 already sent).
async fn read_more<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    peer_addr: SocketAddr,
    config: &ServerConfig,
) -> Result<bool, std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if stream.read_buf(buf).await? == 0 {
        debug!(peer = %peer_addr, "connection closed by peer");
        return Ok(false);
    }

    if buf.len() > config.max_request_size {
        warn!(peer = %peer_addr, "request too large, sending 413");
        reject(stream, StatusCode::PayloadTooLarge, "Request entity too large").await?;
        return Ok(false);
    }

    Ok(true)
}

// Writes a final error answer; the caller closes the connection.
async fn reject<S>(stream: &mut S, status: StatusCode, body: impl Into<String>) -> Result<(), std::io::Error>
where
    S: AsyncWrite + Unpin,
{
    let response = Response::new(status).body(body).keep_alive(false);
    stream.write_all(&response.into_bytes()).await
}
