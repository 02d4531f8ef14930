//! Incoming requests, parsed from the connection buffer with [`httparse`].
//!
//! The query string is decoded once at parse time; form bodies are decoded on
//! demand by the binder.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method, header};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },

    #[error("both Content-Length and Transfer-Encoding are present")]
    ConflictingLength,

    #[error("unsupported Transfer-Encoding: {0:?}")]
    UnsupportedTransferEncoding(String),

    #[error("malformed chunked body")]
    InvalidChunk,
}

/// One parsed request: head, decoded query and a body cut at
/// `Content-Length` (or decoded from chunks by the server).
///
/// # Examples
///
/// ```
/// use teta::http::request::Request;
///
/// let raw = b"GET /hello?name=wor%6Cd HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    query_params: Vec<(String, String)>,
    content_length: Option<usize>,
    chunked: bool,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    const MAX_HEADERS: usize = 64;

    /// Parses the request at the start of `buf` and returns it with the offset
    /// where its body starts.
    ///
    /// The body holds whatever part of the `Content-Length` bytes is already
    /// in `buf`; the server waits for the rest before dispatching.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    /// - [`RequestError::InvalidContentLength`]: `Content-Length` is not a number.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.append(header.name, value);
            }
        }

        let content_length = header_map
            .get(header::CONTENT_LENGTH)
            .map(|value| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| RequestError::InvalidContentLength {
                        value: value.to_owned(),
                    })
            })
            .transpose()?;
        let chunked = match header_map.get(header::TRANSFER_ENCODING) {
            None => false,
            Some(_) if content_length.is_some() => return Err(RequestError::ConflictingLength),
            Some(coding) if coding.trim().eq_ignore_ascii_case("chunked") => true,
            Some(coding) => return Err(RequestError::UnsupportedTransferEncoding(coding.to_owned())),
        };

        let body = match content_length {
            Some(len) if !chunked => {
                let body_end = body_offset.saturating_add(len).min(buf.len());
                Bytes::copy_from_slice(&buf[body_offset..body_end])
            }
            _ => Bytes::new(),
        };

        let query_params = query
            .as_deref()
            .map(|q| decode_pairs(q.as_bytes()))
            .unwrap_or_default();

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                query_params,
                content_length,
                chunked,
                body,
                remote_addr: None,
            },
            body_offset,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The path without its query string, still percent-encoded.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The undecoded query string, without the `?`.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// First decoded value of `key` in the query string.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query_params
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(header::CONTENT_TYPE)
    }

    /// Decodes the body as `application/x-www-form-urlencoded` pairs.
    pub fn form(&self) -> Vec<(String, String)> {
        decode_pairs(&self.body)
    }

    /// The peer address, set by the server. `None` for requests parsed by
    /// hand.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    /// Whether the connection may serve another request after this one.
    /// HTTP/1.1 stays open unless `Connection` lists `close`; HTTP/1.0 closes
    /// unless it lists `keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        if self.version == 1 {
            !self.headers.has_token(header::CONNECTION, "close")
        } else {
            self.headers.has_token(header::CONNECTION, "keep-alive")
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Whether the body arrives as `Transfer-Encoding: chunked`.
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }
}

/// Decodes a chunked body from the start of `buf`.
///
/// On success returns the joined chunk data and the number of bytes consumed,
/// trailer section included. [`RequestError::Incomplete`] means the final
/// zero-size chunk has not arrived yet.
pub fn decode_chunked(buf: &[u8]) -> Result<(Bytes, usize), RequestError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let (size_end, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(found)) => found,
            Ok(httparse::Status::Partial) => return Err(RequestError::Incomplete),
            Err(_) => return Err(RequestError::InvalidChunk),
        };
        pos += size_end;

        if size == 0 {
            // Trailer fields are skipped; the section ends with an empty line.
            let rest = &buf[pos..];
            if rest.starts_with(b"\r\n") {
                return Ok((Bytes::from(body), pos + 2));
            }
            return match rest.windows(4).position(|w| w == b"\r\n\r\n") {
                Some(end) => Ok((Bytes::from(body), pos + end + 4)),
                None => Err(RequestError::Incomplete),
            };
        }

        let size = usize::try_from(size).map_err(|_| RequestError::InvalidChunk)?;
        let data_end = pos.checked_add(size).ok_or(RequestError::InvalidChunk)?;
        let Some(chunk) = buf.get(pos..data_end) else {
            return Err(RequestError::Incomplete);
        };
        match buf.get(data_end..data_end + 2) {
            Some(b"\r\n") => {}
            Some(_) => return Err(RequestError::InvalidChunk),
            None => return Err(RequestError::Incomplete),
        }
        body.extend_from_slice(chunk);
        pos = data_end + 2;
    }
}

// `+` becomes a space and `%XX` escapes are decoded.
fn decode_pairs(input: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(input)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
