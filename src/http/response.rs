//! Outgoing responses.
//!
//! Handlers never build a [`Response`] directly: they write through the
//! context, which edits one in place with the `set_*` methods. The builder
//! methods serve the server's own answers (400, 404, 405, 413) and tests.

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode, header, mime};

/// Status, header fields and body of one answer.
///
/// ```
/// use teta::http::{Response, StatusCode};
///
/// let wire = Response::new(StatusCode::Accepted)
///     .header("X-Queue", "low")
///     .body("queued")
///     .into_bytes();
///
/// let text = String::from_utf8_lossy(&wire);
/// assert!(text.starts_with("HTTP/1.1 202 Accepted\r\n"));
/// assert!(text.ends_with("Content-Length: 6\r\n\r\nqueued"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
    head_only: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
            head_only: false,
        }
    }

    /// Adds a header field; repeated names accumulate.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn body(self, body: impl Into<String>) -> Self {
        self.body_bytes(body.into())
    }

    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the connection stays open after this response. The server
    /// sets it from the request; `false` also writes `Connection: close`.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Answers a `HEAD` request: the encoder still reports the body's
    /// `Content-Length` but leaves the body itself off the wire.
    #[must_use]
    pub fn head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The body written so far.
    pub fn content(&self) -> &[u8] {
        &self.body
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Replaces any value already set under `name`.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Adds a value under `name` next to the existing ones.
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.append(name, value);
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Encodes the status line, header fields and body.
    ///
    /// A non-empty body without a `Content-Type` is sent as UTF-8 text.
    /// `Connection` and `Content-Length` are always written by the encoder and
    /// override whatever the handler set.
    pub fn into_bytes(mut self) -> BytesMut {
        if !self.body.is_empty() && !self.headers.contains(header::CONTENT_TYPE) {
            self.headers.set(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF8);
        }
        self.headers.set(
            header::CONNECTION,
            if self.keep_alive { "keep-alive" } else { "close" },
        );
        self.headers
            .set(header::CONTENT_LENGTH, self.body.len().to_string());

        let mut buf = BytesMut::with_capacity(64 + self.headers.len() * 48 + self.body.len());
        buf.put_slice(b"HTTP/1.1 ");
        buf.put_slice(self.status.as_u16().to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.canonical_reason().as_bytes());
        buf.put_slice(b"\r\n");
        self.headers.write_to(&mut buf);
        buf.put_slice(b"\r\n");
        if !self.head_only {
            buf.put_slice(&self.body);
        }
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(response: Response) -> String {
        String::from_utf8(response.into_bytes().to_vec()).unwrap()
    }

    #[test]
    fn text_body_gets_default_content_type() {
        let out = wire(Response::new(StatusCode::NotFound).body("404 page not found\n"));
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(out.contains("Content-Length: 19\r\n"));
        assert!(out.ends_with("\r\n\r\n404 page not found\n"));
    }

    #[test]
    fn empty_body_has_no_content_type() {
        let out = wire(Response::new(StatusCode::NoContent));
        assert!(!out.contains("Content-Type"));
        assert!(out.contains("Content-Length: 0\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encoder_owns_connection_and_length() {
        let mut response = Response::default().keep_alive(false);
        response.set_header("Connection", "keep-alive");
        response.set_header("Content-Length", "999");
        response.set_body("ok");

        let out = wire(response);
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.contains("Content-Length: 2\r\n"));
        assert!(!out.contains("999"));
    }

    #[test]
    fn head_answer_keeps_length_but_drops_body() {
        let out = wire(Response::new(StatusCode::Ok).body("pong").head_only(true));
        assert!(out.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(out.ends_with("Content-Length: 4\r\n\r\n"));
    }

    #[test]
    fn context_style_edits() {
        let mut response = Response::default();
        response.set_status(StatusCode::Created);
        response.set_header(header::CONTENT_TYPE, mime::TEXT_PLAIN);
        response.set_header("content-type", mime::APPLICATION_JSON);
        response.append_header(header::VARY, header::ORIGIN);
        response.set_body(b"{}".to_vec());

        assert_eq!(response.status(), StatusCode::Created);
        assert_eq!(response.headers().get("Content-Type"), Some(mime::APPLICATION_JSON));
        assert_eq!(response.content(), b"{}");

        let out = wire(response);
        assert!(out.contains("content-type: application/json\r\n"));
        assert!(out.contains("Vary: Origin\r\n"));
    }
}
