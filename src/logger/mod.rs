//! JSON structured logger handle.
//!
//! A [`Logger`] owns its own [`tracing::Dispatch`] built from
//! `tracing-subscriber`'s JSON formatter, so every line it emits has the shape
//!
//! ```text
//! {"timestamp":"2026-01-02T03:04:05.678901Z","level":"INFO","message":"listening","addr":"127.0.0.1:8080"}
//! ```
//!
//! The handle is passed explicitly to the router and to every request
//! context; it never installs itself as the process-wide default.
//!
//! Structured per-call fields go through the ordinary `tracing` macros inside
//! [`Logger::in_scope`]. Fixed fields attached with [`Logger::with_fields`] are
//! merged into every line the child logger writes.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tracing::{Dispatch, Level};
use tracing_subscriber::fmt::MakeWriter;

type Output = Box<dyn Write + Send>;

/// Leveled JSON logger with a replaceable output sink.
///
/// Cloning is cheap; clones and children share the sink, so
/// [`set_output`](Self::set_output) redirects all of them at once.
///
/// # Examples
///
/// ```
/// use teta::logger::Logger;
///
/// let logger = Logger::new(std::io::sink());
/// let db = logger.with_fields([("component", "db")]);
/// db.info("pool ready");
/// logger.in_scope(|| tracing::warn!(retries = 3, "slow upstream"));
/// ```
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    output: Arc<Mutex<Output>>,
    fields: Arc<Map<String, Value>>,
}

impl Logger {
    /// Creates a logger writing one JSON object per line to `output`.
    pub fn new(output: impl Write + Send + 'static) -> Self {
        let output: Arc<Mutex<Output>> = Arc::new(Mutex::new(Box::new(output)));
        Self::assemble(output, Arc::new(Map::new()))
    }

    /// Creates a logger writing to standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    fn assemble(output: Arc<Mutex<Output>>, fields: Arc<Map<String, Value>>) -> Self {
        let writer = LineSink {
            output: Arc::clone(&output),
            fields: Arc::clone(&fields),
        };

        let subscriber = tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_target(false)
            .with_max_level(Level::DEBUG)
            .with_writer(writer)
            .finish();

        Self {
            dispatch: Dispatch::new(subscriber),
            output,
            fields,
        }
    }

    /// Redirects this logger, its clones, and its children to `output`.
    pub fn set_output(&self, output: impl Write + Send + 'static) {
        let mut slot = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Box::new(output);
    }

    /// A writer onto the current sink.
    ///
    /// Bytes go to whatever output is installed when they are written, so the
    /// handle follows later [`set_output`](Self::set_output) calls.
    pub fn output(&self) -> LogOutput {
        LogOutput {
            output: Arc::clone(&self.output),
        }
    }

    /// Returns a child logger that adds `fields` to every line it writes.
    ///
    /// Fields already present on this logger are kept; a key given again is
    /// overwritten for the child only.
    pub fn with_fields<K, V>(&self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut merged = (*self.fields).clone();
        for (key, value) in fields {
            merged.insert(key.into(), value.into());
        }
        Self::assemble(Arc::clone(&self.output), Arc::new(merged))
    }

    /// Runs `f` with this logger as the current `tracing` dispatcher.
    ///
    /// Use it to attach structured fields through the `tracing` macros.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub fn debug(&self, message: &str) {
        self.in_scope(|| tracing::debug!("{message}"));
    }

    pub fn info(&self, message: &str) {
        self.in_scope(|| tracing::info!("{message}"));
    }

    pub fn warn(&self, message: &str) {
        self.in_scope(|| tracing::warn!("{message}"));
    }

    pub fn error(&self, message: &str) {
        self.in_scope(|| tracing::error!("{message}"));
    }

    /// Logs at error level, then aborts the process.
    pub fn fatal(&self, message: &str) -> ! {
        self.error(message);
        std::process::abort()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

/// Raw writer returned by [`Logger::output`].
#[derive(Clone)]
pub struct LogOutput {
    output: Arc<Mutex<Output>>,
}

impl Write for LogOutput {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl fmt::Debug for LogOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOutput").finish_non_exhaustive()
    }
}

// Hands the formatter one buffer per event and writes the finished line
// (with fixed fields merged in) to the shared output on drop.
struct LineSink {
    output: Arc<Mutex<Output>>,
    fields: Arc<Map<String, Value>>,
}

impl<'a> MakeWriter<'a> for LineSink {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            output: Arc::clone(&self.output),
            fields: Arc::clone(&self.fields),
            buf: Vec::with_capacity(256),
        }
    }
}

struct LineWriter {
    output: Arc<Mutex<Output>>,
    fields: Arc<Map<String, Value>>,
    buf: Vec<u8>,
}

impl Write for LineWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = if self.fields.is_empty() {
            std::mem::take(&mut self.buf)
        } else {
            merge_fields(&self.buf, &self.fields)
        };

        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        // Nowhere to report a failing log sink.
        let _ = output.write_all(&line);
        let _ = output.flush();
    }
}

// Event fields win over fixed fields with the same key.
fn merge_fields(line: &[u8], fields: &Map<String, Value>) -> Vec<u8> {
    let Ok(mut event) = serde_json::from_slice::<Map<String, Value>>(line) else {
        return line.to_vec();
    };
    for (key, value) in fields {
        if !event.contains_key(key) {
            event.insert(key.clone(), value.clone());
        }
    }
    match serde_json::to_vec(&event) {
        Ok(mut out) => {
            out.push(b'\n');
            out
        }
        Err(_) => line.to_vec(),
    }
}
