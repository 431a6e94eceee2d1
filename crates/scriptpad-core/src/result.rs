//! Data exchanged between the supervisor and its worker.
//!
//! Everything here crosses the process boundary, so every type is
//! serde-serializable and carries no references to worker-local state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest text carried by one event or exception field. Longer text is
/// cut and marked, so a single value can never outgrow a frame.
pub const MAX_EVENT_TEXT: usize = 1024 * 1024;

/// Stack frames kept per exception.
pub const MAX_STACK_FRAMES: usize = 256;

/// Cut `text` to `MAX_EVENT_TEXT` bytes on a char boundary.
fn truncate_text(text: &mut String) {
    if text.len() <= MAX_EVENT_TEXT {
        return;
    }
    let mut end = MAX_EVENT_TEXT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let dropped = text.len() - end;
    text.truncate(end);
    text.push_str(&format!("... [{} bytes truncated]", dropped));
}

/// Parameters fixed for the lifetime of one worker process.
///
/// Changing any of these requires spawning a new worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializationParams {
    /// Pad-script files run before every submission.
    pub references: Vec<String>,
    /// Builtin namespaces whose functions may be called unqualified.
    pub imports: Vec<String>,
    /// Package configuration, opaque to the core.
    #[serde(default)]
    pub package_config: serde_json::Value,
    /// Directory used to resolve relative reference and artifact paths.
    pub working_directory: String,
}

/// Location of a diagnostic in the source text (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
    pub length: u32,
}

impl Span {
    pub fn new(line: u32, column: u32, length: u32) -> Self {
        Self {
            line,
            column,
            length,
        }
    }
}

/// Severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A compile diagnostic. `Error` severity blocks execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Diagnostic code (e.g., "PS1001").
    pub code: String,
    pub message: String,
    pub span: Span,
    /// Source unit the diagnostic belongs to; `None` for the submission itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, code: &str, message: impl Into<String>, span: Span) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message: message.into(),
            span,
            source: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Error, code, message, span)
    }

    pub fn warning(code: &str, message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Warning, code, message, span)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({},{}): {} {}: {}",
            self.source.as_deref().unwrap_or("<submission>"),
            self.span.line,
            self.span.column,
            self.severity,
            self.code,
            self.message
        )
    }
}

/// A captured exception, including its chain of inner exceptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    /// Innermost frame first.
    pub stack: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: Vec::new(),
            inner: None,
        }
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.stack.push(frame.into());
        self
    }

    pub fn with_inner(mut self, inner: ExceptionInfo) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Iterate over this exception and all of its inner exceptions.
    pub fn chain(&self) -> impl Iterator<Item = &ExceptionInfo> {
        std::iter::successors(Some(self), |e| e.inner.as_deref())
    }

    /// Apply `MAX_EVENT_TEXT` and `MAX_STACK_FRAMES` to the whole chain.
    pub fn bounded(mut self) -> Self {
        truncate_text(&mut self.message);
        if self.stack.len() > MAX_STACK_FRAMES {
            let dropped = self.stack.len() - MAX_STACK_FRAMES;
            self.stack.truncate(MAX_STACK_FRAMES);
            self.stack.push(format!("... {} more frame(s)", dropped));
        }
        for frame in &mut self.stack {
            truncate_text(frame);
        }
        self.inner = self.inner.map(|inner| Box::new(inner.bounded()));
        self
    }

    fn payload_len(&self) -> usize {
        self.chain()
            .map(|e| {
                e.type_name.len()
                    + e.message.len()
                    + e.stack.iter().map(String::len).sum::<usize>()
            })
            .sum()
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)?;
        for frame in &self.stack {
            write!(f, "\n   {}", frame)?;
        }
        if let Some(inner) = &self.inner {
            write!(f, "\n ---> {}", inner)?;
        }
        Ok(())
    }
}

/// Console stream a captured line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One unit of streamed output produced while serving a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultEvent {
    /// Snapshot of a value (submission result or explicit `dump`).
    Value {
        header: Option<String>,
        type_name: String,
        display: String,
    },
    /// An exception reported as output.
    Exception(ExceptionInfo),
    /// A compile diagnostic.
    Diagnostic(Diagnostic),
    /// A captured console line.
    Output { stream: OutputStream, text: String },
}

impl ResultEvent {
    pub fn value(type_name: impl Into<String>, display: impl Into<String>) -> Self {
        Self::Value {
            header: None,
            type_name: type_name.into(),
            display: display.into(),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value { .. })
    }

    /// The event with every text field capped at `MAX_EVENT_TEXT`.
    pub fn bounded(self) -> Self {
        match self {
            Self::Value {
                mut header,
                type_name,
                mut display,
            } => {
                if let Some(header) = &mut header {
                    truncate_text(header);
                }
                truncate_text(&mut display);
                Self::Value {
                    header,
                    type_name,
                    display,
                }
            }
            Self::Exception(info) => Self::Exception(info.bounded()),
            Self::Diagnostic(mut diagnostic) => {
                truncate_text(&mut diagnostic.message);
                Self::Diagnostic(diagnostic)
            }
            Self::Output { stream, mut text } => {
                truncate_text(&mut text);
                Self::Output { stream, text }
            }
        }
    }

    /// Approximate number of text bytes the event puts on the wire.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Value {
                header,
                type_name,
                display,
            } => header.as_ref().map_or(0, String::len) + type_name.len() + display.len(),
            Self::Exception(info) => info.payload_len(),
            Self::Diagnostic(diagnostic) => diagnostic.code.len() + diagnostic.message.len(),
            Self::Output { text, .. } => text.len(),
        }
    }
}

/// Final outcome of an `Execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The run finished; its value, if any, was already emitted as a `ResultEvent`.
    Completed,
    /// User code raised an exception.
    Exception(ExceptionInfo),
    /// The worker serving the call was torn down by cancellation or reset.
    Cancelled,
}

impl ExecutionOutcome {
    /// Convert a captured exception into `Error::ExecutionException`.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Exception(info) => Err(Error::ExecutionException(info)),
            Self::Completed | Self::Cancelled => Ok(()),
        }
    }

    pub fn exception(&self) -> Option<&ExceptionInfo> {
        match self {
            Self::Exception(info) => Some(info),
            _ => None,
        }
    }
}
