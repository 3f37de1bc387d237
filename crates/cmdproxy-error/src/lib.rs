//! Unified error taxonomy for cmdproxy.
//!
//! Every error raised by the client or worker pipelines carries a stable,
//! machine-readable [`ErrorCode`], a human-readable message, an optional
//! cause chain, and arbitrary key-value context. Use the builder returned by
//! [`CmdproxyError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant corresponds to exactly one of the error kinds in the
/// argument-transit protocol: a missing environment variable, an unresolved
/// command, a missing or conflicting blob, a malformed envelope, a broker or
/// subprocess failure, or a server-side exception surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A named environment variable was absent on the side required to resolve it.
    MissingEnvVar,
    /// A `CmdName` was not found in the server's command palette.
    UnknownCommand,
    /// A `CmdPath` could not be resolved on the worker.
    CommandNotFound,
    /// An expected input blob was absent at materialisation time.
    BlobMissing,
    /// An output slot was already occupied when the client tried to reserve it.
    BlobConflict,
    /// The envelope was malformed JSON, used an unknown variant tag, or
    /// violated the serialisable-parameter invariant.
    EnvelopeDecode,
    /// The broker failed to accept or return a dispatched envelope.
    DispatchFailure,
    /// The worker could not spawn the subprocess.
    ExecutionFailure,
    /// The worker raised an exception; wrapped here when the client decodes
    /// a `RunResponse` whose `error` field is non-null.
    ServerEnd,
}

impl ErrorCode {
    /// Stable `&'static str` representation (e.g. `"MISSING_ENV_VAR"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingEnvVar => "MISSING_ENV_VAR",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::CommandNotFound => "COMMAND_NOT_FOUND",
            Self::BlobMissing => "BLOB_MISSING",
            Self::BlobConflict => "BLOB_CONFLICT",
            Self::EnvelopeDecode => "ENVELOPE_DECODE",
            Self::DispatchFailure => "DISPATCH_FAILURE",
            Self::ExecutionFailure => "EXECUTION_FAILURE",
            Self::ServerEnd => "SERVER_END",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CmdproxyError
// ---------------------------------------------------------------------------

/// Unified cmdproxy error.
///
/// # Examples
///
/// ```
/// use cmdproxy_error::{CmdproxyError, ErrorCode};
///
/// let err = CmdproxyError::new(ErrorCode::MissingEnvVar, "PASSWORD is not set")
///     .with_context("name", "PASSWORD");
/// assert_eq!(err.code, ErrorCode::MissingEnvVar);
/// ```
#[derive(Debug)]
pub struct CmdproxyError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics (e.g. the missing
    /// variable name, the unresolved command name).
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CmdproxyError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Render as a single diagnostic line suitable for `RunResponse.error`.
    ///
    /// Shape: `"<CODE>: <message>"`, optionally followed by a `caused by:`
    /// line when a source is attached.
    pub fn to_diagnostic(&self) -> String {
        match &self.source {
            Some(src) => format!("{}: {}\ncaused by: {src}", self.code, self.message),
            None => format!("{}: {}", self.code, self.message),
        }
    }

    /// Convenience constructor for [`ErrorCode::MissingEnvVar`].
    pub fn missing_env_var(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::MissingEnvVar, format!("environment variable not set: {name}"))
            .with_context("name", name)
    }

    /// Convenience constructor for [`ErrorCode::UnknownCommand`].
    pub fn unknown_command(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::UnknownCommand, format!("unknown command: {name}"))
            .with_context("name", name)
    }

    /// Convenience constructor for [`ErrorCode::CommandNotFound`].
    pub fn command_not_found(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(ErrorCode::CommandNotFound, format!("command not found: {path}"))
            .with_context("path", path)
    }

    /// Convenience constructor for [`ErrorCode::BlobMissing`].
    pub fn blob_missing(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::BlobMissing, format!("blob missing: {name}"))
            .with_context("blob", name)
    }

    /// Convenience constructor for [`ErrorCode::BlobConflict`].
    pub fn blob_conflict(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::BlobConflict, format!("output slot already occupied: {name}"))
            .with_context("blob", name)
    }

    /// Convenience constructor for [`ErrorCode::EnvelopeDecode`].
    pub fn envelope_decode(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::EnvelopeDecode, detail.into())
    }

    /// Convenience constructor for [`ErrorCode::DispatchFailure`].
    pub fn dispatch_failure(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::DispatchFailure, detail.into())
    }

    /// Convenience constructor for [`ErrorCode::ExecutionFailure`].
    pub fn execution_failure(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionFailure, detail.into())
    }

    /// Convenience constructor for [`ErrorCode::ServerEnd`], wrapping the
    /// diagnostic string carried in a `RunResponse.error` field.
    pub fn server_end(diagnostic: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerEnd, diagnostic.into())
    }
}

impl fmt::Display for CmdproxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CmdproxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
