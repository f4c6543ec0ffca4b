use std::error::Error;
use std::fmt;

/// Engine-wide error type.
///
/// `Interrupted` is the cooperative-cancellation outcome. It is not a data or
/// type error and callers must not report it as one.
#[derive(Debug)]
pub enum EngineError {
    /// A textual operand token could not be turned into a typed operand.
    Resolution {
        token: String,
        line: usize,
        reason: String,
    },
    /// A resolved comparison has no semantics for the operand shapes involved.
    Evaluation { comparator: String, detail: String },
    /// An internal sequencing invariant was violated. Indicates an engine bug,
    /// not bad user input.
    Invariant(String),
    /// The first failure captured from a per-sequence worker.
    Task {
        operation: String,
        source: Box<EngineError>,
    },
    /// Cooperative cancellation requested by the caller.
    Interrupted,
    /// A line of a classifier dataset file could not be parsed.
    Format { line: usize, detail: String },
    NotFound(String),
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::Resolution {
                token,
                line,
                reason,
            } => {
                write!(f, "Could not resolve '{token}' (line {line}): {reason}")
            }
            EngineError::Evaluation { comparator, detail } => {
                write!(f, "Comparator '{comparator}' not applicable: {detail}")
            }
            EngineError::Invariant(msg) => write!(f, "Internal error: {msg}"),
            EngineError::Task { operation, source } => {
                write!(f, "Operation '{operation}' failed: {source}")
            }
            EngineError::Interrupted => write!(f, "Interrupted"),
            EngineError::Format { line, detail } => {
                write!(f, "Data file format error on line {line}: {detail}")
            }
            EngineError::NotFound(name) => write!(f, "Unknown data item '{name}'"),
            EngineError::Io(err) => write!(f, "{err}"),
            EngineError::Serde(err) => write!(f, "{err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::Task { source, .. } => Some(source.as_ref()),
            EngineError::Io(err) => Some(err),
            EngineError::Serde(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serde(err)
    }
}

impl EngineError {
    /// True for the cancellation outcome, which is propagated without wrapping
    /// and reported without an error dialog.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, EngineError::Interrupted)
    }
}
