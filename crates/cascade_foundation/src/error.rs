//! Error types for the Cascade rule engine.
//!
//! Uses `thiserror` for ergonomic error definition with rich context.

use std::fmt;

use thiserror::Error;

/// The main error type for Cascade operations.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: ErrorKind,
    /// Optional context about where the error occurred.
    pub context: Option<ErrorContext>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// Adds context to this error.
    #[must_use]
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Creates a closed session error.
    #[must_use]
    pub fn session_closed() -> Self {
        Self::new(ErrorKind::SessionClosed)
    }

    /// Creates a capacity exceeded error.
    #[must_use]
    pub fn capacity_exceeded(requested: usize, maximum: usize) -> Self {
        Self::new(ErrorKind::CapacityExceeded { requested, maximum })
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument(message.into()))
    }

    /// Creates an unknown type error.
    #[must_use]
    pub fn unknown_type(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownType(name.into()))
    }

    /// Creates an unknown field error.
    #[must_use]
    pub fn unknown_field(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownField {
            type_name: type_name.into(),
            field: field.into(),
        })
    }

    /// Creates an unknown fact reference error.
    #[must_use]
    pub fn unknown_fact_reference(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownFactReference(name.into()))
    }

    /// Creates a predicate failure error attributed to a rule.
    #[must_use]
    pub fn predicate(rule: impl Into<String>, message: impl Into<String>) -> Self {
        let rule = rule.into();
        Self::new(ErrorKind::Predicate {
            rule: rule.clone(),
            message: message.into(),
        })
        .with_context(ErrorContext::new().with_source(rule))
    }

    /// Creates a semantic limit exceeded error.
    #[must_use]
    pub fn limit_exceeded(limit: SemanticLimit) -> Self {
        Self::new(ErrorKind::LimitExceeded(limit))
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal(message.into()))
    }
}

/// Categorized error kinds for pattern matching.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// The session was closed and no longer accepts operations.
    #[error("session has been closed")]
    SessionClosed,

    /// A table was asked to grow beyond its maximum capacity.
    #[error("capacity exceeded: requested {requested} slots (maximum {maximum})")]
    CapacityExceeded {
        /// The requested slot count.
        requested: usize,
        /// The maximum supported slot count.
        maximum: usize,
    },

    /// A caller passed a malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A fact type name could not be resolved.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A field is not declared on its type.
    #[error("unknown field: {field} on type {type_name}")]
    UnknownField {
        /// The declaring type.
        type_name: String,
        /// The field that was not found.
        field: String,
    },

    /// A rule condition referenced an undeclared fact name.
    #[error("unknown fact reference: {0}")]
    UnknownFactReference(String),

    /// A predicate failed while evaluating a rule condition.
    #[error("predicate failed in rule {rule}: {message}")]
    Predicate {
        /// The rule whose condition failed.
        rule: String,
        /// Description of the failure.
        message: String,
    },

    /// Semantic limit exceeded (kill switch triggered).
    #[error("limit exceeded: {0}")]
    LimitExceeded(SemanticLimit),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Semantic limits (kill switches) that can be exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticLimit {
    /// Maximum commit cycles in a single `fire` call exceeded.
    MaxFireCycles {
        /// The configured limit.
        limit: usize,
    },
}

impl fmt::Display for SemanticLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxFireCycles { limit } => {
                write!(f, "max fire cycles ({limit}) exceeded")
            }
        }
    }
}

/// Context about where an error occurred.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Rule or component name.
    pub source: Option<String>,
    /// Stack of nested operations, outermost last.
    pub stack: Vec<String>,
}

impl ErrorContext {
    /// Creates a new empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source (usually a rule name).
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Adds a stack frame.
    #[must_use]
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.stack.push(frame.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "in {source}")?;
        }
        if !self.stack.is_empty() {
            writeln!(f)?;
            for frame in &self.stack {
                writeln!(f, "  in {frame}")?;
            }
        }
        Ok(())
    }
}
