//! Error types for BeanModel operations.

use std::fmt;

/// The primary error type for all BeanModel operations.
#[derive(Debug)]
pub enum Error {
    /// A unique lookup matched zero rows.
    NoBeanFound(String),
    /// More than one row matched where exactly one was required.
    DuplicateRow(String),
    /// Out-of-range random access on a cursor-mode result.
    InvalidOffset {
        /// The requested offset.
        offset: usize,
        /// A human-readable description of the source.
        message: String,
    },
    /// A set of tables could not be linked into one inheritance chain.
    InheritanceResolution(String),
    /// Attempt to persist a reference to a deleted bean.
    MissingReference(String),
    /// A save-time reference cycle among unsaved beans.
    CyclicReference(String),
    /// Illegal lifecycle transition (double-attach, delete-on-detached, ...).
    InvalidOperation(String),
    /// Malformed filter or order-by input.
    InvalidArgument(String),
    /// Schema metadata errors.
    Schema(SchemaError),
    /// Driver errors, passed through unchanged.
    Driver(DriverError),
}

/// Schema metadata error.
#[derive(Debug)]
pub struct SchemaError {
    /// What went wrong.
    pub kind: SchemaErrorKind,
    /// Human-readable message.
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Table not found
    TableNotFound,
    /// A table has no primary key; such tables are never supported.
    MissingPrimaryKey,
    /// Foreign key not found
    ForeignKeyNotFound,
    /// Invalid schema definition
    Invalid,
}

impl SchemaError {
    /// Create a new schema error.
    pub fn new(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// An error reported by the database driver.
///
/// The runtime never interprets these beyond the `constraint` flag; they are
/// surfaced to the caller unchanged.
#[derive(Debug)]
pub struct DriverError {
    /// Human-readable message from the driver.
    pub message: String,
    /// The SQL that caused the error, if known.
    pub sql: Option<String>,
    /// Whether this was an integrity-constraint violation.
    pub constraint: bool,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql: None,
            constraint: false,
        }
    }

    /// Attach the offending SQL.
    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Mark this as an integrity-constraint violation.
    #[must_use]
    pub fn constraint_violation(mut self) -> Self {
        self.constraint = true;
        self
    }
}

impl Error {
    /// Is this a driver-level integrity-constraint violation?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Driver(d) if d.constraint)
    }

    /// Get the SQL that caused this error, if available.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Driver(d) => d.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoBeanFound(msg) => write!(f, "No bean found: {}", msg),
            Error::DuplicateRow(msg) => write!(f, "Duplicate row: {}", msg),
            Error::InvalidOffset { offset, message } => {
                write!(f, "Invalid offset {}: {}", offset, message)
            }
            Error::InheritanceResolution(msg) => {
                write!(f, "Inheritance resolution error: {}", msg)
            }
            Error::MissingReference(msg) => write!(f, "Missing reference: {}", msg),
            Error::CyclicReference(msg) => write!(f, "Cyclic reference: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Driver(e) => {
                if let Some(sql) = &e.sql {
                    write!(f, "Driver error: {} (sql: {})", e.message, sql)
                } else {
                    write!(f, "Driver error: {}", e.message)
                }
            }
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SchemaError {}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DriverError {}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

/// Result type alias for BeanModel operations.
pub type Result<T> = std::result::Result<T, Error>;
