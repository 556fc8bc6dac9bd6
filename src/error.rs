//! Error taxonomy for the zone loader.
//!
//! Every failure is classified into one of a handful of classes so the
//! binary can report the failing stage and pick an exit code.

use std::{fmt, io, path::PathBuf};
use thiserror::Error;
use tokio_postgres::error::SqlState;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type LoadResult<T> = Result<T, LoadError>;

/// The pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Schema,
    Truncate,
    Insert,
    Verify,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Schema => "schema",
            Stage::Truncate => "truncate",
            Stage::Insert => "insert",
            Stage::Verify => "verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    /// Bad configuration value or unreadable config file.
    #[error("invalid config: {0}")]
    Config(String),

    /// The CSV file is missing or cannot be read.
    #[error("cannot read {}: {source}", .path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Malformed CSV, missing column or non-integer key.
    #[error("malformed CSV {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    /// Server unreachable, connection dropped or authentication refused.
    #[error("{stage}: connection error: {source}")]
    Connection {
        stage: Stage,
        #[source]
        source: BoxError,
    },

    /// Credentials lack the DDL/DML rights the stage needs.
    #[error("{stage}: permission denied: {source}")]
    Permission {
        stage: Stage,
        #[source]
        source: BoxError,
    },

    /// Integrity violation, e.g. a duplicate `locationid`.
    #[error("{stage}: constraint violation: {source}")]
    ConstraintViolation {
        stage: Stage,
        #[source]
        source: BoxError,
    },

    /// Any other server-side failure.
    #[error("{stage}: database error: {source}")]
    Database {
        stage: Stage,
        #[source]
        source: BoxError,
    },
}

/// Coarse classification of a database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorClass {
    Connection,
    Permission,
    Constraint,
    Other,
}

impl DbErrorClass {
    /// Classify by SQLSTATE class or code.
    pub fn from_sqlstate(code: &SqlState) -> Self {
        let code = code.code();
        if code == SqlState::INSUFFICIENT_PRIVILEGE.code() {
            DbErrorClass::Permission
        } else if code.starts_with("08") || code.starts_with("28") || code.starts_with("57P0") {
            DbErrorClass::Connection
        } else if code.starts_with("23") {
            DbErrorClass::Constraint
        } else {
            DbErrorClass::Other
        }
    }
}

impl LoadError {
    /// Wrap a driver error, classifying it by SQLSTATE. Errors without a
    /// SQLSTATE are transport failures unless the driver says otherwise.
    pub fn postgres(stage: Stage, err: tokio_postgres::Error) -> Self {
        let class = match err.code() {
            Some(code) => DbErrorClass::from_sqlstate(code),
            None if err.is_closed() || is_io(&err) => DbErrorClass::Connection,
            None => DbErrorClass::Other,
        };
        Self::classified(stage, class, Box::new(err))
    }

    pub fn classified(stage: Stage, class: DbErrorClass, source: BoxError) -> Self {
        match class {
            DbErrorClass::Connection => LoadError::Connection { stage, source },
            DbErrorClass::Permission => LoadError::Permission { stage, source },
            DbErrorClass::Constraint => LoadError::ConstraintViolation { stage, source },
            DbErrorClass::Other => LoadError::Database { stage, source },
        }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        LoadError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Stage name for operator-facing reports.
    pub fn stage_name(&self) -> &'static str {
        match self {
            LoadError::Config(_) => "configure",
            LoadError::FileAccess { .. } | LoadError::Parse { .. } => "extract",
            LoadError::Connection { stage, .. }
            | LoadError::Permission { stage, .. }
            | LoadError::ConstraintViolation { stage, .. }
            | LoadError::Database { stage, .. } => stage.as_str(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            LoadError::Database { .. } => 1,
            LoadError::Config(_) => 2,
            LoadError::FileAccess { .. } => 3,
            LoadError::Parse { .. } => 4,
            LoadError::Connection { .. } => 5,
            LoadError::Permission { .. } => 6,
            LoadError::ConstraintViolation { .. } => 7,
        }
    }
}

fn is_io(err: &tokio_postgres::Error) -> bool {
    std::error::Error::source(err).is_some_and(|s| s.is::<io::Error>())
}
