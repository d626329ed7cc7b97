//! Error types for the mesh agent

use thiserror::Error;

/// Result type alias using the agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Agent error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("{kind} conflicts with an existing row on {field}")]
    Conflict { kind: String, field: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid {field} {value:?}: {reason}")]
    Parse {
        field: String,
        value: String,
        reason: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Coarse error classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Crypto,
    Parse,
    Storage,
    Io,
}

impl ErrorKind {
    /// Transient storage contention, safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Storage)
    }

    /// Store corruption or key mismatch; retrying will not help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Crypto | ErrorKind::Parse)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::Crypto => write!(f, "crypto"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::Storage => write!(f, "storage"),
            ErrorKind::Io => write!(f, "io"),
        }
    }
}

impl Error {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    pub fn parse(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Error::Parse {
            field: field.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, past any added context.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Context { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Parse { .. } => ErrorKind::Parse,
            Error::Database(_) => ErrorKind::Storage,
            Error::Io(_) => ErrorKind::Io,
            Error::Context { .. } => unreachable!("root() strips context"),
        }
    }

    /// Map a rusqlite error raised by a write on `kind`, turning uniqueness
    /// violations into `Conflict`.
    pub fn from_write(kind: &str, err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, ref message) = err {
            let unique = matches!(
                failure.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            );
            if unique {
                // "UNIQUE constraint failed: iface.net_name, iface.device_name"
                let field = message
                    .as_deref()
                    .and_then(|m| m.split_once(": "))
                    .map(|(_, cols)| cols.to_string())
                    .unwrap_or_else(|| "unique key".to_string());
                return Error::Conflict {
                    kind: kind.to_string(),
                    field,
                };
            }
        }
        Error::Database(err)
    }
}

/// Attach context to fallible results, `anyhow`-style.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
