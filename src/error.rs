//! Error types for Depot operations.

use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Every variant except [`Error::Database`] maps to a client-visible HTTP
/// status; database failures are surfaced as an opaque 500.
#[derive(Debug, Error)]
pub enum Error {
    /// A bucket, key, revision, or object does not exist (or is tombstoned
    /// or expired on a latest-value read).
    #[error("{0}")]
    NotFound(String),

    /// A uniqueness constraint was violated (duplicate bucket, concurrent
    /// upload to the same object name).
    #[error("{0}")]
    Conflict(String),

    /// A compare-and-swap lost against a concurrent writer.
    #[error("expected revision {expected}, current revision is {current}")]
    CasConflict { expected: i64, current: i64 },

    /// The request is malformed: oversized value or object, invalid base64,
    /// invalid range parameters.
    #[error("{0}")]
    Validation(String),

    /// A requested byte range cannot be satisfied for an object of the given
    /// size.
    #[error("range not satisfiable for object of {size} bytes")]
    UnsatisfiableRange { size: i64 },

    /// The database rejected or dropped the operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Whether the underlying cause is a unique-constraint violation.
    ///
    /// Used where a lost insert race should surface as a conflict rather
    /// than an opaque database error.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }

    /// Rewrites a unique-violation database error into a conflict with the
    /// given message; other errors pass through unchanged.
    pub fn conflict_on_unique(self, message: impl Into<String>) -> Self {
        if self.is_unique_violation() {
            Error::Conflict(message.into())
        } else {
            self
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_render_cas_conflict_message() {
        // given
        let err = Error::CasConflict {
            expected: 3,
            current: 5,
        };

        // when
        let message = err.to_string();

        // then
        assert_eq!(message, "expected revision 3, current revision is 5");
    }

    #[test]
    fn should_pass_through_non_unique_errors() {
        // given
        let err = Error::validation("bad input");

        // when
        let err = err.conflict_on_unique("duplicate");

        // then
        assert!(matches!(err, Error::Validation(_)));
    }
}
