//! # Error Handling
//!
//! A single error enum covers every failure mode the store can surface:
//! codec failures, SQL failures, and inconsistencies detected while
//! maintaining the two-table (data + full-text) layout. Callers typically
//! propagate with `?`; the only variant that is routinely *caught* is a
//! unique-constraint violation, which [`crate::writer::Tx::put_if_absent`]
//! maps to "not inserted".
//!
//! Subscriber callback errors never appear here: they are logged by the
//! event loop and isolated from the committing transaction.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors surfaced by store operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// A value of the binary-structured category (`P`) referenced a type id
    /// or runtime type that was never registered with the codec.
    #[error("unregistered binary type")]
    UnregisteredBinaryType,

    /// A value of the text-structured category (`J`) referenced a type id or
    /// runtime type that was never registered with the codec.
    #[error("unregistered text type")]
    UnregisteredTextType,

    /// The leading category tag of a stored value is not one the codec
    /// knows. Either the database was written by something else entirely, or
    /// the bytes are not a codec payload at all.
    #[error("unknown value category: 0x{0:02x}")]
    UnknownCategory(u8),

    /// The payload is too short for its category (or empty).
    #[error("corrupt value payload: {0}")]
    Corrupt(&'static str),

    /// The stored category does not decode to the requested Rust type.
    #[error("stored value is not a {expected}")]
    TypeMismatch {
        /// Name of the type the caller asked for.
        expected: &'static str,
    },

    // =========================================================================
    // Structured-Body Errors
    // =========================================================================
    /// JSON (de)serialization of a registered text-structured type failed.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary (de)serialization of a registered binary-structured type
    /// failed.
    #[error("binary codec error: {0}")]
    Binary(#[from] bincode::Error),

    // =========================================================================
    // SQL Errors
    // =========================================================================
    /// Any error reported by the SQL engine. Unique violations on the path
    /// column arrive here; see [`Error::is_constraint_violation`].
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database answered in a way the maintenance logic cannot explain,
    /// e.g. the rowid counter row missing immediately after its upsert.
    #[error("unexpected database state: {0}")]
    UnexpectedDatabaseState(&'static str),

    /// I/O outside the SQL engine, e.g. spawning the event-loop thread.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The event loop has shut down; commits and subscription changes are no
    /// longer possible.
    #[error("store is closed")]
    Closed,
}

impl Error {
    /// True when this error is a SQL uniqueness violation, i.e. an insert
    /// without the conflict clause hit an existing path.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error {
                    code: rusqlite::ErrorCode::ConstraintViolation,
                    ..
                },
                _,
            ))
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
