// SPDX-License-Identifier: Apache-2.0

//! Error type shared by every layer of the crate.
//!
//! Request handlers never abort the process on a request-level failure: the
//! error is logged, captured in the response envelope, and returned to the
//! caller. [`Error`] is serializable so it crosses the wire verbatim and the
//! client sees exactly what the provider produced.

use serde::{Deserialize, Serialize};

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    /// Configuration parse or validation failure, including references to
    /// unknown backend or transfer manager types.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown target UUID or region id.
    #[error("{0}")]
    NotFound(String),

    /// Propagated verbatim from a backend operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// Failure in a transfer manager or in the file-set transfer layer.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// The destination provider refused the migration; carries the status
    /// code returned by its before- or after-migration callback.
    #[error("migration rejected by destination (status {0})")]
    MigrationRejected(i32),

    /// RPC framing, address lookup, or unexpected failure inside a handler.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The status code for rejected migrations, if this error is one.
    pub fn migration_status(&self) -> Option<i32> {
        match self {
            Error::MigrationRejected(code) => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time assertions that Error stays usable across tasks and the
    // wire; these fail to compile if a future change breaks the guarantees.
    const _: () = {
        fn assert_stderror<T: std::error::Error>() {}
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        fn assert_all() {
            assert_stderror::<Error>();
            assert_send_sync::<Error>();
        }
    };

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Config("bad json".into()).to_string(),
            "configuration error: bad json"
        );
        assert_eq!(
            Error::NotFound("target 42 not found".into()).to_string(),
            "target 42 not found"
        );
        assert_eq!(
            Error::MigrationRejected(3).to_string(),
            "migration rejected by destination (status 3)"
        );
    }

    #[test]
    fn test_serialization_roundtrip() {
        let errors = [
            Error::Config("c".into()),
            Error::NotFound("n".into()),
            Error::Backend("b".into()),
            Error::Transfer("t".into()),
            Error::MigrationRejected(2),
            Error::Internal("i".into()),
        ];
        for err in errors {
            let bytes = rmp_serde::to_vec(&err).unwrap();
            let back: Error = rmp_serde::from_slice(&bytes).unwrap();
            assert_eq!(back, err);
        }
    }

    #[test]
    fn test_migration_status() {
        assert_eq!(Error::MigrationRejected(4).migration_status(), Some(4));
        assert_eq!(Error::Config("x".into()).migration_status(), None);
    }
}
