// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the cluster store-and-forward.

/// Result type using [`CsafError`].
pub type Result<T> = std::result::Result<T, CsafError>;

/// Errors raised by [`ClusterStoreAndForward`](crate::ClusterStoreAndForward) backends.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum CsafError {
    /// A session was re-registered by another user than the one who created it.
    #[error("session '{session_id}' is not owned by user '{user_id}'")]
    WrongUser {
        /// The session being registered.
        session_id: String,
        /// The user that attempted the registration.
        user_id: String,
    },

    /// The client message id is already in the session's inbox: a double delivery.
    #[error("client message id '{client_message_id}' already exists in the inbox of session '{session_id}'")]
    ClientMessageIdAlreadyExists {
        /// The session owning the inbox.
        session_id: String,
        /// The duplicated client message id.
        client_message_id: String,
    },

    /// The backing store could not be reached or rejected the operation.
    #[error("data access failed during {operation}: {details}")]
    DataAccess {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CsafError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::WrongUser { .. } => "WRONG_USER",
            Self::ClientMessageIdAlreadyExists { .. } => "CLIENT_MESSAGE_ID_ALREADY_EXISTS",
            Self::DataAccess { .. } => "DATA_ACCESS",
        }
    }

    pub(crate) fn data_access(operation: &str, details: impl Into<String>) -> Self {
        Self::DataAccess {
            operation: operation.to_string(),
            details: details.into(),
        }
    }
}

impl From<sqlx::Error> for CsafError {
    fn from(err: sqlx::Error) -> Self {
        CsafError::data_access("query", err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for CsafError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CsafError::data_access("migrate", err.to_string())
    }
}

impl From<serde_json::Error> for CsafError {
    fn from(err: serde_json::Error) -> Self {
        CsafError::data_access("json", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (
                CsafError::WrongUser {
                    session_id: "s".into(),
                    user_id: "u".into(),
                },
                "WRONG_USER",
            ),
            (
                CsafError::ClientMessageIdAlreadyExists {
                    session_id: "s".into(),
                    client_message_id: "c".into(),
                },
                "CLIENT_MESSAGE_ID_ALREADY_EXISTS",
            ),
            (CsafError::data_access("query", "boom"), "DATA_ACCESS"),
        ];

        for (err, code) in cases {
            assert_eq!(err.error_code(), code, "unexpected code for {err}");
        }
    }

    #[test]
    fn test_display() {
        let err = CsafError::WrongUser {
            session_id: "abc".into(),
            user_id: "mallory".into(),
        };
        assert_eq!(err.to_string(), "session 'abc' is not owned by user 'mallory'");

        let err = CsafError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CsafError::DataAccess { ref operation, .. } if operation == "query"));
    }
}
