use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Bad declaration: invalid identifier, reserved name, params shape mismatch.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported field type '{type_name}' for field '{field}'")]
    UnsupportedFieldType { field: String, type_name: String },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Function path '{0}' is not in the allow-list")]
    ForbiddenFunctionPath(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transient database error: {0}")]
    TransientDatabase(String),

    #[error("Database error: {0}")]
    FatalDatabase(String),

    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    #[error("Method '{method}' is not bound on model '{model}'")]
    MethodNotBound { model: String, method: String },

    #[error("{model} instance {id} not found")]
    InstanceNotFound { model: String, id: i64 },

    #[error("Related collection '{related}' not found for model '{model}'")]
    UnknownRelation { model: String, related: String },

    #[error("Custom function '{0}' is not registered")]
    FunctionNotFound(String),

    #[error("Custom function '{path}' failed: {message}")]
    FunctionFailed { path: String, message: String },

    #[error("Unsafe migration for model '{model}': {reason}")]
    UnsafeMigration { model: String, reason: String },

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Errors raised by the database engine itself.
    pub fn is_database_error(&self) -> bool {
        matches!(self, Self::TransientDatabase(_) | Self::FatalDatabase(_))
    }

    /// Whether the retry engine may consider this error at all.
    ///
    /// Validation, permission and lookup failures are never retried, whatever
    /// their message says.
    pub fn is_retryable_class(&self) -> bool {
        self.is_database_error() || matches!(self, Self::LockError(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::TransientDatabase(err.to_string())
            }
            _ => Self::FatalDatabase(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_class_excludes_validation_and_permission() {
        assert!(DbError::TransientDatabase("deadlock".into()).is_retryable_class());
        assert!(DbError::FatalDatabase("syntax error".into()).is_retryable_class());
        assert!(!DbError::Validation("deadlock detected".into()).is_retryable_class());
        assert!(!DbError::PermissionDenied("deadlock".into()).is_retryable_class());
    }

    #[test]
    fn test_sqlite_busy_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert!(matches!(DbError::from(err), DbError::TransientDatabase(_)));

        let err = rusqlite::Error::QueryReturnedNoRows;
        assert!(matches!(DbError::from(err), DbError::FatalDatabase(_)));
    }
}
