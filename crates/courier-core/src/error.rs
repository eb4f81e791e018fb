//! Error types for storage and domain operations.
//!
//! Storage write failures must always propagate to the caller; swallowing
//! one would break the guaranteed-delivery contract.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A status transition was requested from a state that does not allow it.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Not-found error for a delivery item.
    pub fn item_not_found(item_id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("delivery item {item_id}"))
    }

    /// Not-found error for a binding.
    pub fn binding_not_found(source_id: &str, endpoint_id: &str) -> Self {
        Self::NotFound(format!("binding {source_id}.{endpoint_id}"))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("malformed JSON column: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn helpers_name_the_entity() {
        assert_eq!(
            CoreError::binding_not_found("stats", "ep-1").to_string(),
            "not found: binding stats.ep-1"
        );
    }
}
