use thiserror::Error;

/// Failures raised by a graph backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Transient lock conflict; the only failure the write pipeline retries.
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("statement failed: {0}")]
    Statement(String),

    #[error("unexpected response from datastore: {0}")]
    Protocol(String),
}

impl StoreError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, StoreError::Deadlock(_))
    }
}

/// Errors surfaced by the persistence adaptor.
#[derive(Debug, Error)]
pub enum AdaptorError {
    #[error("invalid class name: {0}")]
    InvalidClass(String),

    #[error("invalid attribute '{attribute}' for class '{class}'")]
    InvalidAttribute { class: String, attribute: String },

    #[error("{0}")]
    MismatchedLengths(String),

    #[error("please provide a value of type {expected} for attribute {attribute} (got {value})")]
    TypeConversion {
        attribute: String,
        expected: String,
        value: String,
    },

    #[error("instance of class '{0}' has no DB_ID")]
    DbIdNotSet(String),

    #[error(
        "illegal collection: a mix of instances and query requests in a single collection \
         is not supported"
    )]
    InconsistentCollection,

    #[error("illegal sub-query operator '{0}': only 'IS NOT NULL' sub-queries are supported")]
    UnsupportedSubQueryOperator(String),

    #[error("attribute {0} is not an instance type attribute")]
    NotInstanceAttribute(String),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("schema is not loaded")]
    SchemaNotLoaded,

    #[error("instance {0} not found")]
    InstanceNotFound(i64),

    #[error("unable to get auto-incremented DB_ID value")]
    MintFailed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdaptorError {
    /// Validation failures are caller mistakes: reported, never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AdaptorError::InvalidClass(_)
                | AdaptorError::InvalidAttribute { .. }
                | AdaptorError::MismatchedLengths(_)
                | AdaptorError::TypeConversion { .. }
                | AdaptorError::DbIdNotSet(_)
                | AdaptorError::InconsistentCollection
                | AdaptorError::UnsupportedSubQueryOperator(_)
                | AdaptorError::NotInstanceAttribute(_)
                | AdaptorError::UnknownOperator(_)
        )
    }
}

pub type AdaptorResult<T> = std::result::Result<T, AdaptorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_deadlock_is_retryable() {
        assert!(StoreError::Deadlock("x".into()).is_deadlock());
        assert!(!StoreError::Connection("x".into()).is_deadlock());
        assert!(!StoreError::Statement("x".into()).is_deadlock());
    }

    #[test]
    fn test_type_conversion_message_names_attribute() {
        let err = AdaptorError::TypeConversion {
            attribute: "releaseNumber".to_string(),
            expected: "Integer".to_string(),
            value: "abc".to_string(),
        };
        assert!(err.to_string().contains("releaseNumber"));
        assert!(err.is_validation());
        let store: AdaptorError = StoreError::Connection("down".into()).into();
        assert!(!store.is_validation());
    }
}
