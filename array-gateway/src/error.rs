use thiserror::Error;

use crate::types::ObjectKind;

#[derive(Error, Debug)]
pub enum ArrayError {
    #[error("{kind} '{id}' not found on array {array_id}")]
    NotFound {
        array_id: String,
        kind: ObjectKind,
        id: String,
    },

    #[error("{kind} '{id}' already exists on array {array_id}")]
    AlreadyExists {
        array_id: String,
        kind: ObjectKind,
        id: String,
    },

    #[error("array {0} is not known to the management endpoint")]
    UnknownArray(String),

    #[error("no session established for array {0}")]
    NotLoggedIn(String),

    #[error("array {array_id} is busy: {message}")]
    Busy { array_id: String, message: String },

    #[error("array management endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("array {array_id} rejected request: {message}")]
    Rejected { array_id: String, message: String },

    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("failed to load array inventory: {0}")]
    Inventory(String),
}

impl ArrayError {
    pub fn not_found(array_id: &str, kind: ObjectKind, id: &str) -> Self {
        ArrayError::NotFound {
            array_id: array_id.to_string(),
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(array_id: &str, kind: ObjectKind, id: &str) -> Self {
        ArrayError::AlreadyExists {
            array_id: array_id.to_string(),
            kind,
            id: id.to_string(),
        }
    }

    pub fn rejected(array_id: &str, message: impl Into<String>) -> Self {
        ArrayError::Rejected {
            array_id: array_id.to_string(),
            message: message.into(),
        }
    }

    /// Transient failures that may succeed when the same call is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArrayError::Busy { .. } | ArrayError::Unavailable(_) | ArrayError::NotLoggedIn(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ArrayError::NotFound { .. })
    }

    /// True when the missing object is of the given kind.
    pub fn is_missing(&self, expected: ObjectKind) -> bool {
        matches!(self, ArrayError::NotFound { kind, .. } if *kind == expected)
    }
}

pub type Result<T> = std::result::Result<T, ArrayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(
            ArrayError::Busy {
                array_id: "000197900046".to_string(),
                message: "locked".to_string()
            }
            .is_retryable()
        );
        assert!(ArrayError::Unavailable("timeout".to_string()).is_retryable());
        assert!(!ArrayError::rejected("000197900046", "bad size").is_retryable());
        assert!(!ArrayError::not_found("000197900046", ObjectKind::Volume, "00501").is_retryable());
    }

    #[test]
    fn test_not_found_message_names_object() {
        let err = ArrayError::not_found("000197900046", ObjectKind::StorageGroup, "csi-TST-SG");
        assert!(err.is_not_found());
        assert!(err.is_missing(ObjectKind::StorageGroup));
        assert!(!err.is_missing(ObjectKind::Volume));
        assert_eq!(
            err.to_string(),
            "storage group 'csi-TST-SG' not found on array 000197900046"
        );
    }
}
