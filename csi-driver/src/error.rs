//! Driver error taxonomy and its mapping onto gRPC status codes.

use array_gateway::ArrayError;
use thiserror::Error;
use tonic::Status;

use crate::pagination::PaginationError;
use crate::volume_id::IdError;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("malformed identifier: {0}")]
    MalformedId(#[from] IdError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("array API error: {0}")]
    Array(#[from] ArrayError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("in use: {0}")]
    InUse(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("timeout: {operation} did not complete within {seconds}s")]
    Timeout { operation: String, seconds: u64 },
}

impl DriverError {
    pub fn validation(message: impl Into<String>) -> Self {
        DriverError::Validation(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        DriverError::Configuration(message.into())
    }

    /// True for both driver-level and array-level "not found".
    pub fn is_not_found(&self) -> bool {
        match self {
            DriverError::NotFound(_) => true,
            DriverError::Array(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<PaginationError> for DriverError {
    fn from(e: PaginationError) -> Self {
        DriverError::Validation(e.to_string())
    }
}

impl From<DriverError> for Status {
    fn from(e: DriverError) -> Self {
        let message = e.to_string();
        match e {
            DriverError::Validation(_) | DriverError::MalformedId(_) => {
                Status::invalid_argument(message)
            }
            DriverError::Configuration(_) | DriverError::InUse(_) => {
                Status::failed_precondition(message)
            }
            DriverError::NotFound(_) => Status::not_found(message),
            DriverError::AlreadyExists(_) => Status::already_exists(message),
            DriverError::Timeout { .. } => Status::deadline_exceeded(message),
            DriverError::Array(ref inner) if inner.is_retryable() => Status::unavailable(message),
            DriverError::Array(ref inner) if inner.is_not_found() => Status::not_found(message),
            DriverError::Array(_) | DriverError::RetryExhausted { .. } => Status::internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;
    use array_gateway::ObjectKind;
    use tonic::Code;

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(DriverError, Code)> = vec![
            (DriverError::validation("name is required"), Code::InvalidArgument),
            (DriverError::MalformedId(IdError::Grammar("x".to_string())), Code::InvalidArgument),
            (DriverError::configuration("no port groups"), Code::FailedPrecondition),
            (DriverError::InUse("published".to_string()), Code::FailedPrecondition),
            (DriverError::NotFound("vol".to_string()), Code::NotFound),
            (DriverError::AlreadyExists("vol".to_string()), Code::AlreadyExists),
            (
                DriverError::Timeout {
                    operation: "login".to_string(),
                    seconds: 5,
                },
                Code::DeadlineExceeded,
            ),
            (
                DriverError::Array(ArrayError::Unavailable("down".to_string())),
                Code::Unavailable,
            ),
            (
                DriverError::Array(ArrayError::not_found("000197900046", ObjectKind::Volume, "00501")),
                Code::NotFound,
            ),
            (
                DriverError::Array(ArrayError::rejected("000197900046", "bad")),
                Code::Internal,
            ),
            (
                DriverError::RetryExhausted {
                    attempts: 5,
                    last_error: "busy".to_string(),
                },
                Code::Internal,
            ),
        ];

        for (err, code) in cases {
            let status: Status = err.into();
            assert_eq!(status.code(), code, "unexpected code for {}", status.message());
        }
    }

    #[test]
    fn test_message_names_kind() {
        let status: Status = DriverError::validation("capacity must be positive").into();
        assert_eq!(status.message(), "validation error: capacity must be positive");

        let status: Status = DriverError::Timeout {
            operation: "GetCapacity".to_string(),
            seconds: 3,
        }
        .into();
        assert!(status.message().starts_with("timeout:"));
    }

    #[test]
    fn test_not_found_covers_array_errors() {
        assert!(DriverError::NotFound("x".to_string()).is_not_found());
        assert!(
            DriverError::Array(ArrayError::not_found("a", ObjectKind::Host, "h")).is_not_found()
        );
        assert!(!DriverError::validation("x").is_not_found());
    }
}
