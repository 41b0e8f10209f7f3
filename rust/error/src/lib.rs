// Defines the closed set of error codes used across the pipeline, modeled on
// the gRPC status codes so that generic handling (retry, surface, drop) can
// key off the code without knowing the concrete error type.
use std::error::Error;

#[cfg(feature = "sqlx")]
mod sqlx;
#[cfg(feature = "sqlx")]
pub use sqlx::*;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ErrorCodes {
    // OK is returned on success, we use "Success" since Ok is a keyword in Rust.
    Success = 0,
    // CANCELLED indicates the operation was cancelled, typically by the caller.
    Cancelled = 1,
    // UNKNOWN indicates an unknown error.
    Unknown = 2,
    // INVALID_ARGUMENT covers malformed input: bad storage keys, mismatched
    // run ids, rows that do not match a plugin schema.
    InvalidArgument = 3,
    // DEADLINE_EXCEEDED means an operation expired before completion, e.g.
    // the indexer's metadata poll.
    DeadlineExceeded = 4,
    // NOT_FOUND means some requested entity (file, run, topic) was not found.
    NotFound = 5,
    // ALREADY_EXISTS means an entity we attempted to create already exists.
    // Duplicate batch files surface under this code.
    AlreadyExists = 6,
    // PERMISSION_DENIED covers path traversal and unsupported usage types.
    PermissionDenied = 7,
    // RESOURCE_EXHAUSTED indicates some resource has been exhausted.
    ResourceExhausted = 8,
    // FAILED_PRECONDITION indicates the system is not in a state required for
    // the operation, e.g. out-of-order chunks handed to the batch writer.
    FailedPrecondition = 9,
    // ABORTED indicates the operation was aborted.
    Aborted = 10,
    // OUT_OF_RANGE means an operation was attempted past the valid range.
    OutOfRange = 11,
    // UNIMPLEMENTED indicates an operation is not implemented or enabled.
    Unimplemented = 12,
    // INTERNAL errors cover I/O failures with no more specific code.
    Internal = 13,
    // UNAVAILABLE indicates a dependency is currently unavailable, e.g. run
    // metadata that has not been published yet.
    Unavailable = 14,
    // DATA_LOSS indicates unrecoverable corruption: bad framing, bad codec
    // magic, truncated batch files.
    DataLoss = 15,
    // UNAUTHENTICATED indicates missing or invalid credentials.
    Unauthenticated = 16,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::AlreadyExists => "DuplicateError",
            ErrorCodes::PermissionDenied => "PermissionDeniedError",
            ErrorCodes::DeadlineExceeded => "TimeoutError",
            ErrorCodes::DataLoss => "CorruptionError",
            ErrorCodes::Unavailable => "UnavailableError",
            ErrorCodes::Internal => "InternalError",
            _ => "EvochoraError",
        }
    }
}

pub trait EvochoraError: Error + Send {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn EvochoraError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
    fn should_trace_error(&self) -> bool {
        true
    }
}

impl Error for Box<dyn EvochoraError> {}

impl EvochoraError for Box<dyn EvochoraError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

impl EvochoraError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        match self.kind() {
            std::io::ErrorKind::NotFound => ErrorCodes::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorCodes::PermissionDenied,
            std::io::ErrorKind::UnexpectedEof => ErrorCodes::DataLoss,
            _ => ErrorCodes::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_codes() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(err.code(), ErrorCodes::NotFound);
        let err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short");
        assert_eq!(err.code(), ErrorCodes::DataLoss);
    }

    #[test]
    fn code_names() {
        assert_eq!(ErrorCodes::DataLoss.name(), "CorruptionError");
        assert_eq!(ErrorCodes::Aborted.name(), "EvochoraError");
    }
}
