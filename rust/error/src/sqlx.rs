use crate::{ErrorCodes, EvochoraError};
use thiserror::Error;

/// Bridges sqlx failures into the pipeline's code space. The durable topic
/// and the metadata store both run over sqlx/SQLite, so their error enums
/// wrap this instead of mapping sqlx variants themselves.
#[derive(Debug, Error)]
#[error("Database error: {0}")]
pub struct WrappedSqlxError(pub sqlx::Error);

impl EvochoraError for WrappedSqlxError {
    fn code(&self) -> crate::ErrorCodes {
        match &self.0 {
            sqlx::Error::RowNotFound => ErrorCodes::NotFound,
            sqlx::Error::PoolTimedOut => ErrorCodes::ResourceExhausted,
            sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => ErrorCodes::Unavailable,
            // A row that decodes wrong means the stored payload is bad, not
            // the query.
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => ErrorCodes::DataLoss,
            sqlx::Error::Configuration(_) => ErrorCodes::InvalidArgument,
            _ => ErrorCodes::Internal,
        }
    }
}

impl From<sqlx::Error> for WrappedSqlxError {
    fn from(value: sqlx::Error) -> Self {
        Self(value)
    }
}

impl From<sqlx::Error> for Box<dyn EvochoraError> {
    fn from(value: sqlx::Error) -> Self {
        Box::new(WrappedSqlxError(value))
    }
}

impl From<WrappedSqlxError> for Box<dyn EvochoraError> {
    fn from(value: WrappedSqlxError) -> Self {
        Box::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_failures_map_to_pipeline_codes() {
        assert_eq!(
            WrappedSqlxError(sqlx::Error::RowNotFound).code(),
            ErrorCodes::NotFound
        );
        assert_eq!(
            WrappedSqlxError(sqlx::Error::PoolTimedOut).code(),
            ErrorCodes::ResourceExhausted
        );
        assert_eq!(
            WrappedSqlxError(sqlx::Error::PoolClosed).code(),
            ErrorCodes::Unavailable
        );
    }
}
