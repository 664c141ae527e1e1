// Error handling framework

use thiserror::Error;

/// Watch Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Store health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Redis error: {0}")]
    RedisError(String),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    /// The broker refused or did not confirm a publish in time
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Failed to create consumer: {0}")]
    ConsumerCreation(String),

    #[error("Failed to consume message: {0}")]
    ConsumeFailed(String),

    #[error("Failed to acknowledge message: {0}")]
    AckFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Message deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Errors raised by the external document source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Network trouble, throttling or a 5xx from the source
    #[error("Transient source failure: {0}")]
    Transient(String),

    #[error("Source demanded a captcha: {0}")]
    Captcha(String),

    #[error("Source rejected the lookup: {0}")]
    Rejected(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transient(_) | AdapterError::Captcha(_))
    }
}

/// Validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

/// Errors from a single refresh attempt
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid search criterion: {0}")]
    InvalidCriterion(#[from] ValidationError),

    #[error("Execution timeout after {0} seconds")]
    Timeout(u64),
}

impl ExecutionError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Adapter(err) => err.is_retryable(),
            ExecutionError::Store(_) => true,
            ExecutionError::InvalidCriterion(_) => false,
            ExecutionError::Timeout(_) => true,
        }
    }

    /// Short label used in failure records and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ExecutionError::Adapter(AdapterError::Transient(_)) => "error_system",
            ExecutionError::Adapter(AdapterError::Captcha(_)) => "error_captcha",
            ExecutionError::Adapter(AdapterError::Rejected(_)) => "rejected",
            ExecutionError::Store(_) => "store_unavailable",
            ExecutionError::InvalidCriterion(_) => "invalid_criterion",
            ExecutionError::Timeout(_) => "timeout",
        }
    }
}

/// Scheduler heartbeat errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Heartbeat aborted: {0}")]
    Store(#[from] StoreError),

    #[error("Heartbeat aborted: {0}")]
    Queue(#[from] QueueError),
}

/// Notification delivery errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),

    #[error("Notification payload invalid: {0}")]
    Payload(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::CorruptRecord(err.to_string())
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::RedisError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_retryability() {
        assert!(AdapterError::Transient("503".to_string()).is_retryable());
        assert!(AdapterError::Captcha("challenge".to_string()).is_retryable());
        assert!(!AdapterError::Rejected("bad request".to_string()).is_retryable());
    }

    #[test]
    fn test_execution_error_retryability() {
        assert!(ExecutionError::Timeout(600).is_retryable());
        assert!(ExecutionError::Store(StoreError::Unavailable("down".to_string())).is_retryable());

        let invalid = ExecutionError::InvalidCriterion(ValidationError::MissingField(
            "docket_number".to_string(),
        ));
        assert!(!invalid.is_retryable());
        assert_eq!(invalid.reason(), "invalid_criterion");
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout(600);
        assert!(err.to_string().contains("600 seconds"));
    }

    #[test]
    fn test_adapter_reasons() {
        let captcha: ExecutionError = AdapterError::Captcha("x".to_string()).into();
        assert_eq!(captcha.reason(), "error_captcha");
        let transient: ExecutionError = AdapterError::Transient("x".to_string()).into();
        assert_eq!(transient.reason(), "error_system");
    }
}
