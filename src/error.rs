use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Discord error: {0}")]
    Discord(#[from] serenity::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Community {0} is not configured")]
    UnknownCommunity(u64),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller can recover by correcting its input.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownCommunity(_))
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_recoverable() {
        assert!(AppError::validation("bad name").is_recoverable());
        assert!(AppError::UnknownCommunity(42).is_recoverable());
        assert!(!AppError::persistence("disk full").is_recoverable());
        assert!(!AppError::internal("oops").is_recoverable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            AppError::UnknownCommunity(7).to_string(),
            "Community 7 is not configured"
        );
        assert_eq!(
            AppError::validation("empty key").to_string(),
            "Validation error: empty key"
        );
    }
}
