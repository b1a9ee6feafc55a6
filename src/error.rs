use thiserror::Error;

/// Central error type for archon with structured error handling.
///
/// Variants map to the user-facing error kinds: lookups that miss, busy
/// conversations, malformed commands or workflow definitions, worktree
/// failures, assistant transport failures, platform delivery failures, and
/// everything fatal underneath.
#[derive(Error, Debug)]
pub enum ArchonError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Relational store operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Referenced entity absent
    #[error("{entity} not found: {name}")]
    NotFound { entity: &'static str, name: String },

    /// Another operation holds the conversation
    #[error("{message}")]
    Busy { message: String },

    /// Malformed command syntax or invalid workflow definition
    #[error("{message}")]
    Validation { message: String },

    /// Worktree creation, adoption, or destruction failed
    #[error("isolation error: {message}")]
    Isolation {
        message: String,
        hint: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The assistant subprocess stream errored or timed out
    #[error("assistant error: {message}")]
    Assistant {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Outbound platform delivery failed
    #[error("platform error: {message}")]
    Platform {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Git operation error
    #[error("git error: {message}")]
    Git {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Generic error for cases not covered above
    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl From<ai_client::ClientError> for ArchonError {
    fn from(error: ai_client::ClientError) -> Self {
        Self::Assistant {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

impl From<anyhow::Error> for ArchonError {
    fn from(error: anyhow::Error) -> Self {
        Self::Other {
            message: format!("{:#}", error),
            source: None,
        }
    }
}

/// Result type alias for archon operations
pub type Result<T> = std::result::Result<T, ArchonError>;

impl ArchonError {
    /// Create a not-found error
    pub fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            name: name.into(),
        }
    }

    /// Create a busy error
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an isolation error
    pub fn isolation(message: impl Into<String>) -> Self {
        Self::Isolation {
            message: message.into(),
            hint: None,
            source: None,
        }
    }

    /// Create an isolation error with a remediation hint
    pub fn isolation_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Isolation {
            message: message.into(),
            hint: Some(hint.into()),
            source: None,
        }
    }

    /// Create an assistant transport error
    pub fn assistant(message: impl Into<String>) -> Self {
        Self::Assistant {
            message: message.into(),
            source: None,
        }
    }

    /// Create a platform delivery error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
            source: None,
        }
    }

    /// Create a git error
    pub fn git(message: impl Into<String>) -> Self {
        Self::Git {
            message: message.into(),
            source: None,
        }
    }

    /// Render the message sent back to the end user.
    ///
    /// Security-sensitive platform errors are deliberately generic; internal
    /// detail stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { entity, name } => {
                format!("{} `{}` was not found. Use `/status` to inspect the current setup.", entity, name)
            }
            Self::Busy { message } => {
                format!("Another operation is in progress: {}", message)
            }
            Self::Validation { message } => message.clone(),
            Self::Isolation { message, hint, .. } => match hint {
                Some(hint) => format!("Workspace isolation failed: {}. {}", message, hint),
                None => format!(
                    "Workspace isolation failed: {}. Check permissions and whether the branch is checked out elsewhere.",
                    message
                ),
            },
            Self::Assistant { message, .. } => {
                format!("The assistant failed mid-turn: {}. Use `/reset` to start a fresh session.", message)
            }
            Self::Platform { .. } => "Message delivery to the platform failed.".to_string(),
            Self::Git { message, .. } => format!("Git operation failed: {}", message),
            Self::Database(_) | Self::Io(_) | Self::SerdeJson(_) | Self::Other { .. } => {
                "Something went wrong while handling your message. The error has been logged.".to_string()
            }
        }
    }

    /// Classifier hook for adapters deciding whether to retry delivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Platform { .. } | Self::Assistant { .. })
    }

    /// Fatal errors are propagated to the process supervisor instead of
    /// being formatted for the user.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Database(_) => true,
            Self::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages_carry_remediation_hints() {
        let err = ArchonError::assistant("stream closed");
        assert!(err.user_message().contains("/reset"));

        let err = ArchonError::isolation("branch feat/x is checked out at ../other");
        assert!(err.user_message().contains("checked out elsewhere"));
    }

    #[test]
    fn platform_errors_stay_generic_for_users() {
        let err = ArchonError::platform("signature mismatch from 10.0.0.3");
        assert!(!err.user_message().contains("10.0.0.3"));
    }

    #[test]
    fn enoent_io_is_not_fatal() {
        let err = ArchonError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_fatal());
        let err = ArchonError::Io(std::io::Error::other("disk on fire"));
        assert!(err.is_fatal());
    }
}
