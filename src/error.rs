use std::process::ExitCode;

/// Errors raised by town operations.
///
/// Lookups of missing ids return `Option::None`; `NotFound` is reserved for
/// mutations that need the referenced row to exist.
#[derive(Debug, thiserror::Error)]
pub enum TownError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error class surfaced to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Invalid,
    Internal,
}

impl TownError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Invalid(_) | Self::Config(_) => ErrorKind::Invalid,
            Self::Storage(_) | Self::Token(_) | Self::Template(_) | Self::Json(_) | Self::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) => ExitCode::from(2),
            Self::NotFound { .. } => ExitCode::from(3),
            Self::Conflict(_) => ExitCode::from(4),
            Self::Invalid(_) => ExitCode::from(5),
            _ => ExitCode::from(1),
        }
    }
}

pub type Result<T, E = TownError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_distinguish_caller_errors() {
        assert_eq!(TownError::not_found("bead", "b1").kind(), ErrorKind::NotFound);
        assert_eq!(TownError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(TownError::Invalid("x".into()).kind(), ErrorKind::Invalid);
        assert_eq!(
            TownError::Io(std::io::Error::other("disk")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn not_found_message_names_entity() {
        let err = TownError::not_found("agent", "a-1");
        assert_eq!(err.to_string(), "agent not found: a-1");
    }
}
