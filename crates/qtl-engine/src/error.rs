use qtl_conf::ConfigError;
use qtl_query::QueryError;
use qtl_templates::Location;
use qtl_templates::ParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed template, unknown tag or wrong argument kind.
    #[error(transparent)]
    Syntax(#[from] ParseError),
    #[error("{0}")]
    Configuration(String),
    /// Raised on purpose by templates or validators; safe to show callers.
    #[error("{message}")]
    User {
        message: String,
        description: Option<String>,
        location: Option<Location>,
    },
    /// A broken invariant in a template or extension.
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("Template `{0}` not found")]
    TemplateNotFound(String),
}

impl EngineError {
    pub fn syntax(message: impl Into<String>, loc: Location) -> Self {
        Self::Syntax(ParseError::syntax(message, loc))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
            description: None,
            location: None,
        }
    }

    /// Stable identifier of the error class.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Syntax(_) => "qtl.syntax",
            EngineError::Configuration(_) => "qtl.configuration",
            EngineError::User { .. } => "qtl.user",
            EngineError::Internal(_) => "qtl.internal",
            EngineError::Query(_) => "qtl.dataSource",
            EngineError::TemplateNotFound(_) => "qtl.notFound",
        }
    }

    /// Message for external callers. Internal details are withheld.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            EngineError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }

    pub(crate) fn log_internal(&self) {
        if let EngineError::Internal(detail) = self {
            tracing::error!(%detail, "internal template engine error");
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_details_are_hidden() {
        let err = EngineError::internal("Max depth reached");
        assert_eq!(err.code(), "qtl.internal");
        assert_eq!(err.to_string(), "Max depth reached");
        assert_eq!(err.public_message(), "An internal error occurred");
    }

    #[test]
    fn test_user_error_message_is_public() {
        let err = EngineError::user("NOT_FOUND");
        assert_eq!(err.code(), "qtl.user");
        assert_eq!(err.public_message(), "NOT_FOUND");
    }

    #[test]
    fn test_syntax_error_keeps_location() {
        let err = EngineError::syntax("Expected a variable", Location::new(1, 8));
        assert_eq!(err.code(), "qtl.syntax");
        assert_eq!(err.to_string(), "Expected a variable (at 1:8)");
    }
}
