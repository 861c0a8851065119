use thiserror::Error;

use crate::{
    application::render::{DocumentError, RenderError},
    config::LoadError,
    infra::error::InfraError,
};

/// Errors surfaced by the binary entry point.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_errors_convert_transparently() {
        let error = AppError::from(RenderError::Unavailable);
        assert_eq!(error.to_string(), "rendering engine unavailable");
    }

    #[test]
    fn infra_errors_keep_their_source_message() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "context.json");
        let error = AppError::from(InfraError::from(io));
        assert_eq!(error.to_string(), "io error: context.json");

        let error = AppError::from(InfraError::telemetry("subscriber already set"));
        assert!(matches!(error, AppError::Infra(InfraError::Telemetry(_))));
    }
}
