use thiserror::Error;

pub type CoalesceResult<T> = Result<T, CoalesceError>;

/// Errors surfaced by batchers and coalescers.
///
/// Cloneable because a single batch or supplier failure fans out to every
/// caller attached to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoalesceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Batch handler error: {0}")]
    Handler(String),

    #[error("Supplier error: {0}")]
    Supplier(String),

    #[error("Batch handler completed without resolving the request")]
    Unresolved,

    #[error("Request abandoned before completion")]
    Abandoned,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl CoalesceError {
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::Handler(err.to_string())
    }

    pub fn supplier(err: impl std::fmt::Display) -> Self {
        Self::Supplier(err.to_string())
    }
}

impl From<serde_json::Error> for CoalesceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<anyhow::Error> for CoalesceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Handler(format!("{err:#}"))
    }
}

impl From<config::ConfigError> for CoalesceError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err = anyhow::anyhow!("connection refused").context("redis pipeline");
        let converted: CoalesceError = err.into();
        assert_eq!(
            converted,
            CoalesceError::Handler("redis pipeline: connection refused".into())
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            CoalesceError::Config("flush_quota must be positive".into()).to_string(),
            "Configuration error: flush_quota must be positive"
        );
    }
}
