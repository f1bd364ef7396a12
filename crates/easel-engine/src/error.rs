use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Missing or malformed reference, disallowed scheme, runaway forwarding.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A reference resolved to something that is not an image.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("upstream generation failed: {0}")]
    Upstream(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl FetchError {
    /// The status the failure would carry if it were reported directly. It is
    /// only ever surfaced through diagnostic headers.
    pub fn status_code(&self) -> u16 {
        match self {
            FetchError::InvalidInput(_) => 400,
            FetchError::InvalidReference(_) => 422,
            FetchError::Unavailable(_) => 404,
            FetchError::Upstream(_) => 502,
            FetchError::Storage(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::InvalidInput(_) => "invalid_input",
            FetchError::InvalidReference(_) => "invalid_reference",
            FetchError::Unavailable(_) => "unavailable",
            FetchError::Upstream(_) => "upstream",
            FetchError::Storage(_) => "storage",
        }
    }

    pub fn invalid_input(err: anyhow::Error) -> Self {
        FetchError::InvalidInput(format!("{err:#}"))
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Outcome of a failed mask-settings write.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings")]
    InvalidSettings,

    #[error("unsupported target")]
    UnsupportedTarget,

    #[error("settings write failed: {0}")]
    Write(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::FetchError;

    #[test]
    fn every_kind_maps_to_a_failure_status() {
        let errors = [
            FetchError::InvalidInput("x".to_string()),
            FetchError::InvalidReference("x".to_string()),
            FetchError::Unavailable("x".to_string()),
            FetchError::Upstream("x".to_string()),
            FetchError::Storage("x".to_string()),
        ];
        for err in errors {
            assert!(err.status_code() >= 400, "{}", err.kind());
        }
    }

    #[test]
    fn invalid_input_keeps_context_chain() {
        let err = FetchError::invalid_input(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.to_string(), "invalid input: outer: inner");
    }
}
