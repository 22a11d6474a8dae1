use thiserror::Error;

/// Service-wide error taxonomy.
///
/// `NotFound` and `Validation` are permanent: webhook handling acknowledges
/// them to the provider without inviting a retry. `Infrastructure` is the
/// only class surfaced as a 5xx so that the provider redelivers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("invalid parameter: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(#[source] anyhow::Error),
}

impl ServiceError {
    pub fn validation(field: impl Into<String>) -> Self {
        ServiceError::Validation(field.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ServiceError::Conflict(msg.into())
    }
}

impl From<diesel::result::Error> for ServiceError {
    fn from(e: diesel::result::Error) -> Self {
        ServiceError::Infrastructure(e.into())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        ServiceError::Infrastructure(e.into())
    }
}
