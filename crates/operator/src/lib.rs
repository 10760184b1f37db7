pub mod cache;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod kubernetes;
pub mod metrics;
pub mod polling;
pub mod queue;
pub mod router;
pub mod sinks;
pub mod startup;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid work key: {0}")]
    InvalidKey(String),
    #[error("Invalid object: {0}")]
    InvalidObject(String),
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the work queue should retry the key that produced this error.
    ///
    /// Parse failures and malformed objects can never succeed on a retry, so
    /// they are dropped. Everything that touches the API server is retried
    /// with backoff, indefinitely.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidKey(_) | Error::InvalidObject(_) | Error::InvalidSpec(_) | Error::Config(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    pub fn is_already_exists(&self) -> bool {
        self.api_reason() == Some("AlreadyExists")
    }

    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409) && !self.is_already_exists()
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kubernetes(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    fn api_reason(&self) -> Option<&str> {
        match self {
            Error::Kubernetes(kube::Error::Api(resp)) => Some(resp.reason.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
