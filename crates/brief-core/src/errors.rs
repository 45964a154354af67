use std::time::Duration;

use thiserror::Error;

/// Why the external producer did not hand back a usable digest.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProducerError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("malformed producer output: {0}")]
    Malformed(String),
    #[error("producer timed out after {0:?}")]
    Timeout(Duration),
}
