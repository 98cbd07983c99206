//! The tagged failure taxonomy every node call resolves to.

use thiserror::Error;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// The node reports that the target does not exist.
    #[error("not found")]
    NotFound,

    /// Connection-level failure or node 5xx; the call may succeed if
    /// retried later.
    #[error("transient node failure: {0}")]
    Transient(String),

    /// The node answered, but not in a shape this client understands.
    #[error("node protocol error: {0}")]
    Protocol(String),
}

impl NodeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, NodeError::NotFound)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Transient(_))
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() || error.is_request() {
            NodeError::Transient(error.to_string())
        } else {
            NodeError::Protocol(error.to_string())
        }
    }
}
