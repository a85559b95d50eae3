//! Placement error types.

use sharegrid_storage::StorageIndex;
use thiserror::Error;

use crate::outcome::Diagnostics;

/// Errors that end an upload attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("invalid encoding parameters: {0}")]
    InvalidParams(String),

    #[error("expected {expected} share buffers, got {actual}")]
    ShareCount { expected: usize, actual: usize },

    #[error("no usable storage servers: {0}")]
    NoServers(Box<Diagnostics>),

    #[error("upload is not happy: {0}")]
    UploadUnhappiness(Box<Diagnostics>),

    #[error("upload of {0} was cancelled")]
    Cancelled(StorageIndex),
}

impl PlacementError {
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            PlacementError::NoServers(d) | PlacementError::UploadUnhappiness(d) => Some(d),
            _ => None,
        }
    }

    /// Whether the same upload might succeed if tried again later.
    ///
    /// Only an unhappy result with some server unreachable qualifies; a
    /// grid that answered and still could not fit the shares will answer
    /// the same way next time.
    pub fn retry_recommended(&self) -> bool {
        match self {
            PlacementError::UploadUnhappiness(d) => d.servers.unreachable > 0,
            PlacementError::Cancelled(_) => true,
            _ => false,
        }
    }
}

pub type PlacementResult<T> = Result<T, PlacementError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ServerCounts;
    use crate::types::EncodingParams;

    fn diag(unreachable: usize) -> Box<Diagnostics> {
        let mut d =
            Diagnostics::without_servers(StorageIndex::new([0; 16]), EncodingParams::default());
        d.servers = ServerCounts {
            writable: 2,
            unreachable,
            ..Default::default()
        };
        Box::new(d)
    }

    #[test]
    fn unhappy_with_unreachable_servers_is_retryable() {
        assert!(PlacementError::UploadUnhappiness(diag(1)).retry_recommended());
        assert!(!PlacementError::UploadUnhappiness(diag(0)).retry_recommended());
    }

    #[test]
    fn no_servers_and_bad_params_are_not_retryable() {
        assert!(!PlacementError::NoServers(diag(3)).retry_recommended());
        assert!(!PlacementError::InvalidParams("x".into()).retry_recommended());
        assert!(
            !PlacementError::ShareCount {
                expected: 10,
                actual: 3
            }
            .retry_recommended()
        );
    }

    #[test]
    fn message_includes_diagnostics() {
        let err = PlacementError::NoServers(diag(0));
        let text = err.to_string();
        assert!(text.starts_with("no usable storage servers: "));
        assert!(text.contains("shares could be placed on only 0 server(s)"));
        assert!(err.diagnostics().is_some());
        assert!(PlacementError::Cancelled(StorageIndex::new([0; 16])).diagnostics().is_none());
    }
}
