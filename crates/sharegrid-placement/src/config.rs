//! Selector configuration.

use std::time::Duration;

use sharegrid_storage::LeaseSecrets;

/// Timeouts and limits for one [`ServerSelector`](crate::ServerSelector).
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Bound on each held-shares query.
    pub query_timeout: Duration,
    /// Bound on each reserve, write and abort call.
    pub negotiate_timeout: Duration,
    /// Cap on planning iterations. The number of candidate servers is
    /// always an upper bound as well.
    pub max_iterations: Option<usize>,
    /// Lease secrets handed to every server on reservation.
    pub secrets: LeaseSecrets,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(10),
            negotiate_timeout: Duration::from_secs(60),
            max_iterations: None,
            secrets: LeaseSecrets::default(),
        }
    }
}

impl SelectorConfig {
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_negotiate_timeout(mut self, timeout: Duration) -> Self {
        self.negotiate_timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = Some(iterations);
        self
    }

    pub fn with_secrets(mut self, secrets: LeaseSecrets) -> Self {
        self.secrets = secrets;
        self
    }

    /// Planning iterations allowed for `candidates` servers (at least one).
    pub fn iteration_budget(&self, candidates: usize) -> usize {
        let bound = candidates.max(1);
        self.max_iterations.map_or(bound, |cap| cap.clamp(1, bound))
    }
}
