//! Ledger Error Taxonomy
//!
//! Every failure that can cross the ledger port boundary is one of these
//! kinds. Callers branch on the kind, never on message substrings.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Malformed or out-of-range input; surfaced to the caller, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// The ledger rejected the access token (401). The adapter invalidates
    /// its token cache and retries once; recurring failures propagate.
    #[error("Authorization expired")]
    AuthorizationExpired,

    /// Optimistic failure on a contract that changed concurrently
    #[error("Ledger conflict: {0}")]
    Conflict(String),

    /// A referenced contract is no longer active
    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    /// Timeout, network failure, or unparseable response
    #[error("Transport error: {0}")]
    Transport(String),

    /// The ledger reports a concurrent request for the same logical
    /// operation. Carries the server-supplied back-off hint when present.
    #[error("Operation already in flight")]
    AlreadyInFlight { retry_after: Option<Duration> },

    /// Missing or inconsistent startup configuration; fatal before the
    /// engine opens its ports
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    /// Kinds that a local retry loop may re-attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Transport(_)
                | LedgerError::Conflict(_)
                | LedgerError::AlreadyInFlight { .. }
        )
    }

    /// Server-supplied back-off hint, if the error carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LedgerError::AlreadyInFlight { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        LedgerError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Transport(format!("Unparseable response: {}", err))
    }
}
