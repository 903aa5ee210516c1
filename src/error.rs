//! Error taxonomy for the relay engine
//!
//! Every collaborator call returns a [`RelayError`]; the variant decides
//! whether the shared retry policy may try again and which terminal state a
//! job ends in.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by pollers, proof construction and submission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// RPC unreachable, timed out or returned a 5xx. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Queried height or transaction does not exist (yet). Not retryable,
    /// callers treat it as "nothing new".
    #[error("not found: {0}")]
    NotFound(String),

    /// Consensus data or Merkle proof could not be assembled. Retryable up to
    /// the policy bound.
    #[error("proof construction failed: {0}")]
    ProofConstruction(String),

    /// Broadcast rejected by the destination (insufficient funds, bad
    /// sequence, contract error). Never retried automatically.
    #[error("submission rejected: {0}")]
    Submission(String),

    /// The broadcast may or may not have landed.
    #[error("confirmation timed out after {waited:?} for message {message_hash}")]
    ConfirmationTimeout {
        message_hash: String,
        waited: Duration,
    },

    /// Offset or job persistence failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Misconfiguration detected at runtime (e.g. bridge adapter points at a
    /// different light client).
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether the shared retry policy may re-run the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(_) | RelayError::ProofConstruction(_)
        )
    }

    /// Short label used for metrics and the failed-jobs table.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Transport(_) => "transport",
            RelayError::NotFound(_) => "not_found",
            RelayError::ProofConstruction(_) => "proof",
            RelayError::Submission(_) => "submission",
            RelayError::ConfirmationTimeout { .. } => "confirmation_timeout",
            RelayError::Storage(_) => "storage",
            RelayError::Config(_) => "config",
        }
    }

    /// Map a raw RPC/HTTP error message onto the taxonomy.
    pub fn from_rpc_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match crate::writers::retry::classify_error(&message) {
            crate::writers::retry::ErrorClass::NotFound => RelayError::NotFound(message),
            crate::writers::retry::ErrorClass::Permanent => RelayError::Submission(message),
            crate::writers::retry::ErrorClass::Transient => RelayError::Transport(message),
        }
    }
}

impl From<tendermint_rpc::Error> for RelayError {
    fn from(e: tendermint_rpc::Error) -> Self {
        RelayError::from_rpc_message(e.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(404) {
            return RelayError::NotFound(e.to_string());
        }
        RelayError::Transport(e.to_string())
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::Storage(e.to_string())
    }
}
