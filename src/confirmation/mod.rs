//! Broadcast confirmation
//!
//! A destination account is sequence-addressed: a broadcast has landed once
//! the account sequence moves past the value read right before signing. When
//! the destination can index messages, the broadcast's own message hash must
//! also be visible, so another process sharing the account cannot confirm our
//! job by accident. The wait has a wall-clock ceiling independent of the retry
//! policy.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chain::{BroadcastReceipt, Destination};
use crate::error::RelayError;

/// Poll cadence and ceiling for confirmations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1500),
            timeout: Duration::from_millis(90_000),
        }
    }
}

/// Result of one confirmation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationResult {
    /// Sequence has not moved yet
    Pending,
    /// Sequence moved but our message is not indexed yet
    AwaitingIndex,
    /// Our broadcast landed
    Confirmed,
}

/// Decide from the observed sequence and index lookup
pub fn evaluate(sequence_before: u64, sequence_now: u64, landed: Option<bool>) -> ConfirmationResult {
    if sequence_now <= sequence_before {
        return ConfirmationResult::Pending;
    }
    match landed {
        Some(false) => ConfirmationResult::AwaitingIndex,
        Some(true) | None => ConfirmationResult::Confirmed,
    }
}

async fn check_once(
    destination: &dyn Destination,
    receipt: &BroadcastReceipt,
    sequence_before: u64,
) -> Result<ConfirmationResult, RelayError> {
    let sequence_now = destination.sequence().await?;
    if sequence_now <= sequence_before {
        return Ok(ConfirmationResult::Pending);
    }
    let landed = destination.transaction_landed(receipt).await?;
    Ok(evaluate(sequence_before, sequence_now, landed))
}

/// Wait until `receipt` is confirmed. Returns the time waited.
///
/// Lookup failures are logged and polled through; only an on-chain failure of
/// the broadcast itself ends the wait early.
pub async fn wait_for_confirmation(
    destination: &dyn Destination,
    receipt: &BroadcastReceipt,
    sequence_before: u64,
    config: &ConfirmationConfig,
) -> Result<Duration, RelayError> {
    let started = Instant::now();

    loop {
        tokio::time::sleep(config.poll_interval).await;

        match check_once(destination, receipt, sequence_before).await {
            Ok(ConfirmationResult::Confirmed) => {
                let waited = started.elapsed();
                debug!(
                    message_hash = %receipt.message_hash,
                    waited_ms = waited.as_millis() as u64,
                    "Transaction confirmed"
                );
                return Ok(waited);
            }
            Ok(ConfirmationResult::AwaitingIndex) => {
                debug!(message_hash = %receipt.message_hash, "Sequence advanced, waiting for index");
            }
            Ok(ConfirmationResult::Pending) => {}
            Err(e @ RelayError::Submission(_)) => return Err(e),
            Err(e) => {
                warn!(
                    message_hash = %receipt.message_hash,
                    error = %e,
                    "Confirmation check failed, polling again"
                );
            }
        }

        let waited = started.elapsed();
        if waited >= config.timeout {
            return Err(RelayError::ConfirmationTimeout {
                message_hash: receipt.message_hash.clone(),
                waited,
            });
        }
    }
}

/// Whether a broadcast recorded before a restart landed.
///
/// Polls the destination index for `message_hash` until it shows up or the
/// confirmation ceiling passes. `false` means the packet must be broadcast
/// again: the message never landed, landed but failed, or the destination
/// cannot look messages up.
pub async fn recorded_broadcast_landed(
    destination: &dyn Destination,
    message_hash: &str,
    config: &ConfirmationConfig,
) -> bool {
    let receipt = BroadcastReceipt {
        message_hash: message_hash.to_string(),
        sequence: 0,
    };
    let started = Instant::now();

    loop {
        match destination.transaction_landed(&receipt).await {
            Ok(Some(true)) => return true,
            Ok(None) => {
                debug!(message_hash, "Destination cannot index messages");
                return false;
            }
            Ok(Some(false)) => {}
            Err(e @ RelayError::Submission(_)) => {
                warn!(message_hash, error = %e, "Recorded broadcast failed on chain");
                return false;
            }
            Err(e) => {
                warn!(message_hash, error = %e, "Lookup of recorded broadcast failed");
            }
        }

        if started.elapsed() >= config.timeout {
            debug!(message_hash, "Recorded broadcast never landed");
            return false;
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}
