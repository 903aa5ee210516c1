//! Per-account submission locks
//!
//! Destination accounts are sequence-addressed, so at most one
//! broadcast-and-confirm may be in flight per account. Distinct accounts
//! proceed independently. The registry is cheap to clone and shared by every
//! pipeline that signs with the same accounts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct AccountLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `account`. Waiters are served in FIFO order.
    pub async fn acquire(&self, account: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(account.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
