//! Per-node operation lock table.
//!
//! At most one activation or deactivation may be in flight per node. The lock
//! is advisory to the local client; it does not coordinate with other clients.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

/// What the lock holder is doing with the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockIntent {
    Activating,
    Deactivating,
}

impl fmt::Display for LockIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockIntent::Activating => f.write_str("activating"),
            LockIntent::Deactivating => f.write_str("deactivating"),
        }
    }
}

/// Node name to current lock holder.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    locks: Mutex<HashMap<String, LockIntent>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the node's lock. Returns the current holder if it is already taken.
    pub async fn try_acquire(&self, node: &str, intent: LockIntent) -> Result<(), LockIntent> {
        let mut locks = self.locks.lock().await;
        if let Some(holder) = locks.get(node) {
            return Err(*holder);
        }
        locks.insert(node.to_string(), intent);
        debug!(node = %node, intent = %intent, "Acquired node lock");
        Ok(())
    }

    /// Release the node's lock. Releasing a free lock is a no-op.
    pub async fn release(&self, node: &str) {
        if let Some(intent) = self.locks.lock().await.remove(node) {
            debug!(node = %node, intent = %intent, "Released node lock");
        }
    }

    pub async fn holder(&self, node: &str) -> Option<LockIntent> {
        self.locks.lock().await.get(node).copied()
    }

    pub async fn is_locked(&self, node: &str) -> bool {
        self.locks.lock().await.contains_key(node)
    }

    /// Snapshot of every held lock.
    pub async fn held(&self) -> HashMap<String, LockIntent> {
        self.locks.lock().await.clone()
    }
}
