//! Mutual exclusion between update controllers.
//!
//! The [`Locker`] contract is deliberately small: a non-blocking attempt to
//! take a named lock and an explicit release. Controllers that fail to
//! acquire simply skip their tick; nobody queues.
//!
//! [`InMemoryLocker`] coordinates controllers inside one process. The
//! SQLite-backed lock in the `vulnsync` crate coordinates processes that
//! share a database.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

#[async_trait]
pub trait Locker: Send + Sync {
    /// Try to take the lock `name` without waiting.
    ///
    /// `Ok(false)` means another holder has it. `Err` is reserved for
    /// failures of the lock mechanism itself.
    async fn try_lock(&self, name: &str) -> Result<bool>;

    /// Release a lock previously taken by this locker.
    async fn unlock(&self, name: &str) -> Result<()>;

    /// Push back the expiry of a lock this locker holds.
    ///
    /// `Ok(false)` means the lock is no longer ours.
    async fn extend(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }

    /// How often a holder should call [`extend`](Locker::extend) while it
    /// works. `None` for locks that never expire.
    fn renew_interval(&self) -> Option<Duration> {
        None
    }
}

/// Process-local locker backed by a set of held names.
#[derive(Debug, Default)]
pub struct InMemoryLocker {
    held: Mutex<HashSet<String>>,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(name))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn try_lock(&self, name: &str) -> Result<bool> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow!("locker state poisoned"))?;
        Ok(held.insert(name.to_string()))
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow!("locker state poisoned"))?;
        held.remove(name);
        Ok(())
    }
}
