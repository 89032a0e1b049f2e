//! Scheduled, lock-coordinated update pipeline for one updater.
//!
//! A [`Controller`] owns one [`Updater`], one [`Locker`] and a handle to
//! the shared [`VulnerabilityStore`]. Each attempt runs:
//!
//! ```text
//! try_lock ─▶ last fingerprint ─▶ fetch ─▶ parse ─▶ update_vulnerabilities
//!    │                              │
//!    └─ held elsewhere: Locked      └─ not modified: Unchanged
//! ```
//!
//! The lock is released on every exit path, including a panic inside the
//! pipeline, and its lease is renewed while the pipeline runs. A failed
//! release is reported as [`UpdateError::Lock`]. Controllers in other processes sharing the same lock name
//! coordinate only through the locker.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vulnsync_core::locker::Locker;
use vulnsync_core::models::Fingerprint;
use vulnsync_core::store::VulnerabilityStore;
use vulnsync_core::updater::{FetchOutcome, Updater};

/// Failure of one update attempt. None of these are fatal to the loop.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("lock error: {0:#}")]
    Lock(anyhow::Error),
    #[error("reading update operations failed: {0:#}")]
    Store(anyhow::Error),
    #[error("fetch failed: {0:#}")]
    Fetch(anyhow::Error),
    #[error("parse failed: {0:#}")]
    Parse(anyhow::Error),
    #[error("storing vulnerabilities failed: {0:#}")]
    Persist(anyhow::Error),
    #[error("controller already started")]
    AlreadyStarted,
}

/// What a successful attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Another holder has the lock; nothing was done.
    Locked,
    /// Upstream has not moved since the last stored fingerprint.
    Unchanged,
    /// A new generation was stored.
    Updated { operation_id: Uuid, count: usize },
}

pub struct ControllerOpts {
    /// Lock name. Controllers sharing it never run concurrently.
    pub name: String,
    pub updater: Arc<dyn Updater>,
    pub store: Arc<dyn VulnerabilityStore>,
    pub locker: Arc<dyn Locker>,
    pub interval: Duration,
    /// Run one attempt immediately when started.
    pub update_on_start: bool,
}

pub struct Controller {
    name: String,
    updater: Arc<dyn Updater>,
    store: Arc<dyn VulnerabilityStore>,
    locker: Arc<dyn Locker>,
    interval: Duration,
    update_on_start: bool,
    started: AtomicBool,
}

impl Controller {
    pub fn new(opts: ControllerOpts) -> Self {
        Self {
            name: opts.name,
            updater: opts.updater,
            store: opts.store,
            locker: opts.locker,
            interval: opts.interval,
            update_on_start: opts.update_on_start,
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the background loop. Returns immediately.
    ///
    /// The loop runs one attempt per interval until `cancel` fires. An
    /// attempt already in flight when cancellation arrives runs to
    /// completion. A second call on the same controller fails.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>, UpdateError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(UpdateError::AlreadyStarted);
        }
        Ok(tokio::spawn(async move { self.run(cancel).await }))
    }

    async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            controller = %self.name,
            updater = self.updater.name(),
            interval_secs = self.interval.as_secs(),
            "update controller started"
        );

        if self.update_on_start && !cancel.is_cancelled() {
            self.tick().await;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        tracing::info!(controller = %self.name, "update controller stopped");
    }

    /// One loop iteration. Errors and panics are logged; the loop goes on.
    async fn tick(&self) {
        match AssertUnwindSafe(self.update()).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::error!(controller = %self.name, error = %e, "update attempt failed");
            }
            Err(_) => {
                tracing::error!(controller = %self.name, "update attempt panicked");
            }
        }
    }

    /// Run exactly one update attempt.
    pub async fn update(&self) -> Result<UpdateOutcome, UpdateError> {
        let acquired = self
            .locker
            .try_lock(&self.name)
            .await
            .map_err(UpdateError::Lock)?;
        if !acquired {
            tracing::debug!(controller = %self.name, "lock held elsewhere; skipping update");
            return Ok(UpdateOutcome::Locked);
        }

        let result = self
            .hold_lease(AssertUnwindSafe(self.update_locked()).catch_unwind())
            .await;
        let released = self.locker.unlock(&self.name).await;

        match (result, released) {
            (Ok(Ok(outcome)), Ok(())) => Ok(outcome),
            (Ok(Ok(_)), Err(e)) => Err(UpdateError::Lock(e.context("failed to release lock"))),
            (Ok(Err(err)), released) => {
                if let Err(e) = released {
                    tracing::warn!(controller = %self.name, error = %e, "failed to release lock");
                }
                Err(err)
            }
            (Err(panic), released) => {
                if let Err(e) = released {
                    tracing::warn!(controller = %self.name, error = %e, "failed to release lock");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Drive `work` to completion, renewing the lock lease as the locker asks.
    async fn hold_lease<F: Future>(&self, work: F) -> F::Output {
        let Some(every) = self.locker.renew_interval() else {
            return work.await;
        };
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                output = &mut work => return output,
                _ = heartbeat.tick() => match self.locker.extend(&self.name).await {
                    Ok(true) => tracing::trace!(controller = %self.name, "lease renewed"),
                    Ok(false) => {
                        tracing::warn!(controller = %self.name, "lease lost while updating");
                    }
                    Err(e) => {
                        tracing::warn!(controller = %self.name, error = %e, "failed to renew lease");
                    }
                },
            }
        }
    }

    async fn update_locked(&self) -> Result<UpdateOutcome, UpdateError> {
        let operation_id = Uuid::new_v4();
        let updater = self.updater.name().to_string();

        let operations = self
            .store
            .get_update_operations(std::slice::from_ref(&updater))
            .await
            .map_err(UpdateError::Store)?;
        let hint: Fingerprint = operations
            .get(&updater)
            .and_then(|ops| ops.first())
            .map(|op| op.fingerprint.clone())
            .unwrap_or_default();

        tracing::debug!(
            updater = %updater,
            update_operation_id = %operation_id,
            fingerprint = %hint,
            "fetching"
        );
        let (data, fingerprint) = match self.updater.fetch(&hint).await.map_err(UpdateError::Fetch)? {
            FetchOutcome::Unchanged => {
                tracing::info!(updater = %updater, "vulnerability database unchanged");
                return Ok(UpdateOutcome::Unchanged);
            }
            FetchOutcome::Updated { data, fingerprint } => (data, fingerprint),
        };

        let vulns = self.updater.parse(data).await.map_err(UpdateError::Parse)?;

        self.store
            .update_vulnerabilities(&updater, operation_id, &fingerprint, &vulns)
            .await
            .map_err(UpdateError::Persist)?;

        tracing::info!(
            updater = %updater,
            update_operation_id = %operation_id,
            fingerprint = %fingerprint,
            count = vulns.len(),
            "vulnerability database updated"
        );
        Ok(UpdateOutcome::Updated {
            operation_id,
            count: vulns.len(),
        })
    }
}
