//! Updater abstraction: the per-ecosystem feed producer.
//!
//! An [`Updater`] knows how to fetch one upstream vulnerability feed and
//! turn it into [`Vulnerability`] records. It knows nothing about locking
//! or storage; the controller in the `vulnsync` crate drives it.
//!
//! # Lifecycle
//!
//! 1. [`fetch`](Updater::fetch) is called with the fingerprint of the last
//!    stored update operation (empty on the first run).
//! 2. If upstream has not moved, the updater answers
//!    [`FetchOutcome::Unchanged`] and nothing else happens.
//! 3. Otherwise the returned [`FeedData`] is handed to
//!    [`parse`](Updater::parse), which consumes it. Dropping the reader
//!    releases the underlying resource on every path.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Fingerprint, Vulnerability};
use crate::RegistryError;

/// Raw feed payload returned by a fetch.
pub type FeedData = Box<dyn Read + Send>;

/// Result of a successful fetch.
///
/// `Unchanged` is a normal outcome, not an error: the upstream fingerprint
/// did not advance and there is nothing to parse or store.
pub enum FetchOutcome {
    Updated {
        data: FeedData,
        fingerprint: Fingerprint,
    },
    Unchanged,
}

impl std::fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Updated { fingerprint, .. } => f
                .debug_struct("Updated")
                .field("fingerprint", fingerprint)
                .finish_non_exhaustive(),
            Self::Unchanged => f.write_str("Unchanged"),
        }
    }
}

/// A vulnerability feed producer for one ecosystem or source.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Stable name. Update operations are recorded under it.
    fn name(&self) -> &str;

    /// Fetch the feed, using `hint` for incremental or conditional retrieval.
    async fn fetch(&self, hint: &Fingerprint) -> Result<FetchOutcome>;

    /// Parse fetched data into vulnerabilities.
    ///
    /// Malformed individual entries should be skipped and counted rather
    /// than failing the whole parse. An `Err` means the payload as a whole
    /// could not be understood.
    async fn parse(&self, data: FeedData) -> Result<Vec<Vulnerability>>;
}

/// A named set of updaters. Names are unique within the set.
#[derive(Default, Clone)]
pub struct UpdaterSet {
    updaters: BTreeMap<String, Arc<dyn Updater>>,
}

impl UpdaterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an updater. Fails if an updater with the same name is present.
    pub fn add(&mut self, updater: Arc<dyn Updater>) -> std::result::Result<(), RegistryError> {
        let name = updater.name().to_string();
        if self.updaters.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.updaters.insert(name, updater);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Updater>> {
        self.updaters.get(name).cloned()
    }

    /// All updaters, ordered by name.
    pub fn updaters(&self) -> impl Iterator<Item = &Arc<dyn Updater>> {
        self.updaters.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.updaters.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.updaters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updaters.len()
    }
}
