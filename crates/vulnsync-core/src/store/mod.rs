//! Storage abstraction for vulnerabilities and update operations.
//!
//! The [`VulnerabilityStore`] trait defines the write side used by the
//! update controller and the read side used by the matching engine,
//! enabling pluggable backends (SQLite in the `vulnsync` crate, in-memory
//! here).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Generations
//!
//! Every call to [`update_vulnerabilities`](VulnerabilityStore::update_vulnerabilities)
//! records one [`UpdateOperation`] together with the complete set of
//! vulnerabilities it produced. Reads only see the set attached to the most
//! recent operation of each updater, and a reader must observe either the
//! fully committed previous generation or the fully committed new one.

pub mod memory;

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::matcher::MatchConstraint;
use crate::models::{Fingerprint, IndexRecord, UpdateOperation, Vulnerability};

/// Options for [`VulnerabilityStore::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOpts {
    /// Dimensions bound in addition to the package name.
    pub constraints: BTreeSet<MatchConstraint>,
}

impl GetOpts {
    pub fn with_constraints(constraints: impl IntoIterator<Item = MatchConstraint>) -> Self {
        Self {
            constraints: constraints.into_iter().collect(),
        }
    }
}

/// Abstract vulnerability store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_update_operations`](VulnerabilityStore::get_update_operations) | Operation history, newest first |
/// | [`update_vulnerabilities`](VulnerabilityStore::update_vulnerabilities) | Atomically store a new generation |
/// | [`get`](VulnerabilityStore::get) | Batched correlation lookup |
#[async_trait]
pub trait VulnerabilityStore: Send + Sync {
    /// Update operations for each named updater, newest first.
    ///
    /// Updaters that never ran are absent from the map.
    async fn get_update_operations(
        &self,
        updaters: &[String],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>>;

    /// Record a new update operation and its full vulnerability set.
    ///
    /// Either both land or neither does.
    async fn update_vulnerabilities(
        &self,
        updater: &str,
        operation_id: Uuid,
        fingerprint: &Fingerprint,
        vulns: &[Vulnerability],
    ) -> Result<()>;

    /// Candidate vulnerabilities for each record, keyed by
    /// [`IndexRecord::id`].
    ///
    /// Candidates share the record's package name (compared without regard
    /// to ASCII case) and agree on every dimension in `opts`. Records with
    /// no candidates are absent from the map. Any failure fails the whole
    /// call; there are no partial results.
    async fn get(
        &self,
        records: &[IndexRecord],
        opts: &GetOpts,
    ) -> Result<HashMap<String, Vec<Vulnerability>>>;
}
