//! # vulnsync core
//!
//! Shared, runtime-agnostic logic for vulnsync: the vulnerability data
//! model, the collaborator traits the update controller drives
//! ([`updater::Updater`], [`locker::Locker`], [`store::VulnerabilityStore`]),
//! version comparison, the [`matcher::Matcher`] abstraction with its
//! explicit registry, and the [`engine::MatchEngine`] that correlates
//! installed packages with stored vulnerabilities.
//!
//! This crate contains no tokio, sqlx, or network dependencies. The
//! SQLite store, the distributed lock, the feed updaters, and the
//! scheduled controller live in the `vulnsync` crate.

pub mod engine;
pub mod locker;
pub mod matcher;
pub mod models;
pub mod store;
pub mod updater;
pub mod version;

pub use engine::MatchEngine;
pub use matcher::{MatchConstraint, Matcher, MatcherRegistry, RegistryError};
pub use models::{
    Distribution, Fingerprint, IndexRecord, NormalizedSeverity, Package, Repository,
    UpdateOperation, Vulnerability,
};
pub use store::{GetOpts, VulnerabilityStore};
pub use updater::{FeedData, FetchOutcome, Updater, UpdaterSet};
