//! # vulnsync
//!
//! The update-and-match core of a vulnerability database.
//!
//! vulnsync periodically fetches vulnerability feeds, ingests each change
//! into a shared SQLite store exactly once, and answers "is this installed
//! package vulnerable?" by running per-ecosystem matchers against the
//! stored vulnerabilities.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Updaters   │──▶│ Controller  │──▶│    SQLite    │
//! │ JSON feeds  │   │ lock+finger │   │ generations  │
//! └─────────────┘   └─────────────┘   └──────┬───────┘
//!                                            │
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │ MatchEngine  │
//!                                     │ maven/py/go  │
//!                                     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vulnsync init                       # create database
//! vulnsync update                     # one attempt per configured feed
//! vulnsync run                        # scheduled updates until Ctrl-C
//! vulnsync history snyk               # update operations, newest first
//! vulnsync match ./records.json       # correlate installed packages
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`controller`] | Scheduled, lock-coordinated update pipeline |
//! | [`feed`] | JSON feed updater |
//! | [`locker`] | SQLite lease lock |
//! | [`sqlite_store`] | SQLite vulnerability store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//!
//! The data model, collaborator traits, matchers and the match engine
//! live in [`vulnsync_core`].

pub mod config;
pub mod controller;
pub mod db;
pub mod feed;
pub mod locker;
pub mod migrate;
pub mod sqlite_store;

pub use vulnsync_core;
