//! Bulk correlation of installed packages against stored vulnerabilities.
//!
//! The [`MatchEngine`] composes one batched [`VulnerabilityStore::get`]
//! call with the matchers of a [`MatcherRegistry`]:
//!
//! 1. Matchers whose [`filter`](crate::Matcher::filter) accepts at least one
//!    record are active; their [`query`](crate::Matcher::query) constraints
//!    are unioned into the store options.
//! 2. The store returns candidates for every record in one call.
//! 3. Each candidate naming the record's package is offered to the
//!    record's filter-passing matchers; it is kept if at least one says it
//!    is vulnerable. Records sharing an id share one result entry, with
//!    each vulnerability reported once.
//!
//! Matcher errors are counted and logged, never surfaced: one malformed
//! version string cannot fail a batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;

use crate::matcher::{union_constraints, Matcher, MatcherRegistry};
use crate::models::{IndexRecord, Vulnerability};
use crate::store::{GetOpts, VulnerabilityStore};

pub struct MatchEngine {
    store: Arc<dyn VulnerabilityStore>,
    registry: Arc<MatcherRegistry>,
}

impl MatchEngine {
    pub fn new(store: Arc<dyn VulnerabilityStore>, registry: Arc<MatcherRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &MatcherRegistry {
        &self.registry
    }

    /// Vulnerabilities affecting each record, keyed by [`IndexRecord::id`].
    ///
    /// Records nothing applies to are absent from the result. Only store
    /// failures are returned as errors.
    pub async fn match_records(
        &self,
        records: &[IndexRecord],
    ) -> Result<HashMap<String, Vec<Vulnerability>>> {
        let active: Vec<&dyn Matcher> = self
            .registry
            .matchers()
            .filter(|m| records.iter().any(|r| m.filter(r)))
            .collect();
        if active.is_empty() {
            tracing::debug!(records = records.len(), "no matcher applies to any record");
            return Ok(HashMap::new());
        }

        let opts = GetOpts {
            constraints: union_constraints(active.iter().copied()),
        };
        let candidates = self.store.get(records, &opts).await?;

        let mut results: HashMap<String, Vec<Vulnerability>> = HashMap::new();
        // Records sharing an id share one candidate list and one result entry.
        let mut reported: HashMap<&str, HashSet<&str>> = HashMap::new();
        let mut matcher_errors = 0usize;
        for record in records {
            let Some(vulns) = candidates.get(record.id()) else {
                continue;
            };
            let applicable: Vec<&dyn Matcher> =
                active.iter().copied().filter(|m| m.filter(record)).collect();
            if applicable.is_empty() {
                continue;
            }

            let seen = reported.entry(record.id()).or_default();
            for vuln in vulns {
                if !same_package(record, vuln) || seen.contains(vuln.id.as_str()) {
                    continue;
                }
                for matcher in &applicable {
                    match matcher.vulnerable(record, vuln).await {
                        Ok(true) => {
                            seen.insert(vuln.id.as_str());
                            results
                                .entry(record.id().to_string())
                                .or_default()
                                .push(vuln.clone());
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            matcher_errors += 1;
                            tracing::debug!(
                                matcher = matcher.name(),
                                record = record.id(),
                                vulnerability = %vuln.name,
                                error = %e,
                                "matcher failed; treating as not vulnerable"
                            );
                        }
                    }
                }
            }
        }

        if matcher_errors > 0 {
            tracing::warn!(count = matcher_errors, "matcher errors while correlating");
        }
        tracing::debug!(
            records = records.len(),
            affected = results.len(),
            matchers = active.len(),
            "correlation complete"
        );
        Ok(results)
    }
}

fn same_package(record: &IndexRecord, vuln: &Vulnerability) -> bool {
    vuln.package
        .as_ref()
        .is_some_and(|p| p.name.eq_ignore_ascii_case(&record.package.name))
}
