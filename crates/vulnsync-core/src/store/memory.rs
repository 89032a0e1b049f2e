//! In-memory [`VulnerabilityStore`] implementation for testing.
//!
//! All state sits behind one `std::sync::RwLock`, so a new generation is
//! published atomically with respect to readers.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::{Fingerprint, IndexRecord, UpdateOperation, Vulnerability};

use super::{GetOpts, VulnerabilityStore};

#[derive(Default)]
struct Inner {
    /// Insertion order is creation order.
    operations: Vec<UpdateOperation>,
    generations: HashMap<Uuid, Vec<Vulnerability>>,
    next_vuln_id: u64,
}

impl Inner {
    fn current_generations(&self) -> impl Iterator<Item = &Vulnerability> {
        let mut seen = std::collections::HashSet::new();
        self.operations
            .iter()
            .rev()
            .filter(move |op| seen.insert(op.updater.as_str()))
            .filter_map(move |op| self.generations.get(&op.id))
            .flatten()
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vulnerabilities in the current generation of `updater`.
    pub fn vulnerability_count(&self, updater: &str) -> Result<usize> {
        let inner = self.inner.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(inner
            .operations
            .iter()
            .rev()
            .find(|op| op.updater == updater)
            .and_then(|op| inner.generations.get(&op.id))
            .map(Vec::len)
            .unwrap_or(0))
    }
}

#[async_trait]
impl VulnerabilityStore for InMemoryStore {
    async fn get_update_operations(
        &self,
        updaters: &[String],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>> {
        let inner = self.inner.read().map_err(|_| anyhow!("store lock poisoned"))?;
        let mut out: HashMap<String, Vec<UpdateOperation>> = HashMap::new();
        for op in inner.operations.iter().rev() {
            if updaters.iter().any(|u| *u == op.updater) {
                out.entry(op.updater.clone()).or_default().push(op.clone());
            }
        }
        Ok(out)
    }

    async fn update_vulnerabilities(
        &self,
        updater: &str,
        operation_id: Uuid,
        fingerprint: &Fingerprint,
        vulns: &[Vulnerability],
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| anyhow!("store lock poisoned"))?;
        if inner.generations.contains_key(&operation_id) {
            bail!("update operation {} already recorded", operation_id);
        }

        let mut generation = Vec::with_capacity(vulns.len());
        for vuln in vulns {
            inner.next_vuln_id += 1;
            let mut stored = vuln.clone();
            stored.id = inner.next_vuln_id.to_string();
            generation.push(stored);
        }

        inner.operations.push(UpdateOperation {
            id: operation_id,
            updater: updater.to_string(),
            fingerprint: fingerprint.clone(),
            date: Utc::now(),
        });
        inner.generations.insert(operation_id, generation);
        Ok(())
    }

    async fn get(
        &self,
        records: &[IndexRecord],
        opts: &GetOpts,
    ) -> Result<HashMap<String, Vec<Vulnerability>>> {
        let inner = self.inner.read().map_err(|_| anyhow!("store lock poisoned"))?;
        let current: Vec<&Vulnerability> = inner.current_generations().collect();

        let mut results: HashMap<String, Vec<Vulnerability>> = HashMap::new();
        for record in records {
            let matches = current.iter().filter(|vuln| {
                let name_matches = vuln
                    .package
                    .as_ref()
                    .is_some_and(|p| p.name.eq_ignore_ascii_case(&record.package.name));
                name_matches
                    && opts
                        .constraints
                        .iter()
                        .all(|c| c.vulnerability_value(vuln) == c.record_value(record))
            });
            for vuln in matches {
                results
                    .entry(record.id().to_string())
                    .or_default()
                    .push((*vuln).clone());
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchConstraint;
    use crate::models::{Package, Repository};

    fn vuln(name: &str, package: &str, repo: &str) -> Vulnerability {
        Vulnerability {
            name: name.into(),
            package: Some(Package {
                name: package.into(),
                version: "<2.0".into(),
                ..Default::default()
            }),
            repo: Some(Repository::named(repo)),
            ..Default::default()
        }
    }

    fn record(id: &str, package: &str, repo: &str) -> IndexRecord {
        IndexRecord {
            package: Package {
                id: id.into(),
                name: package.into(),
                version: "1.0".into(),
                ..Default::default()
            },
            distribution: None,
            repository: Some(Repository::named(repo)),
        }
    }

    #[tokio::test]
    async fn test_operations_newest_first() {
        let store = InMemoryStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store
            .update_vulnerabilities("snyk", first, &"a".into(), &[])
            .await
            .unwrap();
        store
            .update_vulnerabilities("snyk", second, &"b".into(), &[])
            .await
            .unwrap();

        let ops = store
            .get_update_operations(&["snyk".to_string(), "osv".to_string()])
            .await
            .unwrap();
        let snyk = &ops["snyk"];
        assert_eq!(snyk.len(), 2);
        assert_eq!(snyk[0].id, second);
        assert_eq!(snyk[0].fingerprint.as_str(), "b");
        assert!(!ops.contains_key("osv"));
    }

    #[tokio::test]
    async fn test_duplicate_operation_rejected() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store
            .update_vulnerabilities("snyk", id, &"a".into(), &[])
            .await
            .unwrap();
        assert!(store
            .update_vulnerabilities("snyk", id, &"b".into(), &[])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_only_latest_generation_is_visible() {
        let store = InMemoryStore::new();
        store
            .update_vulnerabilities(
                "snyk",
                Uuid::new_v4(),
                &"v1".into(),
                &[vuln("OLD", "foo", "pypi")],
            )
            .await
            .unwrap();
        store
            .update_vulnerabilities(
                "snyk",
                Uuid::new_v4(),
                &"v2".into(),
                &[vuln("NEW", "foo", "pypi")],
            )
            .await
            .unwrap();

        let results = store
            .get(&[record("1", "foo", "pypi")], &GetOpts::default())
            .await
            .unwrap();
        let names: Vec<&str> = results["1"].iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["NEW"]);
        assert_eq!(store.vulnerability_count("snyk").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_applies_constraints() {
        let store = InMemoryStore::new();
        store
            .update_vulnerabilities(
                "feed",
                Uuid::new_v4(),
                &"v1".into(),
                &[vuln("PY", "foo", "pypi"), vuln("MVN", "foo", "maven")],
            )
            .await
            .unwrap();

        let records = [
            record("1", "FOO", "pypi"),
            record("2", "bar", "pypi"),
            record("3", "foo", "maven"),
        ];
        let unconstrained = store.get(&records, &GetOpts::default()).await.unwrap();
        assert_eq!(unconstrained["1"].len(), 2);
        assert!(!unconstrained.contains_key("2"));

        let opts = GetOpts::with_constraints([MatchConstraint::RepositoryName]);
        let constrained = store.get(&records, &opts).await.unwrap();
        assert_eq!(constrained["1"][0].name, "PY");
        assert_eq!(constrained["3"][0].name, "MVN");
        assert_eq!(constrained["3"].len(), 1);
    }
}
