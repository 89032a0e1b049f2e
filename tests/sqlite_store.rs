//! SQLite store and lease lock tests against temporary databases.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use vulnsync::controller::{Controller, ControllerOpts, UpdateOutcome};
use vulnsync::locker::SqliteLocker;
use vulnsync::sqlite_store::{SqliteVulnStore, GET_BATCH_SIZE};
use vulnsync::{db, migrate};
use vulnsync_core::locker::Locker;
use vulnsync_core::models::{
    Distribution, Fingerprint, IndexRecord, NormalizedSeverity, Package, Repository,
    Vulnerability,
};
use vulnsync_core::store::{GetOpts, VulnerabilityStore};
use vulnsync_core::updater::{FeedData, FetchOutcome, Updater};
use vulnsync_core::MatchConstraint;

async fn open() -> (TempDir, SqliteVulnStore) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("data/vulnsync.sqlite"))
        .await
        .unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    (tmp, SqliteVulnStore::new(pool))
}

fn vuln(name: &str, package: &str, repo: &str) -> Vulnerability {
    Vulnerability {
        name: name.into(),
        package: Some(Package {
            name: package.into(),
            version: "<2.0".into(),
            kind: "binary".into(),
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
            kind: "binary".into(),
        },
        distribution: None,
        repository: Some(Repository::named(repo)),
    }
}

fn names(vulns: &[Vulnerability]) -> Vec<&str> {
    vulns.iter().map(|v| v.name.as_str()).collect()
}

async fn store_generation(store: &SqliteVulnStore, fingerprint: &str, vulns: &[Vulnerability]) {
    store
        .update_vulnerabilities("snyk", Uuid::new_v4(), &fingerprint.into(), vulns)
        .await
        .unwrap();
}

async fn row_count(store: &SqliteVulnStore, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(store.pool())
        .await
        .unwrap()
}

// ─── Schema ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_tmp, store) = open().await;
    migrate::migrate_pool(store.pool()).await.unwrap();
    migrate::migrate_pool(store.pool()).await.unwrap();
    assert_eq!(row_count(&store, "update_operation").await, 0);
}

// ─── Update operations ──────────────────────────────────────────────────

#[tokio::test]
async fn test_operations_newest_first() {
    let (_tmp, store) = open().await;
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
    store
        .update_vulnerabilities("osv", Uuid::new_v4(), &"x".into(), &[])
        .await
        .unwrap();

    let ops = store
        .get_update_operations(&["snyk".to_string(), "never".to_string()])
        .await
        .unwrap();
    assert_eq!(ops.len(), 1);
    let snyk = &ops["snyk"];
    assert_eq!(snyk.len(), 2);
    assert_eq!(snyk[0].id, second);
    assert_eq!(snyk[0].fingerprint.as_str(), "b");
    assert_eq!(snyk[1].id, first);

    let latest = store.latest_operation("snyk").await.unwrap().unwrap();
    assert_eq!(latest.id, second);
    assert!(store.latest_operation("never").await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_operation_id_is_rejected() {
    let (_tmp, store) = open().await;
    let id = Uuid::new_v4();
    store
        .update_vulnerabilities("snyk", id, &"a".into(), &[vuln("A", "foo", "pypi")])
        .await
        .unwrap();
    assert!(store
        .update_vulnerabilities("snyk", id, &"b".into(), &[vuln("B", "foo", "pypi")])
        .await
        .is_err());
    assert_eq!(row_count(&store, "update_operation").await, 1);
}

// ─── Generations ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_only_latest_generation_is_visible() {
    let (_tmp, store) = open().await;
    store_generation(&store, "v1", &[vuln("A", "foo", "pypi"), vuln("B", "foo", "pypi")]).await;
    store_generation(&store, "v2", &[vuln("B", "foo", "pypi"), vuln("C", "foo", "pypi")]).await;

    let results = store
        .get(&[record("1", "foo", "pypi")], &GetOpts::default())
        .await
        .unwrap();
    assert_eq!(names(&results["1"]), vec!["B", "C"]);
    assert_eq!(store.vulnerability_count("snyk").await.unwrap(), 2);

    // Identical rows are shared between generations.
    assert_eq!(row_count(&store, "vuln").await, 3);
    assert_eq!(row_count(&store, "uo_vuln").await, 4);
}

#[tokio::test]
async fn test_failed_write_leaves_previous_generation_intact() {
    let (_tmp, store) = open().await;
    store_generation(&store, "v1", &[vuln("A", "foo", "pypi")]).await;

    sqlx::query(
        r#"
        CREATE TRIGGER poison BEFORE INSERT ON vuln
        WHEN NEW.name = 'POISON'
        BEGIN
            SELECT RAISE(ABORT, 'poisoned row');
        END
        "#,
    )
    .execute(store.pool())
    .await
    .unwrap();

    let result = store
        .update_vulnerabilities(
            "snyk",
            Uuid::new_v4(),
            &"v2".into(),
            &[vuln("B", "foo", "pypi"), vuln("POISON", "foo", "pypi")],
        )
        .await;
    assert!(result.is_err());

    let ops = store
        .get_update_operations(&["snyk".to_string()])
        .await
        .unwrap();
    assert_eq!(ops["snyk"].len(), 1);
    assert_eq!(ops["snyk"][0].fingerprint.as_str(), "v1");
    assert_eq!(row_count(&store, "vuln").await, 1);
    assert_eq!(row_count(&store, "uo_vuln").await, 1);

    let results = store
        .get(&[record("1", "foo", "pypi")], &GetOpts::default())
        .await
        .unwrap();
    assert_eq!(names(&results["1"]), vec!["A"]);
}

// ─── Batched correlation ────────────────────────────────────────────────

#[tokio::test]
async fn test_results_follow_record_positions() {
    let (_tmp, store) = open().await;
    store_generation(
        &store,
        "v1",
        &[vuln("CVE-FOO", "foo", "pypi"), vuln("CVE-BAZ", "baz", "pypi")],
    )
    .await;

    let results = store
        .get(
            &[
                record("r1", "foo", "pypi"),
                record("r2", "bar", "pypi"),
                record("r3", "baz", "pypi"),
            ],
            &GetOpts::default(),
        )
        .await
        .unwrap();
    assert_eq!(names(&results["r1"]), vec!["CVE-FOO"]);
    assert!(!results.contains_key("r2"));
    assert_eq!(names(&results["r3"]), vec!["CVE-BAZ"]);
}

#[tokio::test]
async fn test_large_batches_span_chunks() {
    let (_tmp, store) = open().await;
    let total = GET_BATCH_SIZE * 2 + 17;
    let vulns: Vec<Vulnerability> = (0..total)
        .filter(|i| i % 3 == 0)
        .map(|i| vuln(&format!("CVE-{}", i), &format!("pkg-{}", i), "pypi"))
        .collect();
    store_generation(&store, "v1", &vulns).await;

    let records: Vec<IndexRecord> = (0..total)
        .map(|i| record(&format!("r{}", i), &format!("pkg-{}", i), "pypi"))
        .collect();
    let results = store.get(&records, &GetOpts::default()).await.unwrap();

    assert_eq!(results.len(), vulns.len());
    for i in 0..total {
        let key = format!("r{}", i);
        if i % 3 == 0 {
            assert_eq!(names(&results[&key]), vec![format!("CVE-{}", i).as_str()]);
        } else {
            assert!(!results.contains_key(&key));
        }
    }
}

#[tokio::test]
async fn test_names_ignore_case_and_constraints_bind() {
    let (_tmp, store) = open().await;
    store_generation(
        &store,
        "v1",
        &[vuln("PY", "foo", "pypi"), vuln("MVN", "foo", "maven")],
    )
    .await;

    let records = [record("1", "FOO", "pypi"), record("2", "foo", "maven")];
    let unconstrained = store.get(&records, &GetOpts::default()).await.unwrap();
    assert_eq!(unconstrained["1"].len(), 2);

    let opts = GetOpts::with_constraints([MatchConstraint::RepositoryName]);
    let constrained = store.get(&records, &opts).await.unwrap();
    assert_eq!(names(&constrained["1"]), vec!["PY"]);
    assert_eq!(names(&constrained["2"]), vec!["MVN"]);
}

#[tokio::test]
async fn test_stored_fields_are_preserved() {
    let (_tmp, store) = open().await;
    let full = Vulnerability {
        updater: "snyk-python".into(),
        name: "CVE-FULL".into(),
        description: "desc".into(),
        links: "https://example.com/CVE-FULL".into(),
        severity: "high".into(),
        normalized_severity: NormalizedSeverity::High,
        fixed_in_version: "2.0".into(),
        package: Some(Package {
            name: "foo".into(),
            version: "<2.0".into(),
            kind: "binary".into(),
            ..Default::default()
        }),
        dist: Some(Distribution {
            name: "debian".into(),
            version_id: "12".into(),
            ..Default::default()
        }),
        repo: Some(Repository {
            name: "pypi".into(),
            uri: "https://pypi.org/simple".into(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let bare = Vulnerability {
        name: "CVE-BARE".into(),
        ..Default::default()
    };
    store_generation(&store, "v1", &[full.clone(), bare]).await;

    let results = store
        .get(&[record("1", "foo", "pypi")], &GetOpts::default())
        .await
        .unwrap();
    let got = &results["1"];
    assert_eq!(got.len(), 1);
    assert!(!got[0].id.is_empty());
    assert_eq!(
        Vulnerability {
            id: String::new(),
            ..got[0].clone()
        },
        full
    );
    assert_eq!(store.vulnerability_count("snyk").await.unwrap(), 2);
}

#[tokio::test]
async fn test_empty_input_returns_empty_map() {
    let (_tmp, store) = open().await;
    assert!(store.get(&[], &GetOpts::default()).await.unwrap().is_empty());
    assert!(store.get_update_operations(&[]).await.unwrap().is_empty());
}

// ─── Lease lock ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_lock_excludes_other_holders() {
    let (_tmp, store) = open().await;
    let a = SqliteLocker::new(store.pool().clone(), Duration::from_secs(60));
    let b = SqliteLocker::new(store.pool().clone(), Duration::from_secs(60));

    assert!(a.try_lock("snyk").await.unwrap());
    assert!(!b.try_lock("snyk").await.unwrap());
    assert!(!a.try_lock("snyk").await.unwrap());
    assert!(b.try_lock("osv").await.unwrap());

    // Releasing a lock you don't hold is a no-op.
    b.unlock("snyk").await.unwrap();
    assert!(!b.try_lock("snyk").await.unwrap());

    a.unlock("snyk").await.unwrap();
    assert!(b.try_lock("snyk").await.unwrap());
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let (_tmp, store) = open().await;
    let crashed = SqliteLocker::new(store.pool().clone(), Duration::from_millis(1));
    let next = SqliteLocker::new(store.pool().clone(), Duration::from_secs(60));

    assert!(crashed.try_lock("snyk").await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(next.try_lock("snyk").await.unwrap());

    // The stale holder can no longer release the new lease.
    crashed.unlock("snyk").await.unwrap();
    let holder: String = sqlx::query_scalar("SELECT holder FROM locks WHERE name = 'snyk'")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(holder, next.holder());
}

#[tokio::test]
async fn test_only_the_holder_can_extend() {
    let (_tmp, store) = open().await;
    let a = SqliteLocker::new(store.pool().clone(), Duration::from_secs(60));
    let b = SqliteLocker::new(store.pool().clone(), Duration::from_secs(60));

    assert!(!a.extend("snyk").await.unwrap());
    assert!(a.try_lock("snyk").await.unwrap());
    let before: i64 = sqlx::query_scalar("SELECT expires_at FROM locks WHERE name = 'snyk'")
        .fetch_one(store.pool())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(a.extend("snyk").await.unwrap());
    assert!(!b.extend("snyk").await.unwrap());

    let after: i64 = sqlx::query_scalar("SELECT expires_at FROM locks WHERE name = 'snyk'")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert!(after > before);
    assert_eq!(a.renew_interval(), Some(Duration::from_secs(20)));
}

// ─── Controllers sharing a database ─────────────────────────────────────

/// Takes `.0` to fetch each new generation.
struct SlowUpdater(Duration);

#[async_trait]
impl Updater for SlowUpdater {
    fn name(&self) -> &str {
        "snyk"
    }

    async fn fetch(&self, hint: &Fingerprint) -> Result<FetchOutcome> {
        if hint.as_str() == "v1" {
            return Ok(FetchOutcome::Unchanged);
        }
        tokio::time::sleep(self.0).await;
        let body = serde_json::to_vec(&[vuln("CVE-X", "foo", "pypi")])?;
        Ok(FetchOutcome::Updated {
            data: Box::new(Cursor::new(body)),
            fingerprint: "v1".into(),
        })
    }

    async fn parse(&self, data: FeedData) -> Result<Vec<Vulnerability>> {
        Ok(serde_json::from_reader(data)?)
    }
}

#[tokio::test]
async fn test_controllers_with_separate_lockers_update_once() {
    let (_tmp, store) = open().await;
    let pool = store.pool().clone();
    let store: Arc<SqliteVulnStore> = Arc::new(store);

    let controllers: Vec<Controller> = (0..4)
        .map(|_| {
            Controller::new(ControllerOpts {
                name: "snyk".into(),
                updater: Arc::new(SlowUpdater(Duration::from_millis(50))),
                store: store.clone(),
                locker: Arc::new(SqliteLocker::new(pool.clone(), Duration::from_secs(60))),
                interval: Duration::from_secs(3600),
                update_on_start: false,
            })
        })
        .collect();

    let outcomes = futures::future::join_all(controllers.iter().map(|c| c.update())).await;
    let updated = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(UpdateOutcome::Updated { .. })))
        .count();
    assert_eq!(updated, 1);
    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(row_count(&store, "update_operation").await, 1);
    assert_eq!(row_count(&store, "locks").await, 0);

    assert_eq!(
        controllers[0].update().await.unwrap(),
        UpdateOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_update_outliving_its_ttl_keeps_the_lock() {
    let (_tmp, store) = open().await;
    let pool = store.pool().clone();
    let store: Arc<SqliteVulnStore> = Arc::new(store);

    let ctrl = Arc::new(Controller::new(ControllerOpts {
        name: "snyk".into(),
        updater: Arc::new(SlowUpdater(Duration::from_millis(600))),
        store: store.clone(),
        locker: Arc::new(SqliteLocker::new(pool.clone(), Duration::from_millis(150))),
        interval: Duration::from_secs(3600),
        update_on_start: false,
    }));
    let running = tokio::spawn({
        let ctrl = ctrl.clone();
        async move { ctrl.update().await }
    });

    // Well past the TTL, the lease has been renewed and cannot be taken.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let other = SqliteLocker::new(pool, Duration::from_secs(60));
    assert!(!other.try_lock("snyk").await.unwrap());

    let outcome = running.await.unwrap().unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { count: 1, .. }));
    assert_eq!(row_count(&store, "locks").await, 0);
    assert!(other.try_lock("snyk").await.unwrap());
}
