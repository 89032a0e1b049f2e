//! SQLite-backed [`VulnerabilityStore`].
//!
//! Vulnerability rows are immutable and de-duplicated by a SHA-256 content
//! hash. Each update operation is linked to the complete set it produced
//! through `uo_vuln`; the current generation of an updater is whatever is
//! linked to its most recent operation. A write is one transaction, so a
//! reader sees either the previous generation or the new one.
//!
//! Correlation is set-oriented: records are bound into a `VALUES` CTE that
//! carries each record's position, and result rows are routed back by that
//! position rather than by any value in the row.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use vulnsync_core::matcher::MatchConstraint;
use vulnsync_core::models::{
    Distribution, Fingerprint, IndexRecord, NormalizedSeverity, Package, Repository,
    UpdateOperation, Vulnerability,
};
use vulnsync_core::store::{GetOpts, VulnerabilityStore};

/// Records bound per statement in [`SqliteVulnStore::get`].
pub const GET_BATCH_SIZE: usize = 256;

const VULN_COLUMNS: &str = "vuln.id, vuln.updater, vuln.name, vuln.description, vuln.links, \
     vuln.severity, vuln.normalized_severity, vuln.fixed_in_version, vuln.package_name, \
     vuln.package_version, vuln.package_kind, vuln.dist_did, vuln.dist_name, vuln.dist_version, \
     vuln.dist_version_code_name, vuln.dist_version_id, vuln.dist_arch, vuln.dist_cpe, \
     vuln.dist_pretty_name, vuln.repo_name, vuln.repo_key, vuln.repo_uri";

pub struct SqliteVulnStore {
    pool: SqlitePool,
}

impl SqliteVulnStore {
    /// Wrap a pool whose schema has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Most recent operation recorded for `updater`.
    pub async fn latest_operation(&self, updater: &str) -> Result<Option<UpdateOperation>> {
        let row = sqlx::query(
            "SELECT ref, updater, fingerprint, date FROM update_operation WHERE updater = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(updater)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(operation_from_row).transpose()
    }

    /// Size of the current generation of `updater`.
    pub async fn vulnerability_count(&self, updater: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM uo_vuln
            WHERE uo = (SELECT MAX(id) FROM update_operation WHERE updater = ?)
            "#,
        )
        .bind(updater)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl VulnerabilityStore for SqliteVulnStore {
    async fn get_update_operations(
        &self,
        updaters: &[String],
    ) -> Result<HashMap<String, Vec<UpdateOperation>>> {
        let mut out: HashMap<String, Vec<UpdateOperation>> = HashMap::new();
        if updaters.is_empty() {
            return Ok(out);
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT ref, updater, fingerprint, date FROM update_operation WHERE updater IN (",
        );
        let mut names = qb.separated(", ");
        for name in updaters {
            names.push_bind(name.as_str());
        }
        qb.push(") ORDER BY id DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        for row in &rows {
            let op = operation_from_row(row)?;
            out.entry(op.updater.clone()).or_default().push(op);
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
        let mut tx = self.pool.begin().await?;

        let uo: i64 = sqlx::query_scalar(
            "INSERT INTO update_operation (ref, updater, fingerprint, date) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(operation_id.to_string())
        .bind(updater)
        .bind(fingerprint.as_str())
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("recording update operation {}", operation_id))?;

        for vuln in vulns {
            let owner = if vuln.updater.is_empty() {
                updater
            } else {
                vuln.updater.as_str()
            };
            let hash = content_hash(owner, vuln);
            let package = vuln.package.as_ref();
            let dist = vuln.dist.clone().unwrap_or_default();
            let repo = vuln.repo.clone().unwrap_or_default();

            sqlx::query(
                r#"
                INSERT INTO vuln (
                    hash, updater, name, description, links, severity, normalized_severity,
                    fixed_in_version, package_name, package_version, package_kind,
                    dist_did, dist_name, dist_version, dist_version_code_name, dist_version_id,
                    dist_arch, dist_cpe, dist_pretty_name, repo_name, repo_key, repo_uri
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(hash) DO NOTHING
                "#,
            )
            .bind(&hash)
            .bind(owner)
            .bind(&vuln.name)
            .bind(&vuln.description)
            .bind(&vuln.links)
            .bind(&vuln.severity)
            .bind(vuln.normalized_severity.as_str())
            .bind(&vuln.fixed_in_version)
            .bind(package.map(|p| p.name.as_str()))
            .bind(package.map(|p| p.version.as_str()).unwrap_or(""))
            .bind(package.map(|p| p.kind.as_str()).unwrap_or(""))
            .bind(&dist.did)
            .bind(&dist.name)
            .bind(&dist.version)
            .bind(&dist.version_code_name)
            .bind(&dist.version_id)
            .bind(&dist.arch)
            .bind(&dist.cpe)
            .bind(&dist.pretty_name)
            .bind(&repo.name)
            .bind(&repo.key)
            .bind(&repo.uri)
            .execute(&mut *tx)
            .await?;

            let vuln_id: i64 = sqlx::query_scalar("SELECT id FROM vuln WHERE hash = ?")
                .bind(&hash)
                .fetch_one(&mut *tx)
                .await?;

            sqlx::query("INSERT OR IGNORE INTO uo_vuln (uo, vuln) VALUES (?, ?)")
                .bind(uo)
                .bind(vuln_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        tracing::debug!(
            updater,
            update_operation_id = %operation_id,
            count = vulns.len(),
            "stored vulnerability generation"
        );
        Ok(())
    }

    async fn get(
        &self,
        records: &[IndexRecord],
        opts: &GetOpts,
    ) -> Result<HashMap<String, Vec<Vulnerability>>> {
        let mut results: HashMap<String, Vec<Vulnerability>> = HashMap::new();
        if records.is_empty() {
            return Ok(results);
        }
        let constraints: Vec<MatchConstraint> = opts.constraints.iter().copied().collect();

        // All chunks read the same snapshot.
        let mut tx = self.pool.begin().await?;
        for (chunk_no, chunk) in records.chunks(GET_BATCH_SIZE).enumerate() {
            let offset = chunk_no * GET_BATCH_SIZE;
            let mut qb = build_get_query(chunk, offset, &constraints);
            let rows = qb.build().fetch_all(&mut *tx).await?;

            for row in &rows {
                let idx: i64 = row.try_get("idx")?;
                let record = usize::try_from(idx)
                    .ok()
                    .and_then(|i| records.get(i))
                    .ok_or_else(|| anyhow!("correlation row for unknown record index {}", idx))?;
                results
                    .entry(record.id().to_string())
                    .or_default()
                    .push(vuln_from_row(row)?);
            }
        }
        tx.commit().await?;

        Ok(results)
    }
}

fn build_get_query<'a>(
    chunk: &'a [IndexRecord],
    offset: usize,
    constraints: &[MatchConstraint],
) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::<Sqlite>::new("WITH recs(idx, name");
    for i in 0..constraints.len() {
        qb.push(format!(", c{}", i));
    }
    qb.push(") AS (");
    qb.push_values(chunk.iter().enumerate(), |mut b, (i, record)| {
        b.push_bind((offset + i) as i64);
        b.push_bind(record.package.name.as_str());
        for c in constraints {
            b.push_bind(c.record_value(record));
        }
    });
    qb.push(
        "), latest(uo) AS (SELECT MAX(id) FROM update_operation GROUP BY updater) \
         SELECT recs.idx, ",
    );
    qb.push(VULN_COLUMNS);
    qb.push(
        " FROM recs \
         JOIN vuln ON vuln.package_name = recs.name COLLATE NOCASE \
         JOIN uo_vuln ON uo_vuln.vuln = vuln.id \
         JOIN latest ON latest.uo = uo_vuln.uo",
    );
    for (i, c) in constraints.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        qb.push(format!("vuln.{} = recs.c{}", constraint_column(c), i));
    }
    qb.push(" ORDER BY recs.idx, vuln.id");
    qb
}

fn constraint_column(constraint: &MatchConstraint) -> &'static str {
    match constraint {
        MatchConstraint::DistributionDid => "dist_did",
        MatchConstraint::DistributionName => "dist_name",
        MatchConstraint::DistributionVersion => "dist_version",
        MatchConstraint::DistributionVersionCodeName => "dist_version_code_name",
        MatchConstraint::DistributionVersionId => "dist_version_id",
        MatchConstraint::DistributionArch => "dist_arch",
        MatchConstraint::DistributionCpe => "dist_cpe",
        MatchConstraint::DistributionPrettyName => "dist_pretty_name",
        MatchConstraint::RepositoryName => "repo_name",
        MatchConstraint::RepositoryKey => "repo_key",
        MatchConstraint::RepositoryUri => "repo_uri",
    }
}

/// SHA-256 over every stored field of a vulnerability.
fn content_hash(updater: &str, vuln: &Vulnerability) -> String {
    let package = vuln.package.as_ref();
    let dist = vuln.dist.clone().unwrap_or_default();
    let repo = vuln.repo.clone().unwrap_or_default();
    let fields: [&str; 22] = [
        updater,
        &vuln.name,
        &vuln.description,
        &vuln.links,
        &vuln.severity,
        vuln.normalized_severity.as_str(),
        &vuln.fixed_in_version,
        if package.is_some() { "1" } else { "0" },
        package.map(|p| p.name.as_str()).unwrap_or(""),
        package.map(|p| p.version.as_str()).unwrap_or(""),
        package.map(|p| p.kind.as_str()).unwrap_or(""),
        &dist.did,
        &dist.name,
        &dist.version,
        &dist.version_code_name,
        &dist.version_id,
        &dist.arch,
        &dist.cpe,
        &dist.pretty_name,
        &repo.name,
        &repo.key,
        &repo.uri,
    ];

    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

fn operation_from_row(row: &SqliteRow) -> Result<UpdateOperation> {
    let reference: String = row.try_get("ref")?;
    let date_ms: i64 = row.try_get("date")?;
    Ok(UpdateOperation {
        id: Uuid::parse_str(&reference)
            .with_context(|| format!("invalid update operation ref '{}'", reference))?,
        updater: row.try_get("updater")?,
        fingerprint: Fingerprint::new(row.try_get::<String, _>("fingerprint")?),
        date: DateTime::<Utc>::from_timestamp_millis(date_ms)
            .ok_or_else(|| anyhow!("invalid update operation date {}", date_ms))?,
    })
}

fn vuln_from_row(row: &SqliteRow) -> Result<Vulnerability> {
    let id: i64 = row.try_get("id")?;
    let severity_label: String = row.try_get("normalized_severity")?;
    let package_name: Option<String> = row.try_get("package_name")?;

    let package = match package_name {
        Some(name) => Some(Package {
            id: String::new(),
            name,
            version: row.try_get("package_version")?,
            kind: row.try_get("package_kind")?,
        }),
        None => None,
    };
    let dist = Distribution {
        did: row.try_get("dist_did")?,
        name: row.try_get("dist_name")?,
        version: row.try_get("dist_version")?,
        version_code_name: row.try_get("dist_version_code_name")?,
        version_id: row.try_get("dist_version_id")?,
        arch: row.try_get("dist_arch")?,
        cpe: row.try_get("dist_cpe")?,
        pretty_name: row.try_get("dist_pretty_name")?,
    };
    let repo = Repository {
        name: row.try_get("repo_name")?,
        key: row.try_get("repo_key")?,
        uri: row.try_get("repo_uri")?,
    };

    Ok(Vulnerability {
        id: id.to_string(),
        updater: row.try_get("updater")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        links: row.try_get("links")?,
        severity: row.try_get("severity")?,
        normalized_severity: NormalizedSeverity::from_label(&severity_label),
        fixed_in_version: row.try_get("fixed_in_version")?,
        package,
        dist: (!dist.is_empty()).then_some(dist),
        repo: (!repo.is_empty()).then_some(repo),
    })
}
