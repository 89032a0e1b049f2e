use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Create update operations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS update_operation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ref TEXT NOT NULL UNIQUE,
            updater TEXT NOT NULL,
            fingerprint TEXT NOT NULL DEFAULT '',
            date INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create vulnerabilities table; rows are immutable and shared across
    // operations through uo_vuln
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vuln (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash TEXT NOT NULL UNIQUE,
            updater TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            links TEXT NOT NULL DEFAULT '',
            severity TEXT NOT NULL DEFAULT '',
            normalized_severity TEXT NOT NULL DEFAULT 'Unknown',
            fixed_in_version TEXT NOT NULL DEFAULT '',
            package_name TEXT COLLATE NOCASE,
            package_version TEXT NOT NULL DEFAULT '',
            package_kind TEXT NOT NULL DEFAULT '',
            dist_did TEXT NOT NULL DEFAULT '',
            dist_name TEXT NOT NULL DEFAULT '',
            dist_version TEXT NOT NULL DEFAULT '',
            dist_version_code_name TEXT NOT NULL DEFAULT '',
            dist_version_id TEXT NOT NULL DEFAULT '',
            dist_arch TEXT NOT NULL DEFAULT '',
            dist_cpe TEXT NOT NULL DEFAULT '',
            dist_pretty_name TEXT NOT NULL DEFAULT '',
            repo_name TEXT NOT NULL DEFAULT '',
            repo_key TEXT NOT NULL DEFAULT '',
            repo_uri TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create association table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uo_vuln (
            uo INTEGER NOT NULL,
            vuln INTEGER NOT NULL,
            PRIMARY KEY (uo, vuln),
            FOREIGN KEY (uo) REFERENCES update_operation(id),
            FOREIGN KEY (vuln) REFERENCES vuln(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create locks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS locks (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_update_operation_updater ON update_operation(updater, id DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vuln_package_name ON vuln(package_name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_uo_vuln_vuln ON uo_vuln(vuln)")
        .execute(pool)
        .await?;

    Ok(())
}
