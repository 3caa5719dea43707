use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{error, info};

use crate::db::snapshot::snapshot_store;
use crate::{AppError, AppResult};

/// One schema step. Versions are contiguous positive integers; `sql` may hold
/// several `;`-separated statements.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Where the store lives on disk, for the pre-migration snapshot. `None` for
/// transient (in-memory) stores.
pub struct SnapshotSource<'a> {
    pub path: &'a Path,
    pub cipher_key: Option<&'a [u8; 32]>,
}

impl<'a> SnapshotSource<'a> {
    pub fn snapshot_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".bak");
        PathBuf::from(os)
    }
}

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.len() > 160 {
        format!("{}…", &trimmed[..160])
    } else {
        trimmed.to_string()
    }
}

static ADD_COL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)").unwrap());

fn validate_contiguous(migrations: &'static [Migration]) -> AppResult<()> {
    for (i, m) in migrations.iter().enumerate() {
        let expected = i as i64 + 1;
        if m.version != expected {
            return Err(AppError::new(
                "DB_MIGRATE/BAD_VERSION",
                format!(
                    "migration `{}` has version {} where {} was expected",
                    m.name, m.version, expected
                ),
            ));
        }
    }
    Ok(())
}

async fn ensure_version_table(pool: &SqlitePool) -> AppResult<()> {
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'",
    )
    .fetch_optional(pool)
    .await?;
    if exists.is_none() {
        sqlx::query("CREATE TABLE schema_version (version INTEGER NOT NULL)")
            .execute(pool)
            .await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (0)")
            .execute(pool)
            .await?;
    }
    Ok(())
}

pub async fn current_version(pool: &SqlitePool) -> AppResult<i64> {
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'",
    )
    .fetch_optional(pool)
    .await?;
    if exists.is_none() {
        return Ok(0);
    }
    let row = sqlx::query("SELECT version FROM schema_version")
        .fetch_one(pool)
        .await?;
    Ok(row.try_get::<i64, _>("version")?)
}

async fn apply_one(
    tx: &mut Transaction<'static, Sqlite>,
    migration: &Migration,
) -> AppResult<()> {
    let cleaned = migration
        .sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n");

    for stmt in cleaned.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        let upper = s.to_ascii_uppercase();
        if upper == "BEGIN" || upper == "COMMIT" {
            continue;
        }
        if let Some(caps) = ADD_COL_RE.captures(s) {
            let table = caps.get(1).unwrap().as_str();
            let col = caps.get(2).unwrap().as_str();
            let exists: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT 1 FROM pragma_table_info('{table}') WHERE name='{col}'"
            ))
            .fetch_optional(&mut **tx)
            .await?;
            if exists.is_some() {
                info!(target = "fernhill", event = "migration_stmt_skip", name = %migration.name, sql = %preview(s));
                continue;
            }
        }
        info!(target = "fernhill", event = "migration_stmt", name = %migration.name, sql = %preview(s));
        if let Err(e) = sqlx::query(s).execute(&mut **tx).await {
            error!(target = "fernhill", event = "migration_stmt_error", name = %migration.name, sql = %preview(s), error = %e);
            return Err(e.into());
        }
    }

    sqlx::query("UPDATE schema_version SET version = ?")
        .bind(migration.version)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Bring the store current.
///
/// Unless the store is transient, a defensive snapshot is written to
/// `<path>.bak` first (any stale snapshot is deleted — it may not open under
/// the current key). All pending migrations then run inside one transaction,
/// advancing the persisted version after each; any failure rolls the whole
/// batch back and surfaces as fatal. A second call on a current store
/// performs zero writes.
pub async fn migrate(
    pool: &SqlitePool,
    source: Option<SnapshotSource<'_>>,
    migrations: &'static [Migration],
) -> AppResult<()> {
    validate_contiguous(migrations)?;

    let target = migrations.last().map(|m| m.version).unwrap_or(0);
    let version = current_version(pool).await?;
    if version >= target {
        info!(target = "fernhill", event = "migration_current", version);
        return Ok(());
    }

    if let Some(source) = source {
        let bak = source.snapshot_path();
        snapshot_store(source.path, &bak, source.cipher_key).map_err(|err| {
            AppError::new("DB_MIGRATE/SNAPSHOT_FAILED", "Pre-migration snapshot failed")
                .with_context("path", bak.display().to_string())
                .with_cause(err)
        })?;
        info!(target = "fernhill", event = "migration_snapshot", path = %bak.display());
    }

    ensure_version_table(pool).await?;

    let pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > version).collect();
    let result: AppResult<()> = crate::db::run_in_tx(pool, move |tx| {
        Box::pin(async move {
            for migration in pending {
                apply_one(tx, migration).await?;
                info!(
                    target = "fernhill",
                    event = "migration_applied",
                    name = %migration.name,
                    version = migration.version
                );
            }
            Ok(())
        })
    })
    .await;

    result.map_err(|err| {
        AppError::new("DB_MIGRATE/FAILED", "Schema migration failed")
            .with_context("from_version", version.to_string())
            .with_context("target_version", target.to_string())
            .with_cause(err)
    })
}
