use std::fs::{self, File};
use std::future::Future;
use std::pin::Pin;
use std::io::{self, Write};
use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite, Transaction};

use crate::AppResult;

pub mod snapshot;

/// Build the connect options shared by every handle to a store file.
///
/// When `cipher_key` is present the SQLCipher `key` pragma is registered
/// before anything else touches the connection; sqlx orders the `key` pragma
/// first on connect, which is what SQLCipher requires.
pub fn connect_options(path: &Path, cipher_key: Option<&[u8; 32]>) -> SqliteConnectOptions {
    let mut opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_millis(5_000));
    if let Some(key) = cipher_key {
        opts = opts.pragma("key", key_pragma_literal(key));
    }
    opts
}

/// Hex-keyed SQLCipher literal: `"x'<64 hex chars>'"`.
pub fn key_pragma_literal(key: &[u8; 32]) -> String {
    format!("\"x'{}'\"", hex::encode_upper(key))
}

pub async fn open_pool(path: &Path, cipher_key: Option<&[u8; 32]>) -> AppResult<Pool<Sqlite>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            tracing::error!(
                target = "fernhill",
                error = %e,
                event = "store_dir_create_failed",
                path = %parent.display()
            );
            crate::AppError::from(e)
        })?;
    }
    tracing::info!(target = "fernhill", event = "store_path", path = %path.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(connect_options(path, cipher_key))
        .await?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "fernhill",
        event = "store_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target = "fernhill",
            event = "store_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Boxed future tied to the transaction borrow handed to `run_in_tx` closures.
pub type TxFuture<'c, R, E> = Pin<Box<dyn Future<Output = Result<R, E>> + Send + 'c>>;

/// Run work inside a transaction. Commits on success, rolls back on error.
pub async fn run_in_tx<R, E, F>(pool: &Pool<Sqlite>, f: F) -> Result<R, E>
where
    E: From<sqlx::Error>,
    F: for<'c> FnOnce(&'c mut Transaction<'static, Sqlite>) -> TxFuture<'c, R, E>,
{
    use tracing::{error, info, warn};

    let mut tx = pool.begin().await.map_err(E::from)?;
    info!(target = "fernhill", event = "db_tx_begin");
    match f(&mut tx).await {
        Ok(val) => {
            tx.commit().await.map_err(E::from)?;
            info!(target = "fernhill", event = "db_tx_commit");
            Ok(val)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                error!(target = "fernhill", event = "db_tx_rollback_failed", error = %rb);
            } else {
                warn!(target = "fernhill", event = "db_tx_rollback");
            }
            Err(e)
        }
    }
}

/// Write `bytes` to `path` via a temp file and rename, fsyncing file and
/// parent directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_literal_is_hex_quoted() {
        let key = [0xABu8; 32];
        let lit = key_pragma_literal(&key);
        assert!(lit.starts_with("\"x'AB"));
        assert!(lit.ends_with("'\""));
        // "x' + 64 hex chars + '" inside double quotes
        assert_eq!(lit.len(), 3 + 64 + 2);
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("out.bin");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("bin.tmp").exists());
    }

    #[tokio::test]
    async fn run_in_tx_rolls_back_on_error() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();

        let result: Result<(), crate::AppError> = run_in_tx(&pool, |tx| {
            Box::pin(async move {
                sqlx::query("INSERT INTO t (id) VALUES (1)")
                    .execute(&mut **tx)
                    .await?;
                Err(crate::AppError::new("TEST/FAIL", "boom"))
            })
        })
        .await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
