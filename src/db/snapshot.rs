use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;

use fs2::available_space;
use rusqlite::{backup::Backup, Connection, OpenFlags};

use crate::{AppError, AppResult};

const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;

/// Point-in-time copy of a store file.
///
/// Prefers the SQLite online-backup primitive, which is safe against a live,
/// open store; if that fails (e.g. the source cannot be opened through the
/// driver) it falls back to a streaming byte copy. When the source is an
/// encrypted store the key is applied to both sides, so the snapshot stays
/// ciphertext under the same key.
pub fn snapshot_store(src: &Path, dest: &Path, cipher_key: Option<&[u8; 32]>) -> AppResult<()> {
    let src_size = fs::metadata(src)
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "snapshot_src_metadata")
                .with_context("path", src.display().to_string())
        })?
        .len();
    ensure_free_space(dest, src_size)?;

    if dest.exists() {
        fs::remove_file(dest).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "remove_stale_snapshot")
                .with_context("path", dest.display().to_string())
        })?;
    }

    match online_backup(src, dest, cipher_key) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::warn!(
                target: "fernhill",
                event = "snapshot_fallback_copy",
                error = %err,
                src = %src.display()
            );
            let _ = fs::remove_file(dest);
            streaming_copy(src, dest)
        }
    }
}

fn ensure_free_space(dest: &Path, src_size: u64) -> AppResult<()> {
    let probe = dest
        .parent()
        .filter(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::env::temp_dir());
    let available = available_space(&probe).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", probe.display().to_string())
    })?;
    let required = ((src_size as f64) * REQUIRED_FREE_MULTIPLIER).ceil() as u64;
    if available < required {
        return Err(AppError::new(
            "DB_SNAPSHOT/LOW_DISK",
            "Not enough disk space for a snapshot",
        )
        .with_context("available_bytes", available.to_string())
        .with_context("required_bytes", required.to_string()));
    }
    Ok(())
}

fn apply_key(conn: &Connection, cipher_key: Option<&[u8; 32]>) -> rusqlite::Result<()> {
    if let Some(key) = cipher_key {
        conn.execute_batch(&format!(
            "PRAGMA key = \"x'{}'\";",
            hex::encode_upper(key)
        ))?;
    }
    Ok(())
}

fn online_backup(src: &Path, dest: &Path, cipher_key: Option<&[u8; 32]>) -> AppResult<()> {
    let src_flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI;
    let src_conn = Connection::open_with_flags(src, src_flags).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_snapshot_source")
            .with_context("path", src.display().to_string())
    })?;
    apply_key(&src_conn, cipher_key)
        .map_err(|err| AppError::from(err).with_context("operation", "key_snapshot_source"))?;
    // Force a read so a wrong/missing key surfaces here, not mid-backup.
    src_conn
        .query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))
        .map_err(|err| AppError::from(err).with_context("operation", "probe_snapshot_source"))?;

    let mut dest_conn = Connection::open(dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_snapshot_dest")
            .with_context("path", dest.display().to_string())
    })?;
    apply_key(&dest_conn, cipher_key)
        .map_err(|err| AppError::from(err).with_context("operation", "key_snapshot_dest"))?;

    {
        let backup = Backup::new(&src_conn, &mut dest_conn)
            .map_err(|err| AppError::from(err).with_context("operation", "snapshot_init"))?;
        backup
            .run_to_completion(100, Duration::from_millis(10), None)
            .map_err(|err| AppError::from(err).with_context("operation", "snapshot_step"))?;
    }

    // Keep the snapshot a single file.
    dest_conn.execute_batch("PRAGMA journal_mode=DELETE;").ok();

    dest_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_snapshot_dest"))?;
    src_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_snapshot_source"))?;

    Ok(())
}

fn streaming_copy(src: &Path, dest: &Path) -> AppResult<()> {
    let mut input = File::open(src).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_copy_source")
            .with_context("path", src.display().to_string())
    })?;
    let mut output = File::create(dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_copy_dest")
            .with_context("path", dest.display().to_string())
    })?;
    io::copy(&mut input, &mut output)
        .map_err(|err| AppError::from(err).with_context("operation", "stream_copy"))?;
    output
        .sync_all()
        .map_err(|err| AppError::from(err).with_context("operation", "sync_copy_dest"))?;
    Ok(())
}
