use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Local, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::snapshot::snapshot_store;
use crate::remote::RemoteStorage;
use crate::schedule::ScheduleSpec;
use crate::time::now_ms;
use crate::vault::Vault;
use crate::{AppError, AppResult};

pub const LOCAL_BACKUP_PREFIX: &str = "fernhill-auto-backup-";
pub const CLOUD_BACKUP_PREFIX: &str = "fernhill-cloud-backup-";
pub const BACKUP_SUFFIX: &str = ".db";
const BACKUP_DIR_NAME: &str = "backups";
const PARTIAL_SUFFIX: &str = ".partial";
const RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub name: String,
    pub path: String,
    pub modified_at: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum JobName {
    Local,
    Cloud,
}

impl JobName {
    fn as_str(self) -> &'static str {
        match self {
            JobName::Local => "local",
            JobName::Cloud => "cloud",
        }
    }
}

/// Timed and on-demand backups against the live store.
///
/// The "local" and "cloud" jobs run on independent timers; a reschedule
/// replaces only the sleeping timer task, never an in-flight backup (each
/// tick runs detached). Backup failures are logged and audited but never
/// propagate to the caller or terminate the scheduler.
pub struct BackupScheduler {
    vault: Arc<Vault>,
    remote: Arc<dyn RemoteStorage>,
    data_dir: PathBuf,
    jobs: Mutex<HashMap<JobName, JoinHandle<()>>>,
}

impl BackupScheduler {
    pub fn new(vault: Arc<Vault>, remote: Arc<dyn RemoteStorage>, data_dir: impl Into<PathBuf>) -> Self {
        BackupScheduler {
            vault,
            remote,
            data_dir: data_dir.into(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join(BACKUP_DIR_NAME)
    }

    pub fn schedule_local(self: &Arc<Self>, spec: ScheduleSpec) {
        self.schedule(JobName::Local, spec);
    }

    pub fn schedule_cloud(self: &Arc<Self>, spec: ScheduleSpec) {
        self.schedule(JobName::Cloud, spec);
    }

    fn schedule(self: &Arc<Self>, name: JobName, spec: ScheduleSpec) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = jobs.remove(&name) {
            previous.abort();
        }
        info!(
            target: "fernhill",
            event = "backup_job_scheduled",
            job = name.as_str(),
            schedule = %spec
        );
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = spec.next_after(now) else {
                    warn!(
                        target: "fernhill",
                        event = "backup_job_exhausted",
                        job = name.as_str()
                    );
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                // Detach the tick so rescheduling only kills the sleeper; an
                // in-flight backup always finishes or fails on its own.
                let tick = Arc::clone(&me);
                tokio::spawn(async move {
                    match name {
                        JobName::Local => tick.local_backup().await,
                        JobName::Cloud => {
                            if tick.remote.is_authenticated() {
                                tick.cloud_backup().await;
                            } else {
                                debug!(
                                    target: "fernhill",
                                    event = "cloud_backup_skipped",
                                    reason = "unauthenticated"
                                );
                            }
                        }
                    }
                });
            }
        });
        jobs.insert(name, handle);
    }

    /// On-demand backup: local first, cloud only when the remote collaborator
    /// is already authenticated. Each step's failure is isolated.
    pub async fn run_backup(&self) {
        self.local_backup().await;
        if self.remote.is_authenticated() {
            self.cloud_backup().await;
        } else {
            debug!(
                target: "fernhill",
                event = "cloud_backup_skipped",
                reason = "unauthenticated"
            );
        }
    }

    /// Best-effort teardown variant. Identical to `run_backup`; the
    /// authentication check is a pure flag read, so shutdown never blocks on
    /// an interactive flow.
    pub async fn backup_on_shutdown(&self) {
        info!(target: "fernhill", event = "backup_on_shutdown");
        self.run_backup().await;
    }

    /// Timestamped local snapshot plus retention sweep. Never throws.
    pub async fn local_backup(&self) {
        match self.local_backup_inner().await {
            Ok(path) => {
                info!(target: "fernhill", event = "local_backup_ok", path = %path.display());
                self.audit("local", "ok", &path.display().to_string()).await;
            }
            Err(err) => {
                warn!(target: "fernhill", event = "local_backup_failed", error = %err);
                self.audit("local", "failed", &err.to_string()).await;
            }
        }
    }

    async fn local_backup_inner(&self) -> AppResult<PathBuf> {
        let src = self
            .vault
            .store_path()
            .ok_or_else(|| AppError::new(AppError::LOCKED, "Store is locked"))?;
        let key = self.vault.store_key();

        let dir = self.backups_dir();
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_backups_dir")
                .with_context("path", dir.display().to_string())
        })?;

        let name = format!("{LOCAL_BACKUP_PREFIX}{}{BACKUP_SUFFIX}", timestamp());
        let dest = dir.join(&name);
        let key_owned = key.as_ref().map(|k| *k.as_bytes());
        let src_clone = src.clone();
        let dest_clone = dest.clone();
        tokio::task::spawn_blocking(move || {
            snapshot_store(&src_clone, &dest_clone, key_owned.as_ref())
        })
        .await
        .map_err(|err| {
            AppError::new("DB_BACKUP/TASK", "Backup task panicked")
                .with_context("error", err.to_string())
        })??;

        self.prune_older_than(Utc::now() - Duration::days(RETENTION_DAYS));
        Ok(dest)
    }

    /// Delete local backups whose last-modified time predates `cutoff`.
    /// Age-based only; the file count is never considered.
    fn prune_older_than(&self, cutoff: DateTime<Utc>) {
        let dir = self.backups_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(target: "fernhill", event = "backup_prune_read_failed", error = %err);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !(name.starts_with(LOCAL_BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX)) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if DateTime::<Utc>::from(modified) < cutoff {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(
                        target: "fernhill",
                        event = "backup_prune_failed",
                        path = %path.display(),
                        error = %err
                    );
                } else {
                    info!(target: "fernhill", event = "backup_pruned", path = %path.display());
                }
            }
        }
    }

    /// Upload a timestamped snapshot to the remote collaborator. Never throws.
    pub async fn cloud_backup(&self) {
        match self.cloud_backup_inner().await {
            Ok(name) => {
                info!(target: "fernhill", event = "cloud_backup_ok", name = %name);
                self.audit("cloud", "ok", &name).await;
            }
            Err(err) => {
                warn!(target: "fernhill", event = "cloud_backup_failed", error = %err);
                self.audit("cloud", "failed", &err.to_string()).await;
            }
        }
    }

    async fn cloud_backup_inner(&self) -> AppResult<String> {
        let src = self
            .vault
            .store_path()
            .ok_or_else(|| AppError::new(AppError::LOCKED, "Store is locked"))?;
        fs::metadata(&src).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "cloud_backup_source")
                .with_context("path", src.display().to_string())
        })?;
        if !self.remote.is_authenticated() {
            return Err(AppError::new(
                "REMOTE/UNAUTHENTICATED",
                "Remote storage is not connected",
            ));
        }

        let dir = self.backups_dir();
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_backups_dir")
                .with_context("path", dir.display().to_string())
        })?;

        let name = format!("{CLOUD_BACKUP_PREFIX}{}{BACKUP_SUFFIX}", timestamp());
        let staging = dir.join(format!("{name}{PARTIAL_SUFFIX}"));
        let key = self.vault.store_key();
        let key_owned = key.as_ref().map(|k| *k.as_bytes());
        let src_clone = src.clone();
        let staging_clone = staging.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            snapshot_store(&src_clone, &staging_clone, key_owned.as_ref())
        })
        .await
        .map_err(|err| {
            AppError::new("DB_BACKUP/TASK", "Backup task panicked")
                .with_context("error", err.to_string())
        })?;
        if let Err(err) = snapshot {
            let _ = fs::remove_file(&staging);
            return Err(err);
        }

        let uploaded = self.remote.upload(&staging, &name).await;
        let _ = fs::remove_file(&staging);
        uploaded?;
        Ok(name)
    }

    /// Existing local backup files matching the naming convention, newest
    /// first.
    pub fn list_backups(&self) -> AppResult<Vec<BackupFile>> {
        let dir = self.backups_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_backups_dir")
                .with_context("path", dir.display().to_string())
        })? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target: "fernhill", event = "skip_invalid_backup_entry", error = %err);
                    continue;
                }
            };
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if !(name.starts_with(LOCAL_BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX)) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let modified_at = meta
                .modified()
                .map(|m| DateTime::<Utc>::from(m).timestamp_millis())
                .unwrap_or(0);
            out.push(BackupFile {
                name,
                path: path.display().to_string(),
                modified_at,
                size: meta.len(),
            });
        }
        out.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then(b.name.cmp(&a.name)));
        Ok(out)
    }

    /// Overwrite the live store with a backup's bytes.
    ///
    /// Closes the vault handle first; the caller must treat every in-memory
    /// handle as invalid afterwards and fully restart before reopening.
    pub async fn restore(&self, backup_path: &Path) -> AppResult<PathBuf> {
        fs::metadata(backup_path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "restore_source")
                .with_context("path", backup_path.display().to_string())
        })?;

        let target = self
            .vault
            .store_path()
            .unwrap_or_else(|| self.vault.default_store_path());
        self.vault.close().await;

        fs::copy(backup_path, &target).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "restore_copy")
                .with_context("from", backup_path.display().to_string())
                .with_context("to", target.display().to_string())
        })?;
        remove_sidecars(&target);

        info!(
            target: "fernhill",
            event = "store_restored",
            from = %backup_path.display(),
            to = %target.display()
        );
        Ok(target)
    }

    /// Best-effort audit row; failures are logged and swallowed.
    async fn audit(&self, destination: &str, outcome: &str, detail: &str) {
        let Ok(pool) = self.vault.store() else {
            debug!(
                target: "fernhill",
                event = "backup_audit_skipped",
                reason = "store locked"
            );
            return;
        };
        let result = sqlx::query(
            "INSERT INTO backup_audit (destination, outcome, detail, created_at)\
             VALUES (?, ?, ?, ?)",
        )
        .bind(destination)
        .bind(outcome)
        .bind(detail)
        .bind(now_ms())
        .execute(&pool)
        .await;
        if let Err(err) = result {
            warn!(target: "fernhill", event = "backup_audit_failed", error = %err);
        }
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn remove_sidecars(store_path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut os = store_path.as_os_str().to_owned();
        os.push(suffix);
        let sidecar = PathBuf::from(os);
        match fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    target: "fernhill",
                    event = "restore_sidecar_remove_failed",
                    path = %sidecar.display(),
                    error = %err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteObject;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct OfflineRemote;

    #[async_trait]
    impl RemoteStorage for OfflineRemote {
        fn is_authenticated(&self) -> bool {
            false
        }
        async fn upload(&self, _path: &Path, _name: &str) -> AppResult<RemoteObject> {
            panic!("upload must not be called while unauthenticated");
        }
        async fn list(&self) -> AppResult<Vec<RemoteObject>> {
            Ok(Vec::new())
        }
        async fn download(&self, _id: &str, _dest: &Path) -> AppResult<()> {
            Ok(())
        }
    }

    fn scheduler(dir: &Path) -> Arc<BackupScheduler> {
        Arc::new(BackupScheduler::new(
            Arc::new(Vault::new(dir)),
            Arc::new(OfflineRemote),
            dir,
        ))
    }

    #[test]
    fn backup_names_follow_convention() {
        let name = format!("{LOCAL_BACKUP_PREFIX}{}{BACKUP_SUFFIX}", timestamp());
        assert!(name.starts_with("fernhill-auto-backup-"));
        assert!(name.ends_with(".db"));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let tmp = tempdir().unwrap();
        let sched = scheduler(tmp.path());
        let dir = sched.backups_dir();
        fs::create_dir_all(&dir).unwrap();

        fs::write(dir.join("fernhill-auto-backup-20240101-000000.db"), b"a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.join("fernhill-auto-backup-20240201-000000.db"), b"bb").unwrap();
        fs::write(dir.join("unrelated.txt"), b"x").unwrap();
        fs::write(dir.join("fernhill-cloud-backup-20240301-000000.db.partial"), b"y").unwrap();

        let listed = sched.list_backups().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "fernhill-auto-backup-20240201-000000.db");
        assert_eq!(listed[0].size, 2);
    }

    #[tokio::test]
    async fn prune_is_age_based_never_count_based() {
        let tmp = tempdir().unwrap();
        let sched = scheduler(tmp.path());
        let dir = sched.backups_dir();
        fs::create_dir_all(&dir).unwrap();

        for i in 0..5 {
            fs::write(
                dir.join(format!("fernhill-auto-backup-2024010{i}-000000.db")),
                b"x",
            )
            .unwrap();
        }
        fs::write(dir.join("keepme.txt"), b"x").unwrap();

        // Cutoff in the past: everything was just written, nothing goes.
        sched.prune_older_than(Utc::now() - Duration::days(30));
        assert_eq!(sched.list_backups().unwrap().len(), 5);

        // Cutoff in the future: every matching file is older than it.
        sched.prune_older_than(Utc::now() + Duration::days(1));
        assert_eq!(sched.list_backups().unwrap().len(), 0);
        assert!(dir.join("keepme.txt").exists());
    }

    #[tokio::test]
    async fn run_backup_on_locked_vault_does_not_panic() {
        let tmp = tempdir().unwrap();
        let sched = scheduler(tmp.path());
        // Locked vault: local step fails internally, cloud step is skipped
        // because the remote reports unauthenticated (upload would panic).
        sched.run_backup().await;
    }
}
