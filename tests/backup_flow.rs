mod util;

use std::sync::Arc;

use fernhill_lib::backup::{BackupScheduler, CLOUD_BACKUP_PREFIX, LOCAL_BACKUP_PREFIX};
use fernhill_lib::migrate::{self, SnapshotSource};
use fernhill_lib::schema::LOCAL_MIGRATIONS;
use fernhill_lib::settings::{self, Settings};
use fernhill_lib::vault::Vault;
use tempfile::tempdir;
use util::RecordingRemote;

async fn unlocked_vault(dir: &std::path::Path) -> Arc<Vault> {
    let vault = Arc::new(Vault::new(dir));
    vault.initialize("backup pw", None).await.unwrap();
    let pool = vault.store().unwrap();
    let path = vault.store_path().unwrap();
    migrate::migrate(
        &pool,
        Some(SnapshotSource {
            path: &path,
            cipher_key: None,
        }),
        LOCAL_MIGRATIONS,
    )
    .await
    .unwrap();
    vault
}

async fn audit_rows(pool: &sqlx::SqlitePool) -> Vec<(String, String)> {
    sqlx::query_as("SELECT destination, outcome FROM backup_audit ORDER BY id")
        .fetch_all(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn local_backup_writes_artifact_and_audit_row() {
    let tmp = tempdir().unwrap();
    let vault = unlocked_vault(tmp.path()).await;
    let remote = Arc::new(RecordingRemote::new(false));
    let scheduler = Arc::new(BackupScheduler::new(vault.clone(), remote, tmp.path()));

    scheduler.local_backup().await;

    let backups = scheduler.list_backups().unwrap();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].name.starts_with(LOCAL_BACKUP_PREFIX));
    assert!(backups[0].name.ends_with(".db"));
    assert!(backups[0].size > 0);

    let rows = audit_rows(&vault.store().unwrap()).await;
    assert_eq!(rows, vec![("local".to_string(), "ok".to_string())]);

    vault.close().await;
}

#[tokio::test]
async fn run_backup_skips_cloud_when_unauthenticated() {
    let tmp = tempdir().unwrap();
    let vault = unlocked_vault(tmp.path()).await;
    // RecordingRemote panics on upload while unauthenticated, so reaching
    // the assertion below proves no upload was attempted.
    let remote = Arc::new(RecordingRemote::new(false));
    let scheduler = Arc::new(BackupScheduler::new(vault.clone(), remote.clone(), tmp.path()));

    scheduler.run_backup().await;

    assert_eq!(remote.upload_count(), 0);
    assert_eq!(scheduler.list_backups().unwrap().len(), 1);
    vault.close().await;
}

#[tokio::test]
async fn run_backup_uploads_when_authenticated() {
    let tmp = tempdir().unwrap();
    let vault = unlocked_vault(tmp.path()).await;
    let remote = Arc::new(RecordingRemote::new(true));
    let scheduler = Arc::new(BackupScheduler::new(vault.clone(), remote.clone(), tmp.path()));

    scheduler.run_backup().await;

    let uploads = remote.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].starts_with(CLOUD_BACKUP_PREFIX));
    assert!(uploads[0].ends_with(".db"));

    // The staging file is cleaned up after the upload.
    let staging_left = std::fs::read_dir(scheduler.backups_dir())
        .unwrap()
        .flatten()
        .any(|e| e.file_name().to_string_lossy().ends_with(".partial"));
    assert!(!staging_left);

    let rows = audit_rows(&vault.store().unwrap()).await;
    assert_eq!(
        rows,
        vec![
            ("local".to_string(), "ok".to_string()),
            ("cloud".to_string(), "ok".to_string()),
        ]
    );
    vault.close().await;
}

#[tokio::test]
async fn restore_brings_back_the_backed_up_state() {
    let tmp = tempdir().unwrap();
    let vault = unlocked_vault(tmp.path()).await;
    let remote = Arc::new(RecordingRemote::new(false));
    let scheduler = Arc::new(BackupScheduler::new(vault.clone(), remote, tmp.path()));

    // State at backup time.
    let pool = vault.store().unwrap();
    settings::save(
        &pool,
        &Settings {
            directory_url: Some("http://directory.before".into()),
            ..Settings::default()
        },
    )
    .await
    .unwrap();
    scheduler.local_backup().await;

    // Diverge after the backup.
    settings::save(
        &pool,
        &Settings {
            directory_url: Some("http://directory.after".into()),
            ..Settings::default()
        },
    )
    .await
    .unwrap();

    let backup = &scheduler.list_backups().unwrap()[0];
    let target = scheduler
        .restore(std::path::Path::new(&backup.path))
        .await
        .unwrap();
    assert_eq!(target, vault.default_store_path());
    assert!(vault.store().is_err(), "handle must be invalid after restore");

    // Full restart: reopen with the same password.
    vault.initialize("backup pw", None).await.unwrap();
    let restored = settings::load(&vault.store().unwrap()).await.unwrap();
    assert_eq!(
        restored.directory_url.as_deref(),
        Some("http://directory.before")
    );
    vault.close().await;
}

#[tokio::test]
async fn failed_local_backup_is_audited_but_does_not_propagate() {
    let tmp = tempdir().unwrap();
    let vault = unlocked_vault(tmp.path()).await;
    let remote = Arc::new(RecordingRemote::new(false));
    let scheduler = Arc::new(BackupScheduler::new(vault.clone(), remote, tmp.path()));

    // Remove the store file from under the scheduler to force a failure.
    let store_path = vault.store_path().unwrap();
    let stolen = tmp.path().join("stolen.db");
    std::fs::rename(&store_path, &stolen).unwrap();

    scheduler.local_backup().await;

    std::fs::rename(&stolen, &store_path).unwrap();
    let rows = audit_rows(&vault.store().unwrap()).await;
    assert_eq!(rows, vec![("local".to_string(), "failed".to_string())]);
    assert!(scheduler.list_backups().unwrap().is_empty());
    vault.close().await;
}
