use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::backup::BackupScheduler;
use crate::migrate::{self, SnapshotSource};
use crate::remote::{DriveRemote, TokenPair};
use crate::schedule::ScheduleSpec;
use crate::schema::LOCAL_MIGRATIONS;
use crate::settings::{self, Settings};
use crate::vault::{Vault, VaultStatus};
use crate::{AppError, AppResult};

/// Wiring for the clinic-side application: the vault owns the store handle,
/// the scheduler and sync bridge operate against it once it is open.
pub struct AppState {
    pub vault: Arc<Vault>,
    pub remote: Arc<DriveRemote>,
    pub scheduler: Arc<BackupScheduler>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub vault: &'static str,
    pub store_path: Option<String>,
    pub schema_version: Option<i64>,
    pub local_backups: usize,
    pub cloud_enabled: bool,
    pub clinic_id: Option<String>,
}

impl AppState {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let vault = Arc::new(Vault::new(&data_dir));
        let remote = Arc::new(DriveRemote::new("https://drive.fernhill.app", None));
        let scheduler = Arc::new(BackupScheduler::new(
            vault.clone(),
            remote.clone(),
            &data_dir,
        ));
        AppState {
            vault,
            remote,
            scheduler,
        }
    }

    /// First run: create the salt, open (and thereby create) the store,
    /// migrate it, and hand back the initial recovery code.
    pub async fn setup(&self, password: &str) -> AppResult<String> {
        if self.vault.status() != VaultStatus::NotSetup {
            return Err(AppError::new(
                "VAULT/ALREADY_SETUP",
                "This installation is already set up",
            ));
        }
        self.vault.initialize(password, None).await?;
        self.migrate_store().await?;
        let code = self.vault.issue_recovery_code().await?;
        self.after_unlock().await?;
        Ok(code)
    }

    /// Unlock an existing installation.
    pub async fn login(&self, password: &str) -> AppResult<()> {
        if self.vault.status() == VaultStatus::NotSetup {
            return Err(AppError::new(AppError::NOT_SETUP, "Run setup first"));
        }
        self.vault.initialize(password, None).await?;
        self.migrate_store().await?;
        self.after_unlock().await?;
        Ok(())
    }

    /// Reset the password with a recovery code; returns the reissued code.
    pub async fn recover(&self, code: &str, new_password: &str) -> AppResult<String> {
        let reissued = self.vault.recover(code, new_password).await?;
        self.migrate_store().await?;
        self.after_unlock().await?;
        Ok(reissued)
    }

    /// Migrations run before any other data access against the store.
    async fn migrate_store(&self) -> AppResult<()> {
        let pool = self.vault.store()?;
        let path = self
            .vault
            .store_path()
            .ok_or_else(|| AppError::new(AppError::LOCKED, "Store is locked"))?;
        let key = self.vault.store_key();
        let source = SnapshotSource {
            path: &path,
            cipher_key: key.as_ref().map(|k| k.as_bytes()),
        };
        migrate::migrate(&pool, Some(source), LOCAL_MIGRATIONS).await
    }

    /// Push persisted settings into the live collaborators: remote tokens
    /// and the two backup timers.
    async fn after_unlock(&self) -> AppResult<()> {
        let settings = self.settings().await?;

        if let Some(access_token) = settings.remote_access_token.clone() {
            self.remote.set_tokens(Some(TokenPair {
                access_token,
                refresh_token: settings.remote_refresh_token.clone(),
            }));
        }

        if let Some(text) = settings.backup_local_schedule.as_deref() {
            match ScheduleSpec::parse(text) {
                Ok(spec) => self.scheduler.schedule_local(spec),
                Err(err) => {
                    tracing::warn!(target: "fernhill", event = "bad_local_schedule", error = %err);
                }
            }
        }
        if settings.cloud_enabled {
            if let Some(text) = settings.backup_cloud_schedule.as_deref() {
                match ScheduleSpec::parse(text) {
                    Ok(spec) => self.scheduler.schedule_cloud(spec),
                    Err(err) => {
                        tracing::warn!(target: "fernhill", event = "bad_cloud_schedule", error = %err);
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn settings(&self) -> AppResult<Settings> {
        let pool = self.vault.store()?;
        settings::load(&pool).await
    }

    pub async fn save_settings(&self, value: &Settings) -> AppResult<()> {
        let pool = self.vault.store()?;
        settings::save(&pool, value).await
    }

    pub async fn status(&self) -> StatusReport {
        let vault_state = match self.vault.status() {
            VaultStatus::NotSetup => "not_setup",
            VaultStatus::Locked => "locked",
            VaultStatus::Unlocked => "unlocked",
        };
        let schema_version = match self.vault.store() {
            Ok(pool) => migrate::current_version(&pool).await.ok(),
            Err(_) => None,
        };
        let (cloud_enabled, clinic_id) = match self.settings().await {
            Ok(settings) => (settings.cloud_enabled, settings.clinic_id),
            Err(_) => (false, None),
        };
        StatusReport {
            vault: vault_state,
            store_path: self.vault.store_path().map(|p| p.display().to_string()),
            schema_version,
            local_backups: self.scheduler.list_backups().map(|b| b.len()).unwrap_or(0),
            cloud_enabled,
            clinic_id,
        }
    }

    /// Teardown: best-effort backup, then drop the handle.
    pub async fn shutdown(&self) {
        self.scheduler.backup_on_shutdown().await;
        self.vault.close().await;
    }
}
