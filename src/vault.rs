use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{db, AppError, AppResult};

pub const SALT_FILE_NAME: &str = "fernhill.salt";
pub const RECOVERY_FILE_NAME: &str = "fernhill.recovery.json";
pub const STORE_FILE_NAME: &str = "fernhill.db";

const SALT_LEN: usize = 32;
const RECOVERY_CODE_BYTES: usize = 8;

/// Fixed Argon2id cost profile: 64 MiB, 3 passes, 4 lanes, 32-byte raw
/// output. These values are a versionless contract — changing any of them
/// makes every previously-encrypted store permanently undecryptable.
static KDF_PARAMS: Lazy<Params> =
    Lazy::new(|| Params::new(64 * 1024, 3, 4, Some(32)).expect("argon2 cost profile"));

/// Raw data-encryption key. Never persisted; wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; 32]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DerivedKey").field(&"<redacted>").finish()
    }
}

/// Deterministic Argon2id derivation of the store key from a password and
/// the installation salt. No other function may alter the cost profile.
pub fn derive_key(password: &str, salt: &[u8; 32]) -> AppResult<DerivedKey> {
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, KDF_PARAMS.clone());
    let mut out = [0u8; 32];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|err| {
            AppError::new("VAULT/KDF", "Key derivation failed")
                .with_context("detail", err.to_string())
        })?;
    Ok(DerivedKey(out))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultStatus {
    /// No salt file yet; `setup` has never run.
    NotSetup,
    Locked,
    Unlocked,
}

#[derive(Serialize, Deserialize)]
struct RecoveryEnvelope {
    version: u32,
    salt: String,
    nonce: String,
    wrapped_key: String,
}

struct OpenStore {
    pool: SqlitePool,
    path: PathBuf,
    key: DerivedKey,
}

/// Owner of the single live handle to the encrypted store.
///
/// `Uninitialized → Locked → Unlocked`; unlocking goes through the correct
/// password or a valid recovery code, and unlock attempts are serialized so
/// two key derivations never race against the same store file.
pub struct Vault {
    data_dir: PathBuf,
    unlock_gate: tokio::sync::Mutex<()>,
    open: RwLock<Option<OpenStore>>,
}

impl Vault {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Vault {
            data_dir: data_dir.into(),
            unlock_gate: tokio::sync::Mutex::new(()),
            open: RwLock::new(None),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn salt_path(&self) -> PathBuf {
        self.data_dir.join(SALT_FILE_NAME)
    }

    pub fn recovery_path(&self) -> PathBuf {
        self.data_dir.join(RECOVERY_FILE_NAME)
    }

    pub fn default_store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE_NAME)
    }

    pub fn status(&self) -> VaultStatus {
        if self.open.read().unwrap_or_else(|e| e.into_inner()).is_some() {
            return VaultStatus::Unlocked;
        }
        if self.salt_path().exists() {
            VaultStatus::Locked
        } else {
            VaultStatus::NotSetup
        }
    }

    /// Live pool, or `AUTH/LOCKED` when the vault is not open.
    pub fn store(&self) -> AppResult<SqlitePool> {
        self.open
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.pool.clone())
            .ok_or_else(|| AppError::new(AppError::LOCKED, "Store is locked"))
    }

    /// Path the store was last opened from.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.open
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.path.clone())
    }

    pub(crate) fn store_key(&self) -> Option<DerivedKey> {
        self.open
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.key.clone())
    }

    /// Load the installation salt, generating and persisting it on first use.
    fn load_or_create_salt(&self) -> AppResult<[u8; 32]> {
        let path = self.salt_path();
        if path.exists() {
            let bytes = fs::read(&path).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "read_salt")
                    .with_context("path", path.display().to_string())
            })?;
            let salt: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                AppError::new("VAULT/SALT_CORRUPT", "Salt file has the wrong length")
                    .with_context("path", path.display().to_string())
                    .with_context("len", bytes.len().to_string())
            })?;
            return Ok(salt);
        }

        fs::create_dir_all(&self.data_dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_data_dir")
                .with_context("path", self.data_dir.display().to_string())
        })?;
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        db::write_atomic(&path, &salt).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_salt")
                .with_context("path", path.display().to_string())
        })?;
        restrict_permissions(&path);
        tracing::info!(target: "fernhill", event = "salt_created", path = %path.display());
        Ok(salt)
    }

    /// Open the store at `path` with `key` and verify the key against the
    /// database header. A cipher mismatch surfaces as `AUTH/INVALID_PASSWORD`;
    /// every other failure propagates unchanged.
    ///
    /// With a wrong key SQLCipher reports the file as not being a database at
    /// all. That can fire while the pool applies its setup pragmas or on the
    /// schema-metadata probe below, so both paths go through the same check.
    pub async fn open_store(path: &Path, key: &DerivedKey) -> AppResult<SqlitePool> {
        let pool = match db::open_pool(path, Some(key.as_bytes())).await {
            Ok(pool) => pool,
            Err(err) if is_wrong_key(&err) => {
                return Err(AppError::new(AppError::INVALID_PASSWORD, "Invalid password"));
            }
            Err(err) => return Err(err),
        };

        let probe: Result<i64, sqlx::Error> =
            sqlx::query_scalar("SELECT count(*) FROM sqlite_master")
                .fetch_one(&pool)
                .await;
        match probe {
            Ok(_) => Ok(pool),
            Err(err) => {
                pool.close().await;
                let app = AppError::from(err);
                if is_wrong_key(&app) {
                    Err(AppError::new(AppError::INVALID_PASSWORD, "Invalid password"))
                } else {
                    Err(app.with_context("operation", "verify_store_key"))
                }
            }
        }
    }

    /// Unlock: load-or-create the salt, derive the key, open the store.
    pub async fn initialize(&self, password: &str, store_path: Option<&Path>) -> AppResult<()> {
        let _gate = self.unlock_gate.lock().await;
        if self.open.read().unwrap_or_else(|e| e.into_inner()).is_some() {
            return Err(AppError::new(
                "VAULT/ALREADY_OPEN",
                "Store handle is already open",
            ));
        }

        let salt = self.load_or_create_salt()?;
        let password = password.to_owned();
        let key = tokio::task::spawn_blocking(move || derive_key(&password, &salt))
            .await
            .map_err(|err| {
                AppError::new("VAULT/KDF", "Key derivation task failed")
                    .with_context("detail", err.to_string())
            })??;

        let path = store_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_store_path());
        let pool = Self::open_store(&path, &key).await?;

        *self.open.write().unwrap_or_else(|e| e.into_inner()) = Some(OpenStore {
            pool,
            path: path.clone(),
            key,
        });
        tracing::info!(target: "fernhill", event = "vault_unlocked", path = %path.display());
        Ok(())
    }

    /// Close the live handle. Idempotent; safe on an already-closed vault.
    pub async fn close(&self) {
        let taken = self
            .open
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(open) = taken {
            open.pool.close().await;
            tracing::info!(target: "fernhill", event = "vault_closed", path = %open.path.display());
        }
    }

    /// Wrap the live key under a fresh recovery code and persist the
    /// envelope. Returns the code; it is shown once and never stored.
    pub async fn issue_recovery_code(&self) -> AppResult<String> {
        let key = self
            .store_key()
            .ok_or_else(|| AppError::new(AppError::LOCKED, "Store is locked"))?;
        let (code, envelope) = seal_envelope(&key)?;
        let payload = serde_json::to_vec_pretty(&envelope)?;
        let path = self.recovery_path();
        db::write_atomic(&path, &payload).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_recovery_envelope")
                .with_context("path", path.display().to_string())
        })?;
        restrict_permissions(&path);
        tracing::info!(target: "fernhill", event = "recovery_code_issued");
        Ok(code)
    }

    /// Reset the password using a recovery code.
    ///
    /// Unseals the real key from the envelope, re-encrypts the store under
    /// the key derived from `new_password`, unlocks, and rotates the
    /// envelope: the used code is dead and the freshly issued one is
    /// returned.
    pub async fn recover(&self, code: &str, new_password: &str) -> AppResult<String> {
        let _gate = self.unlock_gate.lock().await;
        if self.open.read().unwrap_or_else(|e| e.into_inner()).is_some() {
            return Err(AppError::new(
                "VAULT/ALREADY_OPEN",
                "Close the store before recovering",
            ));
        }

        let envelope_path = self.recovery_path();
        let raw = fs::read(&envelope_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                AppError::new("RECOVERY/NOT_AVAILABLE", "No recovery code has been issued")
            } else {
                AppError::from(err)
                    .with_context("operation", "read_recovery_envelope")
                    .with_context("path", envelope_path.display().to_string())
            }
        })?;
        let envelope: RecoveryEnvelope = serde_json::from_slice(&raw)?;
        let old_key = unseal_envelope(code, &envelope)?;

        // The unsealed key must actually open the store before we rekey.
        let path = self.default_store_path();
        let pool = Self::open_store(&path, &old_key).await?;
        pool.close().await;

        let salt = self.load_or_create_salt()?;
        let new_password_owned = new_password.to_owned();
        let new_key = tokio::task::spawn_blocking(move || derive_key(&new_password_owned, &salt))
            .await
            .map_err(|err| {
                AppError::new("VAULT/KDF", "Key derivation task failed")
                    .with_context("detail", err.to_string())
            })??;

        rekey_store(&path, &old_key, &new_key)?;

        let pool = Self::open_store(&path, &new_key).await?;
        *self.open.write().unwrap_or_else(|e| e.into_inner()) = Some(OpenStore {
            pool,
            path: path.clone(),
            key: new_key,
        });

        // Rotate: a used recovery code must never work twice.
        let reissued = self.issue_recovery_code().await?;
        tracing::info!(target: "fernhill", event = "vault_recovered", path = %path.display());
        Ok(reissued)
    }
}

/// SQLITE_NOTADB anywhere in the error chain is the cipher's signature for a
/// wrong key.
fn is_wrong_key(err: &AppError) -> bool {
    err.code() == "Sqlite/26"
        || err.message().contains("file is not a database")
        || err.cause().is_some_and(is_wrong_key)
}

/// `XXXX-XXXX-XXXX-XXXX` over 8 random bytes.
fn format_recovery_code(bytes: &[u8]) -> String {
    let hexed = hex::encode_upper(bytes);
    hexed
        .as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-")
}

fn normalize_recovery_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn wrap_key_for_code(code: &str, salt: &[u8; 32]) -> AppResult<DerivedKey> {
    derive_key(&normalize_recovery_code(code), salt)
}

fn seal_envelope(key: &DerivedKey) -> AppResult<(String, RecoveryEnvelope)> {
    let mut code_bytes = [0u8; RECOVERY_CODE_BYTES];
    OsRng.fill_bytes(&mut code_bytes);
    let code = format_recovery_code(&code_bytes);

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let wrap = wrap_key_for_code(&code, &salt)?;

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(wrap.as_bytes()));
    let wrapped = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), key.as_bytes().as_slice())
        .map_err(|_| AppError::new("RECOVERY/SEAL", "Failed to seal recovery envelope"))?;

    Ok((
        code,
        RecoveryEnvelope {
            version: 1,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            wrapped_key: hex::encode(wrapped),
        },
    ))
}

fn unseal_envelope(code: &str, envelope: &RecoveryEnvelope) -> AppResult<DerivedKey> {
    let invalid = || AppError::new(AppError::INVALID_CREDENTIALS, "Invalid recovery code");

    let salt_bytes = hex::decode(&envelope.salt).map_err(|_| invalid())?;
    let salt: [u8; 32] = salt_bytes.as_slice().try_into().map_err(|_| invalid())?;
    let nonce_bytes = hex::decode(&envelope.nonce).map_err(|_| invalid())?;
    let wrapped = hex::decode(&envelope.wrapped_key).map_err(|_| invalid())?;

    let wrap = wrap_key_for_code(code, &salt)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(wrap.as_bytes()));
    let mut plain = cipher
        .decrypt(XNonce::from_slice(&nonce_bytes), wrapped.as_slice())
        .map_err(|_| invalid())?;

    let key: [u8; 32] = plain.as_slice().try_into().map_err(|_| invalid())?;
    plain.zeroize();
    Ok(DerivedKey(key))
}

/// Re-encrypt the store file in place from `old_key` to `new_key`. The
/// caller must hold the only handle and have closed it.
fn rekey_store(path: &Path, old_key: &DerivedKey, new_key: &DerivedKey) -> AppResult<()> {
    let conn = rusqlite::Connection::open(path)
        .map_err(|err| AppError::from(err).with_context("operation", "open_for_rekey"))?;
    conn.execute_batch(&format!(
        "PRAGMA key = \"x'{}'\";",
        hex::encode_upper(old_key.as_bytes())
    ))
    .map_err(|err| AppError::from(err).with_context("operation", "rekey_apply_old"))?;
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))
        .map_err(|err| AppError::from(err).with_context("operation", "rekey_probe"))?;
    conn.execute_batch(&format!(
        "PRAGMA rekey = \"x'{}'\";",
        hex::encode_upper(new_key.as_bytes())
    ))
    .map_err(|err| AppError::from(err).with_context("operation", "rekey_apply_new"))?;
    conn.close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "rekey_close"))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
