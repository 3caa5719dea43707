#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use fernhill_lib::directory::core;
use fernhill_lib::directory::http::{router, DirectoryState};
use fernhill_lib::remote::{RemoteObject, RemoteStorage};
use fernhill_lib::schema::{DIRECTORY_MIGRATIONS, LOCAL_MIGRATIONS};
use fernhill_lib::AppResult;

pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

pub async fn directory_pool() -> SqlitePool {
    let pool = memory_pool().await;
    fernhill_lib::migrate::migrate(&pool, None, DIRECTORY_MIGRATIONS)
        .await
        .unwrap();
    pool
}

pub async fn local_pool() -> SqlitePool {
    let pool = memory_pool().await;
    fernhill_lib::migrate::migrate(&pool, None, LOCAL_MIGRATIONS)
        .await
        .unwrap();
    pool
}

/// Onboard a clinic and return `(clinic_id, api_key)`.
pub async fn seed_clinic(pool: &SqlitePool, name: &str) -> (String, String) {
    let result = core::onboard(pool, name, "Arklow", Some("general"))
        .await
        .unwrap();
    (result.clinic_id, result.api_key)
}

/// Insert a slot row directly, bypassing the publish path.
pub async fn seed_slot(
    pool: &SqlitePool,
    clinic_id: &str,
    date: &str,
    time: &str,
    status: &str,
    hold_expires_at: Option<i64>,
) -> String {
    let id = fernhill_lib::id::new_id();
    sqlx::query(
        "INSERT INTO slots (id, clinic_id, date, time, status, hold_expires_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(clinic_id)
    .bind(date)
    .bind(time)
    .bind(status)
    .bind(hold_expires_at)
    .execute(pool)
    .await
    .unwrap();
    id
}

/// A date comfortably in the future, so query-time "today or later"
/// filtering never interferes with fixtures.
pub fn future_date(days_ahead: i64) -> String {
    (chrono::Local::now().date_naive() + chrono::Duration::days(days_ahead))
        .format("%Y-%m-%d")
        .to_string()
}

pub const TEST_APP_SECRET: &str = "test-app-secret";

/// Serve the directory API over `pool` on an ephemeral port. Returns the
/// base URL; the server task lives until the runtime shuts down.
pub async fn spawn_directory(pool: SqlitePool) -> String {
    let state = Arc::new(DirectoryState {
        pool,
        app_secret: TEST_APP_SECRET.to_string(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    format!("http://{addr}")
}

/// Remote double that records uploads and panics if used while
/// unauthenticated.
pub struct RecordingRemote {
    pub authenticated: bool,
    pub uploads: Mutex<Vec<String>>,
}

impl RecordingRemote {
    pub fn new(authenticated: bool) -> Self {
        RecordingRemote {
            authenticated,
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteStorage for RecordingRemote {
    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn upload(&self, _path: &Path, name: &str) -> AppResult<RemoteObject> {
        assert!(self.authenticated, "upload called while unauthenticated");
        self.uploads.lock().unwrap().push(name.to_string());
        Ok(RemoteObject {
            id: format!("remote-{name}"),
            name: name.to_string(),
            size: 0,
            modified_at: None,
        })
    }

    async fn list(&self) -> AppResult<Vec<RemoteObject>> {
        Ok(Vec::new())
    }

    async fn download(&self, _id: &str, _dest_path: &Path) -> AppResult<()> {
        Ok(())
    }
}
