use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::time::now_ms;
use crate::AppResult;

/// Single-row application settings, upserted as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub backup_local_schedule: Option<String>,
    pub backup_cloud_schedule: Option<String>,
    pub cloud_enabled: bool,
    pub remote_access_token: Option<String>,
    pub remote_refresh_token: Option<String>,
    pub directory_url: Option<String>,
    pub clinic_id: Option<String>,
    pub clinic_api_key: Option<String>,
}

pub async fn load(pool: &SqlitePool) -> AppResult<Settings> {
    let row = sqlx::query("SELECT * FROM settings WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(Settings::default());
    };
    Ok(Settings {
        backup_local_schedule: row.try_get("backup_local_schedule")?,
        backup_cloud_schedule: row.try_get("backup_cloud_schedule")?,
        cloud_enabled: row.try_get::<i64, _>("cloud_enabled")? != 0,
        remote_access_token: row.try_get("remote_access_token")?,
        remote_refresh_token: row.try_get("remote_refresh_token")?,
        directory_url: row.try_get("directory_url")?,
        clinic_id: row.try_get("clinic_id")?,
        clinic_api_key: row.try_get("clinic_api_key")?,
    })
}

pub async fn save(pool: &SqlitePool, settings: &Settings) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO settings (\
           id, backup_local_schedule, backup_cloud_schedule, cloud_enabled,\
           remote_access_token, remote_refresh_token, directory_url,\
           clinic_id, clinic_api_key, updated_at\
         ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?)\
         ON CONFLICT(id) DO UPDATE SET \
           backup_local_schedule = excluded.backup_local_schedule,\
           backup_cloud_schedule = excluded.backup_cloud_schedule,\
           cloud_enabled = excluded.cloud_enabled,\
           remote_access_token = excluded.remote_access_token,\
           remote_refresh_token = excluded.remote_refresh_token,\
           directory_url = excluded.directory_url,\
           clinic_id = excluded.clinic_id,\
           clinic_api_key = excluded.clinic_api_key,\
           updated_at = excluded.updated_at",
    )
    .bind(&settings.backup_local_schedule)
    .bind(&settings.backup_cloud_schedule)
    .bind(i64::from(settings.cloud_enabled))
    .bind(&settings.remote_access_token)
    .bind(&settings.remote_refresh_token)
    .bind(&settings.directory_url)
    .bind(&settings.clinic_id)
    .bind(&settings.clinic_api_key)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LOCAL_MIGRATIONS;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool_with_schema() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::migrate(&pool, None, LOCAL_MIGRATIONS)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn defaults_when_no_row() {
        let pool = pool_with_schema().await;
        let settings = load(&pool).await.unwrap();
        assert!(settings.backup_local_schedule.is_none());
        assert!(!settings.cloud_enabled);
    }

    #[tokio::test]
    async fn upsert_is_stable() {
        let pool = pool_with_schema().await;
        let mut settings = Settings {
            backup_local_schedule: Some("02:30".into()),
            cloud_enabled: true,
            directory_url: Some("http://localhost:8700".into()),
            ..Settings::default()
        };
        save(&pool, &settings).await.unwrap();

        settings.backup_cloud_schedule = Some("03:30".into());
        save(&pool, &settings).await.unwrap();

        let loaded = load(&pool).await.unwrap();
        assert_eq!(loaded.backup_local_schedule.as_deref(), Some("02:30"));
        assert_eq!(loaded.backup_cloud_schedule.as_deref(), Some("03:30"));
        assert!(loaded.cloud_enabled);

        let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM settings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }
}
