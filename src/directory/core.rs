use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Local;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use subtle::ConstantTimeEq;

use crate::db::run_in_tx;
use crate::id::new_id;
use crate::model::{
    AppointmentDetails, BookingRequest, Clinic, Message, MessagePayload, PublishRequest, Slot,
    SlotStatus, MESSAGE_KIND_APPOINTMENT_REQUEST,
};
use crate::time::now_ms;
use crate::{AppError, AppResult};

pub const HOLD_MINUTES: i64 = 15;

fn hold_expiry(now: i64) -> i64 {
    now + HOLD_MINUTES * 60 * 1000
}

fn today() -> String {
    Local::now().date_naive().format("%Y-%m-%d").to_string()
}

/// SHA-256 hex digest of an API key, the only form ever persisted.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Constant-time comparison of a presented key against a stored digest.
pub fn verify_api_key(stored_hash_hex: &str, presented: &str) -> bool {
    let Ok(stored) = hex::decode(stored_hash_hex) else {
        return false;
    };
    let presented_digest = Sha256::digest(presented.as_bytes());
    stored.ct_eq(presented_digest.as_slice()).into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardResult {
    pub clinic_id: String,
    /// Returned exactly once; only its hash is stored.
    pub api_key: String,
}

/// Register a clinic and mint its API key.
pub async fn onboard(
    pool: &SqlitePool,
    name: &str,
    city: &str,
    specialty: Option<&str>,
) -> AppResult<OnboardResult> {
    if name.trim().is_empty() || city.trim().is_empty() {
        return Err(AppError::new(
            AppError::VALIDATION,
            "Clinic name and city are required",
        ));
    }

    let clinic_id = new_id();
    let mut key_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut key_bytes);
    let api_key = URL_SAFE_NO_PAD.encode(key_bytes);

    sqlx::query(
        "INSERT INTO clinics (id, name, city, specialty, api_key_hash) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&clinic_id)
    .bind(name.trim())
    .bind(city.trim())
    .bind(specialty.map(str::trim))
    .bind(hash_api_key(&api_key))
    .execute(pool)
    .await?;

    tracing::info!(target: "fernhill", event = "clinic_onboarded", clinic_id = %clinic_id);
    Ok(OnboardResult { clinic_id, api_key })
}

/// Verify `api_key` against the hash stored for exactly `clinic_id`.
/// Failures are indistinguishable to the caller.
pub async fn authenticate(pool: &SqlitePool, clinic_id: &str, api_key: &str) -> AppResult<()> {
    let denied = || AppError::new(AppError::ACCESS_DENIED, "Access denied");

    let row = sqlx::query("SELECT api_key_hash FROM clinics WHERE id = ?")
        .bind(clinic_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(denied());
    };
    let stored: String = row.try_get("api_key_hash")?;
    if verify_api_key(&stored, api_key) {
        Ok(())
    } else {
        Err(denied())
    }
}

pub async fn list_clinics(pool: &SqlitePool) -> AppResult<Vec<Clinic>> {
    let rows = sqlx::query(
        "SELECT id, name, city, specialty, last_seen_at FROM clinics ORDER BY name",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            Ok(Clinic {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                city: row.try_get("city")?,
                specialty: row.try_get("specialty")?,
                last_seen_at: row.try_get("last_seen_at")?,
            })
        })
        .collect()
}

/// Replace the AVAILABLE slots for the listed dates with the supplied
/// entries, inside one transaction.
///
/// Dates absent from `dates` are untouched; HELD/BOOKED rows always survive.
/// A listed date with no matching entries simply ends up empty. Returns the
/// number of inserted slots.
pub async fn publish_availability(
    pool: &SqlitePool,
    clinic_id: &str,
    request: PublishRequest,
) -> AppResult<u32> {
    for date in &request.dates {
        if !crate::model::is_valid_date(date) {
            return Err(AppError::new(AppError::VALIDATION, "Invalid date")
                .with_context("date", date.clone()));
        }
    }
    for entry in &request.slots {
        if !crate::model::is_valid_date(&entry.date) || !crate::model::is_valid_time(&entry.time) {
            return Err(AppError::new(AppError::VALIDATION, "Invalid slot entry")
                .with_context("date", entry.date.clone())
                .with_context("time", entry.time.clone()));
        }
    }
    if request.dates.is_empty() {
        return Err(AppError::new(
            AppError::VALIDATION,
            "At least one date is required",
        ));
    }

    let clinic_id = clinic_id.to_string();
    let dates = request.dates.clone();
    let entries: Vec<_> = request
        .slots
        .into_iter()
        .filter(|s| dates.contains(&s.date))
        .collect();
    let inserted = entries.len() as u32;

    run_in_tx::<_, AppError, _>(pool, move |tx| {
        Box::pin(async move {
            let placeholders = vec!["?"; dates.len()].join(", ");
            let delete_sql = format!(
                "DELETE FROM slots WHERE clinic_id = ? AND status = 'AVAILABLE' AND date IN ({placeholders})"
            );
            let mut delete = sqlx::query(&delete_sql).bind(&clinic_id);
            for date in &dates {
                delete = delete.bind(date);
            }
            delete.execute(&mut **tx).await?;

            for entry in &entries {
                sqlx::query(
                    "INSERT INTO slots (id, clinic_id, date, time, status) \
                     VALUES (?, ?, ?, ?, 'AVAILABLE')",
                )
                .bind(new_id())
                .bind(&clinic_id)
                .bind(&entry.date)
                .bind(&entry.time)
                .execute(&mut **tx)
                .await?;
            }
            Ok(())
        })
    })
    .await?;

    Ok(inserted)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookOutcome {
    pub message_id: String,
}

/// Book a slot (hold + enqueue) or file a general request (enqueue only),
/// as one atomic unit.
///
/// The hold is a compare-and-set: it claims the row only while it is still
/// AVAILABLE or carries an expired hold, so two late bookers of the same
/// expired slot cannot both win.
pub async fn book(pool: &SqlitePool, request: BookingRequest) -> AppResult<BookOutcome> {
    if request.patient_name.trim().is_empty() {
        return Err(AppError::new(
            AppError::VALIDATION,
            "Patient name is required",
        ));
    }

    if let Some(slot_id) = request.slot_id.clone() {
        let patient = request.patient_name.trim().to_string();
        let phone = request.phone.clone();
        let reason = request.reason.clone();

        return run_in_tx::<_, AppError, _>(pool, move |tx| {
            Box::pin(async move {
                let now = now_ms();
                let updated = sqlx::query(
                    "UPDATE slots SET status = 'HELD', hold_expires_at = ? \
                     WHERE id = ? AND (status = 'AVAILABLE' \
                       OR (status = 'HELD' AND hold_expires_at <= ?))",
                )
                .bind(hold_expiry(now))
                .bind(&slot_id)
                .bind(now)
                .execute(&mut **tx)
                .await?
                .rows_affected();

                if updated == 0 {
                    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM slots WHERE id = ?")
                        .bind(&slot_id)
                        .fetch_optional(&mut **tx)
                        .await?;
                    return Err(if exists.is_some() {
                        AppError::new(AppError::SLOT_CONFLICT, "Slot is no longer available")
                    } else {
                        AppError::new(AppError::SLOT_NOT_FOUND, "Slot does not exist")
                    });
                }

                let row = sqlx::query("SELECT clinic_id, date, time FROM slots WHERE id = ?")
                    .bind(&slot_id)
                    .fetch_one(&mut **tx)
                    .await?;
                let clinic_id: String = row.try_get("clinic_id")?;
                let date: String = row.try_get("date")?;
                let time: String = row.try_get("time")?;

                let details = AppointmentDetails {
                    patient_name: patient,
                    phone,
                    date: Some(date),
                    time: Some(time),
                    reason,
                };
                let message_id =
                    enqueue_message(tx, &clinic_id, MessagePayload::AppointmentRequest(details))
                        .await?;
                Ok(BookOutcome { message_id })
            })
        })
        .await;
    }

    let Some(clinic_id) = request.clinic_id.clone() else {
        return Err(AppError::new(
            AppError::VALIDATION,
            "Either slotId or clinicId is required",
        ));
    };

    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM clinics WHERE id = ?")
        .bind(&clinic_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Err(
            AppError::new(AppError::VALIDATION, "Unknown clinic")
                .with_context("clinic_id", clinic_id),
        );
    }

    let details = AppointmentDetails {
        patient_name: request.patient_name.trim().to_string(),
        phone: request.phone,
        date: None,
        time: None,
        reason: request.reason,
    };
    let clinic = clinic_id.clone();
    let message_id = run_in_tx::<_, AppError, _>(pool, move |tx| {
        Box::pin(async move {
            enqueue_message(tx, &clinic, MessagePayload::AppointmentRequest(details)).await
        })
    })
    .await?;

    Ok(BookOutcome { message_id })
}

async fn enqueue_message(
    tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
    clinic_id: &str,
    payload: MessagePayload,
) -> AppResult<String> {
    let message_id = new_id();
    let body = serde_json::to_string(&payload)?;
    sqlx::query(
        "INSERT INTO messages (id, clinic_id, kind, payload, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&message_id)
    .bind(clinic_id)
    .bind(MESSAGE_KIND_APPOINTMENT_REQUEST)
    .bind(&body)
    .bind(now_ms())
    .execute(&mut **tx)
    .await?;
    Ok(message_id)
}

/// Bookable slots for a clinic: today or later, AVAILABLE or carrying an
/// expired hold. Stored rows are never rewritten by this query.
pub async fn query_slots(
    pool: &SqlitePool,
    clinic_id: &str,
    date: Option<&str>,
) -> AppResult<Vec<Slot>> {
    if let Some(date) = date {
        if !crate::model::is_valid_date(date) {
            return Err(AppError::new(AppError::VALIDATION, "Invalid date")
                .with_context("date", date.to_string()));
        }
    }

    let now = now_ms();
    let mut sql = String::from(
        "SELECT id, clinic_id, date, time, status, hold_expires_at FROM slots \
         WHERE clinic_id = ? AND date >= ? \
           AND (status = 'AVAILABLE' OR (status = 'HELD' AND hold_expires_at <= ?))",
    );
    if date.is_some() {
        sql.push_str(" AND date = ?");
    }
    sql.push_str(" ORDER BY date, time");

    let mut query = sqlx::query(&sql).bind(clinic_id).bind(today()).bind(now);
    if let Some(date) = date {
        query = query.bind(date);
    }

    let rows = query.fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| {
            let status: String = row.try_get("status")?;
            Ok(Slot {
                id: row.try_get("id")?,
                clinic_id: row.try_get("clinic_id")?,
                date: row.try_get("date")?,
                time: row.try_get("time")?,
                status: SlotStatus::parse(&status).unwrap_or(SlotStatus::Available),
                hold_expires_at: row.try_get("hold_expires_at")?,
            })
        })
        .collect()
}

/// Pending messages for a clinic, oldest first. Also refreshes the clinic's
/// last-seen heartbeat.
pub async fn poll_messages(pool: &SqlitePool, clinic_id: &str) -> AppResult<Vec<Message>> {
    sqlx::query("UPDATE clinics SET last_seen_at = ? WHERE id = ?")
        .bind(now_ms())
        .bind(clinic_id)
        .execute(pool)
        .await?;

    let rows = sqlx::query(
        "SELECT id, clinic_id, kind, payload, created_at FROM messages \
         WHERE clinic_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(clinic_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let raw: String = row.try_get("payload")?;
            Ok(Message {
                id: row.try_get("id")?,
                clinic_id: row.try_get("clinic_id")?,
                kind: row.try_get("kind")?,
                payload: MessagePayload::decode(&raw),
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Delete exactly the given message ids belonging to `clinic_id`. Foreign or
/// already-deleted ids are silent no-ops. Returns the number removed.
pub async fn ack(pool: &SqlitePool, clinic_id: &str, ids: &[String]) -> AppResult<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("DELETE FROM messages WHERE clinic_id = ? AND id IN ({placeholders})");
    let mut query = sqlx::query(&sql).bind(clinic_id);
    for id in ids {
        query = query.bind(id);
    }
    let removed = query.execute(pool).await?.rows_affected();
    Ok(removed)
}
