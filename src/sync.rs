use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::directory::core::OnboardResult;
use crate::model::{
    AppointmentRequest, BookingRequest, Clinic, Message, MessagePayload, PublishRequest,
    RequestStatus, Slot,
};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Thin client over the remote directory HTTP API.
pub struct DirectoryClient {
    base_url: String,
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookResponse {
    #[allow(dead_code)]
    status: String,
    message_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[allow(dead_code)]
    status: String,
    count: u32,
}

impl DirectoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        DirectoryClient {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            credentials: None,
        }
    }

    pub fn with_credentials(
        base_url: impl Into<String>,
        clinic_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        DirectoryClient {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            credentials: Some((clinic_id.into(), api_key.into())),
        }
    }

    pub fn clinic_id(&self) -> Option<&str> {
        self.credentials.as_ref().map(|(id, _)| id.as_str())
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/v1/{}", self.base_url.trim_end_matches('/'), tail)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> AppResult<reqwest::RequestBuilder> {
        let (clinic_id, api_key) = self.credentials.as_ref().ok_or_else(|| {
            AppError::new(AppError::NOT_SETUP, "Clinic credentials are not configured")
        })?;
        Ok(builder
            .header("x-clinic-id", clinic_id)
            .header("x-api-key", api_key))
    }

    pub async fn onboard(
        &self,
        app_secret: &str,
        name: &str,
        city: &str,
        specialty: Option<&str>,
    ) -> AppResult<OnboardResult> {
        let response = self
            .client
            .post(self.url("onboard"))
            .header("x-app-secret", app_secret)
            .json(&serde_json::json!({
                "name": name,
                "city": city,
                "specialty": specialty,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }

    pub async fn clinics(&self) -> AppResult<Vec<Clinic>> {
        let response = self
            .client
            .get(self.url("clinics"))
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }

    pub async fn query_slots(&self, clinic_id: &str, date: Option<&str>) -> AppResult<Vec<Slot>> {
        let mut request = self.client.get(self.url(&format!("slots/{clinic_id}")));
        if let Some(date) = date {
            request = request.query(&[("date", date)]);
        }
        let response = request.send().await.map_err(transport_error)?;
        decode(response).await
    }

    pub async fn book(&self, booking: &BookingRequest) -> AppResult<String> {
        let response = self
            .client
            .post(self.url("book"))
            .json(booking)
            .send()
            .await
            .map_err(transport_error)?;
        let body: BookResponse = decode(response).await?;
        Ok(body.message_id)
    }

    pub async fn publish(&self, request: &PublishRequest) -> AppResult<u32> {
        let response = self
            .authed(self.client.post(self.url("slots")))?
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        let body: PublishResponse = decode(response).await?;
        Ok(body.count)
    }

    pub async fn sync(&self) -> AppResult<Vec<Message>> {
        let response = self
            .authed(self.client.get(self.url("sync")))?
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }

    pub async fn ack(&self, ids: &[String]) -> AppResult<()> {
        let response = self
            .authed(self.client.post(self.url("ack")))?
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await
            .map_err(transport_error)?;
        let _: serde_json::Value = decode(response).await?;
        Ok(())
    }
}

fn transport_error(err: reqwest::Error) -> AppError {
    AppError::new("DIRECTORY/HTTP", "Directory request failed")
        .with_context("detail", err.to_string())
}

/// Decode a 2xx body, or surface the server's structured error unchanged.
async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> AppResult<T> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|err| {
            AppError::new("DIRECTORY/DECODE", "Directory response was malformed")
                .with_context("detail", err.to_string())
        });
    }
    let fallback = AppError::new("DIRECTORY/STATUS", "Directory rejected the request")
        .with_context("status", status.as_u16().to_string());
    match response.json::<AppError>().await {
        Ok(err) => Err(err),
        Err(_) => Err(fallback),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub fetched: usize,
    pub persisted: usize,
    pub acked: usize,
    pub failed: usize,
}

/// Pull-based synchronization between the directory outbox and the local
/// store's appointment mirror.
pub struct SyncBridge {
    client: DirectoryClient,
}

impl SyncBridge {
    pub fn new(client: DirectoryClient) -> Self {
        SyncBridge { client }
    }

    pub fn client(&self) -> &DirectoryClient {
        &self.client
    }

    /// One poll cycle: fetch pending messages, persist each locally, then
    /// ack only those that persisted. A failing message is left pending for
    /// the next poll and never blocks the others.
    pub async fn sync_once(&self, pool: &SqlitePool) -> AppResult<SyncReport> {
        let messages = self.client.sync().await?;
        let mut report = SyncReport {
            fetched: messages.len(),
            ..SyncReport::default()
        };

        let mut to_ack = Vec::new();
        for message in &messages {
            match persist_message(pool, message).await {
                Ok(()) => {
                    report.persisted += 1;
                    to_ack.push(message.id.clone());
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target: "fernhill",
                        event = "sync_persist_failed",
                        message_id = %message.id,
                        error = %err
                    );
                }
            }
        }

        if !to_ack.is_empty() {
            self.client.ack(&to_ack).await?;
            report.acked = to_ack.len();
        }

        info!(
            target: "fernhill",
            event = "sync_cycle",
            fetched = report.fetched,
            persisted = report.persisted,
            acked = report.acked,
            failed = report.failed
        );
        Ok(report)
    }

    /// Poll forever. Cycle failures are logged and the loop continues; the
    /// server never pushes, so delivery latency is bounded by `interval`.
    pub async fn run_poll_loop(&self, pool: SqlitePool, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sync_once(&pool).await {
                warn!(target: "fernhill", event = "sync_cycle_failed", error = %err);
            }
        }
    }
}

/// Mirror one message into `appointment_requests`, keyed by the message id.
/// `INSERT OR IGNORE` keeps redelivery idempotent.
async fn persist_message(pool: &SqlitePool, message: &Message) -> AppResult<()> {
    let details = match &message.payload {
        MessagePayload::AppointmentRequest(details) => details,
        MessagePayload::Unparseable { .. } => {
            return Err(AppError::new(
                "SYNC/UNPARSEABLE",
                "Message payload could not be decoded",
            )
            .with_context("message_id", message.id.clone()));
        }
    };

    sqlx::query(
        "INSERT OR IGNORE INTO appointment_requests \
         (id, patient_name, phone, date, time, reason, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)",
    )
    .bind(&message.id)
    .bind(&details.patient_name)
    .bind(&details.phone)
    .bind(&details.date)
    .bind(&details.time)
    .bind(&details.reason)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

/// Synced requests, newest first, for the staff worklist.
pub async fn list_requests(pool: &SqlitePool) -> AppResult<Vec<AppointmentRequest>> {
    use sqlx::Row;

    let rows = sqlx::query(
        "SELECT id, patient_name, phone, date, time, reason, status, created_at \
         FROM appointment_requests ORDER BY created_at DESC, id DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            let status: String = row.try_get("status")?;
            Ok(AppointmentRequest {
                id: row.try_get("id")?,
                patient_name: row.try_get("patient_name")?,
                phone: row.try_get("phone")?,
                date: row.try_get("date")?,
                time: row.try_get("time")?,
                reason: row.try_get("reason")?,
                status: match status.as_str() {
                    "accepted" => RequestStatus::Accepted,
                    "rejected" => RequestStatus::Rejected,
                    _ => RequestStatus::Pending,
                },
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Staff decision on a synced request. Requests are never deleted, only
/// advanced.
pub async fn set_request_status(
    pool: &SqlitePool,
    id: &str,
    status: RequestStatus,
) -> AppResult<()> {
    let updated = sqlx::query("UPDATE appointment_requests SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(
            AppError::new("SQLX/ROW_NOT_FOUND", "Unknown appointment request")
                .with_context("id", id.to_string()),
        );
    }
    Ok(())
}
