mod util;

use fernhill_lib::directory::core;
use fernhill_lib::model::{BookingRequest, MessagePayload};
use fernhill_lib::time::now_ms;
use fernhill_lib::AppError;
use sqlx::Row;
use util::{directory_pool, future_date, seed_clinic, seed_slot};

fn booking(slot_id: Option<&str>, clinic_id: Option<&str>) -> BookingRequest {
    BookingRequest {
        slot_id: slot_id.map(String::from),
        clinic_id: clinic_id.map(String::from),
        patient_name: "Ana Byrne".into(),
        phone: Some("085 123 4567".into()),
        reason: Some("check-up".into()),
    }
}

#[tokio::test]
async fn booking_holds_slot_and_enqueues_one_message() {
    let pool = directory_pool().await;
    let (clinic_id, _) = seed_clinic(&pool, "Acme").await;
    let date = future_date(7);
    let slot_id = seed_slot(&pool, &clinic_id, &date, "10:00", "AVAILABLE", None).await;

    let before = now_ms();
    let outcome = core::book(&pool, booking(Some(&slot_id), None)).await.unwrap();
    let after = now_ms();

    let row = sqlx::query("SELECT status, hold_expires_at FROM slots WHERE id = ?")
        .bind(&slot_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let status: String = row.try_get("status").unwrap();
    let expiry: i64 = row.try_get("hold_expires_at").unwrap();
    assert_eq!(status, "HELD");
    assert!(expiry >= before + 15 * 60 * 1000);
    assert!(expiry <= after + 15 * 60 * 1000);

    let messages = core::poll_messages(&pool, &clinic_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, outcome.message_id);
    assert_eq!(messages[0].kind, "APPOINTMENT_REQUEST");
    match &messages[0].payload {
        MessagePayload::AppointmentRequest(details) => {
            assert_eq!(details.patient_name, "Ana Byrne");
            assert_eq!(details.date.as_deref(), Some(date.as_str()));
            assert_eq!(details.time.as_deref(), Some("10:00"));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn booking_a_held_slot_is_a_conflict_with_no_side_effects() {
    let pool = directory_pool().await;
    let (clinic_id, _) = seed_clinic(&pool, "Acme").await;
    let date = future_date(7);
    let expiry = now_ms() + 10 * 60 * 1000; // hold still live
    let slot_id = seed_slot(&pool, &clinic_id, &date, "10:00", "HELD", Some(expiry)).await;

    let err = core::book(&pool, booking(Some(&slot_id), None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), AppError::SLOT_CONFLICT);

    let stored_expiry: i64 = sqlx::query_scalar("SELECT hold_expires_at FROM slots WHERE id = ?")
        .bind(&slot_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stored_expiry, expiry, "losing booker must not touch the row");

    let messages = core::poll_messages(&pool, &clinic_id).await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn booking_a_missing_slot_is_not_found_and_enqueues_nothing() {
    let pool = directory_pool().await;
    let (clinic_id, _) = seed_clinic(&pool, "Acme").await;

    let err = core::book(&pool, booking(Some("no-such-slot"), None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), AppError::SLOT_NOT_FOUND);

    let messages = core::poll_messages(&pool, &clinic_id).await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn expired_hold_is_bookable_again_exactly_once() {
    let pool = directory_pool().await;
    let (clinic_id, _) = seed_clinic(&pool, "Acme").await;
    let date = future_date(7);
    let stale = now_ms() - 60_000;
    let slot_id = seed_slot(&pool, &clinic_id, &date, "10:00", "HELD", Some(stale)).await;

    // First late booker wins the compare-and-set.
    core::book(&pool, booking(Some(&slot_id), None)).await.unwrap();

    // Second late booker finds a live hold and loses.
    let err = core::book(&pool, booking(Some(&slot_id), None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), AppError::SLOT_CONFLICT);

    let messages = core::poll_messages(&pool, &clinic_id).await.unwrap();
    assert_eq!(messages.len(), 1, "only the winner enqueues");
}

#[tokio::test]
async fn general_request_requires_a_clinic_id() {
    let pool = directory_pool().await;

    let err = core::book(&pool, booking(None, None)).await.unwrap_err();
    assert_eq!(err.code(), AppError::VALIDATION);
}

#[tokio::test]
async fn general_request_enqueues_without_a_slot() {
    let pool = directory_pool().await;
    let (clinic_id, _) = seed_clinic(&pool, "Acme").await;

    let outcome = core::book(&pool, booking(None, Some(&clinic_id)))
        .await
        .unwrap();

    let messages = core::poll_messages(&pool, &clinic_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, outcome.message_id);
    match &messages[0].payload {
        MessagePayload::AppointmentRequest(details) => {
            assert!(details.date.is_none());
            assert!(details.time.is_none());
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn blank_patient_name_is_rejected_before_storage() {
    let pool = directory_pool().await;
    let (clinic_id, _) = seed_clinic(&pool, "Acme").await;
    let date = future_date(7);
    let slot_id = seed_slot(&pool, &clinic_id, &date, "10:00", "AVAILABLE", None).await;

    let mut request = booking(Some(&slot_id), None);
    request.patient_name = "   ".into();
    let err = core::book(&pool, request).await.unwrap_err();
    assert_eq!(err.code(), AppError::VALIDATION);

    let status: String = sqlx::query_scalar("SELECT status FROM slots WHERE id = ?")
        .bind(&slot_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "AVAILABLE");
}
