mod util;

use fernhill_lib::model::{BookingRequest, MessagePayload, PublishRequest, SlotEntry};
use fernhill_lib::sync::DirectoryClient;
use fernhill_lib::AppError;
use util::{directory_pool, future_date, spawn_directory, TEST_APP_SECRET};

/// The full booking round trip: onboard → publish → book → the slot stops
/// being bookable → one message arrives on sync → ack empties the outbox.
#[tokio::test]
async fn end_to_end_booking_flow() {
    let pool = directory_pool().await;
    let base = spawn_directory(pool).await;
    let date = future_date(7);

    let anonymous = DirectoryClient::new(base.clone());
    let onboarded = anonymous
        .onboard(TEST_APP_SECRET, "Acme", "Arklow", Some("general"))
        .await
        .unwrap();

    let acme = DirectoryClient::with_credentials(
        base.clone(),
        onboarded.clinic_id.clone(),
        onboarded.api_key.clone(),
    );

    let count = acme
        .publish(&PublishRequest {
            dates: vec![date.clone()],
            slots: vec![SlotEntry {
                date: date.clone(),
                time: "10:00".into(),
            }],
        })
        .await
        .unwrap();
    assert_eq!(count, 1);

    let listing = anonymous.clinics().await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "Acme");

    let slots = anonymous
        .query_slots(&onboarded.clinic_id, Some(&date))
        .await
        .unwrap();
    assert_eq!(slots.len(), 1);
    let slot_id = slots[0].id.clone();

    let message_id = anonymous
        .book(&BookingRequest {
            slot_id: Some(slot_id),
            clinic_id: None,
            patient_name: "Ana Byrne".into(),
            phone: Some("085 123 4567".into()),
            reason: Some("check-up".into()),
        })
        .await
        .unwrap();

    // 10:00 is held now and no longer bookable.
    let slots = anonymous
        .query_slots(&onboarded.clinic_id, Some(&date))
        .await
        .unwrap();
    assert!(slots.is_empty());

    let messages = acme.sync().await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, message_id);
    assert_eq!(messages[0].kind, "APPOINTMENT_REQUEST");
    match &messages[0].payload {
        MessagePayload::AppointmentRequest(details) => {
            assert_eq!(details.patient_name, "Ana Byrne");
            assert_eq!(details.time.as_deref(), Some("10:00"));
        }
        other => panic!("unexpected payload {other:?}"),
    }

    acme.ack(&[message_id]).await.unwrap();
    assert!(acme.sync().await.unwrap().is_empty());
}

#[tokio::test]
async fn onboarding_requires_the_app_secret() {
    let pool = directory_pool().await;
    let base = spawn_directory(pool).await;
    let client = DirectoryClient::new(base);

    let err = client
        .onboard("wrong-secret", "Acme", "Arklow", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), AppError::INVALID_CREDENTIALS);
}

#[tokio::test]
async fn missing_or_wrong_credentials_are_rejected() {
    let pool = directory_pool().await;
    let base = spawn_directory(pool).await;
    let http = reqwest::Client::new();

    // No headers at all.
    let response = http.get(format!("{base}/v1/sync")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    // Real clinic, wrong key.
    let anonymous = DirectoryClient::new(base.clone());
    let onboarded = anonymous
        .onboard(TEST_APP_SECRET, "Acme", "Arklow", None)
        .await
        .unwrap();
    let response = http
        .get(format!("{base}/v1/sync"))
        .header("x-clinic-id", &onboarded.clinic_id)
        .header("x-api-key", "not-the-key")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    // Error bodies stay generic.
    let body: AppError = response.json().await.unwrap();
    assert_eq!(body.code(), AppError::ACCESS_DENIED);
    assert_eq!(body.message(), "Access denied");
}

#[tokio::test]
async fn booking_conflicts_surface_as_http_conflict() {
    let pool = directory_pool().await;
    let base = spawn_directory(pool).await;
    let date = future_date(7);

    let anonymous = DirectoryClient::new(base.clone());
    let onboarded = anonymous
        .onboard(TEST_APP_SECRET, "Acme", "Arklow", None)
        .await
        .unwrap();
    let acme =
        DirectoryClient::with_credentials(base.clone(), onboarded.clinic_id.clone(), onboarded.api_key);
    acme.publish(&PublishRequest {
        dates: vec![date.clone()],
        slots: vec![SlotEntry {
            date: date.clone(),
            time: "10:00".into(),
        }],
    })
    .await
    .unwrap();

    let slots = anonymous
        .query_slots(&onboarded.clinic_id, Some(&date))
        .await
        .unwrap();
    let booking = BookingRequest {
        slot_id: Some(slots[0].id.clone()),
        clinic_id: None,
        patient_name: "First".into(),
        phone: None,
        reason: None,
    };

    anonymous.book(&booking).await.unwrap();
    let err = anonymous.book(&booking).await.unwrap_err();
    assert_eq!(err.code(), AppError::SLOT_CONFLICT);

    let err = anonymous
        .book(&BookingRequest {
            slot_id: Some("missing-slot".into()),
            clinic_id: None,
            patient_name: "Second".into(),
            phone: None,
            reason: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), AppError::SLOT_NOT_FOUND);
}

#[tokio::test]
async fn malformed_date_filter_is_a_validation_error() {
    let pool = directory_pool().await;
    let base = spawn_directory(pool).await;
    let http = reqwest::Client::new();

    let response = http
        .get(format!("{base}/v1/slots/any-clinic"))
        .query(&[("date", "06-01-2024")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
}
