//! S3 backend behaviors that don't need a bucket to verify: location
//! strings from other backends are rejected, and metadata IDs are validated
//! before anything is sent to the service.

use surveydata_core::storage::{S3Config, S3Storage};
use surveydata_core::{AttachmentRef, StorageError, StorageSystem};

async fn offline_storage() -> S3Storage {
    S3Storage::new(
        S3Config::new("survey-attachments", "Surveys/household/")
            .with_region("eu-west-1")
            .with_endpoint("http://localhost:1"),
    )
    .await
}

#[tokio::test]
async fn foreign_location_strings_are_rejected() {
    let storage = offline_storage().await;

    let err = storage
        .get_attachment(AttachmentRef::Location("file:/data/uuid1/photo.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidLocation(_)));

    let err = storage
        .query_attachment(AttachmentRef::Location("__SYNCED__"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidLocation(_)));
}

#[tokio::test]
async fn metadata_ids_are_validated_before_any_request() {
    let storage = offline_storage().await;
    let err = storage.store_metadata("CURSOR", "x").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidMetadataId(_)));
}
