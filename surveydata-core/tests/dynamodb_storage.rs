//! DynamoDB backend behaviors that don't need a table to verify: the
//! attachment operations are declared unsupported, and metadata IDs are
//! validated before anything is sent to the service.

use bytes::Bytes;
use surveydata_core::storage::{DynamoDbConfig, DynamoDbStorage};
use surveydata_core::{AttachmentRef, StorageError, StorageSystem};

async fn offline_storage() -> DynamoDbStorage {
    DynamoDbStorage::new(DynamoDbConfig {
        region: "eu-west-1".to_string(),
        table: "survey-submissions".to_string(),
        id_field: "KEY".to_string(),
        partition: None,
        endpoint: Some("http://localhost:1".to_string()),
    })
    .await
}

#[tokio::test]
async fn every_attachment_operation_is_unsupported() {
    let storage = offline_storage().await;
    assert!(!storage.attachments_supported());

    assert!(matches!(
        storage.list_attachments(None).await,
        Err(StorageError::Unsupported(_))
    ));
    assert!(matches!(
        storage.list_attachments(Some("uuid:1")).await,
        Err(StorageError::Unsupported(_))
    ));
    assert!(matches!(
        storage
            .query_attachment(AttachmentRef::Named {
                submission_id: "uuid:1",
                name: "photo.png",
            })
            .await,
        Err(StorageError::Unsupported(_))
    ));
    assert!(matches!(
        storage
            .store_attachment("uuid:1", "photo.png", Bytes::from_static(b"x"))
            .await,
        Err(StorageError::Unsupported(_))
    ));
    assert!(matches!(
        storage.get_attachment(AttachmentRef::Location("anything")).await,
        Err(StorageError::Unsupported(_))
    ));
}

#[tokio::test]
async fn metadata_ids_are_validated_before_any_request() {
    let storage = offline_storage().await;
    let err = storage.store_metadata("CURSOR", "x").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidMetadataId(_)));
}
