use std::fs;

use bytes::Bytes;
use serde_json::json;
use surveydata_core::storage::{OdkExportStorage, SurveyCtoExportStorage};
use surveydata_core::{AttachmentRef, StorageError, StorageSystem};
use tempfile::tempdir;

#[tokio::test]
async fn surveycto_export_serves_csv_rows_as_submissions() {
    let dir = tempdir().unwrap();
    let export_file = dir.path().join("form_WIDE.csv");
    fs::write(
        &export_file,
        "KEY,age,name\nuuid:1,5,ada\nuuid:2,7,grace\n",
    )
    .unwrap();

    let storage = SurveyCtoExportStorage::new(&export_file, false).unwrap();

    let mut listed = storage.list_submissions().await.unwrap();
    listed.sort();
    assert_eq!(listed, vec!["uuid:1", "uuid:2"]);

    let loaded = storage.get_submission("uuid:1").await.unwrap().unwrap();
    assert_eq!(loaded.get("age"), Some(&json!("5")));
    assert_eq!(loaded.get("name"), Some(&json!("ada")));

    assert!(storage.query_submission("uuid:2").await.unwrap());
    assert!(!storage.query_submission("uuid:3").await.unwrap());
    assert_eq!(storage.get_submission("uuid:3").await.unwrap(), None);
}

#[tokio::test]
async fn surveycto_export_rejects_writes() {
    let dir = tempdir().unwrap();
    let export_file = dir.path().join("form_WIDE.csv");
    fs::write(&export_file, "KEY,age\nuuid:1,5\n").unwrap();

    let storage = SurveyCtoExportStorage::new(&export_file, false).unwrap();

    let payload = json!({"KEY": "uuid:9"}).as_object().unwrap().clone();
    assert!(matches!(
        storage.store_submission("uuid:9", &payload).await,
        Err(StorageError::Unsupported(_))
    ));
    assert!(matches!(
        storage.store_metadata("__CURSOR__", "x").await,
        Err(StorageError::Unsupported(_))
    ));
    assert!(matches!(
        storage
            .store_attachment("uuid:1", "a.png", Bytes::from_static(b"x"))
            .await,
        Err(StorageError::Unsupported(_))
    ));
}

#[tokio::test]
async fn surveycto_export_without_attachments_rejects_attachment_reads() {
    let dir = tempdir().unwrap();
    let export_file = dir.path().join("form_WIDE.csv");
    fs::write(&export_file, "KEY,age\nuuid:1,5\n").unwrap();

    let storage = SurveyCtoExportStorage::new(&export_file, false).unwrap();
    assert!(!storage.attachments_supported());
    assert!(matches!(
        storage
            .query_attachment(AttachmentRef::Location("media/photo.png"))
            .await,
        Err(StorageError::Unsupported(_))
    ));
    assert!(matches!(
        storage
            .get_attachment(AttachmentRef::Location("media/photo.png"))
            .await,
        Err(StorageError::Unsupported(_))
    ));
}

#[tokio::test]
async fn surveycto_export_serves_media_attachments() {
    let dir = tempdir().unwrap();
    let export_file = dir.path().join("form_WIDE.csv");
    fs::write(&export_file, "KEY,photo\nuuid:1,media\\photo.png\n").unwrap();
    fs::create_dir(dir.path().join("media")).unwrap();
    fs::write(dir.path().join("media/photo.png"), b"image bytes").unwrap();

    let storage = SurveyCtoExportStorage::new(&export_file, true).unwrap();
    assert!(storage.attachments_supported());

    // The location is the relative path as exported into the data itself.
    assert!(storage
        .query_attachment(AttachmentRef::Location("media\\photo.png"))
        .await
        .unwrap());
    let data = storage
        .get_attachment(AttachmentRef::Location("media/photo.png"))
        .await
        .unwrap();
    assert_eq!(data, Bytes::from_static(b"image bytes"));

    let by_name = storage
        .get_attachment(AttachmentRef::Named {
            submission_id: "uuid:1",
            name: "photo.png",
        })
        .await
        .unwrap();
    assert_eq!(by_name, Bytes::from_static(b"image bytes"));
}

#[tokio::test]
async fn odk_export_merges_repeat_groups_into_wide_columns() {
    let dir = tempdir().unwrap();
    let export_file = dir.path().join("household.csv");
    fs::write(
        &export_file,
        "KEY,name\nuuid:a,ada\nuuid:b,grace\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("household-children.csv"),
        "KEY,PARENT_KEY,age\nuuid:a/children[1],uuid:a,4\nuuid:a/children[2],uuid:a,9\nuuid:b/children[1],uuid:b,2\n",
    )
    .unwrap();

    let storage = OdkExportStorage::new(&export_file, false).unwrap();

    let a = storage.get_submission("uuid:a").await.unwrap().unwrap();
    assert_eq!(a.get("name"), Some(&json!("ada")));
    assert_eq!(a.get("children/0/age"), Some(&json!("4")));
    assert_eq!(a.get("children/1/age"), Some(&json!("9")));

    let b = storage.get_submission("uuid:b").await.unwrap().unwrap();
    assert_eq!(b.get("children/0/age"), Some(&json!("2")));
    assert!(!b.contains_key("children/1/age"));
}

#[tokio::test]
async fn odk_export_ignores_unrelated_csv_files() {
    let dir = tempdir().unwrap();
    let export_file = dir.path().join("household.csv");
    fs::write(&export_file, "KEY,name\nuuid:a,ada\n").unwrap();
    // Same directory, but not named like a repeat-group export.
    fs::write(dir.path().join("other.csv"), "x,y,z\n1,2,3\n").unwrap();

    let storage = OdkExportStorage::new(&export_file, false).unwrap();
    let a = storage.get_submission("uuid:a").await.unwrap().unwrap();
    assert_eq!(a.len(), 2);
}

#[tokio::test]
async fn odk_export_is_read_only() {
    let dir = tempdir().unwrap();
    let export_file = dir.path().join("household.csv");
    fs::write(&export_file, "KEY,name\nuuid:a,ada\n").unwrap();

    let storage = OdkExportStorage::new(&export_file, false).unwrap();
    let payload = json!({"KEY": "uuid:x"}).as_object().unwrap().clone();
    assert!(matches!(
        storage.store_submission("uuid:x", &payload).await,
        Err(StorageError::Unsupported(_))
    ));
    assert!(matches!(
        storage.get_metadata("__CURSOR__").await,
        Err(StorageError::Unsupported(_))
    ));
}
