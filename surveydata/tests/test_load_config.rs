use std::io::Write;

use surveydata::load_config::{load_config, PlatformConfig, StorageConfig};
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(yaml.as_bytes()).expect("write temp config");
    file
}

#[test]
fn loads_surveycto_file_storage_config() {
    let file = write_config(
        r#"
platform:
  type: surveycto
  server: myserver
  form_id: household_survey
storage:
  type: file
  path: ./survey-data
"#,
    );

    let config = load_config(file.path()).expect("config should load");
    match &config.platform {
        PlatformConfig::Surveycto {
            server,
            form_id,
            review_statuses,
        } => {
            assert_eq!(server, "myserver");
            assert_eq!(form_id, "household_survey");
            assert!(review_statuses.is_empty());
        }
        other => panic!("unexpected platform config: {other:?}"),
    }
    match &config.storage {
        StorageConfig::File { path } => assert_eq!(path.to_str(), Some("./survey-data")),
        other => panic!("unexpected storage config: {other:?}"),
    }
    assert!(config.attachment_storage.is_none());
    assert!(!config.no_attachments);
}

#[test]
fn loads_odk_with_separate_s3_attachment_storage() {
    let file = write_config(
        r#"
platform:
  type: odk
  base_url: https://central.example.org
  project_id: 7
  form_id: household_survey
  include_rejected: true
storage:
  type: dynamodb
  region: eu-west-1
  table: survey-submissions
  id_field: KEY
  partition_key: FormID
  partition_value: household_survey
attachment_storage:
  type: s3
  bucket: survey-attachments
  prefix: Surveys/household/
  region: eu-west-1
"#,
    );

    let config = load_config(file.path()).expect("config should load");
    match &config.platform {
        PlatformConfig::Odk {
            base_url,
            project_id,
            include_rejected,
            ..
        } => {
            assert_eq!(base_url, "https://central.example.org");
            assert_eq!(*project_id, 7);
            assert!(*include_rejected);
        }
        other => panic!("unexpected platform config: {other:?}"),
    }
    match &config.storage {
        StorageConfig::Dynamodb {
            partition_key,
            partition_value,
            ..
        } => {
            assert_eq!(partition_key.as_deref(), Some("FormID"));
            assert_eq!(partition_value.as_deref(), Some("household_survey"));
        }
        other => panic!("unexpected storage config: {other:?}"),
    }
    match config.attachment_storage.as_ref().expect("attachment storage") {
        StorageConfig::S3 { bucket, prefix, .. } => {
            assert_eq!(bucket, "survey-attachments");
            assert_eq!(prefix, "Surveys/household/");
        }
        other => panic!("unexpected attachment storage config: {other:?}"),
    }
}

#[test]
fn unknown_keys_are_rejected() {
    let file = write_config(
        r#"
platform:
  type: surveycto
  server: myserver
  form_id: f
storage:
  type: file
  path: ./data
surprise: true
"#,
    );
    assert!(load_config(file.path()).is_err());
}

#[test]
fn missing_file_is_a_clear_error() {
    let err = load_config("/definitely/not/here.yaml").unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}
