use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::DataType;
use bytes::Bytes;
use surveydata_core::contract::MockStorageSystem;
use surveydata_core::platform::SurveyCtoPlatform;

const AUDIT_CSV: &[u8] = b"\
Field name,Total duration (seconds),First appeared (seconds into survey)\n\
consent,12,3\n\
age,5,15\n";

#[tokio::test]
async fn text_audits_load_with_canonical_column_names() {
    let mut storage = MockStorageSystem::new();
    storage
        .expect_get_attachment()
        .returning(|_att: surveydata_core::AttachmentRef<'_>| Ok(Bytes::from_static(AUDIT_CSV)));

    let locations = vec![
        ("uuid:2".to_string(), "file:/data/uuid2/ta.csv".to_string()),
        ("uuid:1".to_string(), "file:/data/uuid1/ta.csv".to_string()),
    ];
    let batch = SurveyCtoPlatform::get_text_audit_df(&storage, &locations)
        .await
        .unwrap();

    // Two submissions, two audit rows each, sorted by submission ID.
    assert_eq!(batch.num_rows(), 4);
    let schema = batch.schema();
    let (key_index, _) = schema.column_with_name("KEY").unwrap();
    let keys = batch
        .column(key_index)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    assert_eq!(keys.value(0), "uuid:1");
    assert_eq!(keys.value(3), "uuid:2");

    let (_, field) = schema.column_with_name("duration_s").unwrap();
    assert_eq!(field.data_type(), &DataType::Int64);
    let (duration_index, _) = schema.column_with_name("duration_s").unwrap();
    let durations = batch
        .column(duration_index)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(durations.value(0), 12);

    assert!(schema.column_with_name("field").is_some());
    assert!(schema.column_with_name("visited_s").is_some());
    // Raw export headers were renamed away.
    assert!(schema.column_with_name("Field name").is_none());
}

#[tokio::test]
async fn submissions_without_an_audit_are_skipped() {
    let mut storage = MockStorageSystem::new();
    storage
        .expect_get_attachment()
        .times(1)
        .returning(|_att: surveydata_core::AttachmentRef<'_>| Ok(Bytes::from_static(AUDIT_CSV)));

    let locations = vec![
        ("uuid:1".to_string(), "file:/data/uuid1/ta.csv".to_string()),
        ("uuid:2".to_string(), String::new()),
    ];
    let batch = SurveyCtoPlatform::get_text_audit_df(&storage, &locations)
        .await
        .unwrap();
    assert_eq!(batch.num_rows(), 2);
}
