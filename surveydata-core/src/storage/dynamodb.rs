//! AWS DynamoDB storage backend.
//!
//! Submissions are stored as native items, one attribute per top-level
//! field. The table must already exist with its primary key configured in
//! one of two ways: a fixed partition key plus the ID field as sort key, or
//! the ID field alone as partition key. Metadata (the sync cursor) rides
//! along as faux items inside the reserved `__...__` ID namespace.
//!
//! Attachments are not supported; binary payloads don't belong in a
//! key-value table.

use std::collections::HashMap;

use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::contract::{
    check_metadata_id, AttachmentInfo, AttachmentLocation, AttachmentRef, StorageError,
    StorageSystem, SubmissionData,
};

const METADATA_VALUE_FIELD: &str = "Value";
const UNSUPPORTED: &str = "DynamoDB storage does not hold attachments";

/// Configuration for DynamoDB access.
#[derive(Debug, Clone)]
pub struct DynamoDbConfig {
    /// AWS region.
    pub region: String,
    /// Table name (must already exist).
    pub table: String,
    /// Attribute name of the unique submission ID (e.g. `KEY`).
    pub id_field: String,
    /// Optional fixed partition: attribute name and value (e.g. `FormID`,
    /// the form's ID) when the table is shared across forms.
    pub partition: Option<(String, String)>,
    /// Custom endpoint URL (DynamoDB Local).
    pub endpoint: Option<String>,
}

/// AWS DynamoDB survey data storage.
pub struct DynamoDbStorage {
    client: Client,
    table: String,
    id_field: String,
    partition: Option<(String, String)>,
}

impl DynamoDbStorage {
    pub async fn new(config: DynamoDbConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        DynamoDbStorage {
            client: Client::new(&sdk_config),
            table: config.table,
            id_field: config.id_field,
            partition: config.partition,
        }
    }

    fn primary_key(&self, submission_id: &str) -> HashMap<String, AttributeValue> {
        let mut key = HashMap::new();
        if let Some((name, value)) = &self.partition {
            key.insert(name.clone(), AttributeValue::S(value.clone()));
        }
        key.insert(
            self.id_field.clone(),
            AttributeValue::S(submission_id.to_string()),
        );
        key
    }

    async fn get_item(
        &self,
        submission_id: &str,
        projection: Option<&str>,
    ) -> Result<Option<HashMap<String, AttributeValue>>, StorageError> {
        let mut request = self
            .client
            .get_item()
            .table_name(&self.table)
            .set_key(Some(self.primary_key(submission_id)));
        if let Some(projection) = projection {
            request = request
                .projection_expression(projection)
                .expression_attribute_names("#id", &self.id_field);
        }
        let response = request.send().await.map_err(StorageError::service)?;
        Ok(response.item)
    }

    async fn put_item(
        &self,
        item: HashMap<String, AttributeValue>,
        if_absent: bool,
    ) -> Result<bool, StorageError> {
        let mut request = self.client.put_item().table_name(&self.table).set_item(Some(item));
        if if_absent {
            request = request
                .condition_expression("attribute_not_exists(#id)")
                .expression_attribute_names("#id", &self.id_field);
        }
        match request.send().await {
            Ok(_) => Ok(true),
            Err(err)
                if if_absent
                    && err
                        .as_service_error()
                        .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(err) => Err(StorageError::service(err)),
        }
    }

    /// Fetch every submission ID, paging through the table. Uses a query
    /// when a fixed partition is configured, a scan otherwise.
    async fn all_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let (items, last_key) = match &self.partition {
                Some((name, value)) => {
                    let response = self
                        .client
                        .query()
                        .table_name(&self.table)
                        .key_condition_expression("#pk = :pk")
                        .expression_attribute_names("#pk", name)
                        .expression_attribute_names("#id", &self.id_field)
                        .expression_attribute_values(":pk", AttributeValue::S(value.clone()))
                        .projection_expression("#id")
                        .set_exclusive_start_key(start_key.take())
                        .send()
                        .await
                        .map_err(StorageError::service)?;
                    (
                        response.items.unwrap_or_default(),
                        response.last_evaluated_key,
                    )
                }
                None => {
                    let response = self
                        .client
                        .scan()
                        .table_name(&self.table)
                        .projection_expression("#id")
                        .expression_attribute_names("#id", &self.id_field)
                        .set_exclusive_start_key(start_key.take())
                        .send()
                        .await
                        .map_err(StorageError::service)?;
                    (
                        response.items.unwrap_or_default(),
                        response.last_evaluated_key,
                    )
                }
            };
            for item in items {
                if let Some(AttributeValue::S(id)) = item.get(&self.id_field) {
                    ids.push(id.clone());
                }
            }
            match last_key {
                Some(key) => start_key = Some(key),
                None => break,
            }
        }
        Ok(ids)
    }
}

fn json_to_attr(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(json_to_attr).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_attr(v)))
                .collect(),
        ),
    }
}

fn attr_to_json(attr: &AttributeValue) -> Value {
    match attr {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => n
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(n.clone())),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(items) => Value::Array(items.iter().map(attr_to_json).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attr_to_json(v)))
                .collect(),
        ),
        other => Value::String(format!("{other:?}")),
    }
}

#[async_trait]
impl StorageSystem for DynamoDbStorage {
    async fn store_metadata(&self, metadata_id: &str, metadata: &str) -> Result<(), StorageError> {
        check_metadata_id(metadata_id)?;
        let mut item = self.primary_key(metadata_id);
        item.insert(
            METADATA_VALUE_FIELD.to_string(),
            AttributeValue::S(metadata.to_string()),
        );
        self.put_item(item, false).await?;
        Ok(())
    }

    async fn get_metadata(&self, metadata_id: &str) -> Result<Option<String>, StorageError> {
        let item = self.get_item(metadata_id, None).await?;
        Ok(item.and_then(|item| match item.get(METADATA_VALUE_FIELD) {
            Some(AttributeValue::S(value)) => Some(value.clone()),
            _ => None,
        }))
    }

    async fn list_submissions(&self) -> Result<Vec<String>, StorageError> {
        // Metadata rides in the same table as faux items; keep its reserved
        // namespace out of submission listings.
        Ok(self
            .all_ids()
            .await?
            .into_iter()
            .filter(|id| !(id.starts_with("__") && id.ends_with("__")))
            .collect())
    }

    async fn query_submission(&self, submission_id: &str) -> Result<bool, StorageError> {
        Ok(self.get_item(submission_id, Some("#id")).await?.is_some())
    }

    async fn store_submission(
        &self,
        submission_id: &str,
        submission: &SubmissionData,
    ) -> Result<(), StorageError> {
        let mut item: HashMap<String, AttributeValue> = submission
            .iter()
            .map(|(field, value)| (field.clone(), json_to_attr(value)))
            .collect();
        // The primary key attributes always win over payload fields.
        for (name, value) in self.primary_key(submission_id) {
            item.insert(name, value);
        }
        if !self.put_item(item, true).await? {
            return Err(StorageError::AlreadyExists(submission_id.to_string()));
        }
        debug!(submission_id, table = %self.table, "stored submission");
        Ok(())
    }

    async fn get_submission(
        &self,
        submission_id: &str,
    ) -> Result<Option<SubmissionData>, StorageError> {
        Ok(self.get_item(submission_id, None).await?.map(|item| {
            item.iter()
                .map(|(field, attr)| (field.clone(), attr_to_json(attr)))
                .collect()
        }))
    }

    async fn list_attachments<'a>(
        &self,
        _submission_id: Option<&'a str>,
    ) -> Result<Vec<AttachmentInfo>, StorageError> {
        Err(StorageError::Unsupported(UNSUPPORTED))
    }

    async fn query_attachment<'a>(
        &self,
        _attachment: AttachmentRef<'a>,
    ) -> Result<bool, StorageError> {
        Err(StorageError::Unsupported(UNSUPPORTED))
    }

    async fn store_attachment(
        &self,
        _submission_id: &str,
        _attachment_name: &str,
        _data: Bytes,
    ) -> Result<AttachmentLocation, StorageError> {
        Err(StorageError::Unsupported(UNSUPPORTED))
    }

    async fn get_attachment<'a>(
        &self,
        _attachment: AttachmentRef<'a>,
    ) -> Result<Bytes, StorageError> {
        Err(StorageError::Unsupported(UNSUPPORTED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_attribute_round_trip() {
        let value = json!({
            "KEY": "uuid:1",
            "age": 5,
            "consent": true,
            "note": "",
            "nested": {"a": [1, "two", null]}
        });
        let map = value.as_object().unwrap();
        let attrs: HashMap<String, AttributeValue> = map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_attr(v)))
            .collect();
        let back: SubmissionData = attrs
            .iter()
            .map(|(k, v)| (k.clone(), attr_to_json(v)))
            .collect();
        assert_eq!(Value::Object(back), value);
    }
}
