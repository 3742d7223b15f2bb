//! AWS S3 storage backend.
//!
//! Submissions are `.json` objects directly under the key prefix;
//! attachments live one level deeper (`<prefix><encoded-id>/<encoded-name>`).
//! Slash counting at the prefix level keeps submission listing from being
//! fooled by attachments that happen to end in `.json`.

use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::{
    check_metadata_id, AttachmentInfo, AttachmentLocation, AttachmentRef, StorageError,
    StorageSystem, SubmissionData,
};
use crate::storage::{decode_key, encode_key};

const SUBMISSION_KEY_SUFFIX: &str = ".json";
const ATTACHMENT_LOCATION_PREFIX: &str = "s3:";

/// Configuration for S3 access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    /// Globally-unique bucket name (must already exist).
    pub bucket: String,

    /// Prefix for all key names (e.g. `Surveys/Form123/`).
    pub prefix: String,

    /// AWS region; falls back to the ambient environment when unset.
    pub region: Option<String>,

    /// Custom endpoint URL (LocalStack, MinIO).
    pub endpoint: Option<String>,

    /// Explicit credentials; the default provider chain applies when unset.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        S3Config {
            bucket: bucket.into(),
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self.session_token = session_token;
        self
    }
}

/// AWS S3 survey data storage.
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    /// Build the client from configuration. No network I/O happens here;
    /// the first request is made by the first storage operation.
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                config.session_token.clone(),
                None,
                "surveydata-explicit",
            ));
        }
        let sdk_config = loader.load().await;
        S3Storage {
            client: Client::new(&sdk_config),
            bucket: config.bucket,
            prefix: config.prefix,
        }
    }

    fn submission_key(&self, submission_id: &str) -> String {
        format!(
            "{}{}{SUBMISSION_KEY_SUFFIX}",
            self.prefix,
            encode_key(submission_id)
        )
    }

    fn submission_id(&self, key: &str) -> String {
        let stem = &key[self.prefix.len()..key.len() - SUBMISSION_KEY_SUFFIX.len()];
        decode_key(stem)
    }

    fn attachment_key(&self, submission_id: &str, attachment_name: &str) -> String {
        format!(
            "{}{}/{}",
            self.prefix,
            encode_key(submission_id),
            encode_key(attachment_name)
        )
    }

    fn attachment_key_from_ref(&self, attachment: AttachmentRef<'_>) -> Result<String, StorageError> {
        match attachment {
            AttachmentRef::Named {
                submission_id,
                name,
            } => Ok(self.attachment_key(submission_id, name)),
            AttachmentRef::Location(location) => location
                .strip_prefix(ATTACHMENT_LOCATION_PREFIX)
                .map(str::to_string)
                .ok_or_else(|| StorageError::InvalidLocation(location.to_string())),
        }
    }

    async fn object_exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(StorageError::service(err)),
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(StorageError::service)?;
                Ok(Some(data.into_bytes()))
            }
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => Ok(None),
            Err(err) => Err(StorageError::service(err)),
        }
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(StorageError::service)?;
        Ok(())
    }

    /// List all keys under `prefix`, following continuation tokens.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(StorageError::service)?;
            if let Some(contents) = response.contents {
                keys.extend(contents.into_iter().filter_map(|object| object.key));
            }
            continuation_token = response.next_continuation_token;
            if continuation_token.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    fn prefix_slashes(&self) -> usize {
        self.prefix.matches('/').count()
    }
}

#[async_trait]
impl StorageSystem for S3Storage {
    fn attachments_supported(&self) -> bool {
        true
    }

    async fn store_metadata(&self, metadata_id: &str, metadata: &str) -> Result<(), StorageError> {
        check_metadata_id(metadata_id)?;
        let key = format!("{}{}", self.prefix, encode_key(metadata_id));
        self.put_object(&key, Bytes::copy_from_slice(metadata.as_bytes()))
            .await
    }

    async fn get_metadata(&self, metadata_id: &str) -> Result<Option<String>, StorageError> {
        let key = format!("{}{}", self.prefix, encode_key(metadata_id));
        match self.get_object(&key).await? {
            Some(raw) => Ok(Some(String::from_utf8_lossy(&raw).into_owned())),
            None => Ok(None),
        }
    }

    async fn list_submissions(&self) -> Result<Vec<String>, StorageError> {
        let slashes_expected = self.prefix_slashes();
        let submissions = self
            .list_keys(&self.prefix)
            .await?
            .into_iter()
            .filter(|key| {
                key.ends_with(SUBMISSION_KEY_SUFFIX)
                    && key.matches('/').count() == slashes_expected
            })
            .map(|key| self.submission_id(&key))
            .collect();
        Ok(submissions)
    }

    async fn query_submission(&self, submission_id: &str) -> Result<bool, StorageError> {
        self.object_exists(&self.submission_key(submission_id)).await
    }

    async fn store_submission(
        &self,
        submission_id: &str,
        submission: &SubmissionData,
    ) -> Result<(), StorageError> {
        let key = self.submission_key(submission_id);
        if self.object_exists(&key).await? {
            return Err(StorageError::AlreadyExists(submission_id.to_string()));
        }
        let body = serde_json::to_vec(submission)?;
        self.put_object(&key, Bytes::from(body)).await?;
        debug!(submission_id, key, "stored submission");
        Ok(())
    }

    async fn get_submission(
        &self,
        submission_id: &str,
    ) -> Result<Option<SubmissionData>, StorageError> {
        match self.get_object(&self.submission_key(submission_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn list_attachments<'a>(
        &self,
        submission_id: Option<&'a str>,
    ) -> Result<Vec<AttachmentInfo>, StorageError> {
        let slashes_expected = self.prefix_slashes() + 1;
        let prefix = match submission_id {
            Some(submission_id) => format!("{}{}/", self.prefix, encode_key(submission_id)),
            None => self.prefix.clone(),
        };
        let mut attachments = Vec::new();
        for key in self.list_keys(&prefix).await? {
            if key.matches('/').count() != slashes_expected {
                continue;
            }
            let stripped = &key[self.prefix.len()..];
            let Some((encoded_id, encoded_name)) = stripped.split_once('/') else {
                continue;
            };
            attachments.push(AttachmentInfo {
                name: decode_key(encoded_name),
                submission_id: decode_key(encoded_id),
                location: AttachmentLocation::new(format!("{ATTACHMENT_LOCATION_PREFIX}{key}")),
            });
        }
        Ok(attachments)
    }

    async fn query_attachment<'a>(
        &self,
        attachment: AttachmentRef<'a>,
    ) -> Result<bool, StorageError> {
        let key = self.attachment_key_from_ref(attachment)?;
        self.object_exists(&key).await
    }

    async fn store_attachment(
        &self,
        submission_id: &str,
        attachment_name: &str,
        data: Bytes,
    ) -> Result<AttachmentLocation, StorageError> {
        let key = self.attachment_key(submission_id, attachment_name);
        debug!(submission_id, attachment_name, key, bytes = data.len(), "storing attachment");
        self.put_object(&key, data).await?;
        Ok(AttachmentLocation::new(format!(
            "{ATTACHMENT_LOCATION_PREFIX}{key}"
        )))
    }

    async fn get_attachment<'a>(
        &self,
        attachment: AttachmentRef<'a>,
    ) -> Result<Bytes, StorageError> {
        let key = self.attachment_key_from_ref(attachment)?;
        self.get_object(&key)
            .await?
            .ok_or_else(|| StorageError::InvalidLocation(format!("no such attachment: {key}")))
    }
}
