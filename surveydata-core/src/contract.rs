//! # contract: Capability interfaces for survey platforms and storage systems
//!
//! This module defines the two traits everything else plugs into, plus the
//! supporting data types and error taxonomy shared across backends.
//!
//! - [`StorageSystem`] is implemented once per storage backend (local files,
//!   S3, DynamoDB, desktop exports). A backend is selected at construction
//!   time and used through the trait; callers never inspect the concrete type.
//! - [`SurveyPlatform`] is implemented once per survey-collection service
//!   (SurveyCTO, ODK Central) and copies new remote submissions into one or
//!   more storage systems.
//!
//! ## Mocking & Testing
//! [`StorageSystem`] is annotated for `mockall` (behind the default-on
//! `test-mocks` feature) so platform logic and consumers can run against a
//! deterministic `MockStorageSystem`.
//!
//! ## Error Handling
//! Absent entities are `Ok(None)` / `Ok(false)`, never errors. Conflicting
//! stores, unsupported operations, and malformed locations get their own
//! [`StorageError`] variants; errors from wrapped SDKs surface verbatim under
//! [`StorageError::Service`] with no retry layer in between.

use std::fmt;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[cfg(any(test, feature = "test-mocks"))]
use mockall::automock;

use crate::frame;

/// One submission payload: a JSON object keyed by top-level field name.
pub type SubmissionData = serde_json::Map<String, serde_json::Value>;

/// Errors reported by storage systems.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A submission with this ID is already in storage; stores never
    /// silently overwrite.
    #[error("submission {0:?} already exists in storage")]
    AlreadyExists(String),

    /// The backend does not support the requested operation (attachment
    /// operations on attachment-less backends, writes to read-only exports).
    #[error("operation not supported by this storage system: {0}")]
    Unsupported(&'static str),

    /// Metadata IDs must begin and end with `__` so they can never collide
    /// with submission IDs.
    #[error("metadata IDs must begin and end with __ ({0:?} doesn't qualify)")]
    InvalidMetadataId(String),

    /// A location string was malformed or produced by a different backend.
    #[error("invalid attachment location: {0}")]
    InvalidLocation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Frame(#[from] arrow::error::ArrowError),

    /// An error from the wrapped storage service SDK, surfaced unchanged.
    #[error("storage service error: {0}")]
    Service(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StorageError {
    pub(crate) fn service(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StorageError::Service(Box::new(err))
    }
}

/// Errors reported by survey platforms.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// The platform was constructed without the parameters required for this
    /// operation (server, form ID, credentials).
    #[error("platform not configured for syncing: missing {0}")]
    NotConfigured(&'static str),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network or protocol failure from the remote service. Propagated
    /// unchanged; retrying is the caller's business.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The remote service returned a response this client cannot interpret.
    #[error("malformed platform response: {0}")]
    MalformedResponse(String),

    /// A sync cursor timestamp failed to parse.
    #[error("unparseable cursor timestamp {0:?}")]
    Cursor(String),

    #[error(transparent)]
    Frame(#[from] arrow::error::ArrowError),
}

/// Opaque locator for a stored attachment.
///
/// The encoding is backend-specific (a prefixed path, an object key, ...) and
/// must not be parsed by callers; its only valid use is being handed back to
/// the same backend instance that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentLocation(String);

impl AttachmentLocation {
    pub fn new(location: impl Into<String>) -> Self {
        AttachmentLocation(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AttachmentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One attachment known to a storage system.
#[derive(Debug, Clone)]
pub struct AttachmentInfo {
    /// Attachment filename, as reported by the platform.
    pub name: String,
    /// The submission this attachment belongs to.
    pub submission_id: String,
    /// Locator for retrieving the content from the same backend.
    pub location: AttachmentLocation,
}

/// How to address an attachment: by the location string returned when it was
/// stored, or by the (submission ID, attachment name) pair.
#[derive(Debug, Clone, Copy)]
pub enum AttachmentRef<'a> {
    Location(&'a str),
    Named {
        submission_id: &'a str,
        name: &'a str,
    },
}

/// Checks that a metadata ID is in the reserved `__...__` namespace.
pub(crate) fn check_metadata_id(metadata_id: &str) -> Result<(), StorageError> {
    if metadata_id.len() >= 4 && metadata_id.starts_with("__") && metadata_id.ends_with("__") {
        Ok(())
    } else {
        Err(StorageError::InvalidMetadataId(metadata_id.to_string()))
    }
}

/// Uniform interface to survey data storage.
///
/// One implementation per backend; all methods are sequential async calls
/// with no internal parallelism. Submissions are append-only per ID, and
/// metadata entries (cursor bookkeeping) live in a `__...__` ID namespace
/// that never collides with submission IDs.
#[cfg_attr(any(test, feature = "test-mocks"), automock)]
#[async_trait]
pub trait StorageSystem: Send + Sync {
    /// Whether this backend can store and serve attachments.
    fn attachments_supported(&self) -> bool {
        false
    }

    /// Store a metadata string. Unlike submissions, metadata is mutable:
    /// storing under an existing ID replaces the previous value.
    async fn store_metadata(&self, metadata_id: &str, metadata: &str) -> Result<(), StorageError>;

    /// Fetch a metadata string, or `None` if no such metadata exists.
    async fn get_metadata(&self, metadata_id: &str) -> Result<Option<String>, StorageError>;

    /// List the IDs of all submissions currently in storage, in no
    /// particular order. Metadata entries never appear here.
    async fn list_submissions(&self) -> Result<Vec<String>, StorageError>;

    /// Whether a specific submission exists, without fetching its content.
    async fn query_submission(&self, submission_id: &str) -> Result<bool, StorageError>;

    /// Store a submission payload. Fails with
    /// [`StorageError::AlreadyExists`] if the ID is already present.
    async fn store_submission(
        &self,
        submission_id: &str,
        submission: &SubmissionData,
    ) -> Result<(), StorageError>;

    /// Fetch a submission payload, or `None` if the ID is unknown.
    async fn get_submission(
        &self,
        submission_id: &str,
    ) -> Result<Option<SubmissionData>, StorageError>;

    /// Fetch every submission payload in storage.
    async fn get_submissions(&self) -> Result<Vec<SubmissionData>, StorageError> {
        let mut submissions = Vec::new();
        for submission_id in self.list_submissions().await? {
            if let Some(submission) = self.get_submission(&submission_id).await? {
                submissions.push(submission);
            }
        }
        Ok(submissions)
    }

    /// Assemble every stored submission into an Arrow record batch: one row
    /// per submission, one column per top-level field, with numeric and
    /// datetime columns auto-detected.
    async fn get_submissions_df(&self) -> Result<RecordBatch, StorageError> {
        let submissions = self.get_submissions().await?;
        Ok(frame::submissions_to_batch(&submissions)?)
    }

    /// List attachments, either for one submission or for all of them.
    async fn list_attachments<'a>(
        &self,
        submission_id: Option<&'a str>,
    ) -> Result<Vec<AttachmentInfo>, StorageError>;

    /// Whether a specific attachment exists, without fetching its content.
    async fn query_attachment<'a>(
        &self,
        attachment: AttachmentRef<'a>,
    ) -> Result<bool, StorageError>;

    /// Store an attachment under (submission ID, name), returning the
    /// backend-specific location for retrieving it later.
    async fn store_attachment(
        &self,
        submission_id: &str,
        attachment_name: &str,
        data: Bytes,
    ) -> Result<AttachmentLocation, StorageError>;

    /// Fetch an attachment's binary content.
    async fn get_attachment<'a>(
        &self,
        attachment: AttachmentRef<'a>,
    ) -> Result<Bytes, StorageError>;
}

/// Where a sync run should put attachments.
pub enum AttachmentSink<'a> {
    /// Store attachments in the same system as the submissions (the default,
    /// skipped automatically when that backend doesn't support attachments).
    WithSubmissions,
    /// Store attachments in a separate storage system.
    Separate(&'a dyn StorageSystem),
    /// Don't sync attachments at all.
    Disabled,
}

/// Uniform interface to survey-collection platforms.
#[async_trait]
pub trait SurveyPlatform: Send + Sync {
    /// Pull submissions newer than the stored cursor from the remote service
    /// into `storage`, copying attachments per `attachments`, and return the
    /// IDs of newly stored submissions.
    ///
    /// Idempotent per submission ID: already-stored submissions are never
    /// re-stored, and a second sync with no new remote data returns an empty
    /// list.
    async fn sync_data<'a>(
        &self,
        storage: &dyn StorageSystem,
        attachments: AttachmentSink<'a>,
    ) -> Result<Vec<String>, PlatformError>;

    /// Read all submissions from `storage` and shape them into a record
    /// batch the way this platform's tooling expects (row order, column
    /// naming).
    async fn get_submissions_df(
        &self,
        storage: &dyn StorageSystem,
    ) -> Result<RecordBatch, PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_ids_must_be_dunder_wrapped() {
        assert!(check_metadata_id("__CURSOR__").is_ok());
        assert!(check_metadata_id("__a__").is_ok());
        assert!(check_metadata_id("CURSOR").is_err());
        assert!(check_metadata_id("__CURSOR").is_err());
        assert!(check_metadata_id("CURSOR__").is_err());
        assert!(check_metadata_id("__").is_err());
    }
}
