//! Read-only access to SurveyCTO Desktop data exports.
//!
//! The export CSV is loaded fully into memory at construction; attachments,
//! when exported alongside, live in a `media/` directory next to the export
//! file and are addressed by the relative paths SurveyCTO Desktop writes
//! into the data itself. All store operations are unsupported.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::contract::{
    AttachmentInfo, AttachmentLocation, AttachmentRef, StorageError, StorageSystem, SubmissionData,
};

const ID_FIELD: &str = "KEY";
const ATTACHMENTS_SUBDIR: &str = "media";
const READ_ONLY: &str = "SurveyCTO exports are read-only";

/// Read-only storage over a SurveyCTO Desktop export.
pub struct SurveyCtoExportStorage {
    export_dir: PathBuf,
    attachments_available: bool,
    submissions: Vec<SubmissionData>,
}

impl SurveyCtoExportStorage {
    /// Load the export file into memory. `attachments_available` declares
    /// whether SurveyCTO Desktop also exported media files.
    pub fn new(
        export_file: impl AsRef<Path>,
        attachments_available: bool,
    ) -> Result<Self, StorageError> {
        let export_file = export_file.as_ref();
        let mut reader = csv::Reader::from_path(export_file)?;
        let headers = reader.headers()?.clone();
        let mut submissions = Vec::new();
        for record in reader.records() {
            let record = record?;
            let submission: SubmissionData = headers
                .iter()
                .zip(record.iter())
                .map(|(field, value)| (field.to_string(), Value::String(value.to_string())))
                .collect();
            submissions.push(submission);
        }
        debug!(
            export_file = %export_file.display(),
            submissions = submissions.len(),
            "loaded SurveyCTO export"
        );
        Ok(SurveyCtoExportStorage {
            export_dir: export_file.parent().unwrap_or(Path::new(".")).to_path_buf(),
            attachments_available,
            submissions,
        })
    }

    fn find(&self, submission_id: &str) -> Option<&SubmissionData> {
        self.submissions
            .iter()
            .find(|submission| submission.get(ID_FIELD).and_then(Value::as_str) == Some(submission_id))
    }

    fn attachment_path_from_ref(&self, attachment: AttachmentRef<'_>) -> PathBuf {
        match attachment {
            // Desktop exports reference attachments by relative path.
            AttachmentRef::Location(location) => {
                self.export_dir.join(location.replace('\\', "/"))
            }
            AttachmentRef::Named { name, .. } => {
                self.export_dir.join(ATTACHMENTS_SUBDIR).join(name)
            }
        }
    }
}

#[async_trait]
impl StorageSystem for SurveyCtoExportStorage {
    fn attachments_supported(&self) -> bool {
        self.attachments_available
    }

    async fn store_metadata(&self, _metadata_id: &str, _metadata: &str) -> Result<(), StorageError> {
        Err(StorageError::Unsupported(READ_ONLY))
    }

    async fn get_metadata(&self, _metadata_id: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unsupported(READ_ONLY))
    }

    async fn list_submissions(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .submissions
            .iter()
            .filter_map(|submission| submission.get(ID_FIELD).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn query_submission(&self, submission_id: &str) -> Result<bool, StorageError> {
        Ok(self.find(submission_id).is_some())
    }

    async fn store_submission(
        &self,
        _submission_id: &str,
        _submission: &SubmissionData,
    ) -> Result<(), StorageError> {
        Err(StorageError::Unsupported(READ_ONLY))
    }

    async fn get_submission(
        &self,
        submission_id: &str,
    ) -> Result<Option<SubmissionData>, StorageError> {
        Ok(self.find(submission_id).cloned())
    }

    async fn get_submissions(&self) -> Result<Vec<SubmissionData>, StorageError> {
        Ok(self.submissions.clone())
    }

    async fn list_attachments<'a>(
        &self,
        _submission_id: Option<&'a str>,
    ) -> Result<Vec<AttachmentInfo>, StorageError> {
        // Exported media files aren't associated with submissions by name,
        // so there is nothing meaningful to list.
        Err(StorageError::Unsupported(
            "attachment listing is not available for desktop exports",
        ))
    }

    async fn query_attachment<'a>(
        &self,
        attachment: AttachmentRef<'a>,
    ) -> Result<bool, StorageError> {
        if !self.attachments_available {
            return Err(StorageError::Unsupported(
                "export was loaded without attachments",
            ));
        }
        Ok(self.attachment_path_from_ref(attachment).is_file())
    }

    async fn store_attachment(
        &self,
        _submission_id: &str,
        _attachment_name: &str,
        _data: Bytes,
    ) -> Result<AttachmentLocation, StorageError> {
        Err(StorageError::Unsupported(READ_ONLY))
    }

    async fn get_attachment<'a>(
        &self,
        attachment: AttachmentRef<'a>,
    ) -> Result<Bytes, StorageError> {
        if !self.attachments_available {
            return Err(StorageError::Unsupported(
                "export was loaded without attachments",
            ));
        }
        Ok(Bytes::from(fs::read(
            self.attachment_path_from_ref(attachment),
        )?))
    }
}
