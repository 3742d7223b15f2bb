//! Local file system storage backend.
//!
//! Layout under the submission directory:
//! - `<encoded-id>.json` — one submission payload per file
//! - `<encoded-id>/<encoded-name>` — attachments, one subdirectory per
//!   submission
//! - `<encoded-metadata-id>` — metadata strings (no `.json` suffix, so they
//!   never show up as submissions)

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::contract::{
    check_metadata_id, AttachmentInfo, AttachmentLocation, AttachmentRef, StorageError,
    StorageSystem, SubmissionData,
};
use crate::storage::{decode_key, encode_key};

const SUBMISSION_FILE_SUFFIX: &str = ".json";
const ATTACHMENT_LOCATION_PREFIX: &str = "file:";

/// Local file system survey data storage.
pub struct FileStorage {
    submission_path: PathBuf,
}

impl FileStorage {
    /// Open storage rooted at `submission_path`, creating the directory if
    /// it doesn't exist yet.
    pub fn new(submission_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let submission_path = submission_path.into();
        fs::create_dir_all(&submission_path)?;
        Ok(FileStorage { submission_path })
    }

    fn submission_file(&self, submission_id: &str) -> PathBuf {
        self.submission_path
            .join(format!("{}{SUBMISSION_FILE_SUFFIX}", encode_key(submission_id)))
    }

    fn attachment_path(&self, submission_id: &str, attachment_name: &str) -> PathBuf {
        self.submission_path
            .join(encode_key(submission_id))
            .join(encode_key(attachment_name))
    }

    fn attachment_path_from_ref(&self, attachment: AttachmentRef<'_>) -> Result<PathBuf, StorageError> {
        match attachment {
            AttachmentRef::Named {
                submission_id,
                name,
            } => Ok(self.attachment_path(submission_id, name)),
            AttachmentRef::Location(location) => location
                .strip_prefix(ATTACHMENT_LOCATION_PREFIX)
                .map(PathBuf::from)
                .ok_or_else(|| StorageError::InvalidLocation(location.to_string())),
        }
    }

    fn location_for(path: &Path) -> AttachmentLocation {
        AttachmentLocation::new(format!("{ATTACHMENT_LOCATION_PREFIX}{}", path.display()))
    }

    fn attachments_in_dir(&self, dir: &Path, submission_id: &str) -> Result<Vec<AttachmentInfo>, StorageError> {
        let mut attachments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                attachments.push(AttachmentInfo {
                    name: decode_key(&entry.file_name().to_string_lossy()),
                    submission_id: submission_id.to_string(),
                    location: Self::location_for(&entry.path()),
                });
            }
        }
        Ok(attachments)
    }
}

#[async_trait]
impl StorageSystem for FileStorage {
    fn attachments_supported(&self) -> bool {
        true
    }

    async fn store_metadata(&self, metadata_id: &str, metadata: &str) -> Result<(), StorageError> {
        check_metadata_id(metadata_id)?;
        let path = self.submission_path.join(encode_key(metadata_id));
        fs::write(&path, metadata)?;
        debug!(metadata_id, path = %path.display(), "stored metadata");
        Ok(())
    }

    async fn get_metadata(&self, metadata_id: &str) -> Result<Option<String>, StorageError> {
        let path = self.submission_path.join(encode_key(metadata_id));
        match fs::read_to_string(&path) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_submissions(&self) -> Result<Vec<String>, StorageError> {
        let mut submissions = Vec::new();
        for entry in fs::read_dir(&self.submission_path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = file_name.strip_suffix(SUBMISSION_FILE_SUFFIX) {
                if entry.file_type()?.is_file() {
                    submissions.push(decode_key(stem));
                }
            }
        }
        Ok(submissions)
    }

    async fn query_submission(&self, submission_id: &str) -> Result<bool, StorageError> {
        Ok(self.submission_file(submission_id).is_file())
    }

    async fn store_submission(
        &self,
        submission_id: &str,
        submission: &SubmissionData,
    ) -> Result<(), StorageError> {
        let path = self.submission_file(submission_id);
        let file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists(submission_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::to_writer(file, submission)?;
        debug!(submission_id, path = %path.display(), "stored submission");
        Ok(())
    }

    async fn get_submission(
        &self,
        submission_id: &str,
    ) -> Result<Option<SubmissionData>, StorageError> {
        match fs::read(self.submission_file(submission_id)) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_attachments<'a>(
        &self,
        submission_id: Option<&'a str>,
    ) -> Result<Vec<AttachmentInfo>, StorageError> {
        match submission_id {
            Some(submission_id) => {
                let dir = self.submission_path.join(encode_key(submission_id));
                if !dir.is_dir() {
                    return Ok(Vec::new());
                }
                self.attachments_in_dir(&dir, submission_id)
            }
            None => {
                let mut attachments = Vec::new();
                for entry in fs::read_dir(&self.submission_path)? {
                    let entry = entry?;
                    if entry.file_type()?.is_dir() {
                        let submission_id = decode_key(&entry.file_name().to_string_lossy());
                        attachments
                            .extend(self.attachments_in_dir(&entry.path(), &submission_id)?);
                    }
                }
                Ok(attachments)
            }
        }
    }

    async fn query_attachment<'a>(
        &self,
        attachment: AttachmentRef<'a>,
    ) -> Result<bool, StorageError> {
        Ok(self.attachment_path_from_ref(attachment)?.is_file())
    }

    async fn store_attachment(
        &self,
        submission_id: &str,
        attachment_name: &str,
        data: Bytes,
    ) -> Result<AttachmentLocation, StorageError> {
        let dir = self.submission_path.join(encode_key(submission_id));
        fs::create_dir_all(&dir)?;
        let path = self.attachment_path(submission_id, attachment_name);
        fs::write(&path, &data)?;
        debug!(
            submission_id,
            attachment_name,
            bytes = data.len(),
            "stored attachment"
        );
        Ok(Self::location_for(&path))
    }

    async fn get_attachment<'a>(
        &self,
        attachment: AttachmentRef<'a>,
    ) -> Result<Bytes, StorageError> {
        let path = self.attachment_path_from_ref(attachment)?;
        Ok(Bytes::from(fs::read(path)?))
    }
}
