//! Read-only access to ODK Central data exports.
//!
//! An "All data and Attachments" export unzips to a main CSV plus one CSV
//! per repeat group (named `<main-stem>-<group>.csv`). At construction the
//! repeat-group rows are merged back into their parent submissions as wide
//! columns (`group/0/field`, zero-based to match what the live ODK platform
//! produces), so the export reads the same as synced data.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::contract::{
    AttachmentInfo, AttachmentLocation, AttachmentRef, StorageError, StorageSystem, SubmissionData,
};

const ID_FIELD: &str = "KEY";
const PARENT_ID_FIELD: &str = "PARENT_KEY";
const ATTACHMENTS_SUBDIR: &str = "media";
const READ_ONLY: &str = "ODK Central exports are read-only";

/// Read-only storage over an ODK Central export.
pub struct OdkExportStorage {
    export_dir: PathBuf,
    attachments_available: bool,
    submissions: Vec<SubmissionData>,
}

impl OdkExportStorage {
    pub fn new(
        export_file: impl AsRef<Path>,
        attachments_available: bool,
    ) -> Result<Self, StorageError> {
        let export_file = export_file.as_ref();
        let mut submissions = read_csv_records(export_file)?;

        let repeat_files = find_repeat_files(export_file)?;
        for repeat_file in &repeat_files {
            let rows = read_csv_records(repeat_file)?;
            merge_repeat_rows(&mut submissions, rows);
        }
        debug!(
            export_file = %export_file.display(),
            submissions = submissions.len(),
            repeat_files = repeat_files.len(),
            "loaded ODK Central export"
        );

        Ok(OdkExportStorage {
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
            AttachmentRef::Location(location) => {
                self.export_dir.join(location.replace('\\', "/"))
            }
            AttachmentRef::Named { name, .. } => {
                self.export_dir.join(ATTACHMENTS_SUBDIR).join(name)
            }
        }
    }
}

fn read_csv_records(path: &Path) -> Result<Vec<SubmissionData>, StorageError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: SubmissionData = headers
            .iter()
            .zip(record.iter())
            .map(|(field, value)| (field.to_string(), Value::String(value.to_string())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Repeat-group exports sit next to the main file, named `<stem>-<group>.csv`.
fn find_repeat_files(export_file: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let stem = export_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = export_file.parent().unwrap_or(Path::new("."));
    let prefix = format!("{stem}-");

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".csv") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Merge repeat-group rows into their parent submissions as wide columns.
///
/// A repeat row's `KEY` looks like `uuid:xxx/group[1]/item[2]`; it becomes
/// the column prefix `group/0/item/1/` (indexes shifted to zero-based), and
/// `PARENT_KEY`'s first segment names the owning submission.
fn merge_repeat_rows(submissions: &mut [SubmissionData], rows: Vec<SubmissionData>) {
    let first_has_keys = rows.first().is_some_and(|row| {
        row.contains_key(ID_FIELD) && row.contains_key(PARENT_ID_FIELD) && row.len() > 2
    });
    if !first_has_keys {
        return;
    }

    let index_re = Regex::new(r"/\d+/").expect("static regex");
    let mut merged: BTreeMap<String, SubmissionData> = BTreeMap::new();
    for mut row in rows {
        let Some(Value::String(key)) = row.remove(ID_FIELD) else {
            continue;
        };
        let Some(Value::String(parent_key)) = row.remove(PARENT_ID_FIELD) else {
            continue;
        };
        let submission_id = parent_key.split('/').next().unwrap_or_default().to_string();

        let mut prefix = key
            .split('/')
            .skip(1)
            .collect::<Vec<_>>()
            .join("/")
            .replace('[', "/")
            .replace(']', "");
        prefix.push('/');
        let prefix = index_re
            .replace_all(&prefix, |caps: &regex::Captures<'_>| {
                let index: u64 = caps[0][1..caps[0].len() - 1].parse().unwrap_or(1);
                format!("/{}/", index.saturating_sub(1))
            })
            .into_owned();

        let entry = merged.entry(submission_id).or_default();
        for (field, value) in row {
            entry.insert(format!("{prefix}{field}"), value);
        }
    }

    for submission in submissions.iter_mut() {
        let Some(id) = submission.get(ID_FIELD).and_then(Value::as_str) else {
            continue;
        };
        if let Some(extra) = merged.get(id) {
            for (field, value) in extra {
                submission.insert(field.clone(), value.clone());
            }
        }
    }
}

#[async_trait]
impl StorageSystem for OdkExportStorage {
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> SubmissionData {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn repeat_rows_merge_as_zero_based_wide_columns() {
        let mut submissions = vec![row(json!({"KEY": "uuid:a", "name": "ada"}))];
        let repeats = vec![
            row(json!({
                "KEY": "uuid:a/child[1]",
                "PARENT_KEY": "uuid:a",
                "age": "4"
            })),
            row(json!({
                "KEY": "uuid:a/child[2]",
                "PARENT_KEY": "uuid:a",
                "age": "9"
            })),
        ];
        merge_repeat_rows(&mut submissions, repeats);

        let merged = &submissions[0];
        assert_eq!(merged.get("child/0/age"), Some(&json!("4")));
        assert_eq!(merged.get("child/1/age"), Some(&json!("9")));
        assert!(!merged.contains_key("PARENT_KEY"));
    }

    #[test]
    fn nested_repeat_indexes_all_shift() {
        let mut submissions = vec![row(json!({"KEY": "uuid:a"}))];
        let repeats = vec![row(json!({
            "KEY": "uuid:a/group[2]/item[3]",
            "PARENT_KEY": "uuid:a/group[2]",
            "value": "x"
        }))];
        merge_repeat_rows(&mut submissions, repeats);
        assert_eq!(submissions[0].get("group/1/item/2/value"), Some(&json!("x")));
    }

    #[test]
    fn repeat_files_without_repeat_columns_are_ignored() {
        let mut submissions = vec![row(json!({"KEY": "uuid:a"}))];
        let not_repeats = vec![row(json!({"other": "1", "thing": "2", "more": "3"}))];
        merge_repeat_rows(&mut submissions, not_repeats);
        assert_eq!(submissions[0].len(), 1);
    }
}
