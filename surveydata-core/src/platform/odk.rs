//! ODK Central survey data platform client.
//!
//! Data comes from the OData `Submissions` table with `$expand=*`, so
//! repeat-group rows arrive nested and are flattened here into `/`-separated
//! columns. Authentication is a session token obtained per operation
//! (`POST /v1/sessions`); nothing touches the network at construction time.
//!
//! The sync cursor is the latest `__system/updatedAt` (falling back to
//! `__system/submissionDate`), persisted in storage metadata. The pull
//! filter uses `ge` rather than `gt` so two submissions sharing a timestamp
//! can never be missed; the overlap is deduplicated against storage.

use async_trait::async_trait;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use tracing::{debug, info};

use crate::contract::{
    AttachmentSink, PlatformError, StorageSystem, SubmissionData, SurveyPlatform,
};
use crate::frame;
use crate::platform::resolve_attachment_storage;

/// Unique submission ID field, as stored.
const ID_FIELD: &str = "KEY";
/// Unique submission ID field, as returned by the API.
const ID_FIELD_API: &str = "__id";
/// Metadata ID under which the sync cursor is persisted.
const CURSOR_METADATA_ID: &str = "__CURSOR__";
/// Suffix of OData columns representing repeat groups.
const REPEAT_GROUP_COLUMN_SUFFIX: &str = "@odata.navigationLink";

/// ODK Central survey data platform.
pub struct OdkPlatform {
    base_url: String,
    project_id: u64,
    form_id: String,
    creds: Option<(String, String)>,
    include_rejected: bool,
    http: reqwest::Client,
}

impl OdkPlatform {
    /// `base_url` is the Central server root (e.g.
    /// `https://central.example.org`), without the `/v1` suffix.
    pub fn new(base_url: impl Into<String>, project_id: u64, form_id: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        OdkPlatform {
            base_url,
            project_id,
            form_id: form_id.into(),
            creds: None,
            include_rejected: false,
            http: reqwest::Client::new(),
        }
    }

    /// Web-user email and password, needed for syncing.
    pub fn with_credentials(
        mut self,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.creds = Some((email.into(), password.into()));
        self
    }

    /// Also pull submissions whose review state is `rejected`.
    pub fn with_rejected_included(mut self, include_rejected: bool) -> Self {
        self.include_rejected = include_rejected;
        self
    }

    /// Obtain a fresh session token.
    async fn session_token(&self) -> Result<String, PlatformError> {
        let (email, password) = self
            .creds
            .as_ref()
            .ok_or(PlatformError::NotConfigured("email and password"))?;
        let response = self
            .http
            .post(format!("{}/v1/sessions", self.base_url))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body.get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Auth("session response carried no token".to_string()))
    }

    fn submission_filter(&self, cursor: &str) -> String {
        let mut filter = String::new();
        if !cursor.is_empty() {
            filter = format!(
                "(__system/updatedAt ge {cursor} or __system/submissionDate ge {cursor})"
            );
        }
        if !self.include_rejected {
            if !filter.is_empty() {
                filter.push_str(" and ");
            }
            filter.push_str("__system/reviewState ne 'rejected'");
        }
        filter
    }

    async fn fetch_table(&self, token: &str, cursor: &str) -> Result<Vec<Value>, PlatformError> {
        let url = format!(
            "{}/v1/projects/{}/forms/{}.svc/Submissions",
            self.base_url, self.project_id, self.form_id
        );
        let mut request = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("$expand", "*")]);
        let filter = self.submission_filter(cursor);
        if !filter.is_empty() {
            request = request.query(&[("$filter", filter.as_str())]);
        }
        debug!(url, filter, "pulling submission table");
        let body: Value = request.send().await?.error_for_status()?.json().await?;
        Ok(body
            .get("value")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_attachments(
        &self,
        token: &str,
        submission_id: &str,
        attachment_storage: &dyn StorageSystem,
    ) -> Result<(), PlatformError> {
        let base = format!(
            "{}/v1/projects/{}/forms/{}/submissions/{}/attachments",
            self.base_url, self.project_id, self.form_id, submission_id
        );
        let listing: Vec<Value> = self
            .http
            .get(&base)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        for attachment in listing {
            if attachment.get("exists").and_then(Value::as_bool) != Some(true) {
                continue;
            }
            let Some(name) = attachment.get("name").and_then(Value::as_str) else {
                continue;
            };
            let data = self
                .http
                .get(format!("{base}/{name}"))
                .bearer_auth(token)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            let location = attachment_storage
                .store_attachment(submission_id, name, data)
                .await?;
            debug!(submission_id, name, location = %location, "synced attachment");
        }
        Ok(())
    }

    fn parse_cursor(raw: &str) -> Result<DateTime<FixedOffset>, PlatformError> {
        DateTime::parse_from_rfc3339(raw).map_err(|_| PlatformError::Cursor(raw.to_string()))
    }
}

/// Flatten a nested submission into `/`-separated columns, the shape ODK
/// Central's own CSV exports use; array elements get zero-based indexes.
fn flatten_submission(value: &Value) -> SubmissionData {
    let mut flat = SubmissionData::new();
    flatten_into("", value, &mut flat);
    flat
}

fn flatten_into(prefix: &str, value: &Value, out: &mut SubmissionData) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}/{key}")
                };
                flatten_into(&key, nested, out);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}/{index}"), nested, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Rename the API's `__id` to `KEY` and drop the OData repeat-group
/// bookkeeping columns (navigation links and per-row `__id`s).
fn tidy_submission(mut submission: SubmissionData) -> SubmissionData {
    if let Some(id) = submission.remove(ID_FIELD_API) {
        submission.insert(ID_FIELD.to_string(), id);
    }

    let repeat_groups: Vec<String> = submission
        .keys()
        .filter_map(|column| {
            column
                .strip_suffix(REPEAT_GROUP_COLUMN_SUFFIX)
                .map(str::to_string)
        })
        .collect();
    if repeat_groups.is_empty() {
        return submission;
    }
    submission.retain(|column, _| {
        if column.ends_with(REPEAT_GROUP_COLUMN_SUFFIX) {
            return false;
        }
        !repeat_groups.iter().any(|group| {
            column.starts_with(&format!("{group}/")) && column.ends_with("/__id")
        })
    });
    submission
}

/// When the submission was last touched: `updatedAt` when set (it is always
/// >= the submission date), the submission date otherwise.
fn last_touched(submission: &SubmissionData) -> Option<&str> {
    submission
        .get("__system/updatedAt")
        .and_then(Value::as_str)
        .filter(|raw| !raw.is_empty())
        .or_else(|| {
            submission
                .get("__system/submissionDate")
                .and_then(Value::as_str)
        })
}

#[async_trait]
impl SurveyPlatform for OdkPlatform {
    async fn sync_data<'a>(
        &self,
        storage: &dyn StorageSystem,
        attachments: AttachmentSink<'a>,
    ) -> Result<Vec<String>, PlatformError> {
        if self.form_id.is_empty() {
            return Err(PlatformError::NotConfigured("form ID"));
        }
        let attachment_storage = resolve_attachment_storage(storage, attachments);

        let token = self.session_token().await?;
        let cursor = storage
            .get_metadata(CURSOR_METADATA_ID)
            .await?
            .unwrap_or_default();
        let rows = self.fetch_table(&token, &cursor).await?;
        info!(
            form_id = %self.form_id,
            fetched = rows.len(),
            cursor = %cursor,
            "pulled submissions from server"
        );

        let mut new_submissions = Vec::new();
        let mut new_cursor: Option<(String, DateTime<FixedOffset>)> = None;
        for row in &rows {
            let submission = tidy_submission(flatten_submission(row));

            if let Some(raw) = last_touched(&submission) {
                let touched = Self::parse_cursor(raw)?;
                if new_cursor.as_ref().is_none_or(|(_, dt)| touched > *dt) {
                    new_cursor = Some((raw.to_string(), touched));
                }
            }

            let Some(submission_id) = submission.get(ID_FIELD).and_then(Value::as_str) else {
                return Err(PlatformError::MalformedResponse(format!(
                    "submission without {ID_FIELD_API} field"
                )));
            };
            let submission_id = submission_id.to_string();

            // The ge filter re-delivers the newest already-stored rows;
            // submissions are append-only per ID, so skip anything stored.
            if storage.query_submission(&submission_id).await? {
                continue;
            }

            let has_attachments = submission
                .get("__system/attachmentsPresent")
                .and_then(Value::as_i64)
                .unwrap_or(0)
                > 0;
            if has_attachments {
                if let Some(attachment_storage) = attachment_storage {
                    self.fetch_attachments(&token, &submission_id, attachment_storage)
                        .await?;
                }
            }

            storage.store_submission(&submission_id, &submission).await?;
            new_submissions.push(submission_id);
        }

        if let Some((raw, _)) = new_cursor {
            if raw != cursor {
                storage.store_metadata(CURSOR_METADATA_ID, &raw).await?;
            }
        }
        info!(
            form_id = %self.form_id,
            new = new_submissions.len(),
            "sync complete"
        );
        Ok(new_submissions)
    }

    async fn get_submissions_df(
        &self,
        storage: &dyn StorageSystem,
    ) -> Result<RecordBatch, PlatformError> {
        let mut submissions = storage.get_submissions().await?;
        frame::sort_by_id_field(&mut submissions, ID_FIELD);
        Ok(frame::submissions_to_batch(&submissions)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submissions_flatten_to_slash_columns() {
        let flat = flatten_submission(&json!({
            "__id": "uuid:a",
            "group": {"name": "ada", "children": [{"age": 4}, {"age": 9}]},
        }));
        assert_eq!(flat.get("__id"), Some(&json!("uuid:a")));
        assert_eq!(flat.get("group/name"), Some(&json!("ada")));
        assert_eq!(flat.get("group/children/0/age"), Some(&json!(4)));
        assert_eq!(flat.get("group/children/1/age"), Some(&json!(9)));
    }

    #[test]
    fn tidying_renames_id_and_drops_odata_columns() {
        let flat = flatten_submission(&json!({
            "__id": "uuid:a",
            "children@odata.navigationLink": "Submissions('uuid:a')/children",
            "children/0/__id": "generated",
            "children/0/age": 4,
        }));
        let tidy = tidy_submission(flat);
        assert_eq!(tidy.get(ID_FIELD), Some(&json!("uuid:a")));
        assert!(!tidy.contains_key(ID_FIELD_API));
        assert!(!tidy.contains_key("children@odata.navigationLink"));
        assert!(!tidy.contains_key("children/0/__id"));
        assert_eq!(tidy.get("children/0/age"), Some(&json!(4)));
    }

    #[test]
    fn update_timestamp_wins_over_submission_date() {
        let submission = flatten_submission(&json!({
            "__system": {"updatedAt": "2023-01-02T00:00:00Z", "submissionDate": "2023-01-01T00:00:00Z"},
        }));
        assert_eq!(last_touched(&submission), Some("2023-01-02T00:00:00Z"));

        let submission = flatten_submission(&json!({
            "__system": {"updatedAt": "", "submissionDate": "2023-01-01T00:00:00Z"},
        }));
        assert_eq!(last_touched(&submission), Some("2023-01-01T00:00:00Z"));
    }

    #[test]
    fn filter_combines_cursor_and_review_state() {
        let platform = OdkPlatform::new("https://central.example.org/", 7, "form");
        assert_eq!(
            platform.submission_filter("2023-01-01T00:00:00Z"),
            "(__system/updatedAt ge 2023-01-01T00:00:00Z or __system/submissionDate ge 2023-01-01T00:00:00Z) and __system/reviewState ne 'rejected'"
        );
        assert_eq!(
            platform.submission_filter(""),
            "__system/reviewState ne 'rejected'"
        );
        let permissive = OdkPlatform::new("https://central.example.org", 7, "form")
            .with_rejected_included(true);
        assert_eq!(permissive.submission_filter(""), "");
    }
}
