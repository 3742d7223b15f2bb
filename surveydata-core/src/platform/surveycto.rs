//! SurveyCTO survey data platform client.
//!
//! Syncing pulls the form's wide JSON via the v2 data API, keyed by a
//! `CompletionDate` cursor persisted in storage metadata. Fields whose
//! values match the form's canonical attachment URL are downloaded and
//! rewritten to storage locations before the submission itself is stored.
//!
//! Review pushes (`update_submissions`) go through the interactive login
//! flow with a CSRF token; that endpoint is not part of the published API
//! and may change between SurveyCTO releases.

use async_trait::async_trait;
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDateTime, Utc};
use reqwest::multipart::Form;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::contract::{
    AttachmentRef, AttachmentSink, PlatformError, StorageError, StorageSystem, SubmissionData,
    SurveyPlatform,
};
use crate::frame;
use crate::platform::resolve_attachment_storage;

/// Unique submission ID field.
const ID_FIELD: &str = "KEY";
/// Metadata ID under which the sync cursor is persisted.
const CURSOR_METADATA_ID: &str = "__CURSOR__";
/// SurveyCTO's `CompletionDate` timestamp format.
const COMPLETION_DATE_FORMAT: &str = "%b %d, %Y %I:%M:%S %p";

/// Review status pushed back to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    fn api_value(self) -> &'static str {
        match self {
            ReviewStatus::Pending => "NONE",
            ReviewStatus::Approved => "APPROVED",
            ReviewStatus::Rejected => "REJECTED",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ReviewStatus::Pending => "set to pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

/// Quality classification pushed back to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityClassification {
    Good,
    Okay,
    Poor,
    Fake,
}

impl QualityClassification {
    fn api_value(self) -> &'static str {
        match self {
            QualityClassification::Good => "ct_good",
            QualityClassification::Okay => "ct_okay",
            QualityClassification::Poor => "ct_poor",
            QualityClassification::Fake => "ct_fake",
        }
    }

    fn label(self) -> &'static str {
        match self {
            QualityClassification::Good => "GOOD",
            QualityClassification::Okay => "OKAY",
            QualityClassification::Poor => "POOR",
            QualityClassification::Fake => "FAKE",
        }
    }
}

/// One correction to push back: a review status, a quality classification,
/// a comment, or any combination (at least one must be set).
#[derive(Debug, Clone, Default)]
pub struct SubmissionUpdate {
    pub submission_id: String,
    pub review_status: Option<ReviewStatus>,
    pub quality: Option<QualityClassification>,
    pub comment: Option<String>,
}

/// SurveyCTO survey data platform.
pub struct SurveyCtoPlatform {
    server: String,
    form_id: String,
    creds: Option<(String, String)>,
    private_key: Option<String>,
    review_statuses: Vec<String>,
    http: reqwest::Client,
}

impl SurveyCtoPlatform {
    /// `server` is the bare server name, without the `https://` prefix or
    /// `.surveycto.com` suffix. Credentials are only needed for operations
    /// that talk to the server; a storage-only reader can skip them.
    pub fn new(server: impl Into<String>, form_id: impl Into<String>) -> Self {
        SurveyCtoPlatform {
            server: server.into(),
            form_id: form_id.into(),
            creds: None,
            private_key: None,
            review_statuses: Vec::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.creds = Some((username.into(), password.into()));
        self
    }

    /// Full text of the form's private key, for encrypted forms.
    pub fn with_private_key(mut self, private_key: impl Into<String>) -> Self {
        self.private_key = Some(private_key.into());
        self
    }

    /// Review statuses to include when pulling data (any combination of
    /// `approved`, `pending`, `rejected`); the server default is
    /// approved-only.
    pub fn with_review_statuses(mut self, review_statuses: Vec<String>) -> Self {
        self.review_statuses = review_statuses;
        self
    }

    fn creds(&self) -> Result<&(String, String), PlatformError> {
        self.creds
            .as_ref()
            .ok_or(PlatformError::NotConfigured("username and password"))
    }

    fn base_url(&self) -> String {
        format!("https://{}.surveycto.com", self.server)
    }

    /// GET normally, POST with the private key as a multipart part for
    /// encrypted forms; the server decrypts on the fly.
    async fn fetch(&self, url: &str) -> Result<reqwest::Response, PlatformError> {
        let (username, password) = self.creds()?;
        let request = match &self.private_key {
            Some(private_key) => self
                .http
                .post(url)
                .multipart(Form::new().text("private_key", private_key.clone())),
            None => self.http.get(url),
        };
        Ok(request
            .basic_auth(username, Some(password))
            .send()
            .await?
            .error_for_status()?)
    }

    async fn fetch_new_submissions(
        &self,
        cursor: &str,
    ) -> Result<Vec<SubmissionData>, PlatformError> {
        let mut url = format!(
            "{}/api/v2/forms/data/wide/json/{}?date={}",
            self.base_url(),
            self.form_id,
            urlencode(if cursor.is_empty() { "0" } else { cursor }),
        );
        if !self.review_statuses.is_empty() {
            url.push_str("&r=");
            url.push_str(&urlencode(&self.review_statuses.join("|")));
        }
        debug!(url, "pulling form data");
        Ok(self.fetch(&url).await?.json().await?)
    }

    fn parse_completion_date(raw: &str) -> Result<NaiveDateTime, PlatformError> {
        NaiveDateTime::parse_from_str(raw, COMPLETION_DATE_FORMAT)
            .map_err(|_| PlatformError::Cursor(raw.to_string()))
    }

    /// Download each attachment referenced by the submission and rewrite
    /// the referencing field to the storage location.
    async fn sync_attachments(
        &self,
        submission: &mut SubmissionData,
        submission_id: &str,
        attachment_storage: &dyn StorageSystem,
    ) -> Result<(), PlatformError> {
        // Fields matching the form's attachment URL format are presumed to
        // be attachments.
        let attachment_prefix = format!(
            "{}/api/v2/forms/{}/submissions/{}/attachments/",
            self.base_url(),
            self.form_id,
            submission_id
        );
        let attachment_fields: Vec<(String, String)> = submission
            .iter()
            .filter_map(|(field, value)| {
                let url = value.as_str()?;
                url.starts_with(&attachment_prefix)
                    .then(|| (field.clone(), url.to_string()))
            })
            .collect();

        for (field, url) in attachment_fields {
            let attachment_name = url[attachment_prefix.len()..].to_string();
            let data = self.fetch(&url).await?.bytes().await?;
            let location = attachment_storage
                .store_attachment(submission_id, &attachment_name, data)
                .await?;
            debug!(
                submission_id,
                attachment_name,
                location = %location,
                "synced attachment"
            );
            submission.insert(field, Value::String(location.into_string()));
        }
        Ok(())
    }

    /// Push one or more submission corrections (reviews, classifications,
    /// comments) back to the server.
    ///
    /// Uses an endpoint SurveyCTO has not published; it may break in future
    /// server releases.
    pub async fn update_submissions(
        &self,
        updates: &[SubmissionUpdate],
    ) -> Result<(), PlatformError> {
        let timestamp = Utc::now().timestamp_millis();
        let mut review_bundle = Vec::with_capacity(updates.len());
        for update in updates {
            if update.submission_id.is_empty() {
                return Err(PlatformError::MalformedResponse(
                    "submission update without a submission ID".into(),
                ));
            }
            if update.review_status.is_none()
                && update.quality.is_none()
                && update.comment.is_none()
            {
                return Err(PlatformError::MalformedResponse(format!(
                    "submission update for {} carries no review status, classification or comment",
                    update.submission_id
                )));
            }

            let mut xreview = serde_json::json!({ "instanceId": update.submission_id });
            let mut comments = Vec::new();
            if let Some(comment) = &update.comment {
                comments.push(serde_json::json!({
                    "text": comment,
                    "type": "USER",
                    "creationDate": timestamp,
                }));
            }
            let system_comment = match (update.review_status, update.quality) {
                (Some(status), Some(quality)) => {
                    xreview["statusUpdate"] = status.api_value().into();
                    xreview["classTagUpdate"] = quality.api_value().into();
                    Some(format!(
                        "[ Submission {} via API. Classified as {}. ]",
                        status.label(),
                        quality.label()
                    ))
                }
                (Some(status), None) => {
                    xreview["statusUpdate"] = status.api_value().into();
                    Some(format!("[ Submission {} via API. ]", status.label()))
                }
                (None, Some(quality)) => {
                    xreview["classTagUpdate"] = quality.api_value().into();
                    Some(format!("[ Classified as {} via API. ]", quality.label()))
                }
                (None, None) => None,
            };
            if let Some(text) = system_comment {
                comments.push(serde_json::json!({
                    "text": text,
                    "type": "SYSTEM",
                    "creationDate": timestamp,
                }));
            }
            xreview["comments"] = Value::Array(comments);
            review_bundle.push(serde_json::json!({
                "xReview": xreview,
                "lastReviewDate": timestamp,
            }));
        }

        let (session, csrf_token) = self.login().await?;
        session
            .post(format!(
                "{}/forms/{}/save-reviews",
                self.base_url(),
                self.form_id
            ))
            .header("X-csrf-token", csrf_token)
            .json(&review_bundle)
            .send()
            .await?
            .error_for_status()?;
        info!(updates = updates.len(), form_id = %self.form_id, "pushed submission updates");
        Ok(())
    }

    /// Load one or more text audit CSV attachments into a single record
    /// batch, keyed by submission ID, with columns renamed to their
    /// canonical short names.
    ///
    /// `locations` pairs each submission ID with the attachment location of
    /// its text audit; empty locations (submissions without an audit) are
    /// skipped.
    pub async fn get_text_audit_df(
        storage: &dyn StorageSystem,
        locations: &[(String, String)],
    ) -> Result<RecordBatch, PlatformError> {
        let mut rows = Vec::new();
        for (submission_id, location) in locations {
            if location.is_empty() {
                continue;
            }
            let data = storage
                .get_attachment(AttachmentRef::Location(location))
                .await?;
            let mut reader = csv::Reader::from_reader(data.as_ref());
            let headers: Vec<String> = reader
                .headers()
                .map_err(StorageError::from)?
                .iter()
                .map(|header| rename_audit_column(header).to_string())
                .collect();
            for record in reader.records() {
                let record = record.map_err(StorageError::from)?;
                let mut row: SubmissionData = headers
                    .iter()
                    .cloned()
                    .zip(record.iter().map(|value| Value::String(value.to_string())))
                    .collect();
                row.insert(ID_FIELD.to_string(), Value::String(submission_id.clone()));
                rows.push(row);
            }
        }
        frame::sort_by_id_field(&mut rows, ID_FIELD);
        Ok(frame::submissions_to_batch(&rows)?)
    }

    /// Interactive login: pick up a CSRF token from the index page, then
    /// post credentials. Returns a cookie-carrying client plus the
    /// post-login CSRF token.
    async fn login(&self) -> Result<(reqwest::Client, String), PlatformError> {
        let (username, password) = self.creds()?;
        let session = reqwest::Client::builder()
            .cookie_store(true)
            .build()?;

        let response = session
            .head(format!("{}/index.html", self.base_url()))
            .send()
            .await?
            .error_for_status()?;
        let csrf_token = header_value(&response, "X-csrf-token").ok_or_else(|| {
            PlatformError::Auth("server did not provide a CSRF token".to_string())
        })?;

        let response = session
            .post(format!("{}/login", self.base_url()))
            .header("X-csrf-token", csrf_token)
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await?
            .error_for_status()?;
        if let Some(failure) = header_value(&response, "login_failure") {
            return Err(PlatformError::Auth(failure));
        }
        let csrf_token = header_value(&response, "X-csrf-token").ok_or_else(|| {
            PlatformError::Auth("login did not provide a CSRF token".to_string())
        })?;
        Ok((session, csrf_token))
    }
}

#[async_trait]
impl SurveyPlatform for SurveyCtoPlatform {
    async fn sync_data<'a>(
        &self,
        storage: &dyn StorageSystem,
        attachments: AttachmentSink<'a>,
    ) -> Result<Vec<String>, PlatformError> {
        if self.server.is_empty() || self.form_id.is_empty() {
            return Err(PlatformError::NotConfigured("server and form ID"));
        }
        let attachment_storage = resolve_attachment_storage(storage, attachments);

        let cursor = storage
            .get_metadata(CURSOR_METADATA_ID)
            .await?
            .unwrap_or_default();
        let data = self.fetch_new_submissions(&cursor).await?;
        info!(
            form_id = %self.form_id,
            fetched = data.len(),
            cursor = %cursor,
            "pulled submissions from server"
        );

        let mut new_submissions = Vec::new();
        let mut new_cursor: Option<(String, NaiveDateTime)> = None;
        for mut submission in data {
            // Track the latest CompletionDate rather than trusting response
            // order.
            if let Some(raw) = submission.get("CompletionDate").and_then(Value::as_str) {
                let completed = Self::parse_completion_date(raw)?;
                if new_cursor.as_ref().is_none_or(|(_, dt)| completed > *dt) {
                    new_cursor = Some((raw.to_string(), completed));
                }
            }

            let Some(submission_id) = submission.get(ID_FIELD).and_then(Value::as_str) else {
                return Err(PlatformError::MalformedResponse(format!(
                    "submission without {ID_FIELD} field"
                )));
            };
            let submission_id = submission_id.to_string();

            // The API query is inclusive of the cursor date, so the newest
            // already-stored submission comes back again; IDs are
            // append-only, skip everything already in storage.
            if storage.query_submission(&submission_id).await? {
                continue;
            }

            if let Some(attachment_storage) = attachment_storage {
                self.sync_attachments(&mut submission, &submission_id, attachment_storage)
                    .await?;
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

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    let value = response.headers().get(name)?;
    match value.to_str() {
        Ok(value) if !value.is_empty() => Some(value.to_string()),
        Ok(_) => None,
        Err(_) => {
            warn!(header = name, "non-UTF-8 header value from server");
            None
        }
    }
}

/// Map text audit CSV headers to the canonical short names analysis code
/// expects; unknown headers pass through unchanged.
fn rename_audit_column(raw: &str) -> &str {
    match raw {
        "Field name" => "field",
        "Total duration (seconds)" => "duration_s",
        "First appeared (seconds into survey)" => "visited_s",
        "Choices values" => "values",
        "Choices labels" => "labels",
        "Device time" => "device_time",
        "Form time (ms)" => "form_time_ms",
        "Event" => "event",
        "Duration (ms)" => "duration_ms",
        other => other,
    }
}

/// Percent-encode a query value (RFC 3986 unreserved characters pass
/// through).
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}
