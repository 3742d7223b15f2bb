//! Tabular assembly of submission payloads into Arrow record batches.
//!
//! Stored submissions are JSON objects whose values are frequently all
//! strings (SurveyCTO's wide JSON export, CSV-backed desktop exports). To
//! keep downstream analysis sane, column types are auto-detected: a column
//! whose every populated value parses as a timestamp becomes a timestamp
//! column, then numeric detection runs, and everything else stays text.
//! Empty strings and JSON nulls count as missing for typed columns.

use std::collections::BTreeSet;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::array::TimestampMicrosecondArray;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::contract::SubmissionData;

/// Timestamp formats seen across supported platforms: RFC 3339 (ODK
/// Central), SurveyCTO's API format, and the common export spellings.
const NAIVE_FORMATS: &[&str] = &[
    "%b %d, %Y %I:%M:%S %p",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Build a record batch from submission payloads: one row per submission,
/// one column per top-level field (union across rows, sorted by name).
pub fn submissions_to_batch(submissions: &[SubmissionData]) -> Result<RecordBatch, ArrowError> {
    if submissions.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }

    let mut columns: BTreeSet<&str> = BTreeSet::new();
    for submission in submissions {
        columns.extend(submission.keys().map(String::as_str));
    }

    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for column in columns {
        let values: Vec<Option<&Value>> = submissions
            .iter()
            .map(|submission| submission.get(column).filter(|v| !v.is_null()))
            .collect();
        let (field, array) = build_column(column, &values);
        fields.push(field);
        arrays.push(array);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}

/// Sort submissions in place by the given ID field, for platforms that key
/// their frames on it.
pub fn sort_by_id_field(submissions: &mut [SubmissionData], id_field: &str) {
    submissions.sort_by(|a, b| {
        let a = a.get(id_field).and_then(Value::as_str).unwrap_or_default();
        let b = b.get(id_field).and_then(Value::as_str).unwrap_or_default();
        a.cmp(b)
    });
}

fn build_column(name: &str, values: &[Option<&Value>]) -> (Field, ArrayRef) {
    // Populated = present, non-null, and not an empty string.
    let populated: Vec<&Value> = values
        .iter()
        .flatten()
        .filter(|v| v.as_str() != Some(""))
        .copied()
        .collect();

    if !populated.is_empty() {
        if populated.iter().all(|v| v.is_boolean()) {
            let array = BooleanArray::from(
                values
                    .iter()
                    .map(|v| v.and_then(Value::as_bool))
                    .collect::<Vec<_>>(),
            );
            return (
                Field::new(name, DataType::Boolean, true),
                Arc::new(array) as ArrayRef,
            );
        }

        if populated.iter().all(|v| parse_timestamp(v).is_some()) {
            let array = TimestampMicrosecondArray::from(
                values
                    .iter()
                    .map(|v| v.and_then(parse_timestamp))
                    .collect::<Vec<_>>(),
            );
            return (
                Field::new(name, DataType::Timestamp(TimeUnit::Microsecond, None), true),
                Arc::new(array) as ArrayRef,
            );
        }

        if populated.iter().all(|v| parse_integer(v).is_some()) {
            let array = Int64Array::from(
                values
                    .iter()
                    .map(|v| v.and_then(parse_integer))
                    .collect::<Vec<_>>(),
            );
            return (
                Field::new(name, DataType::Int64, true),
                Arc::new(array) as ArrayRef,
            );
        }

        if populated.iter().all(|v| parse_float(v).is_some()) {
            let array = Float64Array::from(
                values
                    .iter()
                    .map(|v| v.and_then(parse_float))
                    .collect::<Vec<_>>(),
            );
            return (
                Field::new(name, DataType::Float64, true),
                Arc::new(array) as ArrayRef,
            );
        }
    }

    let array = StringArray::from(
        values
            .iter()
            .map(|v| v.map(render_text))
            .collect::<Vec<Option<String>>>(),
    );
    (
        Field::new(name, DataType::Utf8, true),
        Arc::new(array) as ArrayRef,
    )
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    let text = value.as_str()?;
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_micros());
    }
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.and_utc().timestamp_micros());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros());
    }
    None
}

fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) if !s.is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
