#![doc = "surveydata-core: uniform access to survey platforms and submission storage."]

//! This crate contains the capability traits, storage backends, platform
//! clients, and tabular-frame assembly for surveydata. The CLI crate is a
//! thin layer on top.
//!
//! # Usage
//! Construct one [`contract::SurveyPlatform`] and one or more
//! [`contract::StorageSystem`] instances, call
//! [`contract::SurveyPlatform::sync_data`] to copy new remote submissions
//! into storage, then read data back out (optionally as an Arrow record
//! batch) for analysis.

pub mod contract;
pub mod frame;
pub mod platform;
pub mod storage;

pub use contract::{
    AttachmentInfo, AttachmentLocation, AttachmentRef, AttachmentSink, PlatformError,
    StorageError, StorageSystem, SubmissionData, SurveyPlatform,
};
