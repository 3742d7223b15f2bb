//! Loads and adapts a static YAML config into typed platform and storage
//! descriptions.
//!
//! This module is the only place where untrusted YAML is parsed. Secrets
//! never appear in the YAML; credentials are injected from the environment
//! when the platform is built (see `cli`).
//!
//! All errors here use `anyhow::Error` for context-rich diagnostics,
//! surfaced at the CLI boundary.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    pub platform: PlatformConfig,
    pub storage: StorageConfig,
    /// Separate storage system for attachments, only if needed.
    #[serde(default)]
    pub attachment_storage: Option<StorageConfig>,
    /// Skip attachment syncing entirely.
    #[serde(default)]
    pub no_attachments: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformConfig {
    Surveycto {
        /// Server name, without the https prefix or .surveycto.com suffix.
        server: String,
        form_id: String,
        /// Review statuses to pull (server default is approved-only).
        #[serde(default)]
        review_statuses: Vec<String>,
    },
    Odk {
        base_url: String,
        project_id: u64,
        form_id: String,
        #[serde(default)]
        include_rejected: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    File {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        prefix: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    Dynamodb {
        region: String,
        table: String,
        id_field: String,
        #[serde(default)]
        partition_key: Option<String>,
        #[serde(default)]
        partition_value: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    SurveyctoExport {
        export_file: PathBuf,
        #[serde(default)]
        attachments_available: bool,
    },
    OdkExport {
        export_file: PathBuf,
        #[serde(default)]
        attachments_available: bool,
    },
}

/// Load a static YAML config file. Secrets stay in the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path = path.as_ref();
    info!(config_path = ?path, "loading configuration");

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {path:?}"))?;
    let config: CliConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config YAML {path:?}"))?;
    info!(config_path = ?path, "configuration parsed");
    Ok(config)
}
