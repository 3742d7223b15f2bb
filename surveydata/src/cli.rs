//! CLI interface for surveydata: command parsing, platform/storage
//! construction from config plus environment secrets, and subcommand
//! orchestration.
//!
//! All business logic lives in `surveydata-core`; this module is strictly
//! CLI glue. Credentials are read from the environment (loaded from `.env`
//! by `main`):
//!
//! - SurveyCTO: `SURVEYCTO_USERNAME`, `SURVEYCTO_PASSWORD`, optionally
//!   `SURVEYCTO_PRIVATE_KEY_FILE` for encrypted forms
//! - ODK Central: `ODK_EMAIL`, `ODK_PASSWORD`

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use surveydata_core::platform::{OdkPlatform, SurveyCtoPlatform};
use surveydata_core::storage::{
    DynamoDbConfig, DynamoDbStorage, FileStorage, OdkExportStorage, S3Config, S3Storage,
    SurveyCtoExportStorage,
};
use surveydata_core::{AttachmentSink, StorageSystem, SurveyPlatform};

use crate::load_config::{load_config, PlatformConfig, StorageConfig};

/// CLI for surveydata: sync survey submissions into storage and export
/// them for analysis.
#[derive(Parser)]
#[clap(
    name = "surveydata",
    version,
    about = "Sync survey submissions and attachments from SurveyCTO/ODK into pluggable storage"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sync new submissions from the survey platform into storage
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Export all stored submissions as a CSV table
    Export {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Path of the CSV file to write
        #[clap(long)]
        output: PathBuf,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main().
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Sync { config } => {
            let config = load_config(config)?;
            let platform = build_platform(&config.platform)?;
            let storage = build_storage(&config.storage).await?;
            let attachment_storage = match &config.attachment_storage {
                Some(storage_config) => Some(build_storage(storage_config).await?),
                None => None,
            };

            let sink = if config.no_attachments {
                AttachmentSink::Disabled
            } else {
                match &attachment_storage {
                    Some(separate) => AttachmentSink::Separate(separate.as_ref()),
                    None => AttachmentSink::WithSubmissions,
                }
            };

            tracing::info!(command = "sync", "starting synchronisation");
            let new_submissions = platform
                .sync_data(storage.as_ref(), sink)
                .await
                .context("synchronisation failed")?;
            println!("Synchronised {} new submission(s).", new_submissions.len());
            for submission_id in &new_submissions {
                println!("  {submission_id}");
            }
            Ok(())
        }
        Commands::Export { config, output } => {
            let config = load_config(config)?;
            let platform = build_platform(&config.platform)?;
            let storage = build_storage(&config.storage).await?;

            tracing::info!(command = "export", output = ?output, "exporting submissions");
            let batch = platform
                .get_submissions_df(storage.as_ref())
                .await
                .context("failed to assemble submission table")?;
            let file = fs::File::create(&output)
                .with_context(|| format!("failed to create output file {output:?}"))?;
            let mut writer = arrow::csv::WriterBuilder::new().with_header(true).build(file);
            writer
                .write(&batch)
                .context("failed to write CSV export")?;
            println!(
                "Exported {} submission(s) with {} column(s) to {}.",
                batch.num_rows(),
                batch.num_columns(),
                output.display()
            );
            Ok(())
        }
    }
}

fn build_platform(config: &PlatformConfig) -> Result<Box<dyn SurveyPlatform>> {
    match config {
        PlatformConfig::Surveycto {
            server,
            form_id,
            review_statuses,
        } => {
            let username = require_env("SURVEYCTO_USERNAME")?;
            let password = require_env("SURVEYCTO_PASSWORD")?;
            let mut platform = SurveyCtoPlatform::new(server, form_id)
                .with_credentials(username, password)
                .with_review_statuses(review_statuses.clone());
            if let Ok(key_file) = env::var("SURVEYCTO_PRIVATE_KEY_FILE") {
                let private_key = fs::read_to_string(&key_file)
                    .with_context(|| format!("failed to read private key file {key_file}"))?;
                platform = platform.with_private_key(private_key);
            }
            Ok(Box::new(platform))
        }
        PlatformConfig::Odk {
            base_url,
            project_id,
            form_id,
            include_rejected,
        } => {
            let email = require_env("ODK_EMAIL")?;
            let password = require_env("ODK_PASSWORD")?;
            Ok(Box::new(
                OdkPlatform::new(base_url, *project_id, form_id)
                    .with_credentials(email, password)
                    .with_rejected_included(*include_rejected),
            ))
        }
    }
}

async fn build_storage(config: &StorageConfig) -> Result<Box<dyn StorageSystem>> {
    match config {
        StorageConfig::File { path } => Ok(Box::new(
            FileStorage::new(path).context("failed to open file storage")?,
        )),
        StorageConfig::S3 {
            bucket,
            prefix,
            region,
            endpoint,
        } => {
            let mut s3_config = S3Config::new(bucket, prefix);
            if let Some(region) = region {
                s3_config = s3_config.with_region(region);
            }
            if let Some(endpoint) = endpoint {
                s3_config = s3_config.with_endpoint(endpoint);
            }
            Ok(Box::new(S3Storage::new(s3_config).await))
        }
        StorageConfig::Dynamodb {
            region,
            table,
            id_field,
            partition_key,
            partition_value,
            endpoint,
        } => {
            let partition = match (partition_key, partition_value) {
                (Some(key), Some(value)) => Some((key.clone(), value.clone())),
                (None, None) => None,
                _ => anyhow::bail!(
                    "dynamodb storage needs both partition_key and partition_value, or neither"
                ),
            };
            Ok(Box::new(
                DynamoDbStorage::new(DynamoDbConfig {
                    region: region.clone(),
                    table: table.clone(),
                    id_field: id_field.clone(),
                    partition,
                    endpoint: endpoint.clone(),
                })
                .await,
            ))
        }
        StorageConfig::SurveyctoExport {
            export_file,
            attachments_available,
        } => Ok(Box::new(
            SurveyCtoExportStorage::new(export_file, *attachments_available)
                .context("failed to load SurveyCTO export")?,
        )),
        StorageConfig::OdkExport {
            export_file,
            attachments_available,
        } => Ok(Box::new(
            OdkExportStorage::new(export_file, *attachments_available)
                .context("failed to load ODK Central export")?,
        )),
    }
}

fn require_env(name: &'static str) -> Result<String> {
    env::var(name).with_context(|| format!("{name} must be set in the environment"))
}
