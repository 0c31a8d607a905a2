//! Centralized environment configuration for every launcher subcommand.
//!
//! Components take a `&PipelineConfig` rather than re-reading the
//! environment themselves, so a given run's configuration is read exactly
//! once, at startup, in one place.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub scan_url: String,
    pub batch_size: u32,
    pub page_size: u32,
    pub parallel_fetches: u32,
    pub max_workers: usize,
    pub max_rows_per_file: usize,
    pub zstd_level: i32,
    pub gcs_bucket: Option<String>,
    pub gcs_enabled: bool,
    pub gcs_upload_concurrency: usize,
    pub gcs_queue_high_water: i64,
    pub gcs_queue_low_water: i64,
    pub gcs_byte_high_water: i64,
    pub gcs_byte_low_water: i64,
    pub gcs_max_retries: usize,
    pub gcs_retry_base_delay_ms: u64,
    pub data_dir: PathBuf,
    pub cursor_dir: PathBuf,
    pub gap_threshold_ms: u64,
    pub insecure_tls: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scan_url: String::new(),
            batch_size: 1000,
            page_size: 1000,
            parallel_fetches: 1,
            max_workers: 4,
            max_rows_per_file: 100_000,
            zstd_level: 3,
            gcs_bucket: None,
            gcs_enabled: true,
            gcs_upload_concurrency: 4,
            gcs_queue_high_water: 64,
            gcs_queue_low_water: 16,
            gcs_byte_high_water: 256 * 1024 * 1024,
            gcs_byte_low_water: 64 * 1024 * 1024,
            gcs_max_retries: 3,
            gcs_retry_base_delay_ms: 1_000,
            data_dir: PathBuf::from("./data"),
            cursor_dir: PathBuf::from("./cursors"),
            gap_threshold_ms: 120_000,
            insecure_tls: false,
        }
    }
}

impl PipelineConfig {
    /// Reads every environment variable from spec.md's §6 list, matching
    /// `telemetry-admin-cli`'s `std::env::var(...).with_context(...)` for
    /// required vars and `.ok().map(...).unwrap_or(default)` for optional
    /// ones. `GCS_BUCKET` is required unless `GCS_ENABLED=false`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let gcs_enabled = env_bool("GCS_ENABLED", defaults.gcs_enabled);
        let gcs_bucket = std::env::var("GCS_BUCKET").ok();
        if gcs_enabled && gcs_bucket.is_none() {
            anyhow::bail!("GCS_BUCKET is required when GCS_ENABLED is not \"false\"");
        }

        let scan_url = std::env::var("SCAN_URL").with_context(|| "reading SCAN_URL")?;

        Ok(Self {
            scan_url,
            batch_size: env_parsed("BATCH_SIZE", defaults.batch_size)?,
            page_size: env_parsed("PAGE_SIZE", defaults.page_size)?,
            parallel_fetches: env_parsed("PARALLEL_FETCHES", defaults.parallel_fetches)?,
            max_workers: env_parsed("MAX_WORKERS", defaults.max_workers)?,
            max_rows_per_file: env_parsed("MAX_ROWS_PER_FILE", defaults.max_rows_per_file)?,
            zstd_level: env_parsed("ZSTD_LEVEL", defaults.zstd_level)?,
            gcs_bucket,
            gcs_enabled,
            gcs_upload_concurrency: env_parsed("GCS_UPLOAD_CONCURRENCY", defaults.gcs_upload_concurrency)?,
            gcs_queue_high_water: env_parsed("GCS_QUEUE_HIGH_WATER", defaults.gcs_queue_high_water)?,
            gcs_queue_low_water: env_parsed("GCS_QUEUE_LOW_WATER", defaults.gcs_queue_low_water)?,
            gcs_byte_high_water: env_parsed("GCS_BYTE_HIGH_WATER", defaults.gcs_byte_high_water)?,
            gcs_byte_low_water: env_parsed("GCS_BYTE_LOW_WATER", defaults.gcs_byte_low_water)?,
            gcs_max_retries: env_parsed("GCS_MAX_RETRIES", defaults.gcs_max_retries)?,
            gcs_retry_base_delay_ms: env_parsed("GCS_RETRY_BASE_DELAY_MS", defaults.gcs_retry_base_delay_ms)?,
            data_dir: std::env::var("DATA_DIR").ok().map(PathBuf::from).unwrap_or(defaults.data_dir),
            cursor_dir: std::env::var("CURSOR_DIR").ok().map(PathBuf::from).unwrap_or(defaults.cursor_dir),
            gap_threshold_ms: env_parsed("GAP_THRESHOLD_MS", defaults.gap_threshold_ms)?,
            insecure_tls: env_bool("INSECURE_TLS", defaults.insecure_tls),
        })
    }

    /// The object-store URL this run writes to: an `s3://`-style bucket URL
    /// when GCS is enabled, a `file://` URL rooted at `data_dir` otherwise
    /// (the `GCS_ENABLED=false` "write local only" contract from §6).
    pub fn object_store_url(&self) -> Result<String> {
        if self.gcs_enabled {
            let bucket = self.gcs_bucket.as_deref().expect("validated non-empty in from_env");
            Ok(format!("s3://{bucket}"))
        } else {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("creating local data dir {}", self.data_dir.display()))?;
            let abs = std::fs::canonicalize(&self.data_dir)
                .with_context(|| format!("resolving local data dir {}", self.data_dir.display()))?;
            Ok(format!("file://{}", abs.display()))
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name).ok().map(|v| v != "false").unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => v.parse().map_err(|e| anyhow::anyhow!("parsing {name}={v}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_url_uses_file_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            gcs_enabled: false,
            data_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let url = config.object_store_url().unwrap();
        assert!(url.starts_with("file://"));
    }

    #[test]
    fn gcs_url_uses_bucket_name() {
        let config = PipelineConfig {
            gcs_enabled: true,
            gcs_bucket: Some("my-bucket".to_string()),
            ..PipelineConfig::default()
        };
        assert_eq!(config.object_store_url().unwrap(), "s3://my-bucket");
    }
}
