//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::time::Duration;

use crate::build;
use crate::registry::BoxPolicy;
use crate::service::RateLimits;
use crate::storage::BackendKind;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_ADMIN_PASSWORD: &str = "password";
pub const DEFAULT_BOX_EXPIRE_SECS: i64 = 24 * 60 * 60;
pub const DEFAULT_WAITING_DIVISOR: i64 = 10;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_S3_PART_SIZE: u64 = 10_000_000;
pub const DEFAULT_RATE_BOX_LIMIT: u64 = 10;
pub const DEFAULT_RATE_FILE_LIMIT: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_RATE_ERROR_LIMIT: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "fbox", version = VERSION_INFO, about = "File box upload server")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "FBOX_DATA_ROOT",
        default_value = "data",
        help = "Directory holding active boxes and cards"
    )]
    pub data_root: String,
    #[arg(
        short = 'l',
        long,
        env = "FBOX_LOGS_ROOT",
        default_value = "logs",
        help = "Directory receiving archived boxes"
    )]
    pub logs_root: String,
    #[arg(
        short = 'b',
        long,
        env = "FBOX_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FBOX_HTTP_PORT",
        default_value_t = 8000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "FBOX_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "FBOX_ADMIN_PASSWORD",
        default_value = DEFAULT_ADMIN_PASSWORD,
        help = "Password for card issuing and admin endpoints"
    )]
    pub admin_password: String,
    #[arg(long, env = "FBOX_SECRET_KEY", help = "Secret used to sign card tokens")]
    pub secret_key: String,
    #[arg(
        long,
        value_enum,
        env = "FBOX_STORAGE_ENGINE",
        default_value = "filesystem",
        help = "Storage backend"
    )]
    pub storage_engine: BackendKind,
    #[arg(long, env = "FBOX_S3_DATA_BUCKET", help = "Bucket for active boxes")]
    pub s3_data_bucket: Option<String>,
    #[arg(long, env = "FBOX_S3_LOGS_BUCKET", help = "Bucket for archived boxes")]
    pub s3_logs_bucket: Option<String>,
    #[arg(long, env = "FBOX_S3_ENDPOINT_URL", help = "S3 compatible endpoint")]
    pub s3_endpoint_url: Option<String>,
    #[arg(long, env = "FBOX_S3_REGION", help = "S3 region")]
    pub s3_region: Option<String>,
    #[arg(long, env = "FBOX_S3_ACCESS_KEY", help = "S3 access key id")]
    pub s3_access_key: Option<String>,
    #[arg(long, env = "FBOX_S3_SECRET_KEY", help = "S3 secret access key")]
    pub s3_secret_key: Option<String>,
    #[arg(
        long,
        env = "FBOX_S3_PART_SIZE",
        default_value_t = DEFAULT_S3_PART_SIZE,
        help = "Multipart upload part size in bytes"
    )]
    pub s3_part_size: u64,
    #[arg(
        long,
        env = "FBOX_BOX_EXPIRE_SECS",
        default_value_t = DEFAULT_BOX_EXPIRE_SECS,
        help = "Lifetime of a completed box in seconds"
    )]
    pub box_expire_secs: i64,
    #[arg(
        long,
        env = "FBOX_WAITING_DIVISOR",
        default_value_t = DEFAULT_WAITING_DIVISOR,
        help = "Waiting boxes live box_expire_secs divided by this"
    )]
    pub waiting_divisor: i64,
    #[arg(
        long,
        env = "FBOX_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        help = "Seconds between expiration sweeps"
    )]
    pub sweep_interval_secs: u64,
    #[arg(
        long,
        env = "FBOX_RATE_BOX_LIMIT",
        default_value_t = DEFAULT_RATE_BOX_LIMIT,
        help = "Boxes per address per hour"
    )]
    pub rate_box_limit: u64,
    #[arg(
        long,
        env = "FBOX_RATE_FILE_LIMIT",
        default_value_t = DEFAULT_RATE_FILE_LIMIT,
        help = "Uploaded chunk bytes per address per hour"
    )]
    pub rate_file_limit: u64,
    #[arg(
        long,
        env = "FBOX_RATE_ERROR_LIMIT",
        default_value_t = DEFAULT_RATE_ERROR_LIMIT,
        help = "Failed lookups per address per hour"
    )]
    pub rate_error_limit: u64,
}

impl Args {
    pub fn box_policy(&self) -> BoxPolicy {
        BoxPolicy {
            box_ttl: self.box_expire_secs,
            waiting_divisor: self.waiting_divisor.max(1),
        }
    }

    /// 预签名 URL 的有效期与等待中盒子的寿命一致。
    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.box_policy().waiting_ttl().max(1) as u64)
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            boxes: self.rate_box_limit,
            file_bytes: self.rate_file_limit,
            errors: self.rate_error_limit,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
