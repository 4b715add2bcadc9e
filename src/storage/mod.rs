//! 存储后端抽象：本地文件系统与远端对象存储共享同一能力接口。
//!
//! The registry only talks to [`StorageBackend`]; which implementation is in
//! effect is decided once at startup by [`build_backend`].

mod local;
mod remote;
mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Args;

pub use local::FilesystemStorage;
pub use remote::{ObjectStorage, ObjectStorageConfig};
pub use s3::S3Client;

#[cfg(test)]
pub use remote::MemoryObjectClient;

/// Characters left unescaped in a single URL path segment.
pub(crate) const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Filesystem,
    S3,
}

/// Descriptor record families persisted next to box content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Namespace {
    Box,
    Card,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Box => "box",
            Namespace::Card => "card",
        }
    }
}

/// 客户端上传目标：本地为单个接口地址，对象存储为每个分片一个预签名 URL。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("object store error: {0}")]
    Remote(String),
    #[error("write of {len} bytes at offset {offset} exceeds file size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("operation not supported by the {0:?} backend")]
    Unsupported(BackendKind),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Creates whatever roots or buckets layout the backend needs.
    async fn init(&self) -> Result<(), StorageError>;

    /// 为声明的文件预留存储并返回上传目标。
    async fn allocate(
        &self,
        code: &str,
        filename: &str,
        size: u64,
    ) -> Result<UploadTarget, StorageError>;

    /// Writes `chunk` at `offset`. Callers validate bounds against the
    /// declared size first.
    async fn write(
        &self,
        code: &str,
        filename: &str,
        chunk: Bytes,
        offset: u64,
    ) -> Result<(), StorageError>;

    /// 校验已存储内容并返回是否完成；`extra` 为后端特定的客户端载荷。
    async fn finalize(
        &self,
        code: &str,
        filename: &str,
        size: u64,
        sha256: &str,
        extra: &serde_json::Value,
    ) -> Result<bool, StorageError>;

    /// Returns a download locator for a completed file.
    async fn locate(&self, code: &str, filename: &str) -> Result<String, StorageError>;

    /// Path on local disk, for backends that serve content themselves.
    fn local_path(&self, code: &str, filename: &str) -> Option<PathBuf>;

    async fn list_descriptor_keys(&self, namespace: Namespace) -> Result<Vec<String>, StorageError>;

    async fn load_descriptor(
        &self,
        namespace: Namespace,
        code: &str,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    async fn save_descriptor(
        &self,
        namespace: Namespace,
        code: &str,
        data: Vec<u8>,
    ) -> Result<(), StorageError>;

    /// 记录完成盒子时的客户端信息。
    async fn save_log(
        &self,
        code: &str,
        entries: &BTreeMap<String, String>,
    ) -> Result<(), StorageError>;

    /// Moves the box out of the active namespace under a dated path.
    async fn archive(&self, code: &str) -> Result<(), StorageError>;

    async fn remove(&self, code: &str) -> Result<(), StorageError>;

    /// Storage fill level on a 0-200 scale.
    async fn capacity(&self) -> Result<u32, StorageError>;
}

/// 按启动参数选择存储后端。
pub async fn build_backend(
    args: &Args,
    url_ttl: Duration,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match args.storage_engine {
        BackendKind::Filesystem => Ok(Arc::new(FilesystemStorage::new(
            PathBuf::from(&args.data_root),
            PathBuf::from(&args.logs_root),
        ))),
        BackendKind::S3 => {
            let data_bucket = args
                .s3_data_bucket
                .clone()
                .ok_or_else(|| StorageError::Config("s3 data bucket is required".into()))?;
            let logs_bucket = args
                .s3_logs_bucket
                .clone()
                .ok_or_else(|| StorageError::Config("s3 logs bucket is required".into()))?;
            let client = S3Client::connect(
                args.s3_endpoint_url.as_deref(),
                args.s3_region.as_deref(),
                args.s3_access_key.as_deref(),
                args.s3_secret_key.as_deref(),
            )
            .await;
            Ok(Arc::new(ObjectStorage::new(
                Arc::new(client),
                ObjectStorageConfig {
                    data_bucket,
                    logs_bucket,
                    part_size: args.s3_part_size,
                    url_ttl,
                },
            )))
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex digests from clients compare case-insensitively.
pub(crate) fn normalize_hash(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

/// Local upload/download endpoint for one file.
pub(crate) fn file_endpoint(code: &str, filename: &str) -> String {
    format!(
        "/api/files/{code}/{}",
        utf8_percent_encode(filename, PATH_SEGMENT)
    )
}

/// 将阻塞型磁盘/哈希操作移出调度线程。
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
}

pub(crate) fn archive_stamp() -> String {
    chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string()
}
