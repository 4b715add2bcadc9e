//! 远端对象存储后端：客户端通过预签名分片 URL 直传，服务端只负责编排。

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    BackendKind, Namespace, StorageBackend, StorageError, UploadTarget, archive_stamp,
    normalize_hash,
};

pub const DEFAULT_PART_SIZE: u64 = 10_000_000;
/// Objects at or above this size are not copied into the logs bucket.
pub const ARCHIVE_COPY_CEILING: u64 = 5_000_000_000;
const DELETE_BATCH: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// 客户端上传完成的分片。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CompletedPartRef {
    #[serde(rename = "ETag")]
    pub e_tag: String,
    #[serde(rename = "PartNumber")]
    pub part_number: i32,
}

/// `extra` payload the client sends when finalizing a multipart file.
#[derive(Debug, Deserialize)]
struct MultipartCompletion {
    #[serde(rename = "UploadId")]
    upload_id: String,
    #[serde(rename = "Parts")]
    parts: Vec<CompletedPartRef>,
}

/// Minimal provider surface the object-store backend needs.
#[async_trait]
pub trait ObjectClient: Send + Sync + 'static {
    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, StorageError>;

    async fn presign_upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> Result<String, StorageError>;

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartRef],
        checksum_sha256: &str,
    ) -> Result<(), StorageError>;

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<u64>, StorageError>;

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>, StorageError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StorageError>;

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StorageError>;

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<(), StorageError>;
}

#[derive(Clone, Debug)]
pub struct ObjectStorageConfig {
    pub data_bucket: String,
    pub logs_bucket: String,
    pub part_size: u64,
    /// Lifetime of presigned upload and download URLs.
    pub url_ttl: Duration,
}

pub struct ObjectStorage {
    client: Arc<dyn ObjectClient>,
    config: ObjectStorageConfig,
}

impl ObjectStorage {
    pub fn new(client: Arc<dyn ObjectClient>, config: ObjectStorageConfig) -> Self {
        Self { client, config }
    }

    fn box_prefix(code: &str) -> String {
        format!("box/{code}/")
    }

    fn file_key(code: &str, filename: &str) -> String {
        format!("box/{code}/files/{filename}")
    }

    fn descriptor_key(namespace: Namespace, code: &str) -> String {
        match namespace {
            Namespace::Box => format!("box/{code}/box.json"),
            Namespace::Card => format!("card/{code}.json"),
        }
    }

    fn part_count(&self, size: u64) -> u64 {
        size.div_ceil(self.config.part_size.max(1)).max(1)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<(), StorageError> {
        for batch in keys.chunks(DELETE_BATCH) {
            self.client
                .delete_many(&self.config.data_bucket, batch)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for ObjectStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn allocate(
        &self,
        code: &str,
        filename: &str,
        size: u64,
    ) -> Result<UploadTarget, StorageError> {
        let key = Self::file_key(code, filename);
        let bucket = &self.config.data_bucket;
        let upload_id = self.client.create_multipart(bucket, &key).await?;
        let parts = self.part_count(size);
        let mut urls = Vec::with_capacity(parts as usize);
        for part_number in 1..=parts {
            let part_number = i32::try_from(part_number)
                .map_err(|_| StorageError::Remote("too many parts".into()))?;
            let url = self
                .client
                .presign_upload_part(bucket, &key, &upload_id, part_number, self.config.url_ttl)
                .await?;
            urls.push(url);
        }
        debug!(code, filename, size, parts, "opened multipart upload");
        Ok(UploadTarget {
            urls,
            upload_id: Some(upload_id),
        })
    }

    async fn write(
        &self,
        _code: &str,
        _filename: &str,
        _chunk: Bytes,
        _offset: u64,
    ) -> Result<(), StorageError> {
        Err(StorageError::Unsupported(BackendKind::S3))
    }

    async fn finalize(
        &self,
        code: &str,
        filename: &str,
        size: u64,
        sha256: &str,
        extra: &serde_json::Value,
    ) -> Result<bool, StorageError> {
        let completion: MultipartCompletion = match serde_json::from_value(extra.clone()) {
            Ok(value) => value,
            Err(err) => {
                warn!(code, filename, error = %err, "invalid multipart completion payload");
                return Ok(false);
            }
        };
        let checksum = match hex::decode(normalize_hash(sha256)) {
            Ok(digest) if digest.len() == 32 => BASE64.encode(digest),
            _ => {
                warn!(code, filename, "declared sha256 is not a hex digest");
                return Ok(false);
            }
        };

        let key = Self::file_key(code, filename);
        let bucket = &self.config.data_bucket;
        if let Err(err) = self
            .client
            .complete_multipart(bucket, &key, &completion.upload_id, &completion.parts, &checksum)
            .await
        {
            warn!(code, filename, error = %err, "complete multipart upload failed");
            return Ok(false);
        }

        match self.client.head(bucket, &key).await {
            Ok(Some(stored)) if stored == size => Ok(true),
            Ok(stored) => {
                warn!(code, filename, expected = size, actual = ?stored, "size mismatch on finalize");
                Ok(false)
            }
            Err(err) => {
                warn!(code, filename, error = %err, "head after completion failed");
                Ok(false)
            }
        }
    }

    async fn locate(&self, code: &str, filename: &str) -> Result<String, StorageError> {
        self.client
            .presign_get(
                &self.config.data_bucket,
                &Self::file_key(code, filename),
                self.config.url_ttl,
            )
            .await
    }

    fn local_path(&self, _code: &str, _filename: &str) -> Option<PathBuf> {
        None
    }

    async fn list_descriptor_keys(&self, namespace: Namespace) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{}/", namespace.as_str());
        let objects = self.client.list(&self.config.data_bucket, &prefix).await?;
        let keys: BTreeSet<String> = objects
            .iter()
            .filter_map(|object| {
                let rest = object.key.strip_prefix(&prefix)?;
                match namespace {
                    Namespace::Box => rest.split('/').next().map(str::to_string),
                    Namespace::Card => rest.strip_suffix(".json").map(str::to_string),
                }
            })
            .filter(|code| !code.is_empty())
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn load_descriptor(
        &self,
        namespace: Namespace,
        code: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.client
            .get(
                &self.config.data_bucket,
                &Self::descriptor_key(namespace, code),
            )
            .await
    }

    async fn save_descriptor(
        &self,
        namespace: Namespace,
        code: &str,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.client
            .put(
                &self.config.data_bucket,
                &Self::descriptor_key(namespace, code),
                data,
            )
            .await
    }

    async fn save_log(
        &self,
        code: &str,
        entries: &BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        let data = serde_json::to_vec(entries).map_err(|err| StorageError::Remote(err.to_string()))?;
        self.client
            .put(
                &self.config.logs_bucket,
                &format!("box/{code}/user.json"),
                data,
            )
            .await
    }

    async fn archive(&self, code: &str) -> Result<(), StorageError> {
        let prefix = Self::box_prefix(code);
        let objects = self.client.list(&self.config.data_bucket, &prefix).await?;
        let stamp = archive_stamp();
        let mut keys = Vec::with_capacity(objects.len());
        for object in &objects {
            let rest = object.key.strip_prefix(&prefix).unwrap_or(&object.key);
            let target = format!("box/{code}/{stamp}/{rest}");
            if object.size < ARCHIVE_COPY_CEILING {
                self.client
                    .copy(
                        &self.config.data_bucket,
                        &object.key,
                        &self.config.logs_bucket,
                        &target,
                    )
                    .await?;
            } else {
                warn!(code, key = object.key, size = object.size, "object too large to archive, skipping copy");
            }
            keys.push(object.key.clone());
        }
        self.delete_keys(&keys).await?;
        info!(code, objects = keys.len(), "archived box");
        Ok(())
    }

    async fn remove(&self, code: &str) -> Result<(), StorageError> {
        let objects = self
            .client
            .list(&self.config.data_bucket, &Self::box_prefix(code))
            .await?;
        let keys: Vec<String> = objects.into_iter().map(|object| object.key).collect();
        self.delete_keys(&keys).await
    }

    async fn capacity(&self) -> Result<u32, StorageError> {
        Ok(1)
    }
}

#[cfg(test)]
pub use memory::MemoryObjectClient;

#[cfg(test)]
mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory provider double; object sizes can be overridden to
    /// exercise the archive copy ceiling without allocating gigabytes.
    #[derive(Default)]
    pub struct MemoryObjectClient {
        pub objects: DashMap<(String, String), Vec<u8>>,
        pub size_overrides: DashMap<String, u64>,
        pub uploads: AtomicUsize,
        pub fail_complete: AtomicBool,
        pub fail_copy: AtomicBool,
    }

    impl MemoryObjectClient {
        pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
            self.objects
                .get(&(bucket.to_string(), key.to_string()))
                .map(|entry| entry.clone())
        }

        pub fn insert(&self, bucket: &str, key: &str, body: &[u8]) {
            self.objects
                .insert((bucket.to_string(), key.to_string()), body.to_vec());
        }

        fn size_of(&self, key: &str, body: &[u8]) -> u64 {
            self.size_overrides
                .get(key)
                .map(|size| *size)
                .unwrap_or(body.len() as u64)
        }
    }

    #[async_trait]
    impl ObjectClient for MemoryObjectClient {
        async fn create_multipart(&self, _bucket: &str, key: &str) -> Result<String, StorageError> {
            let id = self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(format!("upload-{id}-{key}"))
        }

        async fn presign_upload_part(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            part_number: i32,
            expires_in: Duration,
        ) -> Result<String, StorageError> {
            Ok(format!(
                "https://{bucket}.example/{key}?partNumber={part_number}&uploadId={upload_id}&expires={}",
                expires_in.as_secs()
            ))
        }

        async fn complete_multipart(
            &self,
            bucket: &str,
            key: &str,
            _upload_id: &str,
            parts: &[CompletedPartRef],
            _checksum_sha256: &str,
        ) -> Result<(), StorageError> {
            if self.fail_complete.load(Ordering::SeqCst) || parts.is_empty() {
                return Err(StorageError::Remote("InvalidPart".into()));
            }
            if self.object(bucket, key).is_none() {
                self.insert(bucket, key, &[]);
            }
            Ok(())
        }

        async fn presign_get(
            &self,
            bucket: &str,
            key: &str,
            expires_in: Duration,
        ) -> Result<String, StorageError> {
            Ok(format!(
                "https://{bucket}.example/{key}?expires={}",
                expires_in.as_secs()
            ))
        }

        async fn head(&self, bucket: &str, key: &str) -> Result<Option<u64>, StorageError> {
            Ok(self.object(bucket, key).map(|body| self.size_of(key, &body)))
        }

        async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>, StorageError> {
            let mut objects: Vec<ObjectSummary> = self
                .objects
                .iter()
                .filter(|entry| entry.key().0 == bucket && entry.key().1.starts_with(prefix))
                .map(|entry| ObjectSummary {
                    key: entry.key().1.clone(),
                    size: self.size_of(&entry.key().1, entry.value()),
                })
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        }

        async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Ok(self.object(bucket, key))
        }

        async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
            self.objects
                .insert((bucket.to_string(), key.to_string()), body);
            Ok(())
        }

        async fn copy(
            &self,
            src_bucket: &str,
            src_key: &str,
            dst_bucket: &str,
            dst_key: &str,
        ) -> Result<(), StorageError> {
            if self.fail_copy.load(Ordering::SeqCst) {
                return Err(StorageError::Remote("copy refused".into()));
            }
            let body = self
                .object(src_bucket, src_key)
                .ok_or_else(|| StorageError::Remote("NoSuchKey".into()))?;
            self.insert(dst_bucket, dst_key, &body);
            Ok(())
        }

        async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<(), StorageError> {
            for key in keys {
                self.objects.remove(&(bucket.to_string(), key.clone()));
            }
            Ok(())
        }
    }
}
