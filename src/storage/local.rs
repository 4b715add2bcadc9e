//! 本地文件系统后端：稀疏占位文件 + 随机写入分片，完成时整体校验 SHA-256。

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BackendKind, Namespace, StorageBackend, StorageError, UploadTarget, archive_stamp,
    file_endpoint, normalize_hash, run_blocking,
};
use crate::atomic::write_atomic;

const HASH_BUFFER_SIZE: usize = 256 * 1024;
const BOX_DESCRIPTOR: &str = "box.json";
const BOX_LOG: &str = "user.json";

/// Layout: `data/box/{code}/box.json`, `data/box/{code}/files/{name}`,
/// `data/card/{code}.json`; archives land in `logs/box/{code}/{date}`.
#[derive(Clone, Debug)]
pub struct FilesystemStorage {
    data_root: PathBuf,
    logs_root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(data_root: PathBuf, logs_root: PathBuf) -> Self {
        Self {
            data_root,
            logs_root,
        }
    }

    fn box_dir(&self, code: &str) -> PathBuf {
        self.data_root.join(Namespace::Box.as_str()).join(code)
    }

    fn file_path(&self, code: &str, filename: &str) -> PathBuf {
        self.box_dir(code).join("files").join(filename)
    }

    fn descriptor_path(&self, namespace: Namespace, code: &str) -> PathBuf {
        match namespace {
            Namespace::Box => self.box_dir(code).join(BOX_DESCRIPTOR),
            Namespace::Card => self
                .data_root
                .join(Namespace::Card.as_str())
                .join(format!("{code}.json")),
        }
    }

    /// 为归档选择目标目录，同日重复归档时追加随机后缀。
    async fn archive_target(&self, code: &str) -> io::Result<PathBuf> {
        let base = self.logs_root.join(Namespace::Box.as_str()).join(code);
        fs::create_dir_all(&base).await?;
        let stamp = archive_stamp();
        let target = base.join(&stamp);
        if fs::try_exists(&target).await? {
            return Ok(base.join(format!("{stamp}-{}", Uuid::new_v4())));
        }
        Ok(target)
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    async fn init(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.data_root.join(Namespace::Box.as_str())).await?;
        fs::create_dir_all(self.data_root.join(Namespace::Card.as_str())).await?;
        fs::create_dir_all(self.logs_root.join(Namespace::Box.as_str())).await?;
        Ok(())
    }

    async fn allocate(
        &self,
        code: &str,
        filename: &str,
        size: u64,
    ) -> Result<UploadTarget, StorageError> {
        let path = self.file_path(code, filename);
        run_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(&path)?;
            file.set_len(size)?;
            Ok(())
        })
        .await?;
        debug!(code, filename, size, "allocated placeholder file");
        Ok(UploadTarget {
            urls: vec![file_endpoint(code, filename)],
            upload_id: None,
        })
    }

    async fn write(
        &self,
        code: &str,
        filename: &str,
        chunk: Bytes,
        offset: u64,
    ) -> Result<(), StorageError> {
        let path = self.file_path(code, filename);
        run_blocking(move || {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            let size = file.metadata()?.len();
            let len = chunk.len() as u64;
            if offset.checked_add(len).is_none_or(|end| end > size) {
                return Err(StorageError::OutOfBounds { offset, len, size });
            }
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&chunk)?;
            Ok(())
        })
        .await
    }

    async fn finalize(
        &self,
        code: &str,
        filename: &str,
        size: u64,
        sha256: &str,
        _extra: &serde_json::Value,
    ) -> Result<bool, StorageError> {
        let path = self.file_path(code, filename);
        let expected = normalize_hash(sha256);
        let (length, digest) = run_blocking(move || hash_file(&path)).await?;
        if length != size {
            warn!(code, filename, expected = size, actual = length, "size mismatch on finalize");
            return Ok(false);
        }
        Ok(digest == expected)
    }

    async fn locate(&self, code: &str, filename: &str) -> Result<String, StorageError> {
        Ok(file_endpoint(code, filename))
    }

    fn local_path(&self, code: &str, filename: &str) -> Option<PathBuf> {
        Some(self.file_path(code, filename))
    }

    async fn list_descriptor_keys(&self, namespace: Namespace) -> Result<Vec<String>, StorageError> {
        let root = self.data_root.join(namespace.as_str());
        if !fs::try_exists(&root).await? {
            return Ok(Vec::new());
        }
        let mut dir = fs::read_dir(&root).await?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().await?;
            match namespace {
                Namespace::Box if file_type.is_dir() => keys.push(name),
                Namespace::Card if file_type.is_file() => {
                    if let Some(code) = name.strip_suffix(".json") {
                        keys.push(code.to_string());
                    }
                }
                _ => {}
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn load_descriptor(
        &self,
        namespace: Namespace,
        code: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.descriptor_path(namespace, code)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_descriptor(
        &self,
        namespace: Namespace,
        code: &str,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        let path = self.descriptor_path(namespace, code);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, &data).await?;
        Ok(())
    }

    async fn save_log(
        &self,
        code: &str,
        entries: &BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        let data = serde_json::to_vec(entries).map_err(io::Error::other)?;
        write_atomic(&self.box_dir(code).join(BOX_LOG), &data).await?;
        Ok(())
    }

    async fn archive(&self, code: &str) -> Result<(), StorageError> {
        let source = self.box_dir(code);
        if !fs::try_exists(&source).await? {
            warn!(code, "box directory already gone, nothing to archive");
            return Ok(());
        }
        let target = self.archive_target(code).await?;
        match fs::rename(&source, &target).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::CrossesDevices => {
                let (from, to) = (source.clone(), target.clone());
                run_blocking(move || copy_dir_all(&from, &to).map_err(StorageError::from)).await?;
                fs::remove_dir_all(&source).await?;
            }
            Err(err) => return Err(err.into()),
        }
        info!(code, target = ?target, "archived box");
        Ok(())
    }

    async fn remove(&self, code: &str) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.box_dir(code)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn capacity(&self) -> Result<u32, StorageError> {
        let root = self.data_root.clone();
        run_blocking(move || {
            let root = std::fs::canonicalize(&root)?;
            let disks = Disks::new_with_refreshed_list();
            let disk = disks
                .list()
                .iter()
                .filter(|disk| root.starts_with(disk.mount_point()))
                .max_by_key(|disk| disk.mount_point().as_os_str().len());
            let Some(disk) = disk else {
                return Ok(0);
            };
            let total = disk.total_space();
            if total == 0 {
                return Ok(0);
            }
            let used = total.saturating_sub(disk.available_space());
            Ok((used as u128 * 200 / total as u128) as u32)
        })
        .await
    }
}

/// 流式读取整个文件，返回长度与十六进制摘要。
fn hash_file(path: &Path) -> Result<(u64, String), StorageError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut length = 0u64;
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        length += read as u64;
    }
    Ok((length, hex::encode(hasher.finalize())))
}

fn copy_dir_all(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
