//! 面向接口层的核心操作：建盒、分片上传、完成、下载与卡片管理。
//!
//! 每个按 code 查询的操作先检查错误维度的限流，查不到时计入错误次数。
//! 同一盒子的分片写入持共享锁，完成文件与完成盒子持独占锁。

use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::model::{
    BoxFile, Card, FileBox, FileSpec, Level, MAX_FILENAME_CHARS, Quota, Status, UploadFail,
    is_safe_filename,
};
use crate::rate::Dimension;
use crate::registry::{BoxError, Registry};
use crate::storage::{
    BackendKind, StorageError, UploadTarget, normalize_hash, run_blocking, sha256_hex,
};
use crate::token::TokenSigner;

pub const DEFAULT_CARD_USES: u32 = 10;

/// Hourly ceilings per source address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimits {
    pub boxes: u64,
    pub file_bytes: u64,
    pub errors: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            boxes: 10,
            file_bytes: 10 * 1024 * 1024 * 1024,
            errors: 10,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedBox {
    pub code: String,
    pub storage: BackendKind,
    pub uploads: BTreeMap<String, UploadTarget>,
}

#[derive(Debug, Serialize)]
pub struct FileView {
    pub name: String,
    pub size: u64,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// 盒子对外视图；完成后才包含下载地址。
#[derive(Debug, Serialize)]
pub struct BoxView {
    pub code: String,
    pub status: Status,
    pub level: Level,
    pub created: i64,
    pub count: usize,
    pub results: Vec<FileView>,
}

#[derive(Debug, Serialize)]
pub struct IssuedCard {
    pub code: String,
    pub token: String,
}

pub struct BoxService {
    registry: Arc<Registry>,
    tokens: TokenSigner,
    limits: RateLimits,
}

impl BoxService {
    pub fn new(registry: Arc<Registry>, tokens: TokenSigner, limits: RateLimits) -> Self {
        Self {
            registry,
            tokens,
            limits,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn backend(&self) -> BackendKind {
        self.registry.storage().kind()
    }

    fn guard_errors(&self, ip: IpAddr, now: i64) -> Result<(), BoxError> {
        self.registry.rates().check(ip, Dimension::Error, now)?;
        Ok(())
    }

    fn record_error(&self, ip: IpAddr, now: i64) {
        self.registry
            .rates()
            .update(ip, Dimension::Error, 1, self.limits.errors, now);
    }

    fn find_box(&self, ip: IpAddr, code: &str, now: i64) -> Result<FileBox, BoxError> {
        match self.registry.boxes().get(code, now) {
            Some(file_box) => Ok(file_box),
            None => {
                debug!(code, client_ip = %ip, "unknown or expired box");
                self.record_error(ip, now);
                Err(BoxError::NotFound)
            }
        }
    }

    fn find_file(
        &self,
        ip: IpAddr,
        now: i64,
        file_box: &FileBox,
        filename: &str,
    ) -> Result<BoxFile, BoxError> {
        match file_box.files.get(filename) {
            Some(file) => Ok(file.clone()),
            None => {
                debug!(code = %file_box.code, filename, client_ip = %ip, "unknown file");
                self.record_error(ip, now);
                Err(BoxError::NotFound)
            }
        }
    }

    fn integrity_failure(&self, ip: IpAddr, now: i64) -> BoxError {
        self.record_error(ip, now);
        BoxError::Rejected(UploadFail::InvalidFile)
    }

    /// 校验声明的文件，分配存储并持久化等待中的盒子。
    pub async fn create_box(
        &self,
        ip: IpAddr,
        files: Vec<FileSpec>,
        card: Option<Card>,
    ) -> Result<CreatedBox, BoxError> {
        let now = self.registry.now();
        let level = card.as_ref().map_or(Level::Visitor, |card| card.level);
        self.registry.rates().check(ip, Dimension::Box, now)?;
        validate_files(&files, level.quota())?;

        if let Some(card) = card.as_ref().filter(|card| card.level == Level::Red) {
            self.consume_card_use(&card.code).await?;
        }

        let code = self.registry.boxes().reserve_code();
        match self.provision(&code, files, level, now).await {
            Ok(created) => {
                self.registry
                    .rates()
                    .update(ip, Dimension::Box, 1, self.limits.boxes, now);
                info!(
                    code,
                    files = created.uploads.len(),
                    level = ?level,
                    client_ip = %ip,
                    "created box"
                );
                Ok(created)
            }
            Err(err) => {
                warn!(code, error = %err, "box creation failed");
                if let Err(cleanup) = self.registry.storage().remove(&code).await {
                    warn!(code, error = %cleanup, "failed to clean up partial box");
                }
                self.registry.boxes().release(&code);
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        code: &str,
        files: Vec<FileSpec>,
        level: Level,
        now: i64,
    ) -> Result<CreatedBox, BoxError> {
        let storage = self.registry.storage();
        let mut uploads = BTreeMap::new();
        let mut box_files = BTreeMap::new();
        for spec in files {
            let target = storage.allocate(code, &spec.name, spec.size).await?;
            uploads.insert(spec.name.clone(), target);
            box_files.insert(
                spec.name.clone(),
                BoxFile {
                    status: Status::Waiting,
                    filename: spec.name,
                    size: spec.size,
                },
            );
        }
        self.registry
            .register_box(FileBox {
                code: code.to_string(),
                status: Status::Waiting,
                level,
                created: now,
                files: box_files,
            })
            .await?;
        Ok(CreatedBox {
            code: code.to_string(),
            storage: storage.kind(),
            uploads,
        })
    }

    async fn consume_card_use(&self, code: &str) -> Result<(), BoxError> {
        let _lock = self.registry.lock_card(code).await;
        let mut card = self.registry.get_card(code).ok_or(BoxError::NotFound)?;
        card.count = card.count.saturating_sub(1);
        debug!(code, remaining = card.count, "card use consumed");
        self.registry.update_card(card).await
    }

    pub async fn fetch_box(&self, ip: IpAddr, code: &str) -> Result<BoxView, BoxError> {
        let now = self.registry.now();
        self.guard_errors(ip, now)?;
        let file_box = self.find_box(ip, code, now)?;

        let mut results = Vec::with_capacity(file_box.files.len());
        for file in file_box.files.values() {
            let url = match file_box.status {
                Status::Complete => Some(
                    self.registry
                        .storage()
                        .locate(code, &file.filename)
                        .await?,
                ),
                Status::Waiting => None,
            };
            results.push(FileView {
                name: file.filename.clone(),
                size: file.size,
                status: file.status,
                url,
            });
        }
        Ok(BoxView {
            code: file_box.code,
            status: file_box.status,
            level: file_box.level,
            created: file_box.created,
            count: results.len(),
            results,
        })
    }

    /// 所有文件完成后关闭盒子，并记录客户端信息。
    pub async fn finalize_box(
        &self,
        ip: IpAddr,
        code: &str,
        mut log_entries: BTreeMap<String, String>,
    ) -> Result<FileBox, BoxError> {
        let now = self.registry.now();
        self.guard_errors(ip, now)?;
        let _lock = self.registry.lock_box(code).await;
        let file_box = self.find_box(ip, code, now)?;
        if file_box.status != Status::Waiting {
            return Err(BoxError::Rejected(UploadFail::InvalidFile));
        }

        let completed = self.registry.complete_box(code).await?;
        log_entries.insert("ip".into(), ip.to_string());
        log_entries.insert("created".into(), completed.created.to_string());
        if let Err(err) = self.registry.storage().save_log(code, &log_entries).await {
            warn!(code, error = %err, "failed to save box log");
        }
        info!(code, files = completed.files.len(), "completed box");
        Ok(completed)
    }

    /// Writes one verified chunk of a waiting file at `offset`.
    pub async fn write_chunk(
        &self,
        ip: IpAddr,
        code: &str,
        filename: &str,
        chunk: Bytes,
        offset: i64,
        sha256: &str,
    ) -> Result<(), BoxError> {
        if self.backend() != BackendKind::Filesystem {
            return Err(BoxError::Rejected(UploadFail::InvalidFile));
        }
        let now = self.registry.now();
        self.guard_errors(ip, now)?;
        let _lock = self.registry.lock_box_shared(code).await;
        let file_box = self.find_box(ip, code, now)?;
        if file_box.status != Status::Waiting {
            return Err(BoxError::NotFound);
        }
        let file = self.find_file(ip, now, &file_box, filename)?;
        if file.status != Status::Waiting {
            return Err(BoxError::NotFound);
        }

        let len = chunk.len() as u64;
        let offset = u64::try_from(offset).map_err(|_| UploadFail::InvalidFile)?;
        if offset.checked_add(len).is_none_or(|end| end > file.size) {
            return Err(BoxError::Rejected(UploadFail::InvalidFile));
        }

        self.registry.rates().check(ip, Dimension::File, now)?;

        let data = chunk.clone();
        let digest = run_blocking(move || Ok(sha256_hex(&data))).await?;
        if digest != normalize_hash(sha256) {
            debug!(code, filename, offset, "chunk hash mismatch");
            return Err(self.integrity_failure(ip, now));
        }

        match self
            .registry
            .storage()
            .write(code, filename, chunk, offset)
            .await
        {
            Ok(()) => {}
            Err(StorageError::OutOfBounds { .. }) => {
                return Err(BoxError::Rejected(UploadFail::InvalidFile));
            }
            Err(err) => return Err(err.into()),
        }
        self.registry
            .rates()
            .update(ip, Dimension::File, len, self.limits.file_bytes, now);
        debug!(code, filename, offset, len, "wrote chunk");
        Ok(())
    }

    /// 后端校验通过后将文件标记为完成。
    pub async fn finalize_file(
        &self,
        ip: IpAddr,
        code: &str,
        filename: &str,
        sha256: &str,
        extra: serde_json::Value,
    ) -> Result<(), BoxError> {
        let now = self.registry.now();
        self.guard_errors(ip, now)?;
        let _lock = self.registry.lock_box(code).await;
        let file_box = self.find_box(ip, code, now)?;
        if file_box.status != Status::Waiting {
            return Err(BoxError::NotFound);
        }
        let file = self.find_file(ip, now, &file_box, filename)?;
        if file.status != Status::Waiting {
            return Err(BoxError::NotFound);
        }

        match self
            .registry
            .storage()
            .finalize(code, filename, file.size, sha256, &extra)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(code, filename, "file failed verification");
                return Err(self.integrity_failure(ip, now));
            }
            Err(err) => {
                warn!(code, filename, error = %err, "file verification errored");
                return Err(self.integrity_failure(ip, now));
            }
        }

        self.registry.complete_file(code, filename).await?;
        info!(code, filename, size = file.size, "completed file");
        Ok(())
    }

    /// Local path of a completed file in a completed box.
    pub async fn download_path(
        &self,
        ip: IpAddr,
        code: &str,
        filename: &str,
    ) -> Result<(PathBuf, BoxFile), BoxError> {
        let storage = self.registry.storage();
        let Some(path) = storage.local_path(code, filename) else {
            return Err(BoxError::Rejected(UploadFail::InvalidFile));
        };
        let now = self.registry.now();
        self.guard_errors(ip, now)?;
        let file_box = self.find_box(ip, code, now)?;
        if file_box.status != Status::Complete {
            return Err(BoxError::NotFound);
        }
        let file = self.find_file(ip, now, &file_box, filename)?;
        if file.status != Status::Complete {
            return Err(BoxError::NotFound);
        }
        Ok((path, file))
    }

    pub async fn capacity(&self) -> Result<u32, BoxError> {
        Ok(self.registry.storage().capacity().await?)
    }

    /// 签发新卡片：红色等级、十次可用、不计年限。
    pub async fn issue_card(&self, level: Level) -> Result<IssuedCard, BoxError> {
        let code = self.registry.cards().reserve_code();
        let card = Card {
            code: code.clone(),
            level,
            count: DEFAULT_CARD_USES,
            created: 0,
        };
        if let Err(err) = self.registry.register_card(card).await {
            self.registry.cards().release(&code);
            return Err(err);
        }
        info!(code, level = ?level, "issued card");
        Ok(IssuedCard {
            token: self.tokens.issue(&code),
            code,
        })
    }

    /// Maps a bearer token to a live card; anything else yields `None`.
    pub fn resolve_card(&self, token: &str) -> Option<Card> {
        let code = self.tokens.verify(token)?;
        self.registry.get_card(&code)
    }

    pub fn card_detail(&self, card: &Card) -> Result<Card, BoxError> {
        self.registry
            .get_card(&card.code)
            .filter(|card| card.count > 0)
            .ok_or(BoxError::NotFound)
    }

    /// 换发新卡：剩余次数减一，旧卡立即失效。
    pub async fn renew_card(&self, card: &Card) -> Result<IssuedCard, BoxError> {
        let _lock = self.registry.lock_card(&card.code).await;
        let current = self
            .registry
            .get_card(&card.code)
            .filter(|card| card.count > 0)
            .ok_or(BoxError::NotFound)?;

        let code = self.registry.cards().reserve_code();
        let retired = Card {
            count: 0,
            ..current.clone()
        };
        // 旧卡先落盘为零次，重启后也不会复活
        if let Err(err) = self.registry.persist_card(&retired).await {
            self.registry.cards().release(&code);
            return Err(err);
        }

        let renewed = Card {
            code: code.clone(),
            level: current.level,
            count: current.count - 1,
            created: current.created,
        };
        if let Err(err) = self.registry.register_card(renewed).await {
            self.registry.cards().release(&code);
            if let Err(restore) = self.registry.persist_card(&current).await {
                warn!(code = %current.code, error = %restore, "failed to restore card after renewal error");
            }
            return Err(err);
        }

        self.registry.cards().expire(&current.code);
        info!(old = %retired.code, new = %code, "renewed card");
        Ok(IssuedCard {
            token: self.tokens.issue(&code),
            code,
        })
    }

    pub fn admin_list_boxes(&self, expired: bool) -> Vec<FileBox> {
        if expired {
            self.registry.boxes().expired()
        } else {
            self.registry.boxes().active()
        }
    }

    pub fn admin_get_box(&self, code: &str) -> Option<FileBox> {
        self.registry.boxes().peek(code)
    }
}

fn validate_files(files: &[FileSpec], quota: Quota) -> Result<(), UploadFail> {
    if files.is_empty() {
        return Err(UploadFail::EmptyFile);
    }
    if files.len() > quota.max_files {
        return Err(UploadFail::TooMuchFile);
    }
    let mut names = HashSet::with_capacity(files.len());
    let mut total: u64 = 0;
    for spec in files {
        if spec.name.chars().count() > MAX_FILENAME_CHARS
            || !is_safe_filename(&spec.name)
            || !names.insert(spec.name.as_str())
        {
            return Err(UploadFail::InvalidName);
        }
        total = total
            .checked_add(spec.size)
            .ok_or(UploadFail::TooMuchError)?;
    }
    if total > quota.max_bytes {
        return Err(UploadFail::TooMuchError);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::BoxPolicy;
    use crate::storage::{
        FilesystemStorage, MemoryObjectClient, Namespace, ObjectStorage, ObjectStorageConfig,
        StorageBackend,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    const BOX_TTL: i64 = 86_400;

    struct Harness {
        _dir: tempfile::TempDir,
        clock: ManualClock,
        service: BoxService,
    }

    const POLICY: BoxPolicy = BoxPolicy {
        box_ttl: BOX_TTL,
        waiting_divisor: 10,
    };

    fn local_storage(dir: &tempfile::TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(FilesystemStorage::new(
            dir.path().join("data"),
            dir.path().join("logs"),
        ))
    }

    async fn service_on(
        storage: Arc<dyn StorageBackend>,
        clock: &ManualClock,
        limits: RateLimits,
    ) -> BoxService {
        let registry = Registry::load(storage, Arc::new(clock.clone()), POLICY)
            .await
            .expect("registry");
        BoxService::new(Arc::new(registry), TokenSigner::new("secret"), limits)
    }

    async fn harness_with(limits: RateLimits) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::new(1_700_000_000);
        let service = service_on(local_storage(&dir), &clock, limits).await;
        Harness {
            _dir: dir,
            clock,
            service,
        }
    }

    async fn harness() -> Harness {
        harness_with(RateLimits::default()).await
    }

    fn ip() -> IpAddr {
        "192.0.2.10".parse().expect("ip")
    }

    fn spec(name: &str, size: u64) -> FileSpec {
        FileSpec {
            name: name.into(),
            size,
        }
    }

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    async fn write(service: &BoxService, code: &str, name: &str, data: &[u8], offset: usize) {
        let chunk = Bytes::copy_from_slice(data);
        service
            .write_chunk(ip(), code, name, chunk, offset as i64, &sha256_hex(data))
            .await
            .expect("write chunk");
    }

    #[tokio::test]
    async fn upload_finalize_and_download_two_files() {
        let h = harness().await;
        let service = &h.service;
        let a = content(1024, 1);
        let b = content(2048, 7);

        let created = service
            .create_box(ip(), vec![spec("a.jpg", 1024), spec("b.jpg", 2048)], None)
            .await
            .expect("create");
        let code = created.code.clone();
        assert_eq!(code.len(), 8);
        assert_eq!(created.storage, BackendKind::Filesystem);
        assert_eq!(
            created.uploads["a.jpg"].urls,
            vec![format!("/api/files/{code}/a.jpg")]
        );

        let waiting = service.fetch_box(ip(), &code).await.expect("fetch waiting");
        assert_eq!(waiting.status, Status::Waiting);
        assert!(waiting.results.iter().all(|file| file.url.is_none()));

        // out of order and overlapping
        write(service, &code, "a.jpg", &a[512..], 512).await;
        write(service, &code, "a.jpg", &a[..700], 0).await;
        write(service, &code, "b.jpg", &b, 0).await;

        assert!(matches!(
            service.finalize_box(ip(), &code, BTreeMap::new()).await,
            Err(BoxError::Rejected(UploadFail::InvalidFile))
        ));

        for (name, data) in [("a.jpg", &a), ("b.jpg", &b)] {
            service
                .finalize_file(ip(), &code, name, &sha256_hex(data), serde_json::Value::Null)
                .await
                .expect("finalize file");
        }
        // a completed file no longer accepts chunks
        let late = service
            .write_chunk(ip(), &code, "a.jpg", Bytes::from_static(b"x"), 0, &sha256_hex(b"x"))
            .await;
        assert!(matches!(late, Err(BoxError::NotFound)));

        let mut log = BTreeMap::new();
        log.insert("user-agent".to_string(), "tests".to_string());
        let completed = service.finalize_box(ip(), &code, log).await.expect("finalize box");
        assert_eq!(completed.status, Status::Complete);

        let view = service.fetch_box(ip(), &code).await.expect("fetch complete");
        assert_eq!(view.count, 2);
        assert_eq!(
            view.results[1].url.as_deref(),
            Some(format!("/api/files/{code}/b.jpg").as_str())
        );

        let (path, file) = service
            .download_path(ip(), &code, "a.jpg")
            .await
            .expect("download");
        assert_eq!(file.size, 1024);
        assert_eq!(std::fs::read(path).expect("read"), a);

        assert!(matches!(
            service.finalize_box(ip(), &code, BTreeMap::new()).await,
            Err(BoxError::Rejected(UploadFail::InvalidFile))
        ));
    }

    #[tokio::test]
    async fn corrupt_chunks_and_bad_offsets_are_rejected() {
        let h = harness().await;
        let service = &h.service;
        let created = service
            .create_box(ip(), vec![spec("a.bin", 16)], None)
            .await
            .expect("create");
        let code = created.code;

        let chunk = Bytes::from_static(b"0123456789");
        let wrong_hash = service
            .write_chunk(ip(), &code, "a.bin", chunk.clone(), 0, &sha256_hex(b"other"))
            .await;
        assert!(matches!(wrong_hash, Err(BoxError::Rejected(UploadFail::InvalidFile))));

        for offset in [-1, 7] {
            let result = service
                .write_chunk(ip(), &code, "a.bin", chunk.clone(), offset, &sha256_hex(&chunk))
                .await;
            assert!(matches!(result, Err(BoxError::Rejected(UploadFail::InvalidFile))));
        }

        write(service, &code, "a.bin", b"0123456789abcdef", 0).await;
        let flipped = service
            .finalize_file(ip(), &code, "a.bin", &sha256_hex(b"0123456789abcdeF"), serde_json::Value::Null)
            .await;
        assert!(matches!(flipped, Err(BoxError::Rejected(UploadFail::InvalidFile))));
    }

    #[tokio::test]
    async fn invalid_declarations_leave_no_state() {
        let h = harness().await;
        let service = &h.service;
        let cases = [
            (vec![], UploadFail::EmptyFile),
            (
                (0..6).map(|i| spec(&format!("{i}.txt"), 1)).collect(),
                UploadFail::TooMuchFile,
            ),
            (vec![spec("a", 1), spec("a", 1)], UploadFail::InvalidName),
            (vec![spec("../etc/passwd", 1)], UploadFail::InvalidName),
            (vec![spec(&"x".repeat(251), 1)], UploadFail::InvalidName),
            (
                vec![spec("big", 100 * 1024 * 1024), spec("one-more", 1)],
                UploadFail::TooMuchError,
            ),
            (vec![spec("a", u64::MAX), spec("b", 1)], UploadFail::TooMuchError),
        ];
        for (files, expected) in cases {
            match service.create_box(ip(), files, None).await {
                Err(BoxError::Rejected(fail)) => assert_eq!(fail, expected),
                other => panic!("expected {expected:?}, got {other:?}"),
            }
        }
        assert_eq!(service.registry().boxes().active_len(), 0);
        assert!(service.create_box(ip(), vec![spec(&"x".repeat(250), 1)], None).await.is_ok());
    }

    #[tokio::test]
    async fn waiting_box_disappears_after_waiting_ttl() {
        let h = harness().await;
        let service = &h.service;
        let created = service
            .create_box(ip(), vec![spec("a.txt", 1)], None)
            .await
            .expect("create");

        h.clock.advance(BOX_TTL / 10 - 1);
        assert!(service.fetch_box(ip(), &created.code).await.is_ok());
        h.clock.advance(1);
        assert!(matches!(
            service.fetch_box(ip(), &created.code).await,
            Err(BoxError::NotFound)
        ));
        assert_eq!(
            service.admin_list_boxes(true)[0].code,
            created.code
        );
        assert!(service.admin_get_box(&created.code).is_some());
    }

    #[tokio::test]
    async fn chunk_traffic_over_limit_arms_cooldown() {
        let h = harness_with(RateLimits {
            file_bytes: 1000,
            ..RateLimits::default()
        })
        .await;
        let service = &h.service;
        let created = service
            .create_box(ip(), vec![spec("a.bin", 4096)], None)
            .await
            .expect("create");

        let data = content(1024, 3);
        write(service, &created.code, "a.bin", &data, 0).await;
        let blocked = service
            .write_chunk(ip(), &created.code, "a.bin", Bytes::from(data.clone()), 1024, &sha256_hex(&data))
            .await;
        assert!(matches!(blocked, Err(BoxError::RateLimited { retry_after: 3600 })));

        h.clock.advance(3600);
        write(service, &created.code, "a.bin", &data, 1024).await;
    }

    #[tokio::test]
    async fn red_card_unlocks_quota_and_renewal_retires_old_card() {
        let h = harness().await;
        let service = &h.service;
        let issued = service.issue_card(Level::Red).await.expect("issue");
        assert_eq!(issued.code.len(), 9);

        let card = service.resolve_card(&issued.token).expect("resolve");
        assert_eq!(card.count, DEFAULT_CARD_USES);
        assert!(service.resolve_card("123.bogus").is_none());

        // over the visitor quota, within the red one
        let files = vec![spec("big.iso", 200 * 1024 * 1024)];
        assert!(matches!(
            service.create_box(ip(), files.clone(), None).await,
            Err(BoxError::Rejected(UploadFail::TooMuchError))
        ));
        let created = service
            .create_box(ip(), files, Some(card.clone()))
            .await
            .expect("red box");
        let file_box = service.admin_get_box(&created.code).expect("box");
        assert_eq!(file_box.level, Level::Red);
        let card = service.card_detail(&card).expect("detail");
        assert_eq!(card.count, DEFAULT_CARD_USES - 1);

        let renewed = service.renew_card(&card).await.expect("renew");
        assert_ne!(renewed.code, card.code);
        assert!(service.resolve_card(&issued.token).is_none());
        let fresh = service.resolve_card(&renewed.token).expect("new card");
        assert_eq!(fresh.count, DEFAULT_CARD_USES - 2);
        assert_eq!(fresh.created, 0);
        assert!(matches!(service.renew_card(&card).await, Err(BoxError::NotFound)));
    }

    /// Local storage that refuses descriptor writes for one card code.
    struct RefusingCardWrites {
        inner: FilesystemStorage,
        refused: Mutex<Option<String>>,
    }

    impl RefusingCardWrites {
        fn refuse(&self, code: Option<&str>) {
            *self.refused.lock().expect("refused") = code.map(str::to_string);
        }
    }

    #[async_trait]
    impl StorageBackend for RefusingCardWrites {
        fn kind(&self) -> BackendKind {
            self.inner.kind()
        }

        async fn init(&self) -> Result<(), StorageError> {
            self.inner.init().await
        }

        async fn allocate(
            &self,
            code: &str,
            filename: &str,
            size: u64,
        ) -> Result<UploadTarget, StorageError> {
            self.inner.allocate(code, filename, size).await
        }

        async fn write(
            &self,
            code: &str,
            filename: &str,
            chunk: Bytes,
            offset: u64,
        ) -> Result<(), StorageError> {
            self.inner.write(code, filename, chunk, offset).await
        }

        async fn finalize(
            &self,
            code: &str,
            filename: &str,
            size: u64,
            sha256: &str,
            extra: &serde_json::Value,
        ) -> Result<bool, StorageError> {
            self.inner.finalize(code, filename, size, sha256, extra).await
        }

        async fn locate(&self, code: &str, filename: &str) -> Result<String, StorageError> {
            self.inner.locate(code, filename).await
        }

        fn local_path(&self, code: &str, filename: &str) -> Option<PathBuf> {
            self.inner.local_path(code, filename)
        }

        async fn list_descriptor_keys(
            &self,
            namespace: Namespace,
        ) -> Result<Vec<String>, StorageError> {
            self.inner.list_descriptor_keys(namespace).await
        }

        async fn load_descriptor(
            &self,
            namespace: Namespace,
            code: &str,
        ) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.load_descriptor(namespace, code).await
        }

        async fn save_descriptor(
            &self,
            namespace: Namespace,
            code: &str,
            data: Vec<u8>,
        ) -> Result<(), StorageError> {
            let refused = self.refused.lock().expect("refused").clone();
            if namespace == Namespace::Card && refused.as_deref() == Some(code) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.save_descriptor(namespace, code, data).await
        }

        async fn save_log(
            &self,
            code: &str,
            entries: &BTreeMap<String, String>,
        ) -> Result<(), StorageError> {
            self.inner.save_log(code, entries).await
        }

        async fn archive(&self, code: &str) -> Result<(), StorageError> {
            self.inner.archive(code).await
        }

        async fn remove(&self, code: &str) -> Result<(), StorageError> {
            self.inner.remove(code).await
        }

        async fn capacity(&self) -> Result<u32, StorageError> {
            self.inner.capacity().await
        }
    }

    #[tokio::test]
    async fn renewal_fails_whole_when_old_card_cannot_be_retired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::new(1_700_000_000);
        let storage = Arc::new(RefusingCardWrites {
            inner: FilesystemStorage::new(dir.path().join("data"), dir.path().join("logs")),
            refused: Mutex::new(None),
        });
        let service = service_on(storage.clone(), &clock, RateLimits::default()).await;
        let issued = service.issue_card(Level::Red).await.expect("issue");
        let card = service.resolve_card(&issued.token).expect("card");

        storage.refuse(Some(&card.code));
        assert!(matches!(
            service.renew_card(&card).await,
            Err(BoxError::Storage(_))
        ));
        // nothing changed: the old card still works and no second card exists
        assert_eq!(
            service.resolve_card(&issued.token).map(|card| card.count),
            Some(DEFAULT_CARD_USES)
        );
        assert_eq!(service.registry().cards().active_len(), 1);

        storage.refuse(None);
        let renewed = service.renew_card(&card).await.expect("renew");

        let restarted = service_on(local_storage(&dir), &clock, RateLimits::default()).await;
        assert!(restarted.resolve_card(&issued.token).is_none());
        assert_eq!(
            restarted.resolve_card(&renewed.token).map(|card| card.count),
            Some(DEFAULT_CARD_USES - 1)
        );
        assert_eq!(restarted.registry().cards().active_len(), 1);
    }

    async fn box_with_completed_file(service: &BoxService) -> String {
        let data = content(64, 5);
        let created = service
            .create_box(ip(), vec![spec("a.bin", 64)], None)
            .await
            .expect("create");
        write(service, &created.code, "a.bin", &data, 0).await;
        service
            .finalize_file(ip(), &created.code, "a.bin", &sha256_hex(&data), serde_json::Value::Null)
            .await
            .expect("finalize file");
        created.code
    }

    #[tokio::test]
    async fn concurrent_box_completion_succeeds_once() {
        let h = harness().await;
        let service = &h.service;
        let code = box_with_completed_file(service).await;

        h.clock.advance(5);
        let (first, second) = tokio::join!(
            service.finalize_box(ip(), &code, BTreeMap::new()),
            service.finalize_box(ip(), &code, BTreeMap::new()),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|result| matches!(result, Err(BoxError::Rejected(UploadFail::InvalidFile))))
                .count(),
            1
        );
        let stored = service.admin_get_box(&code).expect("box");
        assert_eq!(stored.status, Status::Complete);
        assert_eq!(stored.created, 1_700_000_005);
    }

    #[tokio::test]
    async fn file_completion_waits_for_in_flight_chunks() {
        let h = harness().await;
        let service = &h.service;
        let data = content(128, 9);
        let created = service
            .create_box(ip(), vec![spec("a.bin", 128)], None)
            .await
            .expect("create");
        let code = created.code;
        write(service, &code, "a.bin", &data[..64], 0).await;

        // a chunk writer holds the shared side while its bytes land
        let in_flight = service.registry().lock_box_shared(&code).await;
        let digest = sha256_hex(&data);
        let finalize = service.finalize_file(
            ip(),
            &code,
            "a.bin",
            &digest,
            serde_json::Value::Null,
        );
        tokio::pin!(finalize);
        assert!(
            timeout(Duration::from_millis(50), &mut finalize)
                .await
                .is_err()
        );

        service
            .registry()
            .storage()
            .write(&code, "a.bin", Bytes::copy_from_slice(&data[64..]), 64)
            .await
            .expect("in-flight write");
        drop(in_flight);

        finalize.await.expect("finalize sees every written byte");
        let stored = service.admin_get_box(&code).expect("box");
        assert_eq!(stored.files["a.bin"].status, Status::Complete);
    }

    #[tokio::test]
    async fn object_store_boxes_hand_out_presigned_locators() {
        let clock = ManualClock::new(1_700_000_000);
        let waiting_ttl = POLICY.waiting_ttl();
        let client = Arc::new(MemoryObjectClient::default());
        let storage = Arc::new(ObjectStorage::new(
            client.clone(),
            ObjectStorageConfig {
                data_bucket: "data".into(),
                logs_bucket: "logs".into(),
                part_size: 10_000_000,
                url_ttl: Duration::from_secs(waiting_ttl as u64),
            },
        ));
        let service = service_on(storage, &clock, RateLimits::default()).await;
        let expires = format!("expires={waiting_ttl}");

        let created = service
            .create_box(ip(), vec![spec("a.jpg", 5), spec("b.jpg", 3)], None)
            .await
            .expect("create");
        assert_eq!(created.storage, BackendKind::S3);
        let code = created.code;
        for target in created.uploads.values() {
            assert_eq!(target.urls.len(), 1);
            assert!(target.urls[0].contains(&expires));
            assert!(target.upload_id.is_some());
        }

        // the client uploads straight to the bucket
        for (name, body) in [("a.jpg", &b"hello"[..]), ("b.jpg", &b"abc"[..])] {
            client.insert("data", &format!("box/{code}/files/{name}"), body);
            let extra = serde_json::json!({
                "UploadId": created.uploads[name].upload_id,
                "Parts": [{"ETag": "\"etag\"", "PartNumber": 1}],
            });
            service
                .finalize_file(ip(), &code, name, &sha256_hex(body), extra)
                .await
                .expect("finalize file");
        }
        service
            .finalize_box(ip(), &code, BTreeMap::new())
            .await
            .expect("finalize box");

        let view = service.fetch_box(ip(), &code).await.expect("fetch");
        assert_eq!(view.count, 2);
        for file in &view.results {
            let url = file.url.as_deref().expect("locator");
            assert!(url.contains(&format!("box/{code}/files/{}", file.name)));
            assert!(url.ends_with(&expires));
        }
        assert!(matches!(
            service.download_path(ip(), &code, "a.jpg").await,
            Err(BoxError::Rejected(UploadFail::InvalidFile))
        ));
    }
}
