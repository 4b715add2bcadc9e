//! 注册表：持有盒子表、卡片表、限流器与按 code 的锁。
//!
//! 所有状态变更都先写描述文件再更新内存，保证重启后可以恢复。

mod boxes;
mod cards;

use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::locking::KeyLocks;
use crate::model::{Card, FileBox, UploadFail};
use crate::rate::{RateLimited, RateLimiter};
use crate::storage::{Namespace, StorageBackend, StorageError};

pub use boxes::{BoxPolicy, BoxStore};
pub use cards::CardStore;

/// Failure of a registry or service operation.
#[derive(Debug, thiserror::Error)]
pub enum BoxError {
    #[error("not found")]
    NotFound,
    #[error("rejected with failure code {0}")]
    Rejected(UploadFail),
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("descriptor error: {0}")]
    Descriptor(#[from] serde_json::Error),
}

impl From<UploadFail> for BoxError {
    fn from(fail: UploadFail) -> Self {
        BoxError::Rejected(fail)
    }
}

impl From<RateLimited> for BoxError {
    fn from(limited: RateLimited) -> Self {
        BoxError::RateLimited {
            retry_after: limited.retry_after,
        }
    }
}

pub struct Registry {
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    boxes: BoxStore,
    cards: CardStore,
    rates: RateLimiter,
    locks: KeyLocks,
}

impl Registry {
    pub fn new(storage: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>, policy: BoxPolicy) -> Self {
        Self {
            storage,
            clock,
            boxes: BoxStore::new(policy),
            cards: CardStore::new(),
            rates: RateLimiter::new(),
            locks: KeyLocks::new(),
        }
    }

    /// 初始化存储并从描述文件恢复盒子与卡片。
    pub async fn load(
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        policy: BoxPolicy,
    ) -> Result<Self, BoxError> {
        let registry = Self::new(storage, clock, policy);
        registry.storage.init().await?;
        registry.load_boxes().await?;
        registry.load_cards().await?;
        Ok(registry)
    }

    async fn load_boxes(&self) -> Result<(), BoxError> {
        let now = self.now();
        let policy = self.boxes.policy();
        for code in self.storage.list_descriptor_keys(Namespace::Box).await? {
            let Some(data) = self.storage.load_descriptor(Namespace::Box, &code).await? else {
                warn!(code, "box without descriptor, removing");
                if let Err(err) = self.storage.remove(&code).await {
                    warn!(code, error = %err, "failed to remove orphaned box");
                }
                continue;
            };
            let file_box: FileBox = match serde_json::from_slice(&data) {
                Ok(file_box) => file_box,
                Err(err) => {
                    warn!(code, error = %err, "unreadable box descriptor, skipping");
                    continue;
                }
            };
            if policy.is_expired(&file_box, now) {
                self.boxes.insert_expired(file_box);
            } else {
                self.boxes.commit(file_box);
            }
        }
        info!(
            active = self.boxes.active_len(),
            expired = self.boxes.expired_len(),
            "boxes loaded"
        );
        Ok(())
    }

    async fn load_cards(&self) -> Result<(), BoxError> {
        let now = self.now();
        for code in self.storage.list_descriptor_keys(Namespace::Card).await? {
            let Some(data) = self.storage.load_descriptor(Namespace::Card, &code).await? else {
                continue;
            };
            let card: Card = match serde_json::from_slice(&data) {
                Ok(card) => card,
                Err(err) => {
                    warn!(code, error = %err, "unreadable card descriptor, skipping");
                    continue;
                }
            };
            if card.is_expired(now) {
                self.cards.expire(&card.code);
            } else {
                self.cards.commit(card);
            }
        }
        info!(
            active = self.cards.active_len(),
            expired = self.cards.expired_len(),
            "cards loaded"
        );
        Ok(())
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn boxes(&self) -> &BoxStore {
        &self.boxes
    }

    pub fn cards(&self) -> &CardStore {
        &self.cards
    }

    pub fn rates(&self) -> &RateLimiter {
        &self.rates
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    pub async fn lock_box_shared(&self, code: &str) -> OwnedRwLockReadGuard<()> {
        self.locks.shared(&format!("box:{code}")).await
    }

    pub async fn lock_box(&self, code: &str) -> OwnedRwLockWriteGuard<()> {
        self.locks.exclusive(&format!("box:{code}")).await
    }

    pub async fn lock_card(&self, code: &str) -> OwnedRwLockWriteGuard<()> {
        self.locks.exclusive(&format!("card:{code}")).await
    }

    pub fn get_box(&self, code: &str) -> Option<FileBox> {
        self.boxes.get(code, self.now())
    }

    pub fn get_card(&self, code: &str) -> Option<Card> {
        self.cards.get(code, self.now())
    }

    pub async fn persist_box(&self, file_box: &FileBox) -> Result<(), BoxError> {
        let data = serde_json::to_vec(file_box)?;
        self.storage
            .save_descriptor(Namespace::Box, &file_box.code, data)
            .await?;
        Ok(())
    }

    pub async fn persist_card(&self, card: &Card) -> Result<(), BoxError> {
        let data = serde_json::to_vec(card)?;
        self.storage
            .save_descriptor(Namespace::Card, &card.code, data)
            .await?;
        Ok(())
    }

    /// Persists a freshly built box and publishes it under its reserved code.
    pub async fn register_box(&self, file_box: FileBox) -> Result<(), BoxError> {
        self.persist_box(&file_box).await?;
        self.boxes.commit(file_box);
        Ok(())
    }

    pub async fn register_card(&self, card: Card) -> Result<(), BoxError> {
        self.persist_card(&card).await?;
        self.cards.commit(card);
        Ok(())
    }

    /// 标记文件完成。调用方需持有该盒子的独占锁。
    pub async fn complete_file(&self, code: &str, filename: &str) -> Result<FileBox, BoxError> {
        let mut file_box = self.get_box(code).ok_or(BoxError::NotFound)?;
        boxes::complete_file(&mut file_box, filename)?;
        self.persist_box(&file_box).await?;
        self.boxes.replace(file_box.clone());
        Ok(file_box)
    }

    /// 盒子进入完成状态。调用方需持有该盒子的独占锁。
    pub async fn complete_box(&self, code: &str) -> Result<FileBox, BoxError> {
        let mut file_box = self.get_box(code).ok_or(BoxError::NotFound)?;
        boxes::complete_box(&mut file_box, self.now())?;
        self.persist_box(&file_box).await?;
        self.boxes.replace(file_box.clone());
        Ok(file_box)
    }

    /// Writes back a card whose remaining uses changed.
    pub async fn update_card(&self, card: Card) -> Result<(), BoxError> {
        self.persist_card(&card).await?;
        if card.is_expired(self.now()) {
            self.cards.expire(&card.code);
        } else {
            self.cards.replace(card);
        }
        Ok(())
    }
}
