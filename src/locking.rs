//! 按 code 的内存锁：分片写入共享，读改写序列独占。

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Manages asynchronous read/write locks keyed by box or card code.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// 共享锁：同一盒子的多个分片写入可并发。
    pub async fn shared(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.entry(key).read_owned().await
    }

    /// 独占锁：等待进行中的写入结束后再执行读改写。
    pub async fn exclusive(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.entry(key).write_owned().await
    }

    /// Drops locks nobody holds or waits on; returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }
}
