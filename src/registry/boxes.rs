//! 活跃盒子表、过期待归档集合与盒子状态机。

use dashmap::{DashMap, DashSet};
use rand::Rng;
use std::ops::RangeInclusive;
use tracing::debug;

use crate::model::{FileBox, Status, UploadFail};

pub const BOX_CODE_RANGE: RangeInclusive<u64> = 10_000_000..=99_999_999;

/// Time-to-live rules for boxes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoxPolicy {
    /// Download window of a complete box, in seconds.
    pub box_ttl: i64,
    /// Waiting boxes live `box_ttl / waiting_divisor`.
    pub waiting_divisor: i64,
}

impl BoxPolicy {
    pub fn waiting_ttl(&self) -> i64 {
        self.box_ttl / self.waiting_divisor.max(1)
    }

    pub fn is_expired(&self, file_box: &FileBox, now: i64) -> bool {
        let passed = now - file_box.created;
        match file_box.status {
            Status::Waiting => passed >= self.waiting_ttl(),
            Status::Complete => passed >= self.box_ttl,
        }
    }
}

/// 将单个文件标记为完成，不改变盒子状态。
pub fn complete_file(file_box: &mut FileBox, filename: &str) -> Result<(), UploadFail> {
    let file = file_box
        .files
        .get_mut(filename)
        .ok_or(UploadFail::InvalidFile)?;
    file.status = Status::Complete;
    Ok(())
}

/// Waiting → Complete; restarts the expiry clock at `now`.
pub fn complete_box(file_box: &mut FileBox, now: i64) -> Result<(), UploadFail> {
    if file_box.status != Status::Waiting || !file_box.all_files_complete() {
        return Err(UploadFail::InvalidFile);
    }
    file_box.status = Status::Complete;
    file_box.created = now;
    Ok(())
}

#[derive(Debug)]
pub struct BoxStore {
    policy: BoxPolicy,
    active: DashMap<String, FileBox>,
    expired: DashMap<String, FileBox>,
    reserved: DashSet<String>,
}

impl BoxStore {
    pub fn new(policy: BoxPolicy) -> Self {
        Self {
            policy,
            active: DashMap::new(),
            expired: DashMap::new(),
            reserved: DashSet::new(),
        }
    }

    pub fn policy(&self) -> BoxPolicy {
        self.policy
    }

    /// 随机生成 code，直到不与活跃、过期或已预留的 code 冲突。
    pub fn reserve_code(&self) -> String {
        let mut rng = rand::thread_rng();
        self.reserve_code_with(|| rng.gen_range(BOX_CODE_RANGE).to_string())
    }

    fn reserve_code_with(&self, mut sample: impl FnMut() -> String) -> String {
        loop {
            let code = sample();
            if !self.reserved.insert(code.clone()) {
                continue;
            }
            if self.active.contains_key(&code) || self.expired.contains_key(&code) {
                self.reserved.remove(&code);
                continue;
            }
            return code;
        }
    }

    /// Gives back a reservation whose box was never committed.
    pub fn release(&self, code: &str) {
        self.reserved.remove(code);
    }

    pub fn commit(&self, file_box: FileBox) {
        let code = file_box.code.clone();
        self.active.insert(code.clone(), file_box);
        self.reserved.remove(&code);
    }

    /// Replaces an active box; returns false if it is no longer active.
    pub fn replace(&self, file_box: FileBox) -> bool {
        match self.active.get_mut(&file_box.code) {
            Some(mut entry) => {
                *entry = file_box;
                true
            }
            None => false,
        }
    }

    /// 读取时即检查过期；过期的盒子移入待归档集合并返回 None。
    pub fn get(&self, code: &str, now: i64) -> Option<FileBox> {
        let current = self.active.get(code).map(|entry| entry.clone())?;
        if self.policy.is_expired(&current, now) {
            self.expire(code);
            return None;
        }
        Some(current)
    }

    /// Reads an active or pending-archival box without evaluating expiry.
    pub fn peek(&self, code: &str) -> Option<FileBox> {
        self.active
            .get(code)
            .or_else(|| self.expired.get(code))
            .map(|entry| entry.clone())
    }

    fn expire(&self, code: &str) {
        if let Some((code, file_box)) = self.active.remove(code) {
            debug!(code, status = ?file_box.status, "box expired");
            self.expired.insert(code, file_box);
        }
    }

    pub fn insert_expired(&self, file_box: FileBox) {
        self.expired.insert(file_box.code.clone(), file_box);
    }

    /// Moves every expired active box to the holding set.
    pub fn expire_due(&self, now: i64) -> usize {
        let due: Vec<String> = self
            .active
            .iter()
            .filter(|entry| self.policy.is_expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();
        for code in &due {
            self.expire(code);
        }
        due.len()
    }

    pub fn expired_codes(&self) -> Vec<String> {
        self.expired.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 归档成功后从待归档集合移除。
    pub fn release_expired(&self, code: &str) {
        self.expired.remove(code);
    }

    pub fn active(&self) -> Vec<FileBox> {
        let mut boxes: Vec<FileBox> = self.active.iter().map(|entry| entry.clone()).collect();
        boxes.sort_by(|a, b| a.code.cmp(&b.code));
        boxes
    }

    pub fn expired(&self) -> Vec<FileBox> {
        let mut boxes: Vec<FileBox> = self.expired.iter().map(|entry| entry.clone()).collect();
        boxes.sort_by(|a, b| a.code.cmp(&b.code));
        boxes
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn expired_len(&self) -> usize {
        self.expired.len()
    }
}
