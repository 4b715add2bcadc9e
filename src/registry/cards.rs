//! 卡片表：活跃卡片与已失效 code 集合。

use dashmap::{DashMap, DashSet};
use rand::Rng;
use std::ops::RangeInclusive;
use tracing::debug;

use crate::model::Card;

pub const CARD_CODE_RANGE: RangeInclusive<u64> = 100_000_000..=999_999_999;

#[derive(Debug, Default)]
pub struct CardStore {
    active: DashMap<String, Card>,
    expired: DashSet<String>,
    reserved: DashSet<String>,
}

impl CardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code = rng.gen_range(CARD_CODE_RANGE).to_string();
            if !self.reserved.insert(code.clone()) {
                continue;
            }
            if self.active.contains_key(&code) || self.expired.contains(&code) {
                self.reserved.remove(&code);
                continue;
            }
            return code;
        }
    }

    pub fn release(&self, code: &str) {
        self.reserved.remove(code);
    }

    pub fn commit(&self, card: Card) {
        let code = card.code.clone();
        self.active.insert(code.clone(), card);
        self.reserved.remove(&code);
    }

    pub fn replace(&self, card: Card) -> bool {
        match self.active.get_mut(&card.code) {
            Some(mut entry) => {
                *entry = card;
                true
            }
            None => false,
        }
    }

    /// 失效的卡片在读取时移出活跃表。
    pub fn get(&self, code: &str, now: i64) -> Option<Card> {
        let card = self.active.get(code).map(|entry| entry.clone())?;
        if card.is_expired(now) {
            self.expire(code);
            return None;
        }
        Some(card)
    }

    pub fn expire(&self, code: &str) {
        if self.active.remove(code).is_some() {
            debug!(code, "card expired");
        }
        self.expired.insert(code.to_string());
    }

    /// Expires every card that ran out of uses or aged out.
    pub fn expire_due(&self, now: i64) -> usize {
        let due: Vec<String> = self
            .active
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for code in &due {
            self.expire(code);
        }
        due.len()
    }

    pub fn is_expired_code(&self, code: &str) -> bool {
        self.expired.contains(code)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn expired_len(&self) -> usize {
        self.expired.len()
    }
}
