//! 按来源 IP 的限流：盒子创建、分片流量与错误次数三个独立窗口。

use dashmap::DashMap;
use std::net::IpAddr;
use tracing::warn;

pub const RATE_WINDOW_SECS: i64 = 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dimension {
    Box,
    File,
    Error,
}

impl Dimension {
    fn index(self) -> usize {
        match self {
            Dimension::Box => 0,
            Dimension::File => 1,
            Dimension::Error => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateWindow {
    pub count: u64,
    pub window_start: i64,
}

impl RateWindow {
    fn is_idle(&self, now: i64) -> bool {
        now - self.window_start > RATE_WINDOW_SECS
    }

    fn reset(&mut self) {
        self.count = 0;
        self.window_start = 0;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateRecord {
    windows: [RateWindow; 3],
}

#[cfg(test)]
impl RateRecord {
    pub fn window(&self, dim: Dimension) -> RateWindow {
        self.windows[dim.index()]
    }
}

/// A cooldown is active for the dimension; `retry_after` is in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimited {
    pub retry_after: u64,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    records: DashMap<IpAddr, RateRecord>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 冷却期内拒绝；否则清零该维度并放行。
    pub fn check(&self, ip: IpAddr, dim: Dimension, now: i64) -> Result<(), RateLimited> {
        let mut record = self.records.entry(ip).or_default();
        let window = &mut record.windows[dim.index()];
        let elapsed = now - window.window_start;
        if window.count > 0 && elapsed < RATE_WINDOW_SECS {
            let retry_after = (RATE_WINDOW_SECS - elapsed).max(0) as u64;
            return Err(RateLimited { retry_after });
        }
        window.reset();
        Ok(())
    }

    /// Adds `amount` to the dimension. Going over `limit` arms a cooldown for
    /// later `check` calls; the current call is never rejected here.
    pub fn update(&self, ip: IpAddr, dim: Dimension, amount: u64, limit: u64, now: i64) {
        let mut record = self.records.entry(ip).or_default();
        let window = &mut record.windows[dim.index()];
        window.count = window.count.saturating_add(amount);
        if window.count > limit {
            window.window_start = now;
            warn!(
                client_ip = %ip,
                dimension = ?dim,
                count = window.count,
                "rate limit exceeded"
            );
        }
    }

    /// 重置已过期的维度，删除三个维度均空闲的记录；返回删除数量。
    pub fn sweep(&self, now: i64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            if record.windows.iter().all(|window| window.is_idle(now)) {
                return false;
            }
            for window in record.windows.iter_mut() {
                if window.is_idle(now) {
                    window.reset();
                }
            }
            true
        });
        before.saturating_sub(self.records.len())
    }

    #[cfg(test)]
    pub fn record(&self, ip: IpAddr) -> Option<RateRecord> {
        self.records.get(&ip).map(|record| record.clone())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}
