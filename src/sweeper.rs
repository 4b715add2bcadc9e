//! 过期清扫后台任务：归档过期盒子、淘汰失效卡片、清理限流记录与空闲锁。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::Registry;

/// Counters from one sweep cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub archived: usize,
    pub failed: usize,
    pub cards_expired: usize,
    pub rates_dropped: usize,
    pub locks_pruned: usize,
}

impl SweepReport {
    fn is_quiet(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct Sweeper {
    registry: Arc<Registry>,
    interval: Duration,
    started: AtomicBool,
    cycle: Mutex<()>,
}

impl Sweeper {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            started: AtomicBool::new(false),
            cycle: Mutex::new(()),
        }
    }

    /// 执行一次清扫；并发调用会排队，不会重叠执行。
    pub async fn run_once(&self) -> SweepReport {
        let _cycle = self.cycle.lock().await;
        let registry = &self.registry;
        let now = registry.now();
        let mut report = SweepReport {
            expired: registry.boxes().expire_due(now),
            ..SweepReport::default()
        };

        for code in registry.boxes().expired_codes() {
            let _lock = registry.lock_box(&code).await;
            match registry.storage().archive(&code).await {
                Ok(()) => {
                    registry.boxes().release_expired(&code);
                    report.archived += 1;
                }
                Err(err) => {
                    warn!(code, error = %err, "archive failed, retrying next cycle");
                    report.failed += 1;
                }
            }
        }

        report.cards_expired = registry.cards().expire_due(now);
        report.rates_dropped = registry.rates().sweep(now);
        report.locks_pruned = registry.locks().prune();

        if report.is_quiet() {
            debug!("sweep found nothing to do");
        } else {
            info!(
                expired = report.expired,
                archived = report.archived,
                failed = report.failed,
                cards_expired = report.cards_expired,
                rates_dropped = report.rates_dropped,
                locks_pruned = report.locks_pruned,
                "sweep finished"
            );
        }
        report
    }

    /// Starts the periodic loop. Returns `None` if it is already running.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("sweeper already started");
            return None;
        }
        let sweeper = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = sweeper.interval.as_secs(), "sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        sweeper.run_once().await;
                    }
                }
            }
            info!("sweeper stopped");
        }))
    }
}
