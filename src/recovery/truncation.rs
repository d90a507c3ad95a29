//! Log truncation policy.
//!
//! The log can be cut back to the oldest LSN anything still depends on:
//! the recLSN of the oldest dirty page, the recLSN of the oldest active
//! transaction, and the durable end of the log. When dirty pages hold the
//! point back and the log has grown too large, they are written back first.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::transactions::ActiveTransactions;
use crate::storage::buffer::BufferManager;
use crate::storage::error::StorageResult;
use crate::storage::wal::{LogManager, Lsn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationConfig {
    /// Time between background truncation attempts.
    pub interval: Duration,
    /// Log size past which dirty pages are written back to let truncation
    /// make progress.
    pub target_log_size: u64,
    /// Smallest truncation worth doing.
    pub min_incremental: u64,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        TruncationConfig {
            interval: Duration::from_secs(1),
            target_log_size: 64 * 1024 * 1024,
            min_incremental: 4 * 1024 * 1024,
        }
    }
}

pub struct Truncator {
    config: TruncationConfig,
    log: Arc<LogManager>,
    pool: Arc<BufferManager>,
    transactions: Arc<ActiveTransactions>,
    stop: Mutex<bool>,
    wake: Condvar,
}

impl Truncator {
    pub fn new(
        config: TruncationConfig,
        log: Arc<LogManager>,
        pool: Arc<BufferManager>,
        transactions: Arc<ActiveTransactions>,
    ) -> Self {
        Self {
            config,
            log,
            pool,
            transactions,
            stop: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub fn config(&self) -> &TruncationConfig {
        &self.config
    }

    /// Oldest LSN that must stay in the log right now.
    fn rec_lsn(&self) -> Lsn {
        let durable = self.log.durable_lsn();
        [
            self.pool.dirty_pages().min_rec_lsn(),
            self.transactions.min_rec_lsn(),
        ]
        .into_iter()
        .flatten()
        .fold(durable, Lsn::min)
    }

    /// Truncate the log if enough of it has become unnecessary. With `force`,
    /// truncate as far as possible regardless of the size thresholds,
    /// writing back dirty pages if they are in the way. Returns whether the
    /// log was truncated.
    pub fn truncate_now(&self, force: bool) -> StorageResult<bool> {
        let min_incremental = self.config.min_incremental;
        let log_trunc = self.log.truncation_point();
        let xact_rec = self
            .transactions
            .min_rec_lsn()
            .unwrap_or(Lsn::MAX)
            .min(self.log.durable_lsn());
        if !force && xact_rec.0.saturating_sub(log_trunc.0) <= min_incremental {
            return Ok(false);
        }

        let mut rec_lsn = self.rec_lsn();
        if !force && rec_lsn.0.saturating_sub(log_trunc.0) <= min_incremental {
            // Dirty pages hold the log back. Only write them out once the
            // log has grown well past its target size.
            let flushed = self.log.durable_lsn();
            if flushed.0.saturating_sub(log_trunc.0) <= 2 * self.config.target_log_size {
                return Ok(false);
            }
            self.pool.flush_until(xact_rec)?;
            rec_lsn = self.rec_lsn();
            if rec_lsn.0.saturating_sub(log_trunc.0) <= min_incremental {
                return Ok(false);
            }
        } else if force {
            self.pool.flush_until(xact_rec)?;
            rec_lsn = self.rec_lsn();
        }

        if rec_lsn <= log_trunc {
            return Ok(false);
        }
        // Written-back pages must be durable before the log that could
        // redo them goes away.
        self.pool.force_pages()?;
        self.log.truncate(rec_lsn)?;
        info!(
            "Truncated log to {} (was {}, now starts at {})",
            rec_lsn,
            log_trunc,
            self.log.truncation_point()
        );
        Ok(true)
    }

    /// Run `truncate_now(false)` every `interval` until `stop` is called.
    pub fn spawn_worker(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let truncator = Arc::clone(self);
        thread::Builder::new()
            .name("log-truncation".to_string())
            .spawn(move || truncator.run())
    }

    fn run(&self) {
        debug!("Truncation worker started");
        let mut stop = self.stop.lock();
        while !*stop {
            self.wake.wait_for(&mut stop, self.config.interval);
            if *stop {
                break;
            }
            let result = parking_lot::MutexGuard::unlocked(&mut stop, || self.truncate_now(false));
            if let Err(e) = result {
                error!("Background truncation failed: {}", e);
            }
        }
        debug!("Truncation worker stopped");
    }

    pub fn stop(&self) {
        *self.stop.lock() = true;
        self.wake.notify_all();
    }
}
