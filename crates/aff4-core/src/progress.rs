//! Progress reporting for long-running stream copies
//!
//! Long copies (image acquisition, map materialization) accept a progress
//! context. Cancellation rides on the same path: a shared flag checked at
//! every report turns the next call into `Error::Aborted`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};

/// Receives periodic offsets during a long-running copy.
///
/// `report` offsets are relative to the start of the current range
/// operation; `set_start` rebases them so cumulative throughput is
/// reported correctly across bevies.
pub trait Progress {
    /// Rebase subsequent reports onto an absolute start offset.
    fn set_start(&mut self, start: u64);

    /// Report the current relative offset. Returns `Error::Aborted` when
    /// cancellation has been requested.
    fn report(&mut self, readptr: u64) -> Result<()>;
}

/// A progress context that does nothing and never aborts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn set_start(&mut self, _start: u64) {}

    fn report(&mut self, _readptr: u64) -> Result<()> {
        Ok(())
    }
}

/// Progress context that logs throughput through `tracing` and honours a
/// shared cancel flag.
pub struct TracingProgress {
    /// Absolute start offset of the current range.
    pub start: u64,
    /// Expected total length, if known.
    pub length: u64,
    last_time: Instant,
    last_offset: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl TracingProgress {
    const REPORT_INTERVAL_MS: u128 = 250;

    pub fn new(length: u64) -> Self {
        Self {
            start: 0,
            length,
            last_time: Instant::now(),
            last_offset: 0,
            cancel: None,
        }
    }

    /// Attach a cancel flag. Setting the flag causes the next report to
    /// return `Error::Aborted`.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

impl Progress for TracingProgress {
    fn set_start(&mut self, start: u64) {
        self.start = start;
    }

    fn report(&mut self, readptr: u64) -> Result<()> {
        let absolute = readptr + self.start;
        let elapsed = self.last_time.elapsed();

        if elapsed.as_millis() > Self::REPORT_INTERVAL_MS {
            let rate_mib = (absolute.saturating_sub(self.last_offset)) as f64
                / elapsed.as_secs_f64()
                / (1024.0 * 1024.0);

            tracing::info!(
                "Reading {} MiB / {} MiB  {:.2} MiB/s",
                absolute / 1024 / 1024,
                self.length / 1024 / 1024,
                rate_mib
            );

            self.last_time = Instant::now();
            self.last_offset = absolute;
        }

        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                tracing::warn!("Copy aborted at offset {}", absolute);
                return Err(Error::Aborted);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_progress_never_aborts() {
        let mut progress = NoProgress;
        progress.set_start(1 << 40);
        for offset in [0u64, 1024, u64::MAX / 2] {
            assert!(progress.report(offset).is_ok());
        }
    }

    #[test]
    fn test_cancel_flag_aborts() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut progress = TracingProgress::new(1024).with_cancel_flag(flag.clone());

        assert!(progress.report(0).is_ok());

        flag.store(true, Ordering::Relaxed);
        assert!(matches!(progress.report(512), Err(Error::Aborted)));
    }

    #[test]
    fn test_set_start_rebases() {
        let mut progress = TracingProgress::new(0);
        progress.set_start(4096);
        assert_eq!(progress.start, 4096);
        assert!(progress.report(10).is_ok());
    }
}
