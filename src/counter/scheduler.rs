// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Interval loop driving the scanners.
//!
//! ```text
//! start() ──► spawn ──► loop {
//!                         for scanner in registration order: scan()
//!                         select! { sleep(interval), stop signal }
//!                       }
//! stop()  ──► flag scanners ──► signal loop ──► await task exit
//! ```
//!
//! Once [`SyncScheduler::stop`] returns no scanner call is in flight, so the
//! host can close its cache and archive right after.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::scanner::{ScanOutcome, SyncScanner};
use crate::config::CounterCacheConfig;
use crate::metrics;
use crate::storage::traits::StorageError;

/// Owns the scanners and the background task running them.
pub struct SyncScheduler {
    scanners: Arc<Vec<SyncScanner>>,
    interval: Duration,
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    pub fn new(scanners: Vec<SyncScanner>, interval: Duration) -> Result<Self, StorageError> {
        if interval.is_zero() {
            return Err(StorageError::InvalidArgument("scan interval must be positive".into()));
        }
        if scanners.is_empty() {
            return Err(StorageError::InvalidArgument("at least one scanner is required".into()));
        }
        Ok(Self {
            scanners: Arc::new(scanners),
            interval,
            stop_tx: None,
            handle: None,
        })
    }

    /// Uses `scan_interval_ms` from the config.
    pub fn from_config(
        config: &CounterCacheConfig,
        scanners: Vec<SyncScanner>,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        Self::new(scanners, Duration::from_millis(config.scan_interval_ms))
    }

    pub fn scanners(&self) -> &[SyncScanner] {
        &self.scanners
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the background loop on the current Tokio runtime.
    ///
    /// The first pass starts immediately.
    pub fn start(&mut self) -> Result<(), StorageError> {
        if self.handle.is_some() {
            return Err(StorageError::InvalidArgument("scheduler already started".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StorageError::InvalidArgument(format!("no Tokio runtime: {}", e)))?;

        for scanner in self.scanners.iter() {
            scanner.reset_stop();
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let scanners = Arc::clone(&self.scanners);
        let interval = self.interval;
        self.handle = Some(runtime.spawn(run_loop(scanners, interval, stop_rx)));
        self.stop_tx = Some(stop_tx);

        info!(
            scanners = self.scanners.len(),
            interval_ms = self.interval.as_millis() as u64,
            "Sync scheduler started"
        );
        Ok(())
    }

    /// Stop scanning and wait for the background task to exit.
    ///
    /// An in-flight entry is finished first, so this returns "soon", not
    /// immediately. Safe to call when not running.
    pub async fn stop(&mut self) {
        for scanner in self.scanners.iter() {
            scanner.request_stop();
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Sync scheduler task failed");
            }
            info!("Sync scheduler stopped");
        }
    }

    /// One pass over every scanner on the caller's task.
    ///
    /// Clears stop requests left by an earlier [`stop`](Self::stop) unless
    /// the background loop is running.
    pub async fn run_once(&self) -> Vec<ScanOutcome> {
        if !self.is_running() {
            for scanner in self.scanners.iter() {
                scanner.reset_stop();
            }
        }
        run_pass(&self.scanners).await
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("Sync scheduler dropped while running, signalling stop");
            for scanner in self.scanners.iter() {
                scanner.request_stop();
            }
            if let Some(stop_tx) = self.stop_tx.take() {
                let _ = stop_tx.send(true);
            }
        }
    }
}

async fn run_pass(scanners: &[SyncScanner]) -> Vec<ScanOutcome> {
    let started = Instant::now();
    let mut outcomes = Vec::with_capacity(scanners.len());
    for scanner in scanners {
        let outcome = scanner.scan().await;
        if !outcome.is_ok() {
            warn!(
                scanner = %outcome.scanner,
                failed_slots = outcome.failures.len(),
                "Scanner finished with errors"
            );
            metrics::record_error("scheduler", "scan");
        }
        let stopped = outcome.stopped;
        outcomes.push(outcome);
        if stopped {
            break;
        }
    }
    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Scheduler pass done");
    outcomes
}

async fn run_loop(scanners: Arc<Vec<SyncScanner>>, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        run_pass(&scanners).await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop_rx.changed() => {
                // Sender dropped counts as a stop
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Sync scheduler loop exited");
}
