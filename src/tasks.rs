//! Long-running operations: single-flight guard, progress reporting, and the
//! backend a bulk action is committed through.
//!
//! A bulk action runs in three steps: the caller snapshots the selection,
//! awaits [`BulkBackend::commit`], then applies the mutation to whatever
//! the state looks like once the commit returns. Only the id set comes from
//! the snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::bulk::BulkOperation;
use crate::config::BulkConfig;
use crate::error::CrmError;
use crate::types::RecordKind;

// =============================================================================
// Single-flight guard
// =============================================================================

/// Busy flag allowing one operation of a kind at a time.
#[derive(Debug)]
pub struct SingleFlight {
    name: &'static str,
    busy: AtomicBool,
}

impl SingleFlight {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: AtomicBool::new(false),
        }
    }

    /// Claim the flag. Fails with [`CrmError::Busy`] while another holder
    /// is alive; the flag is released when the guard drops.
    pub fn try_start(&self) -> Result<FlightGuard<'_>, CrmError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("{} already in flight, rejecting", self.name);
            return Err(CrmError::Busy);
        }
        Ok(FlightGuard { flight: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
    }
}

// =============================================================================
// Progress
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub operation: String,
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    /// Completed share in 0-1. An empty job counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

pub type ProgressSender = mpsc::UnboundedSender<Progress>;

/// Send without caring whether anyone is still listening.
pub(crate) fn report(progress: Option<&ProgressSender>, update: Progress) {
    if let Some(tx) = progress {
        let _ = tx.send(update);
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Where a bulk action is committed before the local state changes.
///
/// An error means nothing was committed; the caller leaves its state and
/// selection as they were.
#[async_trait]
pub trait BulkBackend: Send + Sync {
    async fn commit(
        &self,
        kind: RecordKind,
        op: &BulkOperation,
        ids: &[String],
        progress: Option<&ProgressSender>,
    ) -> Result<(), CrmError>;
}

/// In-process backend: walks the ids in chunks with an optional delay per
/// chunk. Always succeeds.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    chunk_size: usize,
    step_delay: Duration,
}

impl LocalBackend {
    pub fn new(config: &BulkConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            step_delay: Duration::from_millis(config.step_delay_ms),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(&BulkConfig::default())
    }
}

#[async_trait]
impl BulkBackend for LocalBackend {
    async fn commit(
        &self,
        kind: RecordKind,
        op: &BulkOperation,
        ids: &[String],
        progress: Option<&ProgressSender>,
    ) -> Result<(), CrmError> {
        let operation = format!("{} {}", op.label(), kind.collection());
        let total = ids.len();
        report(
            progress,
            Progress {
                operation: operation.clone(),
                completed: 0,
                total,
            },
        );
        let mut completed = 0;
        for chunk in ids.chunks(self.chunk_size) {
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
            completed += chunk.len();
            report(
                progress,
                Progress {
                    operation: operation.clone(),
                    completed,
                    total,
                },
            );
        }
        Ok(())
    }
}
