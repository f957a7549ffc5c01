//! Admission control for incoming connections.
//!
//! A counting semaphore sized at half the task cap gates acceptance; the
//! acceptor uses a non-blocking try-acquire and drops the socket when the
//! gate is full. A background monitor warns when the gate crosses 80% use.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::conntrack::ConnectionTable;
use crate::error::{Error, Result};

pub struct Admission {
    permits: Arc<Semaphore>,
    active_tasks: Arc<AtomicI64>,
    max_tasks: usize,
    capacity: usize,
}

/// Held for the lifetime of one connection task.
pub struct AdmissionPermit {
    active_tasks: Arc<AtomicI64>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.active_tasks.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Admission {
    pub fn new(max_tasks: usize) -> Self {
        let capacity = (max_tasks / 2).max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            active_tasks: Arc::new(AtomicI64::new(0)),
            max_tasks,
            capacity,
        }
    }

    /// Try to admit one connection. `AdmissionRejected` means the gate is
    /// full and the caller should close the socket immediately, no retry.
    pub fn try_admit(&self) -> Result<AdmissionPermit> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| Error::AdmissionRejected)?;
        self.active_tasks.fetch_add(1, Ordering::Relaxed);
        Ok(AdmissionPermit {
            active_tasks: Arc::clone(&self.active_tasks),
            _permit: permit,
        })
    }

    pub fn active_tasks(&self) -> i64 {
        self.active_tasks.load(Ordering::Relaxed)
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    /// Fraction of the admission gate currently in use.
    pub fn utilization(&self) -> f64 {
        self.active_tasks() as f64 / self.capacity as f64
    }

    /// Periodically sample task and connection gauges, warning at 80%
    /// utilization.
    pub async fn run_monitor(&self, table: Arc<ConnectionTable>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let tasks = self.active_tasks();
            debug!(
                tasks,
                connections = table.active_count(),
                "resource monitor"
            );
            if self.utilization() >= 0.8 {
                warn!(tasks, capacity = self.capacity, "high connection task usage");
            }
        }
    }
}
