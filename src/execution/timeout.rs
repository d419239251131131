//! Query Timeout Module
//!
//! Wall-clock deadline for one query execution.
//!
//! ## Design
//!
//! Two mechanisms share one cancellation flag:
//! - the row loop calls [`QueryTimeout::check`] between rows
//! - the async side holds a [`CancelHandle`] that also interrupts SQLite, so a
//!   statement stuck inside a single step (a large sort or cross join) stops
//!   as well

use super::ExecutionFailure;
use rusqlite::InterruptHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline controller for a single execution
#[derive(Clone)]
pub struct QueryTimeout {
    /// Cancellation flag (shared with the cancel handle)
    cancelled: Arc<AtomicBool>,

    /// When execution started
    start_time: Instant,

    /// Maximum allowed duration
    limit: Duration,
}

impl QueryTimeout {
    /// Start the clock
    pub fn start(limit: Duration) -> Self {
        QueryTimeout {
            cancelled: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
            limit,
        }
    }

    /// Ok while the query may continue.
    ///
    /// Trips the shared flag the first time the deadline is seen to have passed.
    pub fn check(&self) -> Result<(), ExecutionFailure> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(self.expired());
        }
        if self.start_time.elapsed() > self.limit {
            self.cancelled.store(true, Ordering::Relaxed);
            return Err(self.expired());
        }
        Ok(())
    }

    /// The failure reported once this deadline has passed or been cancelled
    pub fn expired(&self) -> ExecutionFailure {
        ExecutionFailure::Timeout {
            timeout: self.limit,
            elapsed: self.start_time.elapsed(),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Time left before the deadline (zero once passed)
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.start_time.elapsed())
    }

    /// Handle that cancels from another task and interrupts the connection
    pub fn cancel_handle(&self, interrupt: InterruptHandle) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.cancelled),
            interrupt,
        }
    }
}

/// Cancels an in-flight execution from outside the blocking worker
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    interrupt: InterruptHandle,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.interrupt.interrupt();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
