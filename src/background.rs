// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A phased barrier counting in-flight background file closes and deletes
/// so shutdown can await quiescence.
#[derive(Clone, Default)]
pub struct JobsBarrier {
    inner: Arc<BarrierInner>,
}

#[derive(Default)]
struct BarrierInner {
    jobs: Mutex<u64>,
    idle: Notify,
}

/// Held for the duration of one background job; dropping it checks out.
pub struct JobGuard {
    inner: Arc<BarrierInner>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut jobs = self.inner.jobs.lock();
        *jobs -= 1;
        if *jobs == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl JobsBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide barrier, initialized at first use and awaited on
    /// shutdown.
    pub fn global() -> &'static JobsBarrier {
        static GLOBAL: OnceLock<JobsBarrier> = OnceLock::new();
        GLOBAL.get_or_init(JobsBarrier::new)
    }

    pub fn enter(&self) -> JobGuard {
        *self.inner.jobs.lock() += 1;
        JobGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn in_flight(&self) -> u64 {
        *self.inner.jobs.lock()
    }

    /// Wait until every job entered so far has finished.
    pub async fn quiesce(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if *self.inner.jobs.lock() == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn quiesce_waits_for_jobs() {
        let barrier = JobsBarrier::new();
        let guard = barrier.enter();
        assert_eq!(barrier.in_flight(), 1);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.quiesce().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("quiesce must complete once jobs drain")
            .unwrap();
    }

    #[tokio::test]
    async fn quiesce_returns_immediately_when_idle() {
        JobsBarrier::new().quiesce().await;
    }
}
