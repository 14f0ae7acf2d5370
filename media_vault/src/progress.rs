//! Media Vault - Progress and Cancellation
//!
//! Long vault-wide jobs publish `(processed, total, last_error)` snapshots
//! over a watch channel. Observers poll or await changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Snapshot of a running job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub last_error: Option<String>,
}

impl Progress {
    pub fn is_done(&self) -> bool {
        self.total > 0 && self.processed >= self.total
    }

    /// Fraction complete in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.processed as f64 / self.total as f64
    }
}

/// Producer side, owned by the job
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<Progress>>,
}

/// Observer side
#[derive(Debug, Clone)]
pub struct ProgressWatch {
    rx: watch::Receiver<Progress>,
}

impl ProgressReporter {
    /// Create a reporter and its first observer
    pub fn channel() -> (Self, ProgressWatch) {
        let (tx, rx) = watch::channel(Progress::default());
        (Self { tx: Arc::new(tx) }, ProgressWatch { rx })
    }

    /// Reporter nobody listens to
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn subscribe(&self) -> ProgressWatch {
        ProgressWatch {
            rx: self.tx.subscribe(),
        }
    }

    pub fn start(&self, total: usize) {
        self.tx.send_replace(Progress {
            processed: 0,
            total,
            last_error: None,
        });
    }

    pub fn advance(&self, processed: usize) {
        self.tx.send_modify(|p| p.processed = processed);
    }

    pub fn fail(&self, error: impl ToString) {
        let error = error.to_string();
        self.tx.send_modify(|p| p.last_error = Some(error));
    }
}

impl ProgressWatch {
    /// Latest snapshot
    pub fn snapshot(&self) -> Progress {
        self.rx.borrow().clone()
    }

    /// Wait for the next update. `None` once the job has dropped its reporter.
    pub async fn changed(&mut self) -> Option<Progress> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Cooperative cancellation request
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshots() {
        let (reporter, watch) = ProgressReporter::channel();
        assert_eq!(watch.snapshot(), Progress::default());

        reporter.start(4);
        reporter.advance(3);
        reporter.fail("disk full");

        let snap = watch.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.total, 4);
        assert_eq!(snap.last_error.as_deref(), Some("disk full"));
        assert!(!snap.is_done());
        assert!((snap.fraction() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_detached_reporter_does_not_fail() {
        let reporter = ProgressReporter::detached();
        reporter.start(1);
        reporter.advance(1);
    }

    #[tokio::test]
    async fn test_changed_ends_with_reporter() {
        let (reporter, mut watch) = ProgressReporter::channel();
        reporter.start(2);
        assert_eq!(watch.changed().await.map(|p| p.total), Some(2));

        drop(reporter);
        assert!(watch.changed().await.is_none());
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let seen_by_job = flag.clone();
        assert!(!seen_by_job.is_cancelled());
        flag.cancel();
        assert!(seen_by_job.is_cancelled());
    }
}
