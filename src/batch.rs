//! Per-item outcome collection for wildcard and multi-target operations.
//!
//! Removing `Temp*` collections or every rule matching a pattern is a
//! sequence of independent writes. One item failing does not abort the
//! rest; the failure is recorded with the item it belongs to and the loop
//! moves on.

use tracing::warn;

use crate::error::AdminError;

/// One item that could not be processed.
#[derive(Debug)]
pub struct BatchFailure {
    /// The name or key of the item.
    pub item: String,
    /// Why it failed.
    pub error: AdminError,
}

/// Outcome of a batch: what went through and what did not.
#[derive(Debug)]
pub struct BatchReport<T> {
    /// Results of the items that succeeded, in processing order.
    pub succeeded: Vec<T>,
    /// Items that failed, in processing order.
    pub failed: Vec<BatchFailure>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        BatchReport {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    /// Records the outcome of one item.
    pub fn record(&mut self, item: impl Into<String>, outcome: Result<T, AdminError>) {
        match outcome {
            Ok(value) => self.succeeded.push(value),
            Err(error) => {
                let item = item.into();
                warn!(%item, %error, "batch item failed");
                self.failed.push(BatchFailure { item, error });
            }
        }
    }

    /// `true` when nothing failed.
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Total number of items processed.
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// `true` when no item was processed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_do_not_stop_recording() {
        let mut report: BatchReport<&str> = BatchReport::default();
        report.record("a", Ok("a"));
        report.record(
            "b",
            Err(AdminError::Validation("nope".into())),
        );
        report.record("c", Ok("c"));

        assert_eq!(report.succeeded, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].item, "b");
        assert_eq!(report.len(), 3);
        assert!(!report.is_complete_success());
    }

    #[test]
    fn empty_report() {
        let report: BatchReport<()> = BatchReport::default();
        assert!(report.is_empty());
        assert!(report.is_complete_success());
    }
}
