//! Sequential batch execution with per-record fault isolation.

use std::future::Future;

use tracing::{error, info};

use super::{ImportError, RecordOutcome};

/// Counters for one batch of records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
}

/// A finished batch: counters plus the outcome of every non-failed record,
/// so the caller can aggregate entity-level creation counts.
#[derive(Debug)]
pub struct BatchResult {
    pub report: BatchReport,
    pub outcomes: Vec<RecordOutcome>,
}

/// Run `handler` over `records` in input order, never in parallel.
///
/// A failing record has already had its in-flight unit of work rolled back
/// (transactions roll back on drop); it is counted and logged here, and the
/// batch continues. Only the surrounding setup (connecting to the store at
/// all) can abort a run, and that happens before any batch starts.
pub async fn run_batch<R, F, Fut>(entity: &'static str, records: Vec<R>, mut handler: F) -> BatchResult
where
    F: FnMut(R) -> Fut,
    Fut: Future<Output = Result<RecordOutcome, ImportError>>,
{
    let mut report = BatchReport {
        total: records.len(),
        ..BatchReport::default()
    };
    let mut outcomes = Vec::with_capacity(records.len());

    for record in records {
        match handler(record).await {
            Ok(outcome) => {
                match outcome {
                    RecordOutcome::Skipped(_) => report.skipped += 1,
                    _ => report.succeeded += 1,
                }
                outcomes.push(outcome);
            }
            Err(e) => {
                report.failed += 1;
                error!(entity, error = %e, "Record import failed, continuing with next record");
            }
        }
    }

    info!(
        entity,
        succeeded = report.succeeded,
        skipped = report.skipped,
        failed = report.failed,
        total = report.total,
        "Batch finished"
    );

    BatchResult { report, outcomes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::SkipReason;

    async fn ok_handler(n: i64) -> Result<RecordOutcome, ImportError> {
        match n {
            0 => Ok(RecordOutcome::Skipped(SkipReason::BadShape)),
            n if n < 0 => Err(ImportError::store(
                format!("record {n}"),
                sqlx::Error::RowNotFound,
            )),
            _ => Ok(RecordOutcome::Upserted(crate::import::UpsertOutcome::Inserted)),
        }
    }

    #[tokio::test]
    async fn counts_success_skip_and_failure() {
        let result = run_batch("test", vec![1, 0, -1, 2], ok_handler).await;
        assert_eq!(
            result.report,
            BatchReport {
                succeeded: 2,
                skipped: 1,
                failed: 1,
                total: 4
            }
        );
        // Failed records produce no outcome.
        assert_eq!(result.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn empty_batch_reports_zeroes() {
        let result = run_batch("test", Vec::<i64>::new(), ok_handler).await;
        assert_eq!(result.report, BatchReport::default());
        assert!(result.outcomes.is_empty());
    }

    #[tokio::test]
    async fn preserves_input_order() {
        let result = run_batch("test", vec![1, 0, 1], ok_handler).await;
        assert!(matches!(result.outcomes[0], RecordOutcome::Upserted(_)));
        assert!(matches!(result.outcomes[1], RecordOutcome::Skipped(_)));
        assert!(matches!(result.outcomes[2], RecordOutcome::Upserted(_)));
    }
}
