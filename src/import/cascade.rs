//! The per-record schedule cascade: Line → Direction → DepartureRun →
//! ArrivalTimes.
//!
//! Each step commits before the next begins. That is a deliberate trade-off:
//! a record interrupted mid-cascade leaves valid, reusable parent rows
//! behind, and a re-run completes it because every step is idempotent under
//! its natural key. There is no enclosing transaction to roll back, and none
//! is wanted.

use chrono::NaiveDate;
use sqlx::SqlitePool;
use tracing::warn;

use crate::feed::ScheduleEntry;

use super::resolver::{self, Resolved};
use super::{CascadeOutcome, ImportError, RecordOutcome, SkipReason};

/// Import one normalized schedule record.
///
/// Records missing any of the three natural-key parts are skipped (and
/// counted) before the store is touched; a store failure in any step aborts
/// only this record.
pub async fn import_schedule_entry(
    pool: &SqlitePool,
    entry: ScheduleEntry,
) -> Result<RecordOutcome, ImportError> {
    let Some(stop_id) = entry.stop_id else {
        warn!(date = %entry.date, "Skipping schedule record without stop id");
        return Ok(RecordOutcome::Skipped(SkipReason::MissingStopId));
    };
    let Some(line_code) = entry.line.as_deref().filter(|s| !s.is_empty()) else {
        warn!(stop_id, date = %entry.date, "Skipping schedule record without line code");
        return Ok(RecordOutcome::Skipped(SkipReason::MissingLineCode));
    };
    let Some(direction_name) = entry.direction.as_deref().filter(|s| !s.is_empty()) else {
        warn!(stop_id, line = line_code, date = %entry.date, "Skipping schedule record without direction name");
        return Ok(RecordOutcome::Skipped(SkipReason::MissingDirectionName));
    };

    let line = resolver::resolve_line(pool, line_code).await?;
    let direction = resolver::resolve_direction(pool, line.id, direction_name).await?;
    let run = create_or_get_run(pool, stop_id, direction.id, entry.date).await?;
    let times_attached = attach_times(pool, run.id, &entry.times).await?;

    Ok(RecordOutcome::Cascaded(CascadeOutcome {
        line_created: line.created,
        direction_created: direction.created,
        run_created: run.created,
        times_attached,
    }))
}

/// Create the departure run for (stop, direction, date), or find the one a
/// previous import already created.
async fn create_or_get_run(
    pool: &SqlitePool,
    stop_id: i64,
    direction_id: i64,
    date: NaiveDate,
) -> Result<Resolved, ImportError> {
    let context = || format!("departure run for stop {stop_id}, direction {direction_id} on {date}");

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| ImportError::store(format!("starting transaction for {}", context()), e))?;

    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO departures (stop_id, direction_id, date)
        VALUES (?, ?, ?)
        ON CONFLICT(stop_id, direction_id, date) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(stop_id)
    .bind(direction_id)
    .bind(date)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| ImportError::store(format!("inserting {}", context()), e))?;

    let resolved = match inserted {
        Some((id,)) => Resolved { id, created: true },
        None => {
            let (id,): (i64,) = sqlx::query_as(
                "SELECT id FROM departures WHERE stop_id = ? AND direction_id = ? AND date = ?",
            )
            .bind(stop_id)
            .bind(direction_id)
            .bind(date)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ImportError::store(format!("looking up {}", context()), e))?;
            Resolved { id, created: false }
        }
    };

    tx.commit()
        .await
        .map_err(|e| ImportError::store(format!("committing {}", context()), e))?;

    Ok(resolved)
}

/// Attach the time-of-day set to a run. A run that already has times keeps
/// them: the insert no-ops and this returns false.
async fn attach_times(
    pool: &SqlitePool,
    run_id: i64,
    times: &[String],
) -> Result<bool, ImportError> {
    let times_json = serde_json::to_string(times)?;

    let mut tx = pool.begin().await.map_err(|e| {
        ImportError::store(format!("starting transaction for arrivals of run {run_id}"), e)
    })?;

    let result = sqlx::query(
        r#"
        INSERT INTO arrivals (departures_id, departure_times)
        VALUES (?, ?)
        ON CONFLICT(departures_id) DO NOTHING
        "#,
    )
    .bind(run_id)
    .bind(&times_json)
    .execute(&mut *tx)
    .await
    .map_err(|e| ImportError::store(format!("attaching arrival times to run {run_id}"), e))?;

    tx.commit()
        .await
        .map_err(|e| ImportError::store(format!("committing arrivals of run {run_id}"), e))?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::testutil::test_pool;

    fn entry(stop_id: Option<i64>, line: Option<&str>, direction: Option<&str>) -> ScheduleEntry {
        ScheduleEntry {
            date: NaiveDate::from_ymd_opt(2025, 5, 12).unwrap(),
            stop_id,
            line: line.map(str::to_string),
            direction: direction.map(str::to_string),
            times: vec!["06:10".to_string(), "06:40".to_string()],
        }
    }

    async fn table_counts(pool: &SqlitePool) -> (i64, i64, i64, i64) {
        let (lines,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM lines")
            .fetch_one(pool)
            .await
            .unwrap();
        let (directions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM directions")
            .fetch_one(pool)
            .await
            .unwrap();
        let (runs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM departures")
            .fetch_one(pool)
            .await
            .unwrap();
        let (arrivals,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM arrivals")
            .fetch_one(pool)
            .await
            .unwrap();
        (lines, directions, runs, arrivals)
    }

    #[tokio::test]
    async fn full_cascade_creates_all_four_levels() {
        let pool = test_pool().await;
        let outcome = import_schedule_entry(&pool, entry(Some(10), Some("G1"), Some("Center")))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RecordOutcome::Cascaded(CascadeOutcome {
                line_created: true,
                direction_created: true,
                run_created: true,
                times_attached: true,
            })
        );
        assert_eq!(table_counts(&pool).await, (1, 1, 1, 1));
    }

    #[tokio::test]
    async fn second_import_reuses_everything() {
        let pool = test_pool().await;
        let record = entry(Some(10), Some("G1"), Some("Center"));

        import_schedule_entry(&pool, record.clone()).await.unwrap();
        let second = import_schedule_entry(&pool, record).await.unwrap();

        assert_eq!(
            second,
            RecordOutcome::Cascaded(CascadeOutcome {
                line_created: false,
                direction_created: false,
                run_created: false,
                times_attached: false,
            })
        );
        assert_eq!(table_counts(&pool).await, (1, 1, 1, 1));
    }

    #[tokio::test]
    async fn times_are_never_overwritten() {
        let pool = test_pool().await;
        let mut record = entry(Some(10), Some("G1"), Some("Center"));
        import_schedule_entry(&pool, record.clone()).await.unwrap();

        record.times = vec!["23:59".to_string()];
        import_schedule_entry(&pool, record).await.unwrap();

        let (times_json,): (String,) = sqlx::query_as("SELECT departure_times FROM arrivals")
            .fetch_one(&pool)
            .await
            .unwrap();
        let times: Vec<String> = serde_json::from_str(&times_json).unwrap();
        assert_eq!(times, vec!["06:10", "06:40"]);
    }

    #[tokio::test]
    async fn missing_fields_skip_before_store_work() {
        let pool = test_pool().await;

        let outcome = import_schedule_entry(&pool, entry(None, Some("G1"), Some("Center")))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Skipped(SkipReason::MissingStopId));

        let outcome = import_schedule_entry(&pool, entry(Some(10), None, Some("Center")))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Skipped(SkipReason::MissingLineCode));

        let outcome = import_schedule_entry(&pool, entry(Some(10), Some("G1"), None))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Skipped(SkipReason::MissingDirectionName));

        // Nothing was created for any of the malformed records.
        assert_eq!(table_counts(&pool).await, (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn empty_line_code_counts_as_missing() {
        let pool = test_pool().await;
        let outcome = import_schedule_entry(&pool, entry(Some(10), Some(""), Some("Center")))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Skipped(SkipReason::MissingLineCode));
    }

    #[tokio::test]
    async fn same_direction_new_date_creates_new_run_only() {
        let pool = test_pool().await;
        let mut record = entry(Some(10), Some("G1"), Some("Center"));
        import_schedule_entry(&pool, record.clone()).await.unwrap();

        record.date = NaiveDate::from_ymd_opt(2025, 5, 13).unwrap();
        let outcome = import_schedule_entry(&pool, record).await.unwrap();

        assert_eq!(
            outcome,
            RecordOutcome::Cascaded(CascadeOutcome {
                line_created: false,
                direction_created: false,
                run_created: true,
                times_attached: true,
            })
        );
        assert_eq!(table_counts(&pool).await, (1, 1, 2, 2));
    }
}
