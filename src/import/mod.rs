//! The import pipeline: feed snapshots in, reconciled relational state out.
//!
//! Three batches run per cycle, in input order, each record inside its own
//! fault boundary: stops (wholesale upsert), schedule records (the
//! line/direction/run/times cascade), and route geometries (path upsert).
//! Durability is per statement group, never per batch — a crash mid-run
//! loses nothing already committed, and a re-run converges on the same
//! state because every write is idempotent under its natural key.

pub mod batch;
pub mod cascade;
pub mod resolver;
pub mod upsert;

use chrono::NaiveDate;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::FeedPaths;
use crate::feed::{self, RouteRecord, StopRecord};

use batch::{run_batch, BatchReport};

/// Why a record was skipped rather than imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The record did not decode into its expected shape.
    BadShape,
    MissingStopId,
    MissingLineCode,
    MissingDirectionName,
    EmptyPath,
}

/// Whether an upsert found an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// What one schedule record created (false = reused via lookup).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeOutcome {
    pub line_created: bool,
    pub direction_created: bool,
    pub run_created: bool,
    pub times_attached: bool,
}

/// The result of importing one record, when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Upserted(UpsertOutcome),
    Cascaded(CascadeOutcome),
    Skipped(SkipReason),
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Store error {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImportError {
    pub fn store(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }
}

/// Aggregated counts for one full import cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub stops: BatchReport,
    pub stops_inserted: usize,
    pub stops_updated: usize,

    pub schedule: BatchReport,
    pub lines_created: usize,
    pub directions_created: usize,
    pub runs_created: usize,
    pub times_attached: usize,

    pub routes: BatchReport,
    pub routes_inserted: usize,
    pub routes_updated: usize,
}

impl ImportSummary {
    /// Log the end-of-run summary: the externally observable contract of a
    /// run, alongside the store state itself.
    pub fn log(&self) {
        info!(
            inserted = self.stops_inserted,
            updated = self.stops_updated,
            skipped = self.stops.skipped,
            failed = self.stops.failed,
            total = self.stops.total,
            "Stops imported"
        );
        info!(
            lines_created = self.lines_created,
            directions_created = self.directions_created,
            runs_created = self.runs_created,
            times_attached = self.times_attached,
            skipped = self.schedule.skipped,
            failed = self.schedule.failed,
            total = self.schedule.total,
            "Schedule imported"
        );
        info!(
            inserted = self.routes_inserted,
            updated = self.routes_updated,
            skipped = self.routes.skipped,
            failed = self.routes.failed,
            total = self.routes.total,
            "Routes imported"
        );
    }
}

/// Runs one import cycle over the three configured feed snapshots.
pub struct Importer {
    pool: SqlitePool,
    feeds: FeedPaths,
}

impl Importer {
    pub fn new(pool: SqlitePool, feeds: FeedPaths) -> Self {
        Self { pool, feeds }
    }

    /// Run the full cycle: stops, then schedule, then routes.
    ///
    /// `service_date` is the date assigned to single-day schedule feeds
    /// (the snapshot shape carries its own dates).
    pub async fn run(&self, service_date: NaiveDate) -> ImportSummary {
        let mut summary = ImportSummary::default();

        info!(path = %self.feeds.stops.display(), "Importing stops");
        let stop_items = feed::load_raw_array(&self.feeds.stops);
        let stops = run_batch("stops", stop_items, |value| {
            import_stop_value(&self.pool, value)
        })
        .await;
        summary.stops = stops.report;
        (summary.stops_inserted, summary.stops_updated) = tally_upserts(&stops.outcomes);

        info!(path = %self.feeds.schedule.display(), "Importing schedule");
        let schedule_items = feed::load_raw_array(&self.feeds.schedule);
        let entries = feed::decode_schedule_feed(schedule_items)
            .map(|f| f.normalize(service_date))
            .unwrap_or_default();
        let schedule = run_batch("schedule", entries, |entry| {
            cascade::import_schedule_entry(&self.pool, entry)
        })
        .await;
        summary.schedule = schedule.report;
        for outcome in &schedule.outcomes {
            if let RecordOutcome::Cascaded(c) = outcome {
                summary.lines_created += c.line_created as usize;
                summary.directions_created += c.direction_created as usize;
                summary.runs_created += c.run_created as usize;
                summary.times_attached += c.times_attached as usize;
            }
        }

        info!(path = %self.feeds.routes.display(), "Importing routes");
        let route_items = feed::load_raw_array(&self.feeds.routes);
        let routes = run_batch("routes", route_items, |value| {
            import_route_value(&self.pool, value)
        })
        .await;
        summary.routes = routes.report;
        (summary.routes_inserted, summary.routes_updated) = tally_upserts(&routes.outcomes);

        summary
    }
}

async fn import_stop_value(
    pool: &SqlitePool,
    value: serde_json::Value,
) -> Result<RecordOutcome, ImportError> {
    match serde_json::from_value::<StopRecord>(value) {
        Ok(stop) => upsert::upsert_stop(pool, &stop)
            .await
            .map(RecordOutcome::Upserted),
        Err(e) => {
            warn!(error = %e, "Skipping malformed stop record");
            Ok(RecordOutcome::Skipped(SkipReason::BadShape))
        }
    }
}

async fn import_route_value(
    pool: &SqlitePool,
    value: serde_json::Value,
) -> Result<RecordOutcome, ImportError> {
    match serde_json::from_value::<RouteRecord>(value) {
        Ok(route) => upsert::upsert_route(pool, &route).await,
        Err(e) => {
            warn!(error = %e, "Skipping malformed route record");
            Ok(RecordOutcome::Skipped(SkipReason::BadShape))
        }
    }
}

fn tally_upserts(outcomes: &[RecordOutcome]) -> (usize, usize) {
    let mut inserted = 0;
    let mut updated = 0;
    for outcome in outcomes {
        match outcome {
            RecordOutcome::Upserted(UpsertOutcome::Inserted) => inserted += 1,
            RecordOutcome::Upserted(UpsertOutcome::Updated) => updated += 1,
            _ => {}
        }
    }
    (inserted, updated)
}
