//! Conflict-aware writes for the independently keyed entities.
//!
//! Stops and routes are "latest snapshot wins": an existing row with the
//! same natural key has every non-key attribute overwritten. The key
//! attributes themselves are never changed by a conflict.

use sqlx::SqlitePool;
use tracing::warn;

use crate::feed::{RouteRecord, StopRecord};

use super::resolver;
use super::{ImportError, RecordOutcome, SkipReason, UpsertOutcome};

/// Insert or fully refresh a stop, keyed by its external id.
pub async fn upsert_stop(pool: &SqlitePool, stop: &StopRecord) -> Result<UpsertOutcome, ImportError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| ImportError::store(format!("starting transaction for stop {}", stop.id), e))?;

    // The existence check only informs the reported outcome; the write
    // itself is conflict-safe either way.
    let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM stops WHERE id = ?")
        .bind(stop.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ImportError::store(format!("checking stop {}", stop.id), e))?;

    sqlx::query(
        r#"
        INSERT INTO stops (id, number, name, latitude, longitude)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            number = excluded.number,
            name = excluded.name,
            latitude = excluded.latitude,
            longitude = excluded.longitude
        "#,
    )
    .bind(stop.id)
    .bind(&stop.number)
    .bind(&stop.name)
    .bind(stop.latitude)
    .bind(stop.longitude)
    .execute(&mut *tx)
    .await
    .map_err(|e| ImportError::store(format!("upserting stop {} ({})", stop.id, stop.name), e))?;

    tx.commit()
        .await
        .map_err(|e| ImportError::store(format!("committing stop {}", stop.id), e))?;

    Ok(if existing.is_some() {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    })
}

/// Insert or refresh a route, keyed by (name, line).
///
/// The line is resolved (and created if needed) first; only the path is
/// replaced on conflict. Routes without any path are reported as skips.
pub async fn upsert_route(pool: &SqlitePool, route: &RouteRecord) -> Result<RecordOutcome, ImportError> {
    if route.path.is_empty() {
        warn!(route = %route.route, "Skipping route with empty path");
        return Ok(RecordOutcome::Skipped(SkipReason::EmptyPath));
    }

    // Route names are line codes in this feed ("G1", "G2", ...).
    let line = resolver::resolve_line(pool, &route.route).await?;

    let path_json = serde_json::to_string(&route.path)?;

    let mut tx = pool.begin().await.map_err(|e| {
        ImportError::store(format!("starting transaction for route {}", route.route), e)
    })?;

    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM routes WHERE name = ? AND line_id = ?")
            .bind(&route.route)
            .bind(line.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ImportError::store(format!("checking route {}", route.route), e))?;

    sqlx::query(
        r#"
        INSERT INTO routes (name, line_id, path)
        VALUES (?, ?, ?)
        ON CONFLICT(name, line_id) DO UPDATE SET
            path = excluded.path
        "#,
    )
    .bind(&route.route)
    .bind(line.id)
    .bind(&path_json)
    .execute(&mut *tx)
    .await
    .map_err(|e| ImportError::store(format!("upserting route {}", route.route), e))?;

    tx.commit()
        .await
        .map_err(|e| ImportError::store(format!("committing route {}", route.route), e))?;

    Ok(RecordOutcome::Upserted(if existing.is_some() {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    }))
}
