//! Get-or-create resolution of dimension entities (lines, directions).
//!
//! Both resolvers use the same optimistic pattern: a conditional insert that
//! no-ops on natural-key conflict and returns the fresh surrogate id, with a
//! lookup on the conflict path. This stays correct if two imports ever run
//! concurrently against the same store: the unique constraint arbitrates,
//! and the loser of the race finds the winner's row in the lookup. Each call
//! commits its own transaction, so later cascade steps can rely on the id
//! being durable even when the record fails further down.

use sqlx::SqlitePool;

use super::ImportError;

/// A resolved surrogate id and whether this call created the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub id: i64,
    pub created: bool,
}

/// Resolve a line by its code, creating it on first sight.
/// Line codes are immutable once created.
pub async fn resolve_line(pool: &SqlitePool, line_code: &str) -> Result<Resolved, ImportError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| ImportError::store(format!("starting transaction for line {line_code}"), e))?;

    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO lines (line_code)
        VALUES (?)
        ON CONFLICT(line_code) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(line_code)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| ImportError::store(format!("inserting line {line_code}"), e))?;

    let resolved = match inserted {
        Some((id,)) => Resolved { id, created: true },
        None => {
            // The unique constraint guarantees the row exists after a no-op.
            let (id,): (i64,) = sqlx::query_as("SELECT id FROM lines WHERE line_code = ?")
                .bind(line_code)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| ImportError::store(format!("looking up line {line_code}"), e))?;
            Resolved { id, created: false }
        }
    };

    tx.commit()
        .await
        .map_err(|e| ImportError::store(format!("committing line {line_code}"), e))?;

    Ok(resolved)
}

/// Resolve a direction by (line, name), creating it on first sight.
/// A line may accrue any number of direction names across runs, each
/// created at most once.
pub async fn resolve_direction(
    pool: &SqlitePool,
    line_id: i64,
    name: &str,
) -> Result<Resolved, ImportError> {
    let mut tx = pool.begin().await.map_err(|e| {
        ImportError::store(format!("starting transaction for direction {name}"), e)
    })?;

    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO directions (line_id, name)
        VALUES (?, ?)
        ON CONFLICT(line_id, name) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(line_id)
    .bind(name)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| ImportError::store(format!("inserting direction {name} for line {line_id}"), e))?;

    let resolved = match inserted {
        Some((id,)) => Resolved { id, created: true },
        None => {
            let (id,): (i64,) =
                sqlx::query_as("SELECT id FROM directions WHERE line_id = ? AND name = ?")
                    .bind(line_id)
                    .bind(name)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| {
                        ImportError::store(
                            format!("looking up direction {name} for line {line_id}"),
                            e,
                        )
                    })?;
            Resolved { id, created: false }
        }
    };

    tx.commit()
        .await
        .map_err(|e| ImportError::store(format!("committing direction {name}"), e))?;

    Ok(resolved)
}
