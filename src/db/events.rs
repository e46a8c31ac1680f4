//! Control-event log operations.
//!
//! Events are append-only and never mutated or deleted during a run. The
//! `(run_id, sequence_id)` unique constraint is the store-side guard for the
//! strictly-monotonic sequence invariant; an insert that violates it is a
//! coordinator bug surfacing as an error, never silent reordering.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::Database;
use crate::types::{ControlEvent, ControlPayload};

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    run_id: Uuid,
    sequence_id: i64,
    event_data: Value,
    issued_at: DateTime<Utc>,
}

impl EventRow {
    fn into_event(self) -> Result<ControlEvent> {
        Ok(ControlEvent {
            event_id: self.event_id,
            run_id: self.run_id,
            sequence_id: self
                .sequence_id
                .try_into()
                .map_err(|_| anyhow!("negative sequence_id {}", self.sequence_id))?,
            payload: serde_json::from_value::<ControlPayload>(self.event_data)?,
            issued_at: self.issued_at,
        })
    }
}

impl Database {
    pub async fn append_event(&self, event: &ControlEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO control_events (event_id, run_id, sequence_id, event_type, event_data, issued_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.event_id)
        .bind(event.run_id)
        .bind(event.sequence_id as i64)
        .bind(event.payload.event_type().as_str())
        .bind(serde_json::to_value(&event.payload)?)
        .bind(event.issued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Events with `sequence_id > after`, in sequence order.
    pub async fn events_since(&self, run_id: Uuid, after: u64) -> Result<Vec<ControlEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT event_id, run_id, sequence_id, event_data, issued_at
             FROM control_events
             WHERE run_id = $1 AND sequence_id > $2
             ORDER BY sequence_id",
        )
        .bind(run_id)
        .bind(after as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_event).collect()
    }
}
