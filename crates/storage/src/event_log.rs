use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use shared::domain::{EventKind, EventTail, ServiceEvent};
use sqlx::{sqlite::SqliteRow, Row};

use crate::Storage;

impl Storage {
    /// Appends a start/stop intent stamped with the current wall-clock time.
    pub async fn record_service_event(
        &self,
        service: &str,
        host: &str,
        kind: EventKind,
    ) -> Result<ServiceEvent> {
        self.record_service_event_at(service, host, kind, Utc::now())
            .await
    }

    /// Same as [`Storage::record_service_event`] with an explicit timestamp.
    /// Stored with millisecond precision.
    pub async fn record_service_event_at(
        &self,
        service: &str,
        host: &str,
        kind: EventKind,
        at: DateTime<Utc>,
    ) -> Result<ServiceEvent> {
        let service = service.trim();
        let host = host.trim();
        if service.is_empty() {
            bail!("service event requires a service name");
        }
        if host.is_empty() {
            bail!("service event requires a host");
        }

        let event_time_ms = at.timestamp_millis();
        sqlx::query(
            "INSERT INTO service_events (service, host, kind, event_time_ms) VALUES (?, ?, ?, ?)",
        )
        .bind(service)
        .bind(host)
        .bind(kind.as_str())
        .bind(event_time_ms)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record {} event for {service}@{host}", kind.as_str()))?;

        Ok(ServiceEvent {
            service: service.to_string(),
            host: host.to_string(),
            kind,
            timestamp: millis_to_datetime(event_time_ms)?,
        })
    }

    pub async fn latest_service_event(
        &self,
        service: &str,
        host: &str,
    ) -> Result<Option<ServiceEvent>> {
        let row = sqlx::query(
            "SELECT service, host, kind, event_time_ms
             FROM service_events
             WHERE service = ? AND host = ?
             ORDER BY event_time_ms DESC, id DESC
             LIMIT 1",
        )
        .bind(service)
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    /// Latest event plus whether any start was ever recorded, read in one query.
    pub async fn service_event_tail(&self, service: &str, host: &str) -> Result<EventTail> {
        let row = sqlx::query(
            "SELECT service, host, kind, event_time_ms,
                    EXISTS(
                        SELECT 1 FROM service_events s
                        WHERE s.service = e.service AND s.host = e.host AND s.kind = 'start'
                    ) AS ever_started
             FROM service_events e
             WHERE service = ? AND host = ?
             ORDER BY event_time_ms DESC, id DESC
             LIMIT 1",
        )
        .bind(service)
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(EventTail::default());
        };
        Ok(EventTail {
            latest: Some(event_from_row(&row)?),
            ever_started: row.try_get::<bool, _>("ever_started")?,
        })
    }

    pub async fn service_event_history(
        &self,
        service: &str,
        host: &str,
        limit: u32,
    ) -> Result<Vec<ServiceEvent>> {
        let rows = sqlx::query(
            "SELECT service, host, kind, event_time_ms
             FROM service_events
             WHERE service = ? AND host = ?
             ORDER BY event_time_ms DESC, id DESC
             LIMIT ?",
        )
        .bind(service)
        .bind(host)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: &SqliteRow) -> Result<ServiceEvent> {
    Ok(ServiceEvent {
        service: row.try_get("service")?,
        host: row.try_get("host")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        timestamp: millis_to_datetime(row.try_get("event_time_ms")?)?,
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .with_context(|| format!("event timestamp {millis} is out of range"))
}
