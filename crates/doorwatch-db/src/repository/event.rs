//! # Event Repository
//!
//! Append-only storage for the event log.
//!
//! ## Append Transaction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   SINGLE TRANSACTION                                    │
//! │                                                                         │
//! │  1. INSERT INTO events (event_type, description, occurred_at_ms)        │
//! │     → id assigned by AUTOINCREMENT (never reused)                       │
//! │                                                                         │
//! │  2. SELECT COUNT(*), per-type counts FROM events                        │
//! │     → statistics that include the row from step 1                       │
//! │                                                                         │
//! │  COMMIT ← both or neither                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use doorwatch_core::{Event, EventType, StatisticsSnapshot};

const STATISTICS_SQL: &str = r#"
    SELECT
        COUNT(*) AS total_events,
        COALESCE(SUM(CASE WHEN event_type = 'sensor_open' THEN 1 ELSE 0 END), 0) AS door_open_events,
        COALESCE(SUM(CASE WHEN event_type = 'sensor_close' THEN 1 ELSE 0 END), 0) AS door_close_events,
        COALESCE(SUM(CASE WHEN event_type = 'alarm_triggered' THEN 1 ELSE 0 END), 0) AS alarm_events
    FROM events
"#;

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
struct EventRecord {
    id: i64,
    event_type: String,
    description: String,
    occurred_at_ms: i64,
}

impl TryFrom<EventRecord> for Event {
    type Error = DbError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        let event_type = record
            .event_type
            .parse::<EventType>()
            .map_err(|_| DbError::corrupt("events.event_type", &record.event_type))?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(record.occurred_at_ms)
            .ok_or_else(|| {
                DbError::corrupt("events.occurred_at_ms", record.occurred_at_ms.to_string())
            })?;

        Ok(Event {
            id: record.id,
            event_type,
            description: record.description,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, sqlx::FromRow)]
struct StatisticsRecord {
    total_events: i64,
    door_open_events: i64,
    door_close_events: i64,
    alarm_events: i64,
}

impl From<StatisticsRecord> for StatisticsSnapshot {
    fn from(r: StatisticsRecord) -> Self {
        StatisticsSnapshot {
            total_events: r.total_events,
            door_open_events: r.door_open_events,
            door_close_events: r.door_close_events,
            alarm_events: r.alarm_events,
        }
    }
}

async fn fetch_statistics<'e, E>(executor: E) -> DbResult<StatisticsSnapshot>
where
    E: Executor<'e, Database = Sqlite>,
{
    let record = sqlx::query_as::<_, StatisticsRecord>(STATISTICS_SQL)
        .fetch_one(executor)
        .await?;
    Ok(record.into())
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the event log.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Creates a new EventRepository.
    pub fn new(pool: SqlitePool) -> Self {
        EventRepository { pool }
    }

    /// Persists one event and returns it with statistics that include it.
    pub async fn insert_with_statistics(
        &self,
        event_type: &EventType,
        description: &str,
        occurred_at: DateTime<Utc>,
    ) -> DbResult<(Event, StatisticsSnapshot)> {
        let occurred_at_ms = occurred_at.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            r#"
            INSERT INTO events (event_type, description, occurred_at_ms)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(event_type.as_str())
        .bind(description)
        .bind(occurred_at_ms)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let statistics = fetch_statistics(&mut *tx).await?;
        tx.commit().await?;

        debug!(id, event_type = %event_type, total = statistics.total_events, "Event persisted");

        let timestamp = DateTime::<Utc>::from_timestamp_millis(occurred_at_ms)
            .ok_or_else(|| DbError::corrupt("events.occurred_at_ms", occurred_at_ms.to_string()))?;
        let event = Event {
            id,
            event_type: event_type.clone(),
            description: description.to_string(),
            timestamp,
        };
        Ok((event, statistics))
    }

    /// Events with `id > after_id` and `occurred_at_ms >= min_occurred_ms`,
    /// ascending by ID, at most `limit`.
    pub async fn since(
        &self,
        after_id: i64,
        min_occurred_ms: Option<i64>,
        limit: u32,
    ) -> DbResult<Vec<Event>> {
        let records = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, event_type, description, occurred_at_ms
            FROM events
            WHERE id > ?1 AND occurred_at_ms >= ?2
            ORDER BY id ASC
            LIMIT ?3
            "#,
        )
        .bind(after_id)
        .bind(min_occurred_ms.unwrap_or(i64::MIN))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(Event::try_from).collect()
    }

    /// Counts over the full log.
    pub async fn statistics(&self) -> DbResult<StatisticsSnapshot> {
        fetch_statistics(&self.pool).await
    }

    /// The most recent event, if any.
    pub async fn latest(&self) -> DbResult<Option<Event>> {
        let record = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, event_type, description, occurred_at_ms
            FROM events
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        record.map(Event::try_from).transpose()
    }

    /// Highest assigned ID, 0 when the log is empty.
    pub async fn max_id(&self) -> DbResult<i64> {
        let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use chrono::{Duration, TimeZone, Utc};
    use doorwatch_core::EventType;

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let db = db().await;
        let repo = db.events();

        let (a, _) = repo
            .insert_with_statistics(&EventType::SensorOpen, "Door opened", Utc::now())
            .await
            .unwrap();
        let (b, _) = repo
            .insert_with_statistics(&EventType::SensorClose, "Door closed", Utc::now())
            .await
            .unwrap();

        assert!(b.id > a.id);
        assert_eq!(repo.max_id().await.unwrap(), b.id);
        assert_eq!(repo.latest().await.unwrap().unwrap(), b);
    }

    #[tokio::test]
    async fn test_statistics_include_new_event() {
        let db = db().await;
        let repo = db.events();
        assert_eq!(repo.statistics().await.unwrap().total_events, 0);

        repo.insert_with_statistics(&EventType::SensorOpen, "Door opened", Utc::now())
            .await
            .unwrap();
        let (_, stats) = repo
            .insert_with_statistics(&EventType::AlarmTriggered, "Alarm", Utc::now())
            .await
            .unwrap();

        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.door_open_events, 1);
        assert_eq!(stats.door_close_events, 0);
        assert_eq!(stats.alarm_events, 1);
        assert_eq!(repo.statistics().await.unwrap(), stats);
    }

    #[tokio::test]
    async fn test_since_is_ordered_and_limited() {
        let db = db().await;
        let repo = db.events();
        for i in 0..5 {
            repo.insert_with_statistics(
                &EventType::Other("note".into()),
                &format!("note {i}"),
                Utc::now(),
            )
            .await
            .unwrap();
        }

        let all = repo.since(0, None, 100).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let tail = repo.since(all[2].id, None, 100).await.unwrap();
        assert_eq!(tail.len(), 2);

        let capped = repo.since(0, None, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].id, all[0].id);

        assert!(repo.since(all[4].id, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_since_respects_age_floor() {
        let db = db().await;
        let repo = db.events();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        repo.insert_with_statistics(&EventType::SensorOpen, "old", base)
            .await
            .unwrap();
        let (recent, _) = repo
            .insert_with_statistics(&EventType::SensorClose, "new", base + Duration::minutes(10))
            .await
            .unwrap();

        let floor = (base + Duration::minutes(5)).timestamp_millis();
        let events = repo.since(0, Some(floor), 10).await.unwrap();
        assert_eq!(events, vec![recent]);
    }

    #[tokio::test]
    async fn test_timestamp_round_trips_to_millis() {
        let db = db().await;
        let repo = db.events();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::milliseconds(250);

        let (event, _) = repo
            .insert_with_statistics(&EventType::SensorOpen, "Door opened", at)
            .await
            .unwrap();
        let read = repo.since(0, None, 1).await.unwrap();

        assert_eq!(event.timestamp, at);
        assert_eq!(read[0].timestamp, at);
    }
}
