//! # Settings Repository
//!
//! Key/value settings. The only key the system reads is `timer_duration`,
//! the escalation duration in seconds, looked up once per open episode.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{DbError, DbResult};

/// Key of the escalation duration setting.
pub const TIMER_DURATION_KEY: &str = "timer_duration";

/// Repository for key/value settings.
#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    /// Creates a new SettingsRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SettingsRepository { pool }
    }

    /// Raw value of a setting.
    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Inserts or replaces a setting.
    pub async fn set(&self, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Escalation duration in seconds, if stored.
    pub async fn escalation_duration(&self) -> DbResult<Option<f64>> {
        match self.get(TIMER_DURATION_KEY).await? {
            None => Ok(None),
            Some(raw) => {
                let secs = raw
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or_else(|| DbError::corrupt(TIMER_DURATION_KEY, &raw))?;
                Ok(Some(secs))
            }
        }
    }

    /// Stores the escalation duration in seconds.
    pub async fn set_escalation_duration(&self, secs: f64) -> DbResult<()> {
        self.set(TIMER_DURATION_KEY, &secs.to_string()).await?;
        info!(secs, "Escalation duration updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_seeded_default_duration() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert_eq!(db.settings().escalation_duration().await.unwrap(), Some(30.0));
    }

    #[tokio::test]
    async fn test_update_duration() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let settings = db.settings();

        settings.set_escalation_duration(12.5).await.unwrap();
        assert_eq!(settings.escalation_duration().await.unwrap(), Some(12.5));
    }

    #[tokio::test]
    async fn test_corrupt_duration_is_reported() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let settings = db.settings();

        settings.set(TIMER_DURATION_KEY, "soon").await.unwrap();
        assert!(matches!(
            settings.escalation_duration().await,
            Err(DbError::Corrupt { .. })
        ));
    }
}
