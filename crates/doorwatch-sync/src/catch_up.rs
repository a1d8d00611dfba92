//! # Catch-up Client
//!
//! HTTP reads against the hub: event pages after a known ID, statistics and
//! the current status. Used after every (re)connect and as the poll transport
//! when the push channel is down.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;
use url::Url;

use doorwatch_core::{Event, EventPage, StatisticsSnapshot, StatusView};

use crate::error::{SyncError, SyncResult};

/// Thin typed client over the hub's read endpoints.
#[derive(Debug, Clone)]
pub struct CatchUpClient {
    client: Client,
    base: Url,
}

impl CatchUpClient {
    /// `base` is the hub's http(s) base URL; `timeout` bounds every request.
    pub fn new(base: Url, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(CatchUpClient { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base.join(path)?)
    }

    /// Events with `id > since`, ascending, at most `limit`.
    pub async fn events_since(&self, since: i64, limit: u32) -> SyncResult<Vec<Event>> {
        let url = self.endpoint("events")?;
        let page: EventPage = self
            .client
            .get(url)
            .query(&[("since", since.to_string()), ("limit", limit.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(since, count = page.events.len(), "Fetched catch-up page");
        Ok(page.events)
    }

    pub async fn statistics(&self) -> SyncResult<StatisticsSnapshot> {
        let url = self.endpoint("statistics")?;
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn status(&self) -> SyncResult<StatusView> {
        let url = self.endpoint("status")?;
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_join_onto_base() {
        let client = CatchUpClient::new(
            Url::parse("http://127.0.0.1:8765/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            client.endpoint("events").unwrap().as_str(),
            "http://127.0.0.1:8765/events"
        );
        assert_eq!(
            client.endpoint("status").unwrap().as_str(),
            "http://127.0.0.1:8765/status"
        );
    }

    #[tokio::test]
    async fn test_unreachable_hub_is_retryable() {
        // Port 9 (discard) is not listening on loopback in test environments.
        let client = CatchUpClient::new(
            Url::parse("http://127.0.0.1:9/").unwrap(),
            Duration::from_millis(500),
        )
        .unwrap();
        let err = client.events_since(0, 10).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
