//! Best-effort search analytics.

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use glimpse_server::{AnalyticsEvent, AnalyticsReader, SearchError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::services::rest::{RestClient, RestError};

const EVENTS_TABLE: &str = "rest/v1/analytics_events";

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error(transparent)]
    Rest(#[from] RestError),
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn append(&self, event_type: &str, event_data: Value) -> Result<(), AnalyticsError>;
}

/// Ring buffer of the most recent events, newest last.
pub struct MemoryAnalytics {
    events: Mutex<VecDeque<AnalyticsEvent>>,
    capacity: usize,
}

impl MemoryAnalytics {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AnalyticsEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalytics {
    async fn append(&self, event_type: &str, event_data: Value) -> Result<(), AnalyticsError> {
        let event = AnalyticsEvent {
            event_type: event_type.to_string(),
            event_data,
            user_id: None,
            session_id: None,
            created_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        };
        let mut events = self.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

#[async_trait]
impl AnalyticsReader for MemoryAnalytics {
    async fn recent_events(&self, limit: usize) -> Result<Vec<AnalyticsEvent>, SearchError> {
        Ok(self.lock().iter().rev().take(limit).cloned().collect())
    }
}

/// Events table on the managed backend.
#[derive(Debug, Clone)]
pub struct RestAnalytics {
    rest: RestClient,
}

#[derive(Serialize)]
struct EventInsert<'a> {
    event_type: &'a str,
    event_data: Value,
}

impl RestAnalytics {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl AnalyticsSink for RestAnalytics {
    async fn append(&self, event_type: &str, event_data: Value) -> Result<(), AnalyticsError> {
        let row = EventInsert {
            event_type,
            event_data,
        };
        self.rest.insert(EVENTS_TABLE, &row, None).await?;
        Ok(())
    }
}

#[async_trait]
impl AnalyticsReader for RestAnalytics {
    async fn recent_events(&self, limit: usize) -> Result<Vec<AnalyticsEvent>, SearchError> {
        let query = [
            ("order", "created_at.desc".to_string()),
            ("limit", limit.to_string()),
        ];
        self.rest
            .get_json(EVENTS_TABLE, &query)
            .await
            .map_err(|error| SearchError::upstream_storage(format!("analytics read failed: {error}")))
    }
}
