//! Key-guarded analytics reports.

use std::collections::{BTreeMap, HashSet};

use axum::{
    Extension, Json,
    extract::Query,
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::search::{AnalyticsEvent, SEARCH_SUCCEEDED_EVENT};
use crate::server::{ApiError, ApiStateHandle, ensure_range, header_request_id};

const DEFAULT_EVENTS_LIMIT: usize = 100;
const STATS_WINDOW: usize = 1000;
const METRICS_WINDOW: usize = 50;
const MAX_ADMIN_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    #[serde(default)]
    key: String,
    limit: Option<usize>,
}

/// Stats and metrics read fixed windows; a `limit` parameter is ignored.
#[derive(Debug, Deserialize)]
pub(crate) struct KeyQuery {
    #[serde(default)]
    key: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct EventsResponse {
    events: Vec<AnalyticsEvent>,
    count: usize,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct EventTypeCount {
    event_type: String,
    count: usize,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct StatsResponse {
    events_by_type: Vec<EventTypeCount>,
    unique_users: usize,
    unique_sessions: usize,
    total_events: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct MetricsResponse {
    recent: Vec<AnalyticsEvent>,
    avg_search_time_ms: u64,
}

fn authorize(state: &ApiStateHandle, provided: &str) -> Result<(), ApiError> {
    let Some(expected) = state.admin_key.as_deref() else {
        return Err(ApiError::unauthorized());
    };
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        tracing::warn!("rejected admin request with bad key");
        Err(ApiError::unauthorized())
    }
}

async fn load_events(
    state: &ApiStateHandle,
    headers: &HeaderMap,
    key: &str,
    limit: Option<usize>,
    default_limit: usize,
) -> Result<Vec<AnalyticsEvent>, ApiError> {
    let request_id = header_request_id(headers);
    authorize(state, key).map_err(|err| err.with_request_id(request_id.as_deref()))?;
    let limit = limit.unwrap_or(default_limit);
    ensure_range("limit", limit, 1, MAX_ADMIN_LIMIT)
        .map_err(|err| err.with_request_id(request_id.as_deref()))?;
    state
        .analytics
        .recent_events(limit)
        .await
        .map_err(|err| ApiError::from(err).with_request_id(request_id.as_deref()))
}

pub(crate) async fn analytics_events(
    Extension(state): Extension<ApiStateHandle>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let events = load_events(
        &state,
        &headers,
        &query.key,
        query.limit,
        DEFAULT_EVENTS_LIMIT,
    )
    .await?;
    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

pub(crate) async fn analytics_stats(
    Extension(state): Extension<ApiStateHandle>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let events = load_events(&state, &headers, &query.key, None, STATS_WINDOW).await?;
    Ok(Json(summarize_events(&events)))
}

pub(crate) async fn search_metrics(
    Extension(state): Extension<ApiStateHandle>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<Json<MetricsResponse>, ApiError> {
    let events = load_events(&state, &headers, &query.key, None, METRICS_WINDOW).await?;
    Ok(Json(MetricsResponse {
        avg_search_time_ms: average_search_time(&events),
        recent: events,
    }))
}

/// Counts are ordered by frequency, ties broken by event name.
fn summarize_events(events: &[AnalyticsEvent]) -> StatsResponse {
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    let mut users = HashSet::new();
    let mut sessions = HashSet::new();
    for event in events {
        *by_type.entry(event.event_type.as_str()).or_default() += 1;
        if let Some(user) = event.user_id.as_deref() {
            users.insert(user);
        }
        if let Some(session) = event.session_id.as_deref() {
            sessions.insert(session);
        }
    }

    let mut events_by_type: Vec<EventTypeCount> = by_type
        .into_iter()
        .map(|(event_type, count)| EventTypeCount {
            event_type: event_type.to_string(),
            count,
        })
        .collect();
    events_by_type.sort_by(|a, b| b.count.cmp(&a.count));

    StatsResponse {
        events_by_type,
        unique_users: users.len(),
        unique_sessions: sessions.len(),
        total_events: events.len(),
    }
}

fn average_search_time(events: &[AnalyticsEvent]) -> u64 {
    let timings: Vec<u64> = events
        .iter()
        .filter(|event| event.event_type == SEARCH_SUCCEEDED_EVENT)
        .map(|event| {
            event
                .event_data
                .get("search_time_ms")
                .and_then(|value| value.as_u64())
                .unwrap_or(0)
        })
        .collect();
    if timings.is_empty() {
        return 0;
    }
    timings.iter().sum::<u64>() / timings.len() as u64
}
