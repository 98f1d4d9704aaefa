//! `/events` streaming handler.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;
use skiff_core::event::EngineEvent;
use tokio_stream::wrappers::ReceiverStream;

use super::parse_filters;
use crate::api::AppState;
use crate::error::{DockerError, Result};
use crate::types::{EventActorWire, EventMessage};

/// Events query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Show events since this timestamp (unix seconds or RFC3339).
    #[serde(default)]
    pub since: Option<String>,
    /// Show events until this timestamp (unix seconds or RFC3339).
    #[serde(default)]
    pub until: Option<String>,
    /// Filters (JSON encoded).
    #[serde(default)]
    pub filters: Option<String>,
}

/// `GET /events`
///
/// Streams NDJSON event lines until the client hangs up or `until` passes.
/// An `until` already in the past answers immediately with an empty stream.
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Response> {
    let filters = parse_filters(query.filters.as_deref())?;
    let since = parse_timestamp(query.since.as_deref())?;
    let until = parse_timestamp(query.until.as_deref())?;

    let (tx, rx) = tokio::sync::mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(64);

    if until.is_some_and(|until| until < chrono::Utc::now().timestamp()) {
        drop(tx);
    } else {
        let mut event_rx = state.backend.events().subscribe();
        tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(event) => {
                        if let Some(since) = since {
                            if event.time < since {
                                continue;
                            }
                        }
                        if let Some(until) = until {
                            if event.time > until {
                                break;
                            }
                        }
                        if !matches_event_filters(&filters, &event) {
                            continue;
                        }
                        let line = match encode_event(&event) {
                            Ok(line) => line,
                            Err(e) => {
                                tracing::warn!("failed to encode event: {e}");
                                continue;
                            }
                        };
                        if tx.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| DockerError::Server(e.to_string()))
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<i64>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(ts) = trimmed.parse::<i64>() {
        return Ok(Some(ts));
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Some(dt.timestamp()));
    }
    Err(DockerError::bad_parameter(format!(
        "invalid timestamp: {trimmed}"
    )))
}

/// Applies `docker events` filters: `type` and `event` exact (fuzzy for the
/// exec actions, which carry the process line), `container` exact or prefix
/// on id and name, `label` as `key` or `key=value`.
fn matches_event_filters(filters: &HashMap<String, Vec<String>>, event: &EngineEvent) -> bool {
    if let Some(types) = filters.get("type") {
        if !types.iter().any(|t| t == &event.event_type) {
            return false;
        }
    }
    if let Some(actions) = filters.get("event") {
        let matched = actions.iter().any(|a| {
            a == &event.action
                || (matches!(a.as_str(), "exec_create" | "exec_start")
                    && event.action.starts_with(a.as_str()))
        });
        if !matched {
            return false;
        }
    }
    if let Some(containers) = filters.get("container") {
        let name = event.actor.attributes.get("name");
        let matched = containers.iter().any(|c| {
            event.actor.id.starts_with(c.as_str())
                || name.is_some_and(|n| n.starts_with(c.as_str()))
        });
        if !matched {
            return false;
        }
    }
    if let Some(labels) = filters.get("label") {
        for label in labels {
            let matched = match label.split_once('=') {
                Some((key, value)) => {
                    event.actor.attributes.get(key).map(String::as_str) == Some(value)
                }
                None => event.actor.attributes.contains_key(label),
            };
            if !matched {
                return false;
            }
        }
    }
    true
}

fn encode_event(event: &EngineEvent) -> std::result::Result<Bytes, serde_json::Error> {
    let message = EventMessage {
        event_type: event.event_type.clone(),
        action: event.action.clone(),
        actor: EventActorWire {
            id: event.actor.id.clone(),
            attributes: event.actor.attributes.clone(),
        },
        scope: "local".to_string(),
        time: event.time,
        time_nano: event.time_nano,
    };
    let mut payload = serde_json::to_vec(&message)?;
    payload.push(b'\n');
    Ok(Bytes::from(payload))
}
