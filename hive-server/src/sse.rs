//! Server-Sent Events endpoint.
//!
//! Each event goes out as one `data:` line of JSON; a `: ping` comment
//! every keepalive interval holds idle connections open. Clients filter
//! with `?types=a,b,c`; without it they get the client-relevant default
//! set.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;

use hive_core::event::{EventFilter, EventType};

use crate::routes::{ApiError, AppState};

#[derive(Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event type names; unknown names are ignored.
    pub types: Option<String>,
    pub execution_id: Option<String>,
    pub graph_id: Option<String>,
}

fn build_filter(query: &EventsQuery) -> EventFilter {
    let mut filter = match &query.types {
        Some(raw) => {
            let types: Vec<EventType> = raw
                .split(',')
                .filter_map(|name| EventType::parse(name.trim()))
                .collect();
            if types.is_empty() {
                EventFilter::client_default()
            } else {
                EventFilter::any().with_types(types)
            }
        }
        None => EventFilter::client_default(),
    };
    if let Some(execution_id) = &query.execution_id {
        filter = filter.with_execution(execution_id.clone());
    }
    if let Some(graph_id) = &query.graph_id {
        filter = filter.with_graph(graph_id.clone());
    }
    filter
}

pub async fn events(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let session = state.manager.session(&sid)?;
    let subscription = session.subscribe(build_filter(&query));

    let stream = subscription.into_async_stream().map(|event| {
        // Serialization of our own envelope cannot fail; fall back to an
        // empty object rather than killing the stream.
        let payload = event.encode().unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().data(payload))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.keepalive)
            .text("ping"),
    ))
}
