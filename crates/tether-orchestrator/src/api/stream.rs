//! Server-Sent Events streams.
//!
//! `GET /api/events` carries every dashboard event, named by its `type`.
//! `GET /api/instances/{id}/output` replays the session's scrollback and
//! then follows live output. Terminal bytes are base64 encoded because SSE
//! data must be text. Both streams end when the daemon shuts down so the
//! HTTP server can drain.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use base64::Engine;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use tether_core::types::InstanceId;

use super::{fail, ApiError, AppState};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

fn lagged(missed: u64) -> Event {
    Event::default()
        .event("error")
        .data(format!(r#"{{"code":"LAGGED","missed":{missed}}}"#))
}

fn output_event(chunk: &Bytes) -> Event {
    Event::default()
        .event("output")
        .data(base64::engine::general_purpose::STANDARD.encode(chunk))
}

/// `GET /api/events`
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stopped = state.cancel.clone().cancelled_owned();

    let stream = stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => {
                let data = serde_json::to_string(&event).unwrap_or_default();
                let sse = Event::default().event(event.name()).data(data);
                Some((Ok(sse), rx))
            }
            Err(RecvError::Lagged(n)) => Some((Ok(lagged(n)), rx)),
            Err(RecvError::Closed) => None,
        }
    })
    .take_until(stopped);

    Sse::new(stream).keep_alive(KeepAlive::default().interval(KEEPALIVE_INTERVAL))
}

/// `GET /api/instances/{id}/output`
pub async fn output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state
        .sessions
        .subscribe(&InstanceId::new(id))
        .await
        .map_err(fail)?;

    let replay = (!subscription.replay.is_empty())
        .then(|| Ok::<_, Infallible>(output_event(&subscription.replay)));

    // Lagging subscribers skip ahead rather than hold the session back
    let live = stream::unfold(Some(subscription.live), |rx| async move {
        let mut rx = rx?;
        match rx.recv().await {
            Ok(chunk) => Some((Ok(output_event(&chunk)), Some(rx))),
            Err(RecvError::Lagged(n)) => Some((Ok(lagged(n)), Some(rx))),
            Err(RecvError::Closed) => {
                let exit = Event::default().event("exit").data("{}");
                Some((Ok(exit), None))
            }
        }
    });

    let stream = stream::iter(replay)
        .chain(live)
        .take_until(state.cancel.clone().cancelled_owned());
    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(KEEPALIVE_INTERVAL)))
}
