//! Server-sent event streaming
//!
//! Replays stored events first, then switches to the live bus
//! subscription. Subscribing happens before the replay snapshot is taken,
//! so events published in between show up in both; the id filter drops
//! the duplicates.

use crate::db::SessionEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub fn session_event_stream(
    replay: Vec<SessionEvent>,
    live: mpsc::Receiver<SessionEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_replayed = replay.last().map_or(0, |e| e.id);

    let replayed = futures::stream::iter(
        replay
            .into_iter()
            .map(|event| Ok(session_event_to_axum(&event))),
    );

    let live_stream = ReceiverStream::new(live).filter_map(move |event| {
        if event.id > last_replayed {
            Some(Ok(session_event_to_axum(&event)))
        } else {
            None
        }
    });

    Sse::new(replayed.chain(live_stream)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn session_event_to_axum(event: &SessionEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.event_type.to_string())
        .data(event.data.to_string())
}
