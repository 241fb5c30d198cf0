use std::convert::Infallible;

use axum::response::sse::Event;
use futures_util::{Stream, StreamExt};
use serde::Serialize;

/// Lifecycle markers carried by `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Connecting,
    Connected,
    Streaming,
    Error,
}

/// The only vocabulary a client ever observes, whatever the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalEvent {
    Status(Stage),
    Delta(String),
    Error(String),
    End,
}

impl CanonicalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CanonicalEvent::Status(_) => "status",
            CanonicalEvent::Delta(_) => "delta",
            CanonicalEvent::Error(_) => "error",
            CanonicalEvent::End => "end",
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, CanonicalEvent::End)
    }

    pub fn to_sse(&self) -> Event {
        let event = Event::default().event(self.name());
        match self {
            CanonicalEvent::Status(stage) => {
                event.data(serde_json::json!({ "stage": stage }).to_string())
            }
            CanonicalEvent::Delta(text) => event.data(normalize_newlines(text)),
            CanonicalEvent::Error(message) => event.data(normalize_newlines(message)),
            CanonicalEvent::End => event.data(""),
        }
    }
}

/// SSE readers already treat a bare CR as a line break, and axum refuses CR
/// inside field values.
fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Serializes canonical events onto the SSE transport, in order, stopping
/// after the first `end` so nothing can ever follow it.
pub fn into_sse<S>(events: S) -> impl Stream<Item = Result<Event, Infallible>> + Send
where
    S: Stream<Item = CanonicalEvent> + Send,
{
    async_stream::stream! {
        futures_util::pin_mut!(events);
        while let Some(event) = events.next().await {
            let end = event.is_end();
            yield Ok::<Event, Infallible>(event.to_sse());
            if end {
                break;
            }
        }
    }
}

/// Cuts a canonical sequence at its first `end`, inclusive.
pub fn until_end<S>(events: S) -> impl Stream<Item = CanonicalEvent> + Send
where
    S: Stream<Item = CanonicalEvent> + Send,
{
    async_stream::stream! {
        futures_util::pin_mut!(events);
        while let Some(event) = events.next().await {
            let end = event.is_end();
            yield event;
            if end {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    #[test]
    fn event_names_match_the_wire_vocabulary() {
        assert_eq!(CanonicalEvent::Status(Stage::Connecting).name(), "status");
        assert_eq!(CanonicalEvent::Delta("x".to_owned()).name(), "delta");
        assert_eq!(CanonicalEvent::Error("x".to_owned()).name(), "error");
        assert_eq!(CanonicalEvent::End.name(), "end");
    }

    #[test]
    fn carriage_returns_become_line_feeds() {
        assert_eq!(normalize_newlines("a\r\nb\rc\n"), "a\nb\nc\n");
        let _ = CanonicalEvent::Delta("line one\r\nline two".to_owned()).to_sse();
    }

    #[tokio::test]
    async fn nothing_is_forwarded_after_end() {
        let source = stream::iter(vec![
            CanonicalEvent::Delta("a".to_owned()),
            CanonicalEvent::End,
            CanonicalEvent::Delta("late".to_owned()),
            CanonicalEvent::End,
        ]);

        let forwarded = until_end(source).collect::<Vec<_>>().await;
        assert_eq!(
            forwarded,
            vec![CanonicalEvent::Delta("a".to_owned()), CanonicalEvent::End]
        );
    }

    #[tokio::test]
    async fn sse_stream_stops_at_end() {
        let source = stream::iter(vec![
            CanonicalEvent::Status(Stage::Streaming),
            CanonicalEvent::End,
            CanonicalEvent::Error("late".to_owned()),
        ]);
        let frames = into_sse(source).collect::<Vec<_>>().await;
        assert_eq!(frames.len(), 2);
    }
}
