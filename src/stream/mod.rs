//! Event stream: the ordered events a turn produces.
//!
//! An [`EventLog`] is appended to by the turn and closed when the turn
//! ends. Any number of [`EventStream`]s can read it, each from its own
//! offset, either incrementally or fully buffered.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::Notify;

use crate::event::Event;

#[derive(Debug, Default)]
struct LogState {
    events: Vec<Event>,
    closed: bool,
}

#[derive(Debug, Default)]
struct LogShared {
    state: Mutex<LogState>,
    notify: Notify,
}

/// Append-only, closable event buffer shared between a turn and its readers.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    shared: Arc<LogShared>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event. Ignored once the log is closed.
    pub fn push(&self, event: Event) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.events.push(event);
        }
        self.shared.notify.notify_waiters();
    }

    /// Mark the log finished; readers drain what is left and end.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything appended so far.
    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn subscribe(&self) -> EventStream {
        self.subscribe_from(0)
    }

    /// Stream starting at `offset`; events before it are skipped.
    pub fn subscribe_from(&self, offset: usize) -> EventStream {
        let shared = self.shared.clone();
        let stream = async_stream::stream! {
            let mut next = offset;
            loop {
                let notified = shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let (batch, closed) = {
                    let state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
                    let start = next.min(state.events.len());
                    (state.events[start..].to_vec(), state.closed)
                };

                if !batch.is_empty() {
                    next += batch.len();
                    for event in batch {
                        yield event;
                    }
                    continue;
                }
                if closed {
                    break;
                }
                notified.await;
            }
        };
        EventStream {
            inner: Box::pin(stream),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A finite stream of events, ending when its log closes.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = Event> + Send>>,
}

impl EventStream {
    /// Drain the stream into a vector.
    pub async fn collect_all(self) -> Vec<Event> {
        self.collect().await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn texts(events: &[Event]) -> Vec<&str> {
        events.iter().filter_map(Event::as_text).collect()
    }

    #[tokio::test]
    async fn buffered_read_returns_everything() {
        let log = EventLog::new();
        log.push(Event::user("a"));
        log.push(Event::user("b"));
        log.close();

        let events = log.subscribe().collect_all().await;
        assert_eq!(texts(&events), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn incremental_read_sees_late_events() {
        let log = EventLog::new();
        let mut stream = log.subscribe();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.push(Event::user("late"));
            writer.close();
        });

        let first = stream.next().await.expect("event");
        assert_eq!(first.as_text(), Some("late"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn restart_from_offset() {
        let log = EventLog::new();
        for text in ["a", "b", "c"] {
            log.push(Event::user(text));
        }
        log.close();

        let tail = log.subscribe_from(1).collect_all().await;
        assert_eq!(texts(&tail), vec!["b", "c"]);
        assert!(log.subscribe_from(7).collect_all().await.is_empty());
    }

    #[tokio::test]
    async fn pushes_after_close_are_ignored() {
        let log = EventLog::new();
        log.close();
        log.push(Event::user("ignored"));
        assert!(log.is_empty());
    }
}
