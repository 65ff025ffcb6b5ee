//! Multicast event channels
//!
//! Three flavours are used across the crate:
//! - broadcast without replay: [`live_stream`] only sees items published after
//!   it attached, and skips over items it lagged behind on
//! - broadcast with history: [`replay_then_live`] concatenates a snapshot taken
//!   by the caller with a live stream attached before the snapshot was taken
//! - resynchronising: [`resyncing_stream`] and [`replaying_stream`] replace a
//!   lagging receiver with a fresh snapshot plus a new receiver, so consumers
//!   keyed by identity converge instead of losing state

use crate::Result;
use futures::future::{self, Future};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Boxed stream of events
pub type EventStream<T> = BoxStream<'static, T>;

/// Current state plus a receiver attached while that state was read
pub type Snapshot<T> = (Vec<T>, broadcast::Receiver<T>);

/// Broadcast channel that never replays past events
#[derive(Debug)]
pub struct EventChannel<T> {
    name: &'static str,
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    /// Create a channel buffering up to `capacity` items per slow subscriber
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { name, sender }
    }

    /// Publish to every current subscriber, returns how many received it
    pub fn publish(&self, item: T) -> usize {
        self.sender.send(item).unwrap_or(0)
    }

    /// Raw receiver, for callers that attach inside a critical section
    pub fn receiver(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Live stream of items published from now on, lag gaps skipped
    pub fn subscribe(&self) -> EventStream<T> {
        live_stream(self.name, self.sender.subscribe())
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Turn a broadcast receiver into a stream, skipping over lag gaps.
///
/// Only for feeds where a missed item carries no state, such as connection
/// lifecycle notifications.
pub fn live_stream<T: Clone + Send + 'static>(
    name: &'static str,
    receiver: broadcast::Receiver<T>,
) -> EventStream<T> {
    BroadcastStream::new(receiver)
        .filter_map(move |item| {
            future::ready(match item {
                Ok(value) => Some(value),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = name, skipped, "Subscriber lagged, events dropped");
                    None
                }
            })
        })
        .boxed()
}

/// History first, then live items
pub fn replay_then_live<T: Send + 'static>(history: Vec<T>, live: EventStream<T>) -> EventStream<T> {
    stream::iter(history).chain(live).boxed()
}

struct Resync<T, F> {
    name: &'static str,
    backlog: VecDeque<T>,
    receiver: broadcast::Receiver<T>,
    resync: F,
}

/// `history`, then items from `receiver`.
///
/// When the receiver lags, `resync` is asked for a fresh snapshot: its items
/// are delivered next and its receiver replaces the lagging one. Items seen
/// before the lag may be delivered again. The stream ends when the channel
/// closes or a resync fails.
pub fn resyncing_stream<T, F, Fut>(
    name: &'static str,
    history: Vec<T>,
    receiver: broadcast::Receiver<T>,
    resync: F,
) -> EventStream<T>
where
    T: Clone + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Snapshot<T>>> + Send + 'static,
{
    let state = Resync {
        name,
        backlog: history.into(),
        receiver,
        resync,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.backlog.pop_front() {
                return Some((item, state));
            }
            match state.receiver.recv().await {
                Ok(item) => return Some((item, state)),
                Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = state.name, skipped, "Subscriber lagged, resynchronising");
                    match (state.resync)().await {
                        Ok((history, receiver)) => {
                            state.backlog = history.into();
                            state.receiver = receiver;
                        }
                        Err(e) => {
                            tracing::error!(channel = state.name, error = %e, "Resynchronisation failed");
                            return None;
                        }
                    }
                }
            }
        }
    })
    .boxed()
}

/// Snapshot taken by `snapshot`, then live items, re-seeded from a new
/// snapshot whenever the subscriber lags.
///
/// `snapshot` must attach its receiver while holding whatever lock guards
/// the state it reads.
pub fn replaying_stream<T, F>(name: &'static str, snapshot: F) -> EventStream<T>
where
    T: Clone + Send + 'static,
    F: Fn() -> Snapshot<T> + Send + 'static,
{
    let (history, receiver) = snapshot();
    resyncing_stream(name, history, receiver, move || future::ready(Ok(snapshot())))
}
