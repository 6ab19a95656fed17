use crate::registry::{ActiveRunClaim, ActiveRunRegistry};
use chrono::Utc;
use runlog_core::events::{Event, EventBody, EventKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

pub const DEFAULT_LIVE_WINDOW: usize = 256;

/// The requested cursor has already been evicted from the retention buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[error("stream gap: requested cursor {requested}, oldest retained {oldest}, next {next}")]
pub struct StreamGap {
    pub requested: u64,
    pub oldest: u64,
    pub next: u64,
}

struct ChannelState {
    next_cursor: u64,
    buffer: VecDeque<Event>,
    touched_at: Instant,
}

struct ThreadChannel {
    state: Mutex<ChannelState>,
    sender: broadcast::Sender<Event>,
    retention: usize,
}

impl ThreadChannel {
    fn new(retention: usize, live_window: usize, next_cursor: u64) -> Self {
        let (sender, _) = broadcast::channel(live_window);
        Self {
            state: Mutex::new(ChannelState {
                next_cursor,
                buffer: VecDeque::with_capacity(retention),
                touched_at: Instant::now(),
            }),
            sender,
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, thread_id: &str, kind: EventKind, payload: Value) -> Event {
        let mut state = self.lock();
        let event = Event {
            cursor: state.next_cursor,
            thread_id: thread_id.to_string(),
            kind,
            payload,
            timestamp: Utc::now(),
        };
        state.next_cursor += 1;
        state.touched_at = Instant::now();
        if state.buffer.len() == self.retention {
            state.buffer.pop_front();
        }
        state.buffer.push_back(event.clone());
        // No receivers is fine; the buffer still serves late subscribers.
        let _ = self.sender.send(event.clone());
        event
    }

    fn replay_from(state: &ChannelState, from_cursor: u64) -> Result<VecDeque<Event>, StreamGap> {
        let oldest = state
            .buffer
            .front()
            .map(|event| event.cursor)
            .unwrap_or(state.next_cursor);
        if from_cursor < oldest {
            return Err(StreamGap {
                requested: from_cursor,
                oldest,
                next: state.next_cursor,
            });
        }
        Ok(state
            .buffer
            .iter()
            .filter(|event| event.cursor >= from_cursor)
            .cloned()
            .collect())
    }
}

/// Per-thread ordered event log with bounded retention and live fan-out.
/// Subscribers that fall out of the live window catch up from retention.
pub struct EventBus {
    retention: usize,
    live_window: usize,
    channels: Mutex<HashMap<String, Arc<ThreadChannel>>>,
}

impl EventBus {
    pub fn new(retention: usize) -> Self {
        Self::with_live_window(retention, DEFAULT_LIVE_WINDOW)
    }

    pub fn with_live_window(retention: usize, live_window: usize) -> Self {
        let retention = retention.max(1);
        Self {
            retention,
            live_window: live_window.clamp(1, retention),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, thread_id: &str) -> Arc<ThreadChannel> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(ThreadChannel::new(self.retention, self.live_window, 0)))
            .clone()
    }

    pub fn has_thread(&self, thread_id: &str) -> bool {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(thread_id)
    }

    /// Drops the thread's channel when nobody listens and nothing was
    /// published or subscribed for `idle_after`. The retention buffer goes
    /// with it; a later `seed` restores the head.
    pub fn evict_if_idle(&self, thread_id: &str, idle_after: Duration) -> bool {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(channel) = channels.get(thread_id) else {
            return true;
        };
        if channel.sender.receiver_count() > 0 || Arc::strong_count(channel) > 1 {
            return false;
        }
        if channel.lock().touched_at.elapsed() < idle_after {
            return false;
        }
        channels.remove(thread_id);
        debug!(event = "bus_evicted", thread_id);
        true
    }

    /// Raises the thread's next cursor to at least `next_cursor`.
    pub fn seed(&self, thread_id: &str, next_cursor: u64) {
        let channel = self.channel(thread_id);
        let mut state = channel.lock();
        if next_cursor > state.next_cursor {
            debug!(event = "bus_seeded", thread_id, next_cursor);
            state.next_cursor = next_cursor;
        }
    }

    /// Next cursor that will be assigned on the thread.
    pub fn head(&self, thread_id: &str) -> u64 {
        self.channel(thread_id).lock().next_cursor
    }

    pub fn publish(&self, thread_id: &str, kind: EventKind, payload: Value) -> Event {
        self.channel(thread_id).publish(thread_id, kind, payload)
    }

    pub fn publish_body(
        &self,
        thread_id: &str,
        body: EventBody,
    ) -> Result<Event, serde_json::Error> {
        let (kind, payload) = body.into_parts()?;
        Ok(self.publish(thread_id, kind, payload))
    }

    /// Releases the claim, then publishes the event that ends its run.
    /// Observers reacting to the event always find the registry idle.
    pub fn publish_terminal(
        &self,
        registry: &ActiveRunRegistry,
        claim: &ActiveRunClaim,
        body: EventBody,
    ) -> Result<Event, serde_json::Error> {
        if !body.kind().is_terminal() {
            warn!(
                event = "non_terminal_release",
                kind = %body.kind(),
                thread_id = %claim.thread_id
            );
        }
        registry.release(claim.token);
        let (kind, payload) = body.into_parts()?;
        Ok(self.publish(&claim.thread_id, kind, payload))
    }

    /// Events with `cursor >= from_cursor`, then live events, without gaps or
    /// duplicates. A cursor past the head is clamped to the head.
    pub fn subscribe(&self, thread_id: &str, from_cursor: u64) -> Result<Subscription, StreamGap> {
        let channel = self.channel(thread_id);
        let (backlog, receiver, next_cursor) = {
            let mut state = channel.lock();
            state.touched_at = Instant::now();
            let from_cursor = from_cursor.min(state.next_cursor);
            let backlog = ThreadChannel::replay_from(&state, from_cursor)?;
            (backlog, channel.sender.subscribe(), from_cursor)
        };
        Ok(Subscription {
            channel,
            backlog,
            receiver,
            next_cursor,
        })
    }
}

pub struct Subscription {
    channel: Arc<ThreadChannel>,
    backlog: VecDeque<Event>,
    receiver: broadcast::Receiver<Event>,
    next_cursor: u64,
}

impl Subscription {
    /// Cursor of the next event this subscription will yield.
    pub fn next_cursor(&self) -> u64 {
        self.next_cursor
    }

    pub async fn next(&mut self) -> Option<Result<Event, StreamGap>> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                self.next_cursor = event.cursor + 1;
                return Some(Ok(event));
            }
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.cursor < self.next_cursor {
                        continue;
                    }
                    self.next_cursor = event.cursor + 1;
                    return Some(Ok(event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(event = "subscriber_lagged", skipped, next_cursor = self.next_cursor);
                    let replay = {
                        let state = self.channel.lock();
                        ThreadChannel::replay_from(&state, self.next_cursor)
                    };
                    match replay {
                        Ok(events) => self.backlog = events,
                        Err(gap) => return Some(Err(gap)),
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn publish_n(bus: &EventBus, thread_id: &str, count: u64) {
        for idx in 0..count {
            bus.publish(thread_id, EventKind::MessageUpdate, json!({ "n": idx }));
        }
    }

    async fn collect(sub: &mut Subscription, count: usize) -> Vec<u64> {
        let mut cursors = Vec::new();
        for _ in 0..count {
            let event = sub.next().await.expect("open").expect("no gap");
            cursors.push(event.cursor);
        }
        cursors
    }

    #[test]
    fn cursors_are_dense_per_thread() {
        let bus = EventBus::new(8);
        let a0 = bus.publish("a", EventKind::Done, json!({}));
        let b0 = bus.publish("b", EventKind::Done, json!({}));
        let a1 = bus.publish("a", EventKind::HistoryReset, json!({"messages": []}));
        assert_eq!((a0.cursor, b0.cursor, a1.cursor), (0, 0, 1));
        assert_eq!(bus.head("a"), 2);
        assert_eq!(bus.head("b"), 1);
    }

    #[tokio::test]
    async fn subscribe_replays_backlog_then_live_events() {
        let bus = EventBus::new(16);
        publish_n(&bus, "t", 3);

        let mut sub = bus.subscribe("t", 1).expect("subscribe");
        assert_eq!(collect(&mut sub, 2).await, vec![1, 2]);

        publish_n(&bus, "t", 2);
        assert_eq!(collect(&mut sub, 2).await, vec![3, 4]);
        assert_eq!(sub.next_cursor(), 5);
    }

    #[tokio::test]
    async fn reconnect_at_cursor_resumes_without_loss_or_duplicates() {
        let bus = EventBus::new(64);
        let mut first = bus.subscribe("t4", 0).expect("subscribe");
        publish_n(&bus, "t4", 7);
        assert_eq!(collect(&mut first, 7).await, (0..7).collect::<Vec<_>>());
        let resume_at = first.next_cursor();
        drop(first);

        publish_n(&bus, "t4", 3);
        let mut second = bus.subscribe("t4", resume_at).expect("resubscribe");
        publish_n(&bus, "t4", 2);
        assert_eq!(collect(&mut second, 5).await, vec![7, 8, 9, 10, 11]);
        assert_eq!(second.next_cursor(), bus.head("t4"));
    }

    #[tokio::test]
    async fn cursor_ahead_of_head_is_clamped() {
        let bus = EventBus::new(4);
        publish_n(&bus, "t", 2);
        let mut sub = bus.subscribe("t", 99).expect("subscribe");
        assert_eq!(sub.next_cursor(), 2);
        publish_n(&bus, "t", 1);
        assert_eq!(collect(&mut sub, 1).await, vec![2]);
    }

    #[test]
    fn evicted_cursor_reports_stream_gap() {
        let bus = EventBus::new(4);
        publish_n(&bus, "t", 10);
        let err = bus.subscribe("t", 2).err().expect("gap");
        assert_eq!(
            err,
            StreamGap {
                requested: 2,
                oldest: 6,
                next: 10
            }
        );
        assert!(bus.subscribe("t", 6).is_ok());
    }

    #[test]
    fn seeded_thread_without_buffer_gaps_for_older_cursors() {
        let bus = EventBus::new(4);
        bus.seed("t", 7);
        bus.seed("t", 3);
        assert_eq!(bus.head("t"), 7);
        assert!(bus.subscribe("t", 7).is_ok());
        assert!(matches!(
            bus.subscribe("t", 0),
            Err(StreamGap { oldest: 7, .. })
        ));
        assert_eq!(bus.publish("t", EventKind::Done, json!({})).cursor, 7);
    }

    #[tokio::test]
    async fn lagged_subscriber_recovers_from_buffer_without_duplicates() {
        let bus = EventBus::with_live_window(16, 2);
        let mut sub = bus.subscribe("t", 0).expect("subscribe");
        publish_n(&bus, "t", 6);
        assert_eq!(collect(&mut sub, 6).await, vec![0, 1, 2, 3, 4, 5]);

        publish_n(&bus, "t", 1);
        assert_eq!(collect(&mut sub, 1).await, vec![6]);
    }

    #[tokio::test]
    async fn lag_past_retention_surfaces_gap() {
        let bus = EventBus::with_live_window(2, 2);
        let mut sub = bus.subscribe("t", 0).expect("subscribe");
        publish_n(&bus, "t", 6);
        match sub.next().await {
            Some(Err(gap)) => {
                assert_eq!(gap.requested, 0);
                assert_eq!(gap.oldest, 4);
            }
            other => panic!("expected gap, got {other:?}"),
        }
    }

    #[test]
    fn idle_channels_are_evicted_unless_someone_listens() {
        let bus = EventBus::new(8);
        publish_n(&bus, "quiet", 3);
        publish_n(&bus, "watched", 1);
        let sub = bus.subscribe("watched", 0).expect("subscribe");

        assert!(!bus.evict_if_idle("quiet", Duration::from_secs(60)));
        assert!(bus.evict_if_idle("quiet", Duration::ZERO));
        assert!(!bus.evict_if_idle("watched", Duration::ZERO));
        assert!(!bus.has_thread("quiet"));
        assert!(bus.has_thread("watched"));

        drop(sub);
        assert!(bus.evict_if_idle("watched", Duration::ZERO));
        bus.seed("quiet", 3);
        assert_eq!(bus.publish("quiet", EventKind::Done, json!({})).cursor, 3);
    }

    #[test]
    fn publish_terminal_releases_the_matching_claim() {
        let bus = EventBus::new(4);
        let registry = ActiveRunRegistry::new();
        let admitted = registry
            .try_admit("t", crate::registry::RUN_LABEL, None)
            .expect("admit");

        let event = bus
            .publish_terminal(&registry, &admitted.claim, EventBody::Done)
            .expect("publish");
        assert_eq!(event.kind, EventKind::Done);
        assert_eq!(registry.current(), None);
    }
}
