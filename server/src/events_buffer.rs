//! Time-keyed, bounded, single-subscriber log of battle updates.
//!
//! Updates are stamped with strictly monotonic microsecond timestamps so a
//! reconnecting lobby can resume with `subscribe(since)` and replay exactly
//! what it missed. The push path awaits the subscriber for each delivered
//! event; eviction only ever runs between deliveries, so nothing older than
//! an in-flight event can disappear under the subscriber.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use thiserror::Error;

use shared::updates::{BufferedEvent, LobbyUpdate};

/// Subscriber callback. Returning `()` encodes the "must not fail"
/// contract: there is no error for the buffer to handle.
pub type UpdateSink = Box<dyn FnMut(BufferedEvent) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("an update subscription is already active")]
    CallbackAlreadySet,
    #[error("subscription start time is too far in the past")]
    TooFarInThePast,
}

// Microsecond wall-clock epoch pinned at construction; elapsed time comes
// from the monotonic clock so timestamps can never step backwards.
struct Clock {
    base_us: u64,
    origin: Instant,
}

impl Clock {
    fn new() -> Self {
        let base_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as u64;
        Self {
            base_us,
            origin: Instant::now(),
        }
    }

    fn now_us(&self) -> u64 {
        self.base_us + self.origin.elapsed().as_micros() as u64
    }
}

pub struct EventsBuffer {
    entries: VecDeque<BufferedEvent>,
    last_timestamp: u64,
    max_age: Duration,
    dropping_frequency: Duration,
    last_eviction: Instant,
    subscriber: Option<UpdateSink>,
    clock: Clock,
}

impl EventsBuffer {
    /// Creates a buffer retaining `max_age` of updates, evicting at the
    /// default rate of once per `max_age / 10`.
    pub fn new(max_age: Duration) -> Self {
        Self::with_dropping_frequency(max_age, max_age / 10)
    }

    pub fn with_dropping_frequency(max_age: Duration, dropping_frequency: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            last_timestamp: 0,
            max_age,
            dropping_frequency,
            last_eviction: Instant::now(),
            subscriber: None,
            clock: Clock::new(),
        }
    }

    /// Current timestamp in the buffer's time base.
    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Stamps and stores one update, then delivers it to the subscriber if
    /// one is attached. Waits for the delivery to complete.
    pub async fn push(&mut self, battle_id: String, update: LobbyUpdate) -> u64 {
        let now = self.clock.now_us();
        let time = now.max(self.last_timestamp + 1);
        self.last_timestamp = time;
        self.maybe_evict(now);
        let event = BufferedEvent {
            time,
            battle_id,
            update,
        };
        self.entries.push_back(event.clone());
        if let Some(sink) = self.subscriber.as_mut() {
            sink(event).await;
        }
        time
    }

    /// Replays every stored update newer than `since`, then attaches the
    /// sink for live deliveries.
    pub async fn subscribe(&mut self, since: u64, mut sink: UpdateSink) -> Result<(), BufferError> {
        if self.subscriber.is_some() {
            return Err(BufferError::CallbackAlreadySet);
        }
        let now = self.clock.now_us();
        if since < now.saturating_sub(self.max_age.as_micros() as u64) {
            return Err(BufferError::TooFarInThePast);
        }
        for event in self.entries.iter().filter(|e| e.time > since) {
            sink(event.clone()).await;
        }
        self.subscriber = Some(sink);
        Ok(())
    }

    /// Detaches the subscriber; no further deliveries happen.
    pub fn unsubscribe(&mut self) {
        self.subscriber = None;
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_evict(&mut self, now_us: u64) {
        if self.last_eviction.elapsed() < self.dropping_frequency {
            return;
        }
        self.last_eviction = Instant::now();
        let cutoff = now_us.saturating_sub(self.max_age.as_micros() as u64);
        while self
            .entries
            .front()
            .is_some_and(|event| event.time < cutoff)
        {
            self.entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_sink() -> (UpdateSink, Arc<Mutex<Vec<BufferedEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: UpdateSink = Box::new(move |event| {
            let sink_seen = Arc::clone(&sink_seen);
            Box::pin(async move {
                sink_seen.lock().unwrap().push(event);
            })
        });
        (sink, seen)
    }

    fn message(text: &str) -> LobbyUpdate {
        LobbyUpdate::EngineMessage {
            message: text.to_string(),
        }
    }

    #[tokio::test]
    async fn timestamps_are_strictly_increasing() {
        let mut buffer = EventsBuffer::new(Duration::from_secs(600));
        let mut previous = 0;
        for i in 0..50 {
            let time = buffer.push("b".to_string(), message(&i.to_string())).await;
            assert!(time > previous);
            previous = time;
        }
        assert_eq!(buffer.len(), 50);
    }

    #[tokio::test]
    async fn subscribe_replays_only_newer_events() {
        let mut buffer = EventsBuffer::new(Duration::from_secs(600));
        let t_a = buffer.push("b".to_string(), message("A")).await;
        let t_b = buffer.push("b".to_string(), message("B")).await;

        let (sink, seen) = collecting_sink();
        // Replay point strictly between the two stored events.
        buffer.subscribe((t_a + t_b) / 2, sink).await.unwrap();

        let replayed = seen.lock().unwrap().clone();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].update, message("B"));
        assert_eq!(replayed[0].time, t_b);

        // Live pushes continue through the same sink, in order.
        buffer.push("b".to_string(), message("C")).await;
        let all = seen.lock().unwrap().clone();
        assert_eq!(all.len(), 2);
        assert!(all[1].time > all[0].time);
    }

    #[tokio::test]
    async fn second_subscribe_fails() {
        let mut buffer = EventsBuffer::new(Duration::from_secs(600));
        let (sink, _) = collecting_sink();
        buffer.subscribe(buffer.now_us(), sink).await.unwrap();

        let (sink2, _) = collecting_sink();
        assert_eq!(
            buffer.subscribe(buffer.now_us(), sink2).await,
            Err(BufferError::CallbackAlreadySet)
        );
    }

    #[tokio::test]
    async fn subscribe_beyond_retention_fails() {
        let mut buffer = EventsBuffer::new(Duration::from_millis(10));
        let (sink, _) = collecting_sink();
        let too_old = buffer.now_us().saturating_sub(1_000_000);
        assert_eq!(
            buffer.subscribe(too_old, sink).await,
            Err(BufferError::TooFarInThePast)
        );
    }

    #[tokio::test]
    async fn unsubscribe_stops_deliveries_and_allows_resubscribe() {
        let mut buffer = EventsBuffer::new(Duration::from_secs(600));
        let (sink, seen) = collecting_sink();
        buffer.subscribe(buffer.now_us(), sink).await.unwrap();
        buffer.push("b".to_string(), message("A")).await;
        buffer.unsubscribe();
        buffer.push("b".to_string(), message("B")).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        let (sink2, seen2) = collecting_sink();
        let recent = buffer.now_us().saturating_sub(1_000_000);
        buffer.subscribe(recent, sink2).await.unwrap();
        // The missed push is replayed to the new subscriber.
        assert!(seen2
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.update == message("B")));
    }

    #[tokio::test]
    async fn old_events_are_evicted() {
        let mut buffer =
            EventsBuffer::with_dropping_frequency(Duration::from_millis(20), Duration::ZERO);
        buffer.push("b".to_string(), message("old")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        buffer.push("b".to_string(), message("new")).await;
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn eviction_is_rate_limited() {
        let mut buffer = EventsBuffer::with_dropping_frequency(
            Duration::from_millis(20),
            Duration::from_secs(3600),
        );
        buffer.push("b".to_string(), message("old")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Expired, but the eviction pass is not due yet.
        buffer.push("b".to_string(), message("new")).await;
        assert_eq!(buffer.len(), 2);
    }
}
