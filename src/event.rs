//! Event notifications for external observers.
//!
//! Engines publish human-readable state transitions to an [`EventBus`]. Each
//! subscriber receives them on its own bounded channel through an
//! [`EventStream`]. Publishing never blocks an actor: a slow subscriber loses
//! events (counted in [`EventBus::dropped_events`]) rather than stalling the
//! simulation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecutionError, SimError, SimResult};

/// Which engine produced an event or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Dining Table Engine.
    DiningPhilosophers,
    /// Bounded Buffer Engine.
    ProducerConsumer,
    /// Reader-Writer Engine.
    ReadersWriters,
}

impl EngineKind {
    /// Stable kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DiningPhilosophers => "dining-philosophers",
            Self::ProducerConsumer => "producer-consumer",
            Self::ReadersWriters => "readers-writers",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one run, from `start` out of Idle until the next `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random run id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Fine-grained actor transition.
    Debug,
    /// Lifecycle change or notable transition.
    Info,
    /// Advisory condition such as a suspected deadlock.
    Warn,
    /// Fault that halted the engine.
    Error,
}

/// One state-transition notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    /// Position in the bus's append-only sequence, starting at 1.
    pub seq: u64,
    /// When the event was published.
    pub at: DateTime<Utc>,
    /// Publishing engine.
    pub engine: EngineKind,
    /// Run the event belongs to, if one was active.
    pub run_id: Option<RunId>,
    /// Acting actor, e.g. `P3` or `writer-1`.
    pub actor: Option<String>,
    /// Severity.
    pub level: EventLevel,
    /// Human-readable description.
    pub message: String,
}

impl EventLevel {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SimEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} [{}] {:<5}",
            self.seq,
            self.at.format("%H:%M:%S%.3f"),
            self.engine,
            self.level.as_str()
        )?;
        match &self.actor {
            Some(actor) => write!(f, " {actor}: {}", self.message),
            None => write!(f, " {}", self.message),
        }
    }
}

/// Fan-out point for [`SimEvent`]s of one engine.
#[derive(Debug)]
pub struct EventBus {
    engine: EngineKind,
    stream_capacity: usize,
    subscribers: Mutex<Vec<Sender<SimEvent>>>,
    next_seq: AtomicU64,
    dropped_events: AtomicU64,
}

impl EventBus {
    /// Default per-subscriber buffer.
    pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

    /// Creates a bus with the default per-subscriber buffer.
    #[must_use]
    pub fn new(engine: EngineKind) -> Self {
        Self::with_capacity(engine, Self::DEFAULT_STREAM_CAPACITY)
    }

    /// Creates a bus whose subscribers buffer up to `stream_capacity` events.
    #[must_use]
    pub fn with_capacity(engine: EngineKind, stream_capacity: usize) -> Self {
        Self {
            engine,
            stream_capacity: stream_capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Engine this bus belongs to.
    #[must_use]
    pub const fn engine(&self) -> EngineKind {
        self.engine
    }

    /// Opens a new stream receiving every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = bounded(self.stream_capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        EventStream { rx }
    }

    /// Publishes an event and mirrors it to `tracing`.
    pub fn publish(
        &self,
        level: EventLevel,
        run_id: Option<RunId>,
        actor: Option<&str>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        // Sequence numbers are assigned under the subscriber lock so every
        // stream sees them in increasing order.
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let event = SimEvent {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            engine: self.engine,
            run_id,
            actor: actor.map(str::to_string),
            level,
            message,
        };
        trace_event(&event);

        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Events not delivered because a subscriber's buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

fn trace_event(event: &SimEvent) {
    let engine = event.engine.as_str();
    let actor = event.actor.as_deref().unwrap_or("-");
    match event.level {
        EventLevel::Debug => tracing::debug!(engine, actor, seq = event.seq, "{}", event.message),
        EventLevel::Info => tracing::info!(engine, actor, seq = event.seq, "{}", event.message),
        EventLevel::Warn => tracing::warn!(engine, actor, seq = event.seq, "{}", event.message),
        EventLevel::Error => tracing::error!(engine, actor, seq = event.seq, "{}", event.message),
    }
}

/// A subscription to an engine's events.
///
/// Iterating blocks until the next event arrives and ends once the bus is
/// dropped. Dropping the stream unsubscribes it on the next publish.
#[derive(Debug)]
pub struct EventStream {
    rx: Receiver<SimEvent>,
}

impl EventStream {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> SimResult<SimEvent> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> SimResult<SimEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => SimError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Receive an already-buffered event without blocking.
    pub fn try_recv(&self) -> SimResult<Option<SimEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }

    /// Drains every event buffered so far.
    #[must_use]
    pub fn drain(&self) -> Vec<SimEvent> {
        self.rx.try_iter().collect()
    }
}

impl Iterator for EventStream {
    type Item = SimEvent;

    fn next(&mut self) -> Option<SimEvent> {
        self.rx.recv().ok()
    }
}

fn disconnected() -> SimError {
    SimError::Execution(ExecutionError::Disconnected {
        path: "event_stream".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    #[test]
    fn events_are_sequenced_and_fanned_out() {
        let bus = EventBus::new(EngineKind::ProducerConsumer);
        let a = bus.subscribe();
        let b = bus.subscribe();
        let run = RunId::new();

        bus.publish(EventLevel::Info, Some(run), None, "started");
        bus.publish(EventLevel::Debug, Some(run), Some("producer-0"), "produced item 1");

        let first = a.recv().unwrap();
        let second = a.recv().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.actor.as_deref(), Some("producer-0"));
        assert_eq!(second.run_id, Some(run));
        assert_eq!(b.drain().len(), 2);
    }

    #[test]
    fn full_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::with_capacity(EngineKind::DiningPhilosophers, 2);
        let stream = bus.subscribe();
        for i in 0..5 {
            bus.publish(EventLevel::Debug, None, None, format!("event {i}"));
        }
        assert_eq!(stream.drain().len(), 2);
        assert_eq!(bus.dropped_events(), 3);
    }

    #[test]
    fn concurrent_publishers_deliver_increasing_sequence() {
        let bus = Arc::new(EventBus::with_capacity(EngineKind::DiningPhilosophers, 1 << 16));
        let stream = bus.subscribe();
        let publishers: Vec<_> = (0..8)
            .map(|t| {
                let bus = Arc::clone(&bus);
                thread::spawn(move || {
                    let actor = format!("P{t}");
                    for i in 0..4_000 {
                        bus.publish(EventLevel::Debug, None, Some(&actor), format!("step {i}"));
                    }
                })
            })
            .collect();
        for publisher in publishers {
            publisher.join().unwrap();
        }

        let seqs: Vec<u64> = stream.drain().into_iter().map(|e| e.seq).collect();
        assert_eq!(seqs.len(), 32_000);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(bus.dropped_events(), 0);
    }

    #[test]
    fn dropped_stream_is_unsubscribed() {
        let bus = EventBus::new(EngineKind::ReadersWriters);
        let stream = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(stream);
        bus.publish(EventLevel::Info, None, None, "anyone there?");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn stream_ends_when_bus_is_dropped() {
        let bus = EventBus::new(EngineKind::ReadersWriters);
        let mut stream = bus.subscribe();
        bus.publish(EventLevel::Info, None, None, "last words");
        drop(bus);

        assert_eq!(stream.next().map(|e| e.message), Some("last words".to_string()));
        assert!(stream.next().is_none());
        assert!(stream.recv().is_err());
    }

    #[test]
    fn recv_timeout_reports_timeout() {
        let bus = EventBus::new(EngineKind::ReadersWriters);
        let stream = bus.subscribe();
        let err = stream.recv_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn event_serializes_to_json() {
        let bus = EventBus::new(EngineKind::DiningPhilosophers);
        let stream = bus.subscribe();
        bus.publish(EventLevel::Warn, None, None, "deadlock suspected");
        let json = serde_json::to_value(stream.recv().unwrap()).unwrap();
        assert_eq!(json["engine"], "dining-philosophers");
        assert_eq!(json["level"], "warn");
    }

    #[test]
    fn display_names_actor_when_present() {
        let bus = EventBus::new(EngineKind::ReadersWriters);
        let stream = bus.subscribe();
        bus.publish(EventLevel::Info, None, Some("writer-1"), "writing");
        bus.publish(EventLevel::Info, None, None, "simulation paused");

        let line = stream.recv().unwrap().to_string();
        assert!(line.starts_with("#1 "));
        assert!(line.contains("[readers-writers]"));
        assert!(line.ends_with("writer-1: writing"));
        assert!(stream.recv().unwrap().to_string().ends_with(" simulation paused"));
    }
}
