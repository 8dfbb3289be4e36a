//! Bounded Buffer Engine (producer-consumer).
//!
//! A fixed-capacity circular buffer shared by producers and consumers. The
//! `empty_slots` semaphore (initially `C`) and the `full_slots` semaphore
//! (initially 0) bound how far `in` may run ahead of `out`. The buffer mutex
//! serialises every index update.
//!
//! A producer's `empty_slots` permit is handed over to `full_slots` once its
//! item is in the buffer; a consumer hands its `full_slots` permit back to
//! `empty_slots`. At every rest point `empty + full == C`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::controller::{ActorContext, ActorId, Role, Simulation, SimulationController};
use crate::error::{SimError, SimResult, ValidationError};
use crate::event::EngineKind;
use crate::sync::Semaphore;
use crate::timing::DelayRange;

/// One produced item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Sequence number, starting at 1.
    pub id: u64,
    /// Index of the producer that made it.
    pub producer: usize,
    /// When it was produced.
    pub produced_at: DateTime<Utc>,
}

/// What a producer or consumer is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Simulated work outside the buffer.
    Idle,
    /// Blocked on a slot semaphore.
    Waiting,
    /// Moving an item into or out of the buffer.
    Transferring,
}

/// Simulated-work delays of the buffer engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferTiming {
    pub produce: DelayRange,
    pub consume: DelayRange,
}

impl Default for BufferTiming {
    fn default() -> Self {
        Self {
            produce: DelayRange::new(200, 1000),
            consume: DelayRange::new(200, 1000),
        }
    }
}

/// Buffer engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Number of slots. At least 1.
    pub capacity: usize,
    /// Number of producers. At least 1.
    pub producers: usize,
    /// Number of consumers. At least 1.
    pub consumers: usize,
    /// Simulated-work delays.
    pub timing: BufferTiming,
    /// When set, production stops after this many items in total and
    /// consumption stops once as many have been consumed.
    pub item_limit: Option<u64>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            producers: 1,
            consumers: 1,
            timing: BufferTiming::default(),
            item_limit: None,
        }
    }
}

impl BufferConfig {
    /// Checks counts and delay ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, actual) in [
            ("capacity", self.capacity),
            ("producers", self.producers),
            ("consumers", self.consumers),
        ] {
            if actual < 1 {
                return Err(ValidationError::TooSmall {
                    field: field.to_string(),
                    min: 1,
                    actual,
                });
            }
        }
        self.timing.produce.validate("produce")?;
        self.timing.consume.validate("consume")?;
        Ok(())
    }
}

/// Point-in-time view of the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    /// Slot contents by index, as item ids.
    pub slots: Vec<Option<u64>>,
    /// Next slot a producer writes.
    pub in_index: usize,
    /// Next slot a consumer reads.
    pub out_index: usize,
    /// Slots currently holding an item.
    pub occupied: usize,
    /// Number of slots.
    pub capacity: usize,
    /// Available `empty_slots` permits.
    pub empty_permits: usize,
    /// Available `full_slots` permits.
    pub full_permits: usize,
    /// Items written so far.
    pub produced: u64,
    /// Items taken so far.
    pub consumed: u64,
    /// Producer states by index.
    pub producers: Vec<WorkerState>,
    /// Consumer states by index.
    pub consumers: Vec<WorkerState>,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Item>>,
    in_index: usize,
    out_index: usize,
    occupied: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            in_index: 0,
            out_index: 0,
            occupied: 0,
        }
    }

    fn put(&mut self, item: Item) -> SimResult<usize> {
        let at = self.in_index;
        if self.occupied >= self.slots.len() {
            return Err(SimError::invariant(
                EngineKind::ProducerConsumer,
                format!("write into a full buffer ({} of {} occupied)", self.occupied, self.slots.len()),
            ));
        }
        if let Some(existing) = &self.slots[at] {
            return Err(SimError::invariant(
                EngineKind::ProducerConsumer,
                format!("item {} would overwrite unconsumed item {} in slot {at}", item.id, existing.id),
            ));
        }
        self.slots[at] = Some(item);
        self.in_index = (at + 1) % self.slots.len();
        self.occupied += 1;
        Ok(at)
    }

    fn take(&mut self) -> SimResult<(usize, Item)> {
        let at = self.out_index;
        let Some(item) = self.slots[at].take() else {
            return Err(SimError::invariant(
                EngineKind::ProducerConsumer,
                format!("read of empty slot {at} ({} occupied)", self.occupied),
            ));
        };
        self.out_index = (at + 1) % self.slots.len();
        self.occupied -= 1;
        Ok((at, item))
    }
}

/// The buffer engine driven by a [`ProducerConsumerSim`] controller.
#[derive(Debug)]
pub struct BoundedBuffer {
    config: BufferConfig,
    ring: Mutex<Ring>,
    empty_slots: Semaphore,
    full_slots: Semaphore,
    next_item: AtomicU64,
    consume_claims: AtomicU64,
    produced: AtomicU64,
    consumed: AtomicU64,
    producer_states: Mutex<Vec<WorkerState>>,
    consumer_states: Mutex<Vec<WorkerState>>,
}

impl BoundedBuffer {
    /// Produces item `id` on behalf of producer `producer`: waits for an
    /// empty slot, writes the item at `in` and signals a full slot. Returns
    /// the slot index written.
    pub fn produce(&self, producer: usize, id: u64) -> SimResult<usize> {
        let slot = self.empty_slots.acquire()?;
        self.set_state(&self.producer_states, producer, WorkerState::Transferring);
        let at = {
            let mut ring = self.ring()?;
            let at = ring.put(Item {
                id,
                producer,
                produced_at: Utc::now(),
            })?;
            self.produced.fetch_add(1, Ordering::AcqRel);
            at
        };
        slot.forget();
        self.full_slots.release();
        Ok(at)
    }

    /// Consumes one item on behalf of consumer `consumer`: waits for a full
    /// slot, takes the item at `out` and signals an empty slot. Returns the
    /// slot index read and the item.
    pub fn consume(&self, consumer: usize) -> SimResult<(usize, Item)> {
        let slot = self.full_slots.acquire()?;
        self.set_state(&self.consumer_states, consumer, WorkerState::Transferring);
        let taken = {
            let mut ring = self.ring()?;
            let taken = ring.take()?;
            self.consumed.fetch_add(1, Ordering::AcqRel);
            taken
        };
        slot.forget();
        self.empty_slots.release();
        Ok(taken)
    }

    fn run_producer(&self, index: usize, ctx: &ActorContext) -> SimResult<()> {
        loop {
            ctx.checkpoint()?;
            let id = self.next_item.fetch_add(1, Ordering::AcqRel) + 1;
            if self.config.item_limit.is_some_and(|limit| id > limit) {
                self.set_state(&self.producer_states, index, WorkerState::Idle);
                return Ok(());
            }

            ctx.debug(format!("ready to produce item {id}"));
            self.set_state(&self.producer_states, index, WorkerState::Waiting);
            let result = self.produce(index, id);
            self.set_state(&self.producer_states, index, WorkerState::Idle);
            let at = result?;
            ctx.info(format!("produced item {id} into slot {at}"));

            ctx.delay(&self.config.timing.produce)?;
        }
    }

    fn run_consumer(&self, index: usize, ctx: &ActorContext) -> SimResult<()> {
        loop {
            ctx.checkpoint()?;
            let claim = self.consume_claims.fetch_add(1, Ordering::AcqRel) + 1;
            if self.config.item_limit.is_some_and(|limit| claim > limit) {
                return Ok(());
            }

            ctx.debug("ready to consume");
            self.set_state(&self.consumer_states, index, WorkerState::Waiting);
            let result = self.consume(index);
            self.set_state(&self.consumer_states, index, WorkerState::Idle);
            let (at, item) = result?;
            ctx.info(format!("consumed item {} from slot {at}", item.id));

            ctx.delay(&self.config.timing.consume)?;
        }
    }

    fn set_state(&self, states: &Mutex<Vec<WorkerState>>, index: usize, state: WorkerState) {
        if let Some(slot) = lock(states).get_mut(index) {
            *slot = state;
        }
    }

    fn ring(&self) -> SimResult<MutexGuard<'_, Ring>> {
        self.ring
            .lock()
            .map_err(|_| SimError::internal("poisoned lock: buffer.ring"))
    }
}

impl Simulation for BoundedBuffer {
    type Config = BufferConfig;
    type Snapshot = BufferSnapshot;

    const KIND: EngineKind = EngineKind::ProducerConsumer;

    fn build(config: &BufferConfig) -> SimResult<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            ring: Mutex::new(Ring::new(config.capacity)),
            empty_slots: Semaphore::new("empty-slots", config.capacity),
            full_slots: Semaphore::new("full-slots", 0),
            next_item: AtomicU64::new(0),
            consume_claims: AtomicU64::new(0),
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            producer_states: Mutex::new(vec![WorkerState::Idle; config.producers]),
            consumer_states: Mutex::new(vec![WorkerState::Idle; config.consumers]),
        })
    }

    fn describe(config: &BufferConfig) -> String {
        format!(
            "capacity {}, {} producer(s), {} consumer(s)",
            config.capacity, config.producers, config.consumers
        )
    }

    fn actors(&self) -> Vec<ActorId> {
        (0..self.config.producers)
            .map(|i| ActorId::new(Role::Producer, i))
            .chain((0..self.config.consumers).map(|i| ActorId::new(Role::Consumer, i)))
            .collect()
    }

    fn run_actor(&self, actor: ActorId, ctx: &ActorContext) -> SimResult<()> {
        match actor.role {
            Role::Consumer => self.run_consumer(actor.index, ctx),
            _ => self.run_producer(actor.index, ctx),
        }
    }

    fn abort_waits(&self) {
        self.empty_slots.close();
        self.full_slots.close();
    }

    fn restore(&self) {
        *lock(&self.ring) = Ring::new(self.config.capacity);
        self.ring.clear_poison();
        self.empty_slots.reset();
        self.full_slots.reset();
        self.next_item.store(0, Ordering::Release);
        self.consume_claims.store(0, Ordering::Release);
        self.produced.store(0, Ordering::Release);
        self.consumed.store(0, Ordering::Release);
        lock(&self.producer_states).fill(WorkerState::Idle);
        lock(&self.consumer_states).fill(WorkerState::Idle);
    }

    fn snapshot(&self) -> BufferSnapshot {
        let ring = lock(&self.ring);
        BufferSnapshot {
            slots: ring.slots.iter().map(|s| s.as_ref().map(|item| item.id)).collect(),
            in_index: ring.in_index,
            out_index: ring.out_index,
            occupied: ring.occupied,
            capacity: ring.slots.len(),
            empty_permits: self.empty_slots.available_permits(),
            full_permits: self.full_slots.available_permits(),
            produced: self.produced.load(Ordering::Acquire),
            consumed: self.consumed.load(Ordering::Acquire),
            producers: lock(&self.producer_states).clone(),
            consumers: lock(&self.consumer_states).clone(),
        }
    }
}

// Restore and snapshot must work even after a worker panicked mid-update;
// restore overwrites the ring wholesale.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controller for the buffer engine.
pub type ProducerConsumerSim = SimulationController<BoundedBuffer>;

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn buffer(capacity: usize) -> BoundedBuffer {
        BoundedBuffer::build(&BufferConfig {
            capacity,
            ..BufferConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn produce_and_consume_walk_the_ring() {
        let buf = buffer(3);
        assert_eq!(buf.produce(0, 1).unwrap(), 0);
        assert_eq!(buf.produce(0, 2).unwrap(), 1);
        let snapshot = buf.snapshot();
        assert_eq!(snapshot.slots, vec![Some(1), Some(2), None]);
        assert_eq!((snapshot.empty_permits, snapshot.full_permits), (1, 2));

        let (at, item) = buf.consume(0).unwrap();
        assert_eq!((at, item.id), (0, 1));
        assert_eq!(buf.produce(0, 3).unwrap(), 2);
        assert_eq!(buf.produce(0, 4).unwrap(), 0);

        let snapshot = buf.snapshot();
        assert_eq!(snapshot.occupied, 3);
        assert_eq!(snapshot.in_index, 1);
        assert_eq!(snapshot.out_index, 1);
        assert_eq!(snapshot.empty_permits + snapshot.full_permits, 3);
    }

    #[test]
    fn producer_blocks_on_full_buffer_until_consumed() {
        let buf = Arc::new(buffer(1));
        buf.produce(0, 1).unwrap();

        let producer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || buf.produce(0, 2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(buf.snapshot().slots, vec![Some(1)]);

        assert_eq!(buf.consume(0).unwrap().1.id, 1);
        assert_eq!(producer.join().unwrap().unwrap(), 0);
        assert_eq!(buf.snapshot().slots, vec![Some(2)]);
    }

    #[test]
    fn aborted_consumer_wait_takes_nothing() {
        let buf = Arc::new(buffer(2));
        let consumer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || buf.consume(0))
        };
        thread::sleep(Duration::from_millis(20));
        buf.abort_waits();

        assert!(consumer.join().unwrap().unwrap_err().is_cancellation());
        let snapshot = buf.snapshot();
        assert_eq!(snapshot.full_permits, 0);
        assert_eq!(snapshot.empty_permits, 2);
        assert_eq!(snapshot.consumed, 0);
    }

    #[test]
    fn overwrite_is_an_invariant_violation() {
        let mut ring = Ring::new(2);
        ring.slots[0] = Some(Item {
            id: 7,
            producer: 0,
            produced_at: Utc::now(),
        });
        let err = ring
            .put(Item {
                id: 8,
                producer: 0,
                produced_at: Utc::now(),
            })
            .unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(err.to_string().contains("unconsumed item 7"));
    }

    #[test]
    fn empty_read_is_an_invariant_violation() {
        let mut ring = Ring::new(2);
        assert!(ring.take().unwrap_err().is_invariant_violation());
    }

    #[test]
    fn restore_returns_to_initial_state() {
        let buf = buffer(4);
        buf.produce(0, 1).unwrap();
        buf.produce(0, 2).unwrap();
        buf.consume(0).unwrap();
        buf.abort_waits();

        buf.restore();
        let snapshot = buf.snapshot();
        assert_eq!(snapshot.slots, vec![None; 4]);
        assert_eq!((snapshot.in_index, snapshot.out_index, snapshot.occupied), (0, 0, 0));
        assert_eq!((snapshot.empty_permits, snapshot.full_permits), (4, 0));
        assert_eq!((snapshot.produced, snapshot.consumed), (0, 0));
        assert_eq!(buf.produce(0, 1).unwrap(), 0);
    }

    #[test]
    fn config_validation() {
        let config = BufferConfig {
            consumers: 0,
            ..BufferConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::TooSmall { ref field, .. }) if field == "consumers"
        ));
    }
}
