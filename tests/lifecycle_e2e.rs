use std::thread;
use std::time::{Duration, Instant};

use syncsim::{
    BufferConfig, BufferTiming, DelayRange, DiningConfig, DiningStrategy, DiningTable,
    DiningTiming, EventLevel, Phase, PhilosopherState, ProducerConsumerSim, ReadersWritersConfig,
    ReadersWritersSim, Transition,
};

fn fast_dining() -> DiningConfig {
    DiningConfig {
        strategy: DiningStrategy::BoundedConcurrentDiners,
        timing: DiningTiming {
            think: DelayRange::new(1, 3),
            eat: DelayRange::new(1, 3),
            backoff: DelayRange::new(1, 2),
        },
        observer_interval_ms: 5,
        ..DiningConfig::default()
    }
}

#[test]
fn reset_is_idempotent_from_every_phase() {
    let table = DiningTable::new(fast_dining()).unwrap();
    assert_eq!(table.reset().unwrap(), Transition::NoOp);

    table.start().unwrap();
    thread::sleep(Duration::from_millis(30));
    table.pause().unwrap();
    assert_eq!(table.phase().unwrap(), Phase::Paused);
    assert_eq!(table.reset().unwrap(), Transition::Applied);
    assert_eq!(table.reset().unwrap(), Transition::NoOp);

    let state = table.snapshot().unwrap().state;
    assert_eq!(state.total_meals, 0);
    assert_eq!(state.deadlocks_observed, 0);
    assert!(state.forks.iter().all(|f| !f.taken && f.holder.is_none()));
    assert!(state
        .philosophers
        .iter()
        .all(|p| p.state == PhilosopherState::Thinking && p.eat_count == 0));

    // A fresh run starts from the restored state.
    table.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while table.snapshot().unwrap().state.total_meals == 0 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }
    table.reset().unwrap();
}

#[test]
fn pause_freezes_progress_until_resumed() {
    let sim = ProducerConsumerSim::new(BufferConfig {
        timing: BufferTiming {
            produce: DelayRange::new(1, 2),
            consume: DelayRange::new(1, 2),
        },
        ..BufferConfig::default()
    })
    .unwrap();

    assert_eq!(sim.pause().unwrap(), Transition::NoOp);
    sim.start().unwrap();
    assert_eq!(sim.start().unwrap(), Transition::NoOp);
    thread::sleep(Duration::from_millis(30));

    assert_eq!(sim.pause().unwrap(), Transition::Applied);
    thread::sleep(Duration::from_millis(30));
    let frozen = sim.snapshot().unwrap();
    thread::sleep(Duration::from_millis(60));
    let later = sim.snapshot().unwrap();
    assert_eq!(later.phase, Phase::Paused);
    assert_eq!(frozen.state.produced, later.state.produced);
    assert_eq!(frozen.state.consumed, later.state.consumed);
    assert_eq!(frozen.run_id, later.run_id);

    assert_eq!(sim.start().unwrap(), Transition::Applied);
    let deadline = Instant::now() + Duration::from_secs(10);
    while sim.snapshot().unwrap().state.produced == later.state.produced {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(sim.snapshot().unwrap().run_id, later.run_id);
    sim.reset().unwrap();
}

#[test]
fn invalid_configuration_is_rejected_without_touching_the_run() {
    let sim = ReadersWritersSim::new(ReadersWritersConfig::default()).unwrap();
    sim.start().unwrap();
    let run = sim.snapshot().unwrap().run_id;

    let err = sim
        .configure(ReadersWritersConfig {
            writers: 0,
            ..ReadersWritersConfig::default()
        })
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(sim.phase().unwrap(), Phase::Running);
    assert_eq!(sim.snapshot().unwrap().run_id, run);
    sim.reset().unwrap();

    assert!(DiningTable::new(DiningConfig {
        philosophers: 1,
        ..DiningConfig::default()
    })
    .unwrap_err()
    .is_validation());
}

#[test]
fn lifecycle_is_announced_on_the_event_stream() {
    let table = DiningTable::new(fast_dining()).unwrap();
    let events = table.events();
    table.start().unwrap();
    table.pause().unwrap();
    table.start().unwrap();
    table.reset().unwrap();

    let lifecycle: Vec<String> = events
        .drain()
        .into_iter()
        .filter(|e| e.actor.is_none() && e.level == EventLevel::Info)
        .map(|e| e.message)
        .collect();
    assert!(lifecycle[0].starts_with("simulation started"));
    assert_eq!(
        lifecycle[1..],
        ["simulation paused", "simulation resumed", "simulation reset"]
    );
}

#[test]
fn independent_engines_do_not_share_permits() {
    let a = DiningTable::new(fast_dining()).unwrap();
    let b = DiningTable::new(DiningConfig {
        philosophers: 3,
        ..fast_dining()
    })
    .unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let (sa, sb) = (a.snapshot().unwrap().state, b.snapshot().unwrap().state);
        if sa.total_meals >= 10 && sb.total_meals >= 10 {
            break;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }
    a.reset().unwrap();
    // Resetting one table leaves the other running.
    assert_eq!(b.phase().unwrap(), Phase::Running);
    b.reset().unwrap();
}
