use std::{
    sync::mpsc::{self, Receiver},
    time::{Duration, Instant},
};

use anyhow::Result;
use shoal::{
    Error, FailureReason, Genome, TaskFailure,
    aggregator::{GenomeState, Retry},
    config::CoordinatorConfig,
    protocol::{Message, Outcome},
    scheduler::{Disposition, Scheduler},
    session::RegisterError,
};

fn genomes(n: u64) -> Vec<Genome> {
    (0..n).map(|i| Genome::new(i, vec![i as u8; 4])).collect()
}

/// Tasks queued on a worker's outbox since the last call, as (task_id, genome_id)
fn tasks(rx: &Receiver<Message>) -> Vec<(u64, u64)> {
    rx.try_iter()
        .filter_map(|m| match m {
            Message::Task {
                task_id, genome_id, ..
            } => Some((task_id, genome_id)),
            _ => None,
        })
        .collect()
}

fn worker(
    sched: &mut Scheduler,
    name: &str,
    capacity: u32,
    now: Instant,
) -> Result<(u64, Receiver<Message>)> {
    let (tx, rx) = mpsc::channel();
    let sid = sched.register(name, capacity, tx, None, now)?;
    Ok((sid, rx))
}

#[test]
fn two_workers_four_genomes() -> Result<()> {
    let t0 = Instant::now();
    let mut sched = Scheduler::new(CoordinatorConfig::default());
    let (a, a_rx) = worker(&mut sched, "a", 1, t0)?;
    let (b, b_rx) = worker(&mut sched, "b", 1, t0)?;
    assert!(matches!(
        a_rx.try_recv()?,
        Message::HelloAck { assigned_id, .. } if assigned_id == a
    ));

    sched.begin_generation(&genomes(4), t0)?;
    let a1 = tasks(&a_rx);
    let b1 = tasks(&b_rx);
    assert_eq!(a1.len(), 1);
    assert_eq!(b1.len(), 1);
    assert_eq!(a1[0].1, 0);
    assert_eq!(b1[0].1, 1);

    // A finishes first and picks up the next pending genome
    let d = sched.on_result(a, a1[0].0, Outcome::Fitness(1.0), t0);
    assert_eq!(d, Disposition::Recorded);
    let a2 = tasks(&a_rx);
    assert_eq!(a2.len(), 1);
    assert_eq!(a2[0].1, 2);

    let d = sched.on_result(b, b1[0].0, Outcome::Fitness(2.0), t0);
    assert_eq!(d, Disposition::Recorded);
    let b2 = tasks(&b_rx);
    assert_eq!(b2[0].1, 3);

    assert!(sched.take_outcome(t0).is_none());
    sched.on_result(a, a2[0].0, Outcome::Fitness(3.0), t0);
    sched.on_result(b, b2[0].0, Outcome::Fitness(4.0), t0);

    let outcome = sched.take_outcome(t0).expect("generation should be complete");
    assert_eq!(outcome.len(), 4);
    assert!(outcome.failures.is_empty());
    assert!(!outcome.timed_out);
    assert_eq!(
        outcome.fitness.into_iter().collect::<Vec<_>>(),
        vec![(0, 1.0), (1, 2.0), (2, 3.0), (3, 4.0)]
    );
    assert!(sched.generation().is_none());

    Ok(())
}

#[test]
fn least_loaded_then_earliest_registration() -> Result<()> {
    let t0 = Instant::now();
    let mut sched = Scheduler::new(CoordinatorConfig::default());
    let (_, a_rx) = worker(&mut sched, "a", 2, t0)?;
    let (_, b_rx) = worker(&mut sched, "b", 1, t0)?;

    sched.begin_generation(&genomes(3), t0)?;
    let a_genomes = tasks(&a_rx).into_iter().map(|t| t.1).collect::<Vec<_>>();
    let b_genomes = tasks(&b_rx).into_iter().map(|t| t.1).collect::<Vec<_>>();
    assert_eq!(a_genomes, vec![0, 2]);
    assert_eq!(b_genomes, vec![1]);

    Ok(())
}

#[test]
fn stale_and_duplicate_results_are_discarded() -> Result<()> {
    let t0 = Instant::now();
    let mut sched = Scheduler::new(CoordinatorConfig::default());
    let (a, a_rx) = worker(&mut sched, "a", 1, t0)?;
    let (b, _b_rx) = worker(&mut sched, "b", 1, t0)?;

    sched.begin_generation(&genomes(2), t0)?;
    let (task_id, genome_id) = tasks(&a_rx)[0];

    // Wrong session, unknown task
    assert_eq!(
        sched.on_result(b, task_id, Outcome::Fitness(9.0), t0),
        Disposition::Stale
    );
    assert_eq!(
        sched.on_result(a, 12345, Outcome::Fitness(9.0), t0),
        Disposition::Stale
    );
    assert_eq!(
        sched.on_result(a, task_id, Outcome::Fitness(1.0), t0),
        Disposition::Recorded
    );
    assert_eq!(
        sched.on_result(a, task_id, Outcome::Fitness(7.0), t0),
        Disposition::Stale
    );

    let generation = sched.generation().expect("generation running");
    assert_eq!(generation.state_of(genome_id), Some(GenomeState::Completed));

    Ok(())
}

#[test]
fn silent_worker_loses_its_tasks() -> Result<()> {
    let t0 = Instant::now();
    let config = CoordinatorConfig {
        heartbeat_timeout_ms: 3000,
        ..Default::default()
    };
    let mut sched = Scheduler::new(config);
    let (a, a_rx) = worker(&mut sched, "a", 1, t0)?;
    let (b, b_rx) = worker(&mut sched, "b", 1, t0)?;

    sched.begin_generation(&genomes(2), t0)?;
    let (_, lost_genome) = tasks(&a_rx)[0];
    let (b_task, _) = tasks(&b_rx)[0];

    sched.touch(b, t0 + Duration::from_secs(2));
    sched.maint(t0 + Duration::from_millis(3500));

    assert!(sched.session(a).is_none());
    assert_eq!(sched.active_workers(), 1);
    let generation = sched.generation().expect("generation running");
    assert_eq!(generation.state_of(lost_genome), Some(GenomeState::Pending));

    // B frees its slot and takes over the orphan
    sched.on_result(b, b_task, Outcome::Fitness(0.5), t0 + Duration::from_secs(4));
    let retried = tasks(&b_rx);
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].1, lost_genome);
    let generation = sched.generation().expect("generation running");
    assert_eq!(generation.attempts(lost_genome), 2);

    sched.on_result(b, retried[0].0, Outcome::Fitness(0.25), t0 + Duration::from_secs(4));
    let outcome = sched
        .take_outcome(t0 + Duration::from_secs(4))
        .expect("generation should be complete");
    assert_eq!(outcome.fitness.get(&lost_genome), Some(&0.25));
    assert!(outcome.failures.is_empty());

    Ok(())
}

#[test]
fn retries_exhaust_into_sentinel() -> Result<()> {
    let t0 = Instant::now();
    let config = CoordinatorConfig {
        retry_limit: 2,
        ..Default::default()
    };
    let mut sched = Scheduler::new(config);
    let (a, a_rx) = worker(&mut sched, "a", 1, t0)?;

    sched.begin_generation(&genomes(1), t0)?;
    let (t1, _) = tasks(&a_rx)[0];
    assert_eq!(
        sched.on_result(a, t1, Outcome::Error("boom".to_string()), t0),
        Disposition::Failed(Retry::Requeued)
    );

    let (t2, _) = tasks(&a_rx)[0];
    assert_ne!(t1, t2);
    assert_eq!(
        sched.on_result(a, t2, Outcome::Error("boom".to_string()), t0),
        Disposition::Failed(Retry::Exhausted)
    );
    assert!(tasks(&a_rx).is_empty());

    let outcome = sched.take_outcome(t0).expect("generation should be complete");
    assert_eq!(outcome.fitness.get(&0), Some(&f64::NEG_INFINITY));
    assert!(outcome.is_sentinel(0));
    assert_eq!(
        outcome.failures.get(&0),
        Some(&FailureReason::RetryExhausted {
            attempts: 2,
            last: TaskFailure::Evaluation("boom".to_string()),
        })
    );
    assert_eq!(outcome.evaluated().count(), 0);

    Ok(())
}

#[test]
fn non_finite_fitness_is_a_failed_attempt() -> Result<()> {
    let t0 = Instant::now();
    let mut sched = Scheduler::new(CoordinatorConfig::default());
    let (a, a_rx) = worker(&mut sched, "a", 1, t0)?;

    sched.begin_generation(&genomes(1), t0)?;
    let (t1, _) = tasks(&a_rx)[0];
    assert_eq!(
        sched.on_result(a, t1, Outcome::Fitness(f64::NAN), t0),
        Disposition::Failed(Retry::Requeued)
    );
    let (t2, _) = tasks(&a_rx)[0];
    sched.on_result(a, t2, Outcome::Fitness(3.0), t0);

    let outcome = sched.take_outcome(t0).expect("generation should be complete");
    assert_eq!(outcome.fitness.get(&0), Some(&3.0));

    Ok(())
}

#[test]
fn overdue_task_is_revoked_and_retried() -> Result<()> {
    let t0 = Instant::now();
    let config = CoordinatorConfig {
        task_timeout_ms: 1000,
        ..Default::default()
    };
    let mut sched = Scheduler::new(config);
    let (a, a_rx) = worker(&mut sched, "a", 1, t0)?;

    sched.begin_generation(&genomes(1), t0)?;
    let (t1, _) = tasks(&a_rx)[0];

    let t = t0 + Duration::from_millis(1500);
    sched.touch(a, t);
    sched.maint(t);

    // Slot freed and the genome handed out again
    let (t2, g) = tasks(&a_rx)[0];
    assert_eq!(g, 0);
    assert_ne!(t1, t2);
    assert!(!sched.session(a).is_some_and(|s| s.holds(t1)));

    // The late answer to the first attempt does not count
    assert_eq!(
        sched.on_result(a, t1, Outcome::Fitness(100.0), t),
        Disposition::Stale
    );
    sched.on_result(a, t2, Outcome::Fitness(1.0), t);
    let outcome = sched.take_outcome(t).expect("generation should be complete");
    assert_eq!(outcome.fitness.get(&0), Some(&1.0));

    Ok(())
}

#[test]
fn expiry_fills_sentinels() -> Result<()> {
    let t0 = Instant::now();
    let mut sched = Scheduler::new(CoordinatorConfig::default());
    let (a, a_rx) = worker(&mut sched, "a", 1, t0)?;

    sched.begin_generation(&genomes(3), t0)?;
    let (t1, _) = tasks(&a_rx)[0];
    sched.on_result(a, t1, Outcome::Fitness(1.0), t0);

    sched.expire_generation();
    let outcome = sched.take_outcome(t0).expect("expired generation is complete");
    assert!(outcome.timed_out);
    assert_eq!(outcome.len(), 3);
    assert_eq!(outcome.fitness.get(&0), Some(&1.0));
    assert_eq!(outcome.failures.get(&1), Some(&FailureReason::GenerationTimeout));
    assert_eq!(outcome.failures.get(&2), Some(&FailureReason::GenerationTimeout));
    assert_eq!(sched.session(a).map(|s| s.in_flight_count()), Some(0));

    Ok(())
}

#[test]
fn no_workers_is_an_error() -> Result<()> {
    let t0 = Instant::now();
    let mut sched = Scheduler::new(CoordinatorConfig::default());

    assert!(matches!(
        sched.begin_generation(&genomes(3), t0),
        Err(Error::NoWorkersAvailable)
    ));
    assert!(matches!(
        sched.begin_generation(&[], t0),
        Err(Error::NoWorkersAvailable)
    ));
    assert!(sched.generation().is_none());

    Ok(())
}

#[test]
fn empty_generation_completes_immediately() -> Result<()> {
    let t0 = Instant::now();
    let mut sched = Scheduler::new(CoordinatorConfig::default());
    let (_, _a_rx) = worker(&mut sched, "a", 1, t0)?;

    sched.begin_generation(&[], t0)?;
    let outcome = sched.take_outcome(t0).expect("empty generation is complete");
    assert!(outcome.is_empty());

    Ok(())
}

#[test]
fn one_generation_at_a_time() -> Result<()> {
    let t0 = Instant::now();
    let mut sched = Scheduler::new(CoordinatorConfig::default());
    let (_, _a_rx) = worker(&mut sched, "a", 1, t0)?;

    let dupes = vec![Genome::new(1, vec![]), Genome::new(1, vec![])];
    assert!(matches!(
        sched.begin_generation(&dupes, t0),
        Err(Error::DuplicateGenome(1))
    ));

    assert_eq!(sched.begin_generation(&genomes(2), t0)?, 0);
    assert!(matches!(
        sched.begin_generation(&genomes(2), t0),
        Err(Error::GenerationInProgress)
    ));

    Ok(())
}

#[test]
fn registration_rules() -> Result<()> {
    let t0 = Instant::now();
    let config = CoordinatorConfig {
        max_capacity: 4,
        ..Default::default()
    };
    let mut sched = Scheduler::new(config);

    let (tx, _rx) = mpsc::channel();
    assert_eq!(
        sched.register("zero", 0, tx, None, t0),
        Err(RegisterError::ZeroCapacity)
    );
    assert_eq!(sched.active_workers(), 0);

    let (a, _a_rx) = worker(&mut sched, "a", 100, t0)?;
    assert_eq!(sched.session(a).map(|s| s.capacity()), Some(4));

    let (tx, _rx) = mpsc::channel();
    assert_eq!(
        sched.register("a", 1, tx, None, t0),
        Err(RegisterError::DuplicateId("a".to_string()))
    );

    // Once the first `a` is gone the id is free again
    sched.session_died(a, TaskFailure::Disconnected, t0);
    let (a2, _a2_rx) = worker(&mut sched, "a", 1, t0)?;
    assert_ne!(a, a2);
    assert_eq!(sched.active_workers(), 1);

    Ok(())
}

#[test]
fn losing_every_worker_leaves_genomes_pending() -> Result<()> {
    let t0 = Instant::now();
    let mut sched = Scheduler::new(CoordinatorConfig::default());
    let (a, a_rx) = worker(&mut sched, "a", 2, t0)?;

    sched.begin_generation(&genomes(2), t0)?;
    assert_eq!(tasks(&a_rx).len(), 2);
    sched.session_died(a, TaskFailure::Disconnected, t0);

    let generation = sched.generation().expect("generation running");
    assert_eq!(generation.pending_count(), 2);
    assert_eq!(generation.in_flight_count(), 0);

    // A new worker picks the work back up
    let (_, b_rx) = worker(&mut sched, "b", 2, t0)?;
    assert_eq!(tasks(&b_rx).len(), 2);

    Ok(())
}
