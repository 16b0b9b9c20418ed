use std::thread;

use anyhow::Result;
use shoal::{
    Agent, AgentConfig, Coordinator, CoordinatorConfig, Evolver, GenerationOutcome, Genome,
    Trainer, TrainerConfig, trainer::FinishReason,
};

/// Shifts every genome's single byte up by one and gives it a fresh id
struct Increment {
    next_id: u64,
    calls: usize,
}

impl Evolver for Increment {
    fn evolve(
        &mut self,
        population: Vec<Genome>,
        outcome: &GenerationOutcome,
    ) -> Result<Vec<Genome>> {
        assert_eq!(outcome.len(), population.len());
        self.calls += 1;
        Ok(population
            .into_iter()
            .map(|g| {
                self.next_id += 1;
                Genome::new(self.next_id, vec![g.payload[0] + 1])
            })
            .collect())
    }
}

fn setup() -> Result<(Coordinator, thread::JoinHandle<Result<()>>)> {
    let coord = Coordinator::bind(CoordinatorConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        heartbeat_interval_ms: 100,
        heartbeat_timeout_ms: 1000,
        ..Default::default()
    })?;
    let agent = Agent::new(
        AgentConfig {
            coordinator: coord.local_addr().to_string(),
            worker_id: Some("trainer-test".to_string()),
            capacity: 2,
            heartbeat_interval_ms: 100,
            coordinator_ttl_ms: 2000,
            backoff_min_ms: 50,
            backoff_max_ms: 200,
            ..Default::default()
        },
        |_: u64, payload: &[u8]| -> Result<f64> { Ok(payload[0] as f64) },
    );
    let thread = thread::spawn(move || agent.run());
    Ok((coord, thread))
}

fn population() -> Vec<Genome> {
    (0..6).map(|i| Genome::new(1000 + i, vec![i as u8])).collect()
}

#[test]
fn runs_every_generation() -> Result<()> {
    let (coord, agent) = setup()?;
    let trainer = Trainer::new(TrainerConfig {
        generations: 3,
        worker_wait_ms: 5000,
        generation_timeout_ms: 10_000,
        ..Default::default()
    });
    let mut evolver = Increment {
        next_id: 0,
        calls: 0,
    };

    let report = trainer.run(&coord, &mut evolver, population())?;
    assert_eq!(report.finish_reason, FinishReason::Generations);
    assert_eq!(report.history.len(), 3);
    assert_eq!(evolver.calls, 2);

    // Every generation scores one higher than the last
    let best = report
        .history
        .iter()
        .map(|e| e.map(|e| e.best_fitness))
        .collect::<Vec<_>>();
    assert_eq!(best, vec![Some(5.0), Some(6.0), Some(7.0)]);
    assert_eq!(report.best_fitness(), Some(7.0));
    assert_eq!(report.last_outcome.len(), 6);
    assert_eq!(report.population[0].payload, vec![2]);

    coord.shutdown();
    assert!(agent.join().is_ok_and(|r| r.is_ok()));

    Ok(())
}

#[test]
fn stops_at_fitness_threshold() -> Result<()> {
    let (coord, agent) = setup()?;
    let trainer = Trainer::new(TrainerConfig {
        generations: 10,
        fitness_threshold: Some(6.0),
        worker_wait_ms: 5000,
        generation_timeout_ms: 10_000,
        ..Default::default()
    });
    let mut evolver = Increment {
        next_id: 0,
        calls: 0,
    };

    let report = trainer.run(&coord, &mut evolver, population())?;
    assert_eq!(report.finish_reason, FinishReason::Threshold);
    assert_eq!(report.history.len(), 2);
    assert_eq!(evolver.calls, 1);

    coord.shutdown();
    assert!(agent.join().is_ok_and(|r| r.is_ok()));

    Ok(())
}

#[test]
fn gives_up_without_workers() -> Result<()> {
    let coord = Coordinator::bind(CoordinatorConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    })?;
    let trainer = Trainer::new(TrainerConfig {
        worker_wait_ms: 200,
        ..Default::default()
    });
    let mut evolver = Increment {
        next_id: 0,
        calls: 0,
    };

    assert!(trainer.run(&coord, &mut evolver, population()).is_err());
    assert_eq!(evolver.calls, 0);

    // Nothing to wait for with no genomes
    assert!(trainer.run(&coord, &mut evolver, vec![]).is_err());

    Ok(())
}
