use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::{
    Error, Genome,
    aggregator::GenerationOutcome,
    config::TrainerConfig,
    coordinator::Coordinator,
    util::PopEvaluation,
};

/// The genetic step between two generations. Opaque to the coordinator:
/// it gets the evaluated population and returns the next one.
pub trait Evolver {
    fn evolve(&mut self, population: Vec<Genome>, outcome: &GenerationOutcome)
    -> Result<Vec<Genome>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum FinishReason {
    #[strum(to_string = "generation limit")]
    Generations,
    #[strum(to_string = "fitness threshold")]
    Threshold,
}

#[derive(Debug)]
pub struct TrainingReport {
    pub finish_reason: FinishReason,
    /// One entry per evaluated generation; `None` where every genome failed
    pub history: Vec<Option<PopEvaluation>>,
    /// Outcome of the last evaluated generation
    pub last_outcome: GenerationOutcome,
    /// The population `last_outcome` scored
    pub population: Vec<Genome>,
}

impl TrainingReport {
    pub fn best_fitness(&self) -> Option<f64> {
        self.history
            .iter()
            .flatten()
            .map(|e| e.best_fitness)
            .reduce(f64::max)
    }
}

/// Drives the generational loop on top of a [`Coordinator`]
pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn run<E: Evolver>(
        &self,
        coordinator: &Coordinator,
        evolver: &mut E,
        mut population: Vec<Genome>,
    ) -> Result<TrainingReport> {
        self.config.validate()?;
        if population.is_empty() {
            bail!("Initial population is empty");
        }

        self.await_workers(coordinator)?;

        let mut history = Vec::with_capacity(self.config.generations);
        let mut finish_reason = FinishReason::Generations;
        let mut g = 1;
        let last_outcome = loop {
            let outcome = self.evaluate(coordinator, &population)?;
            let evaluation = PopEvaluation::from_scores(outcome.evaluated().map(|(_, f)| f));
            history.push(evaluation);

            match evaluation {
                Some(e) => info!(
                    "📈 Generation {}/{}: best {:.4}, avg {:.4}",
                    g, self.config.generations, e.best_fitness, e.avg_fitness
                ),
                None => warn!(
                    "Generation {}/{}: no genome was evaluated successfully",
                    g, self.config.generations
                ),
            }

            if let Some(f) = self.config.fitness_threshold
                && evaluation.is_some_and(|e| e.best_fitness >= f)
            {
                info!("Population reached fitness threshold. Ending training.");
                finish_reason = FinishReason::Threshold;
                break outcome;
            }
            if g >= self.config.generations {
                break outcome;
            }

            population = evolver
                .evolve(population, &outcome)
                .with_context(|| format!("Evolution failed after generation {}", g))?;
            if population.is_empty() {
                bail!("Evolver returned an empty population after generation {}", g);
            }
            g += 1;
        };

        info!("🧪 Finished training ({}) after {} generations", finish_reason, g);
        Ok(TrainingReport {
            finish_reason,
            history,
            last_outcome,
            population,
        })
    }

    fn await_workers(&self, coordinator: &Coordinator) -> Result<()> {
        let n = self.config.min_workers;
        if coordinator.active_workers() >= n {
            return Ok(());
        }

        info!(
            "⏳ Waiting up to {:?} for {} worker(s) on {}",
            self.config.worker_wait(),
            n,
            coordinator.local_addr()
        );
        if !coordinator.wait_for_workers(n, self.config.worker_wait()) {
            bail!(
                "Timed out after {:?} waiting for {} worker(s)",
                self.config.worker_wait(),
                n
            );
        }
        Ok(())
    }

    /// Evaluate one generation, waiting for workers to come back if all of
    /// them are gone rather than making up fitness values.
    fn evaluate(
        &self,
        coordinator: &Coordinator,
        population: &[Genome],
    ) -> Result<GenerationOutcome> {
        loop {
            match coordinator.evaluate_generation(population, self.config.generation_timeout()) {
                Ok(outcome) => return Ok(outcome),
                Err(Error::NoWorkersAvailable) => {
                    warn!("No workers connected");
                    self.await_workers(coordinator)?;
                }
                Err(e) => return Err(e).context("Failed to evaluate generation"),
            }
        }
    }
}
