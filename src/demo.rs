//! Toy population and fitness so `shoal coordinator` and `shoal worker`
//! can run end to end: genomes are JSON vectors of f64 weights, fitness is
//! the negated sphere function, so the optimum is 0 at the origin.

use anyhow::{Result, bail};
use rand::{Rng, seq::IndexedRandom};
use rand_distr::{Bernoulli, Distribution, StandardNormal};
use shoal::{Evolver, GenerationOutcome, Genome, GenomeId, TrainerConfig};

pub fn sphere(_genome_id: GenomeId, payload: &[u8]) -> Result<f64> {
    let weights: Vec<f64> = serde_json::from_slice(payload)?;
    if weights.is_empty() {
        bail!("Genome has no weights");
    }
    Ok(-weights.iter().map(|w| w * w).sum::<f64>())
}

/// Elitism plus gaussian mutation
pub struct DemoEvolver {
    genome_len: usize,
    elitism_fraction: f64,
    mutation_probability: f64,
    mutation_magnitude: f64,
    next_id: GenomeId,
}

impl DemoEvolver {
    pub fn new(config: &TrainerConfig) -> Self {
        Self {
            genome_len: config.genome_len,
            elitism_fraction: config.elitism_fraction,
            mutation_probability: config.mutation_probability,
            mutation_magnitude: config.mutation_magnitude,
            next_id: 0,
        }
    }

    /// A population of `size` genomes with standard normal weights
    pub fn random_population(&mut self, size: usize) -> Result<Vec<Genome>> {
        let mut rng = rand::rng();
        (0..size)
            .map(|_| {
                let weights = (0..self.genome_len)
                    .map(|_| rng.sample::<f64, _>(StandardNormal))
                    .collect::<Vec<_>>();
                self.pack(&weights)
            })
            .collect()
    }

    fn pack(&mut self, weights: &[f64]) -> Result<Genome> {
        let id = self.next_id;
        self.next_id += 1;
        Ok(Genome::new(id, serde_json::to_vec(weights)?))
    }

    fn mutate(&self, weights: &mut [f64], rng: &mut impl Rng) -> Result<()> {
        let bern = Bernoulli::new(self.mutation_probability)?;
        for w in weights.iter_mut() {
            if bern.sample(rng) {
                let noise: f64 = StandardNormal.sample(rng);
                *w += noise * self.mutation_magnitude;
            }
        }
        Ok(())
    }
}

impl Evolver for DemoEvolver {
    fn evolve(
        &mut self,
        population: Vec<Genome>,
        outcome: &GenerationOutcome,
    ) -> Result<Vec<Genome>> {
        let size = population.len();
        let mut ranked = population
            .iter()
            .map(|g| {
                let fitness = outcome.fitness.get(&g.id).copied().unwrap_or(f64::NEG_INFINITY);
                let weights: Vec<f64> = serde_json::from_slice(&g.payload)?;
                Ok((fitness, weights))
            })
            .collect::<Result<Vec<_>>>()?;
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        let n_elite = ((size as f64 * self.elitism_fraction).floor() as usize).clamp(1, size);
        let elites = ranked
            .into_iter()
            .take(n_elite)
            .map(|(_, w)| w)
            .collect::<Vec<_>>();

        let mut rng = rand::rng();
        let mut next = Vec::with_capacity(size);
        for w in &elites {
            next.push(self.pack(w)?);
        }
        while next.len() < size {
            let Some(parent) = elites.choose(&mut rng) else {
                bail!("No elites to breed from");
            };
            let mut child = parent.clone();
            self.mutate(&mut child, &mut rng)?;
            next.push(self.pack(&child)?);
        }

        Ok(next)
    }
}
