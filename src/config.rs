use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bail_assert;

/// Most evaluation threads a single worker will run
pub const MAX_WORKER_CAPACITY: u32 = 1024;

/// Master side: where to listen and how to judge workers
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub host: String,
    /// 0 lets the OS pick a port
    pub port: u16,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub task_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub retry_limit: u32,
    /// Fitness recorded for genomes that could not be evaluated
    pub sentinel_fitness: f64,
    /// Upper bound on the capacity a worker may declare
    pub max_capacity: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5556,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
            task_timeout_ms: 60_000,
            handshake_timeout_ms: 5000,
            retry_limit: 3,
            sentinel_fitness: f64::NEG_INFINITY,
            max_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> crate::Result<()> {
        bail_assert!(!self.host.trim().is_empty(), "coordinator.host must not be empty");
        bail_assert!(
            self.heartbeat_interval_ms > 0,
            "coordinator.heartbeat_interval_ms must be greater than 0"
        );
        bail_assert!(
            self.heartbeat_timeout_ms > self.heartbeat_interval_ms,
            "coordinator.heartbeat_timeout_ms must exceed coordinator.heartbeat_interval_ms"
        );
        bail_assert!(
            self.task_timeout_ms > 0,
            "coordinator.task_timeout_ms must be greater than 0"
        );
        bail_assert!(
            self.handshake_timeout_ms > 0,
            "coordinator.handshake_timeout_ms must be greater than 0"
        );
        bail_assert!(
            self.retry_limit > 0,
            "coordinator.retry_limit must be at least 1"
        );
        bail_assert!(
            !self.sentinel_fitness.is_nan(),
            "coordinator.sentinel_fitness must not be NaN"
        );
        bail_assert!(
            self.max_capacity > 0,
            "coordinator.max_capacity must be at least 1"
        );
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Worker side: where the coordinator lives and how much work to take
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `host:port` of the coordinator
    pub coordinator: String,
    /// Declared id sent in HELLO; defaults to `worker-<pid>`
    pub worker_id: Option<String>,
    pub capacity: u32,
    pub heartbeat_interval_ms: u64,
    /// Reconnect if nothing is heard from the coordinator for this long
    pub coordinator_ttl_ms: u64,
    pub connect_timeout_ms: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator: "127.0.0.1:5556".to_string(),
            worker_id: None,
            capacity: 1,
            heartbeat_interval_ms: 1000,
            coordinator_ttl_ms: 5000,
            connect_timeout_ms: 5000,
            backoff_min_ms: 250,
            backoff_max_ms: 8000,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> crate::Result<()> {
        bail_assert!(
            !self.coordinator.trim().is_empty(),
            "worker.coordinator must not be empty"
        );
        bail_assert!(
            self.capacity > 0 && self.capacity <= MAX_WORKER_CAPACITY,
            "worker.capacity must be between 1 and {}",
            MAX_WORKER_CAPACITY
        );
        bail_assert!(
            self.heartbeat_interval_ms > 0,
            "worker.heartbeat_interval_ms must be greater than 0"
        );
        bail_assert!(
            self.coordinator_ttl_ms > self.heartbeat_interval_ms,
            "worker.coordinator_ttl_ms must be greater than worker.heartbeat_interval_ms"
        );
        bail_assert!(
            self.connect_timeout_ms > 0,
            "worker.connect_timeout_ms must be greater than 0"
        );
        bail_assert!(
            self.backoff_min_ms > 0 && self.backoff_min_ms <= self.backoff_max_ms,
            "worker.backoff_min_ms must be greater than 0 and at most worker.backoff_max_ms"
        );
        if let Some(id) = &self.worker_id {
            bail_assert!(!id.trim().is_empty(), "worker.worker_id must not be empty");
        }
        Ok(())
    }

    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn coordinator_ttl(&self) -> Duration {
        Duration::from_millis(self.coordinator_ttl_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Generation loop settings plus the knobs of the bundled demo population
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub generations: usize,
    pub population_size: usize,
    pub generation_timeout_ms: u64,
    /// How long to wait for a first worker (and for workers to come back)
    pub worker_wait_ms: u64,
    pub min_workers: usize,
    pub fitness_threshold: Option<f64>,
    pub genome_len: usize,
    pub elitism_fraction: f64,
    pub mutation_probability: f64,
    pub mutation_magnitude: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            generations: 10,
            population_size: 30,
            generation_timeout_ms: 120_000,
            worker_wait_ms: 60_000,
            min_workers: 1,
            fitness_threshold: None,
            genome_len: 8,
            elitism_fraction: 0.2,
            mutation_probability: 0.8,
            mutation_magnitude: 0.5,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        bail_assert!(
            self.generations > 0,
            "trainer.generations must be at least 1"
        );
        bail_assert!(
            self.population_size > 0,
            "trainer.population_size must be at least 1"
        );
        bail_assert!(
            self.generation_timeout_ms > 0,
            "trainer.generation_timeout_ms must be greater than 0"
        );
        bail_assert!(
            self.min_workers > 0,
            "trainer.min_workers must be at least 1"
        );
        bail_assert!(self.genome_len > 0, "trainer.genome_len must be at least 1");
        bail_assert!(
            self.elitism_fraction >= 0.0 && self.elitism_fraction <= 1.0,
            "trainer.elitism_fraction must be between 0 and 1"
        );
        bail_assert!(
            self.mutation_probability >= 0.0 && self.mutation_probability <= 1.0,
            "trainer.mutation_probability must be between 0 and 1"
        );
        bail_assert!(
            self.mutation_magnitude >= 0.0,
            "trainer.mutation_magnitude must be non-negative"
        );
        Ok(())
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn worker_wait(&self) -> Duration {
        Duration::from_millis(self.worker_wait_ms)
    }
}

/// Contents of a `shoal.toml`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub coordinator: CoordinatorConfig,
    pub worker: AgentConfig,
    pub trainer: TrainerConfig,
}

impl Config {
    pub fn validate(&self) -> crate::Result<()> {
        self.coordinator.validate()?;
        self.worker.validate()?;
        self.trainer.validate()?;
        Ok(())
    }

    /// Parse and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let config_s = fs::read_to_string(path)
            .with_context(|| format!("Failed to open config file `{}`", path.display()))?;
        let config: Config = toml::from_str(&config_s)
            .with_context(|| format!("Failed to parse config file `{}`", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
