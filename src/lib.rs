//! 🐟 Shoal - distributed fitness evaluation for neuroevolution
//!
//! A [`Coordinator`] holds a TCP listener and a registry of remote workers.
//! The evolutionary loop hands it a generation of [`Genome`]s through
//! [`Coordinator::evaluate_generation`] and gets back a complete fitness
//! mapping once every genome has been scored by some worker, retried into
//! the sentinel value, or timed out. Workers run an [`Agent`] that wraps a
//! user-supplied fitness function.

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod trainer;
pub mod util;

use serde::{Deserialize, Serialize};

pub use agent::{Agent, AgentHandle, Fitness};
pub use aggregator::{FailureReason, GenerationOutcome, TaskFailure};
pub use config::{AgentConfig, Config, CoordinatorConfig, TrainerConfig};
pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use trainer::{Evolver, Trainer};
pub use util::PopEvaluation;

/// Identifies a genome within one generation
pub type GenomeId = u64;
/// Identifies one attempt at evaluating a genome; never reused
pub type TaskId = u64;
/// Identifies one worker connection on the coordinator
pub type SessionId = u64;

/// A candidate solution as the coordinator sees it: an id and an opaque,
/// already serialized payload that only the fitness function understands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    pub id: GenomeId,
    pub payload: Vec<u8>,
}

impl Genome {
    pub fn new(id: GenomeId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}
