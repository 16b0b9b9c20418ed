use std::io;

use crate::{GenomeId, protocol::ProtocolError};

/// Hard failures surfaced to the caller of the coordinator.
///
/// Everything else (lost workers, malformed frames, flaky evaluations) is
/// recovered locally and shows up as sentinel fitness in a
/// [`GenerationOutcome`](crate::GenerationOutcome).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No Active worker session exists, so no fitness can be computed.
    #[error("no workers available to evaluate the generation")]
    NoWorkersAvailable,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("genome id {0} appears more than once in the generation")]
    DuplicateGenome(GenomeId),

    #[error("a generation is already being evaluated")]
    GenerationInProgress,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
