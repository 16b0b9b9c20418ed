//! Per-generation bookkeeping: which genomes are pending, which are in
//! flight on which session, and which already have a fitness.
//!
//! Every genome of a generation is in exactly one of those three places.
//! A result only lands if it matches the genome's current in-flight task,
//! so late or duplicate answers can never overwrite a recorded fitness.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{Error, Genome, GenomeId, SessionId, TaskId};

/// Why a single task attempt did not produce a fitness
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum TaskFailure {
    #[error("worker stopped heartbeating")]
    WorkerTimeout,
    #[error("worker disconnected")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    #[error("task timed out")]
    TaskTimeout,
    #[error("non-finite fitness")]
    NonFiniteFitness,
}

/// Why a genome ended its generation with the sentinel fitness
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    RetryExhausted { attempts: u32, last: TaskFailure },
    GenerationTimeout,
}

/// Where a genome currently sits within its generation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenomeState {
    Pending,
    InFlight { task_id: TaskId, session: SessionId },
    Completed,
}

/// What happened to a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retry {
    /// Back in the pending queue for another attempt
    Requeued,
    /// Out of attempts; resolved with the sentinel fitness
    Exhausted,
    /// The task was not the genome's current attempt; nothing changed
    Stale,
}

#[derive(Clone, Copy, Debug)]
struct Flight {
    task_id: TaskId,
    session: SessionId,
}

/// The complete fitness mapping handed back to the evolutionary loop
#[derive(Clone, Debug)]
pub struct GenerationOutcome {
    pub index: u64,
    /// One entry per genome of the generation
    pub fitness: BTreeMap<GenomeId, f64>,
    /// Genomes whose entry in `fitness` is the sentinel value
    pub failures: BTreeMap<GenomeId, FailureReason>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl GenerationOutcome {
    pub fn len(&self) -> usize {
        self.fitness.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fitness.is_empty()
    }

    pub fn is_sentinel(&self, id: GenomeId) -> bool {
        self.failures.contains_key(&id)
    }

    /// Fitness values that came from a worker, skipping sentinels
    pub fn evaluated(&self) -> impl Iterator<Item = (GenomeId, f64)> + '_ {
        self.fitness
            .iter()
            .filter(|(id, _)| !self.failures.contains_key(id))
            .map(|(id, f)| (*id, *f))
    }
}

#[derive(Debug)]
pub struct Generation {
    index: u64,
    size: usize,
    payloads: HashMap<GenomeId, Arc<[u8]>>,
    pending: VecDeque<GenomeId>,
    in_flight: HashMap<GenomeId, Flight>,
    attempts: HashMap<GenomeId, u32>,
    results: BTreeMap<GenomeId, f64>,
    failures: BTreeMap<GenomeId, FailureReason>,
    sentinel: f64,
    retry_limit: u32,
    started_at: Instant,
    timed_out: bool,
}

impl Generation {
    /// Seed the pending queue with every genome, in input order
    pub fn new(
        index: u64,
        genomes: &[Genome],
        sentinel: f64,
        retry_limit: u32,
        now: Instant,
    ) -> Result<Self, Error> {
        let mut payloads = HashMap::with_capacity(genomes.len());
        let mut pending = VecDeque::with_capacity(genomes.len());
        for g in genomes {
            if payloads
                .insert(g.id, Arc::<[u8]>::from(g.payload.as_slice()))
                .is_some()
            {
                return Err(Error::DuplicateGenome(g.id));
            }
            pending.push_back(g.id);
        }

        Ok(Self {
            index,
            size: genomes.len(),
            payloads,
            pending,
            in_flight: HashMap::new(),
            attempts: HashMap::new(),
            results: BTreeMap::new(),
            failures: BTreeMap::new(),
            sentinel,
            retry_limit,
            started_at: now,
            timed_out: false,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn completed_count(&self) -> usize {
        self.results.len()
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn attempts(&self, id: GenomeId) -> u32 {
        self.attempts.get(&id).copied().unwrap_or(0)
    }

    pub fn payload(&self, id: GenomeId) -> Option<Arc<[u8]>> {
        self.payloads.get(&id).cloned()
    }

    pub fn state_of(&self, id: GenomeId) -> Option<GenomeState> {
        if self.results.contains_key(&id) {
            Some(GenomeState::Completed)
        } else if let Some(f) = self.in_flight.get(&id) {
            Some(GenomeState::InFlight {
                task_id: f.task_id,
                session: f.session,
            })
        } else if self.pending.contains(&id) {
            Some(GenomeState::Pending)
        } else {
            None
        }
    }

    /// Next genome to hand out, FIFO
    pub fn pop_pending(&mut self) -> Option<GenomeId> {
        self.pending.pop_front()
    }

    /// Put back a genome whose assignment never reached a worker
    pub fn unpop(&mut self, id: GenomeId) {
        self.pending.push_front(id);
    }

    /// Record that `id` is now in flight as `task_id` on `session`
    pub fn launch(&mut self, id: GenomeId, task_id: TaskId, session: SessionId) -> u32 {
        debug_assert!(
            !self.in_flight.contains_key(&id),
            "genome {} already in flight",
            id
        );
        self.in_flight.insert(id, Flight { task_id, session });
        let attempts = self.attempts.entry(id).or_insert(0);
        *attempts += 1;
        *attempts
    }

    /// Attempt number the next task for `id` will carry
    pub fn next_attempt(&self, id: GenomeId) -> u32 {
        self.attempts(id) + 1
    }

    fn is_current(&self, id: GenomeId, task_id: TaskId, session: SessionId) -> bool {
        self.in_flight
            .get(&id)
            .is_some_and(|f| f.task_id == task_id && f.session == session)
    }

    /// Apply a fitness reported by `session` for `task_id`.
    ///
    /// Returns false and changes nothing unless the task is the genome's
    /// current in-flight attempt on that session.
    pub fn on_result(
        &mut self,
        session: SessionId,
        task_id: TaskId,
        id: GenomeId,
        fitness: f64,
    ) -> bool {
        if !self.is_current(id, task_id, session) || self.results.contains_key(&id) {
            trace!(
                "Discarding stale result for genome {} (task {}, session {:x})",
                id, task_id, session
            );
            return false;
        }

        self.in_flight.remove(&id);
        self.results.insert(id, fitness);
        true
    }

    /// A task attempt failed. Requeue the genome, or resolve it with the
    /// sentinel once it has used up `retry_limit` attempts.
    pub fn on_failure(
        &mut self,
        session: SessionId,
        task_id: TaskId,
        id: GenomeId,
        failure: TaskFailure,
    ) -> Retry {
        if !self.is_current(id, task_id, session) {
            return Retry::Stale;
        }
        self.in_flight.remove(&id);

        let attempts = self.attempts(id);
        if attempts >= self.retry_limit {
            warn!(
                "Genome {} failed {} attempts (last: {}). Using sentinel fitness.",
                id, attempts, failure
            );
            self.results.insert(id, self.sentinel);
            self.failures.insert(
                id,
                FailureReason::RetryExhausted {
                    attempts,
                    last: failure,
                },
            );
            Retry::Exhausted
        } else {
            trace!("Requeueing genome {} after {} (attempt {})", id, failure, attempts);
            self.pending.push_back(id);
            Retry::Requeued
        }
    }

    /// Give up on everything not yet completed. Returns the in-flight
    /// assignments so the caller can revoke them from their sessions.
    pub fn expire(&mut self) -> Vec<(SessionId, TaskId)> {
        let revoked = self
            .in_flight
            .values()
            .map(|f| (f.session, f.task_id))
            .collect();

        let unresolved = self
            .pending
            .drain(..)
            .chain(self.in_flight.drain().map(|(id, _)| id))
            .collect::<Vec<_>>();

        if !unresolved.is_empty() {
            self.timed_out = true;
        }
        for id in unresolved {
            self.results.insert(id, self.sentinel);
            self.failures.insert(id, FailureReason::GenerationTimeout);
        }

        revoked
    }

    /// Hand off the completed mapping. Payloads are dropped here.
    pub fn finish(self, now: Instant) -> GenerationOutcome {
        GenerationOutcome {
            index: self.index,
            fitness: self.results,
            failures: self.failures,
            timed_out: self.timed_out,
            elapsed: now.saturating_duration_since(self.started_at),
        }
    }
}
