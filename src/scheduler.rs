//! The single owned scheduling state: worker registry, the current
//! generation, and every decision that moves a genome between pending,
//! in flight and completed.
//!
//! Nothing in here does I/O. Outbound frames are queued on each session's
//! outbox and written by that session's writer thread, so the coordinator
//! can hold the scheduler lock without ever blocking on a socket.

use std::{
    collections::{BTreeMap, HashSet},
    net::TcpStream,
    time::Instant,
};

use tracing::{debug, info, trace, warn};

use crate::{
    Error, Genome, SessionId, TaskId,
    aggregator::{Generation, GenerationOutcome, Retry, TaskFailure},
    config::CoordinatorConfig,
    protocol::{Message, Outcome},
    session::{AssignError, Outbox, RegisterError, Task, WorkerSession},
};

/// What became of an incoming RESULT frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Fitness recorded for the genome
    Recorded,
    /// The attempt failed; see the wrapped retry decision
    Failed(Retry),
    /// Not a task this session currently holds; discarded
    Stale,
}

#[derive(Debug)]
pub struct Scheduler {
    config: CoordinatorConfig,
    sessions: BTreeMap<SessionId, WorkerSession>,
    generation: Option<Generation>,
    next_session_id: SessionId,
    next_task_id: TaskId,
    next_generation: u64,
    next_registration: u64,
}

impl Scheduler {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            sessions: BTreeMap::new(),
            generation: None,
            next_session_id: 1,
            next_task_id: 1,
            next_generation: 0,
            next_registration: 0,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // registry

    /// Admit a worker that sent HELLO. On success the HELLO_ACK is queued
    /// ahead of any task the follow-up scheduling tick hands out.
    pub fn register(
        &mut self,
        worker_id: &str,
        capacity: u32,
        outbox: Outbox,
        connection: Option<TcpStream>,
        now: Instant,
    ) -> Result<SessionId, RegisterError> {
        if self
            .sessions
            .values()
            .any(|s| s.is_active() && s.declared_id() == worker_id)
        {
            return Err(RegisterError::DuplicateId(worker_id.to_string()));
        }

        let id = self.next_session_id;
        let mut session = WorkerSession::new(id, outbox, connection, now);
        session.register(
            worker_id,
            capacity,
            self.config.max_capacity,
            self.next_registration,
            now,
        )?;
        self.next_session_id += 1;
        self.next_registration += 1;

        session.send(Message::HelloAck {
            assigned_id: id,
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
        });
        info!(
            "🐟 Registered worker `{}` as session {:x} with capacity {}",
            worker_id,
            id,
            session.capacity()
        );
        self.sessions.insert(id, session);

        self.tick(now);
        Ok(id)
    }

    pub fn touch(&mut self, id: SessionId, now: Instant) {
        if let Some(s) = self.sessions.get_mut(&id) {
            s.touch(now);
        }
    }

    /// Tear down a session and requeue whatever it held
    pub fn session_died(&mut self, id: SessionId, failure: TaskFailure, now: Instant) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        let orphans = session.kill();
        warn!(
            "⛓️‍💥 Lost worker `{}` (session {:x}): {}. {} task(s) orphaned.",
            session.declared_id(),
            id,
            failure,
            orphans.len()
        );
        self.fail_tasks(id, orphans, &failure);
        self.tick(now);
    }

    pub fn active_workers(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    pub fn session(&self, id: SessionId) -> Option<&WorkerSession> {
        self.sessions.get(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &WorkerSession> {
        self.sessions.values()
    }

    // generation lifecycle

    /// Start evaluating `genomes`. Fails without touching any state if no
    /// worker is Active, another generation is running, or ids repeat.
    pub fn begin_generation(&mut self, genomes: &[Genome], now: Instant) -> crate::Result<u64> {
        if self.generation.is_some() {
            return Err(Error::GenerationInProgress);
        }
        if self.active_workers() == 0 {
            return Err(Error::NoWorkersAvailable);
        }

        let index = self.next_generation;
        let generation = Generation::new(
            index,
            genomes,
            self.config.sentinel_fitness,
            self.config.retry_limit,
            now,
        )?;
        self.next_generation += 1;
        self.generation = Some(generation);

        debug!(
            "Generation {} started with {} genomes across {} workers",
            index,
            genomes.len(),
            self.active_workers()
        );
        self.tick(now);
        Ok(index)
    }

    pub fn generation(&self) -> Option<&Generation> {
        self.generation.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.generation.as_ref().is_some_and(|g| g.is_complete())
    }

    /// Resolve every unfinished genome with the sentinel and pull their
    /// tasks back from the sessions holding them.
    pub fn expire_generation(&mut self) {
        let Some(generation) = self.generation.as_mut() else {
            return;
        };
        let unresolved = generation.pending_count() + generation.in_flight_count();
        let revoked = generation.expire();
        for (sid, task_id) in revoked {
            if let Some(s) = self.sessions.get_mut(&sid) {
                s.revoke(task_id);
            }
        }
        if unresolved > 0 {
            warn!(
                "⏱️ Generation {} timed out with {} genome(s) unresolved. Using sentinel fitness.",
                generation.index(),
                unresolved
            );
        }
    }

    /// Hand off the finished generation, if it is complete
    pub fn take_outcome(&mut self, now: Instant) -> Option<GenerationOutcome> {
        if !self.is_complete() {
            return None;
        }
        self.generation.take().map(|g| g.finish(now))
    }

    // results

    /// Apply a RESULT frame from `id`
    pub fn on_result(
        &mut self,
        id: SessionId,
        task_id: TaskId,
        outcome: Outcome,
        now: Instant,
    ) -> Disposition {
        let Some(session) = self.sessions.get_mut(&id) else {
            trace!("Result for task {} from unknown session {:x}", task_id, id);
            return Disposition::Stale;
        };
        session.touch(now);
        let Some(task) = session.accept_result(task_id) else {
            debug!(
                "Discarding stale result for task {} from session {:x}",
                task_id, id
            );
            return Disposition::Stale;
        };

        let Some(generation) = self.generation.as_mut() else {
            self.tick(now);
            return Disposition::Stale;
        };

        let disposition = match outcome {
            Outcome::Fitness(f) if f.is_finite() => {
                if generation.on_result(id, task.task_id, task.genome_id, f) {
                    trace!("Genome {} scored {}", task.genome_id, f);
                    Disposition::Recorded
                } else {
                    Disposition::Stale
                }
            }
            Outcome::Fitness(_) => Disposition::Failed(generation.on_failure(
                id,
                task.task_id,
                task.genome_id,
                TaskFailure::NonFiniteFitness,
            )),
            Outcome::Error(e) => {
                warn!(
                    "Worker `{}` failed to evaluate genome {}: {}",
                    session.declared_id(),
                    task.genome_id,
                    e
                );
                Disposition::Failed(generation.on_failure(
                    id,
                    task.task_id,
                    task.genome_id,
                    TaskFailure::Evaluation(e),
                ))
            }
        };

        self.tick(now);
        disposition
    }

    // maintenance

    /// Periodic liveness pass: expire silent sessions, revoke overdue
    /// tasks, ping the survivors, then reschedule.
    pub fn maint(&mut self, now: Instant) {
        let heartbeat_timeout = self.config.heartbeat_timeout();
        let task_timeout = self.config.task_timeout();

        let mut dead = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            if let Some(orphans) = session.heartbeat_tick(now, heartbeat_timeout) {
                warn!(
                    "⛓️‍💥 Worker `{}` (session {:x}) missed heartbeats. {} task(s) orphaned.",
                    session.declared_id(),
                    id,
                    orphans.len()
                );
                dead.push((*id, orphans));
            }
        }
        for (id, orphans) in dead {
            self.sessions.remove(&id);
            self.fail_tasks(id, orphans, &TaskFailure::WorkerTimeout);
        }

        let mut overdue = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            for task_id in session.expired_tasks(now, task_timeout) {
                if let Some(task) = session.revoke(task_id) {
                    warn!(
                        "Task {} (genome {}) on session {:x} exceeded the task timeout",
                        task_id, task.genome_id, id
                    );
                    overdue.push((*id, task));
                }
            }
        }
        for (id, task) in overdue {
            self.fail_tasks(id, vec![task], &TaskFailure::TaskTimeout);
        }

        let unreachable = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.send(Message::Heartbeat))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in unreachable {
            self.session_died(id, TaskFailure::Disconnected, now);
        }

        self.tick(now);
    }

    /// Tell every worker to stop and forget them all
    pub fn shutdown(&mut self) {
        for (_, mut session) in std::mem::take(&mut self.sessions) {
            let orphans = session.retire();
            if let Some(generation) = self.generation.as_mut() {
                for task in orphans {
                    generation.on_failure(
                        session.id(),
                        task.task_id,
                        task.genome_id,
                        TaskFailure::Disconnected,
                    );
                }
            }
        }
    }

    // assignment

    /// Hand pending genomes to sessions with spare capacity until either
    /// runs out. Least-loaded session first, earliest registration on ties.
    pub fn tick(&mut self, now: Instant) {
        let mut skip = HashSet::new();

        loop {
            let Some(generation) = self.generation.as_mut() else {
                return;
            };
            if !generation.has_pending() {
                return;
            }

            let Some(sid) = self
                .sessions
                .values()
                .filter(|s| s.has_capacity() && !skip.contains(&s.id()))
                .min_by_key(|s| (s.in_flight_count(), s.registered_seq()))
                .map(|s| s.id())
            else {
                return;
            };

            let Some(genome_id) = generation.pop_pending() else {
                return;
            };
            let Some(payload) = generation.payload(genome_id) else {
                continue;
            };

            let task_id = self.next_task_id;
            self.next_task_id += 1;
            let task = Task {
                task_id,
                genome_id,
                payload,
                attempt_count: generation.next_attempt(genome_id),
                assigned_at: now,
            };

            let Some(session) = self.sessions.get_mut(&sid) else {
                generation.unpop(genome_id);
                continue;
            };
            match session.assign(task) {
                Ok(()) => {
                    generation.launch(genome_id, task_id, sid);
                }
                Err((AssignError::Busy, task)) => {
                    generation.unpop(task.genome_id);
                    skip.insert(sid);
                }
                Err((AssignError::Dead, task)) => {
                    generation.unpop(task.genome_id);
                    self.session_died(sid, TaskFailure::Disconnected, now);
                }
            }
        }
    }

    fn fail_tasks(&mut self, sid: SessionId, tasks: Vec<Task>, failure: &TaskFailure) {
        let Some(generation) = self.generation.as_mut() else {
            return;
        };
        for task in tasks {
            let retry = generation.on_failure(sid, task.task_id, task.genome_id, failure.clone());
            trace!("Task {} failed ({}): {:?}", task.task_id, failure, retry);
        }
    }
}
