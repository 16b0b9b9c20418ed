use std::{
    collections::BTreeMap,
    net::{Shutdown, TcpStream},
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{GenomeId, SessionId, TaskId, protocol::Message};

/// Outbound queue drained by the session's writer thread
pub type Outbox = mpsc::Sender<Message>;

/// Lifecycle of a worker connection. `Dead` is terminal; a worker that
/// reconnects gets a brand new session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Handshaking,
    Active,
    Dead,
}

/// One attempt at evaluating one genome
#[derive(Clone, Debug)]
pub struct Task {
    pub task_id: TaskId,
    pub genome_id: GenomeId,
    pub payload: Arc<[u8]>,
    pub attempt_count: u32,
    pub assigned_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignError {
    /// The session is already at capacity
    Busy,
    /// The session is dead or its writer has gone away
    Dead,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("capacity must be greater than 0")]
    ZeroCapacity,
    #[error("worker id `{0}` is already registered by a live session")]
    DuplicateId(String),
    #[error("session is {0}, expected Handshaking")]
    NotHandshaking(SessionState),
}

/// Master-side view of one connected worker
#[derive(Debug)]
pub struct WorkerSession {
    id: SessionId,
    declared_id: String,
    capacity: u32,
    state: SessionState,
    tasks: BTreeMap<TaskId, Task>,
    last_heartbeat: Instant,
    registered_seq: u64,
    outbox: Outbox,
    connection: Option<TcpStream>,
}

impl WorkerSession {
    /// `connection` is only used to tear the socket down when the session
    /// dies; reads and writes happen on the connection's own threads.
    pub fn new(id: SessionId, outbox: Outbox, connection: Option<TcpStream>, now: Instant) -> Self {
        Self {
            id,
            declared_id: String::new(),
            capacity: 0,
            state: SessionState::Handshaking,
            tasks: BTreeMap::new(),
            last_heartbeat: now,
            registered_seq: 0,
            outbox,
            connection,
        }
    }

    /// Validate a HELLO and move to Active. `capacity` must be non-zero and
    /// is clamped to `max_capacity`.
    pub fn register(
        &mut self,
        worker_id: &str,
        capacity: u32,
        max_capacity: u32,
        seq: u64,
        now: Instant,
    ) -> Result<SessionId, RegisterError> {
        if self.state != SessionState::Handshaking {
            return Err(RegisterError::NotHandshaking(self.state));
        }
        if capacity == 0 {
            return Err(RegisterError::ZeroCapacity);
        }

        self.declared_id = worker_id.to_string();
        self.capacity = capacity.min(max_capacity.max(1));
        self.registered_seq = seq;
        self.last_heartbeat = now;
        self.state = SessionState::Active;

        Ok(self.id)
    }

    /// Hand a task to the worker. On failure the task is given back so the
    /// caller can return its genome to the pending set.
    pub fn assign(&mut self, task: Task) -> Result<(), (AssignError, Task)> {
        if self.state != SessionState::Active {
            return Err((AssignError::Dead, task));
        }
        if self.in_flight_count() >= self.capacity as usize {
            return Err((AssignError::Busy, task));
        }

        let msg = Message::Task {
            task_id: task.task_id,
            genome_id: task.genome_id,
            payload: task.payload.to_vec(),
        };
        if self.outbox.send(msg).is_err() {
            debug!("Writer for session {:x} is gone", self.id);
            self.state = SessionState::Dead;
            return Err((AssignError::Dead, task));
        }

        trace!(
            "Assigned task {} (genome {}, attempt {}) to session {:x}",
            task.task_id, task.genome_id, task.attempt_count, self.id
        );
        self.tasks.insert(task.task_id, task);
        Ok(())
    }

    /// Release the slot held by `task_id`. Returns `None` if this session
    /// does not hold that task, in which case the result is stale.
    pub fn accept_result(&mut self, task_id: TaskId) -> Option<Task> {
        self.tasks.remove(&task_id)
    }

    /// Take a task back without a result (task timeout, generation expiry)
    pub fn revoke(&mut self, task_id: TaskId) -> Option<Task> {
        self.tasks.remove(&task_id)
    }

    pub fn touch(&mut self, now: Instant) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }

    /// Declare the session dead if it has been silent for longer than
    /// `timeout`. Returns the orphaned tasks when it dies on this tick.
    pub fn heartbeat_tick(&mut self, now: Instant, timeout: Duration) -> Option<Vec<Task>> {
        if self.state == SessionState::Dead {
            return None;
        }
        if now.saturating_duration_since(self.last_heartbeat) <= timeout {
            return None;
        }
        Some(self.kill())
    }

    /// Transition to Dead and hand back every in-flight task. Orphans are
    /// returned exactly once; killing a dead session yields nothing.
    pub fn kill(&mut self) -> Vec<Task> {
        if self.state == SessionState::Dead {
            return Vec::new();
        }
        self.state = SessionState::Dead;
        if let Some(conn) = self.connection.take() {
            let _ = conn.shutdown(Shutdown::Both);
        }
        std::mem::take(&mut self.tasks).into_values().collect()
    }

    /// Ask the worker to stop: queue SHUTDOWN and go Dead, leaving the
    /// socket to the writer so the frame still goes out. Returns the
    /// in-flight tasks like [`kill`](Self::kill).
    pub fn retire(&mut self) -> Vec<Task> {
        if self.state == SessionState::Dead {
            return Vec::new();
        }
        self.send(Message::Shutdown);
        self.state = SessionState::Dead;
        self.connection = None;
        std::mem::take(&mut self.tasks).into_values().collect()
    }

    /// Queue a control message. Returns false if the writer is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.outbox.send(msg).is_ok()
    }

    /// Ids of tasks that have been in flight for longer than `timeout`
    pub fn expired_tasks(&self, now: Instant, timeout: Duration) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| now.saturating_duration_since(t.assigned_at) > timeout)
            .map(|t| t.task_id)
            .collect()
    }

    pub fn holds(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.keys().copied()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn declared_id(&self) -> &str {
        &self.declared_id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_flight_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn has_capacity(&self) -> bool {
        self.is_active() && self.in_flight_count() < self.capacity as usize
    }

    pub fn registered_seq(&self) -> u64 {
        self.registered_seq
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }
}
