use std::{
    io::{BufReader, ErrorKind},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, error_span, info, trace, warn};

use crate::{
    Error, Genome, SessionId,
    aggregator::{GenerationOutcome, TaskFailure},
    config::CoordinatorConfig,
    protocol::{Message, ProtocolError, read_message, write_message},
    scheduler::{Disposition, Scheduler},
    util::lock,
};

const POLL_IVL: Duration = Duration::from_millis(50);

/// State shared by the caller, the accept and maintenance threads, and one
/// reader plus one writer thread per worker connection.
struct Shared {
    scheduler: Mutex<Scheduler>,
    changed: Condvar,
    shutdown: AtomicBool,
    config: CoordinatorConfig,
}

impl Shared {
    /// Mutate the scheduler under the lock, then wake anyone waiting on it
    fn update<T>(&self, f: impl FnOnce(&mut Scheduler) -> T) -> T {
        let out = f(&mut lock(&self.scheduler));
        self.changed.notify_all();
        out
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Master process: owns the listening socket and the worker registry, and
/// turns a list of genomes into a complete fitness mapping.
pub struct Coordinator {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Validate `config`, bind the listener and start the accept and
    /// maintenance threads.
    pub fn bind(config: CoordinatorConfig) -> crate::Result<Self> {
        config.validate()?;

        let addr = config.addr();
        let listener = TcpListener::bind(&addr).map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(
            "🦈 Coordinator v{} listening on {}",
            env!("CARGO_PKG_VERSION"),
            local_addr
        );

        let shared = Arc::new(Shared {
            scheduler: Mutex::new(Scheduler::new(config.clone())),
            changed: Condvar::new(),
            shutdown: AtomicBool::new(false),
            config,
        });

        let accept_shared = Arc::clone(&shared);
        let accept = thread::Builder::new()
            .name("shoal-accept".to_string())
            .spawn(move || accept_loop(listener, accept_shared))?;

        let maint_shared = Arc::clone(&shared);
        let maint = thread::Builder::new()
            .name("shoal-maint".to_string())
            .spawn(move || maint_loop(maint_shared))?;

        Ok(Self {
            shared,
            local_addr,
            handles: Mutex::new(vec![accept, maint]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn active_workers(&self) -> usize {
        lock(&self.shared.scheduler).active_workers()
    }

    /// Block until at least `n` workers are Active. Returns false on timeout.
    pub fn wait_for_workers(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut sched = lock(&self.shared.scheduler);
        loop {
            if sched.active_workers() >= n {
                return true;
            }
            let now = Instant::now();
            if is_past(deadline, now) || self.shared.is_shutdown() {
                return false;
            }
            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(sched, wait_for(deadline, now))
                .unwrap_or_else(PoisonError::into_inner);
            sched = guard;
        }
    }

    /// Have every genome evaluated by the worker pool.
    ///
    /// Returns a mapping with exactly one fitness per genome. Genomes that
    /// ran out of retries, or were still unresolved when `timeout` elapsed,
    /// carry the sentinel fitness and are listed in `failures`. Fails with
    /// [`Error::NoWorkersAvailable`] rather than inventing fitness values
    /// when no worker is connected.
    pub fn evaluate_generation(
        &self,
        genomes: &[Genome],
        timeout: Duration,
    ) -> crate::Result<GenerationOutcome> {
        let started = Instant::now();
        // Overflowing timeouts mean no deadline
        let deadline = started.checked_add(timeout);

        let mut sched = lock(&self.shared.scheduler);
        let index = sched.begin_generation(genomes, started)?;
        info!(
            "🧬 Evaluating generation {} ({} genomes, {} workers)",
            index,
            genomes.len(),
            sched.active_workers()
        );

        loop {
            let now = Instant::now();
            if let Some(outcome) = sched.take_outcome(now) {
                drop(sched);
                if outcome.timed_out {
                    warn!(
                        "Generation {} timed out: {}/{} genomes used sentinel fitness",
                        outcome.index,
                        outcome.failures.len(),
                        outcome.len()
                    );
                } else {
                    info!(
                        "✅ Generation {} evaluated in {:.2?} ({} sentinel)",
                        outcome.index,
                        outcome.elapsed,
                        outcome.failures.len()
                    );
                }
                return Ok(outcome);
            }

            if is_past(deadline, now) || self.shared.is_shutdown() {
                sched.expire_generation();
                continue;
            }

            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(sched, wait_for(deadline, now))
                .unwrap_or_else(PoisonError::into_inner);
            sched = guard;
        }
    }

    /// Send SHUTDOWN to every worker and stop the background threads.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("🛑 Coordinator shutting down");
        self.shared.update(|s| s.shutdown());

        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            if handle.join().is_err() {
                error!("Coordinator background thread panicked");
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_past(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| now >= d)
}

/// How long to park on the condvar before checking the deadline again
fn wait_for(deadline: Option<Instant>, now: Instant) -> Duration {
    match deadline {
        Some(d) => d.saturating_duration_since(now).min(POLL_IVL),
        None => POLL_IVL,
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.is_shutdown() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                let conn_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("shoal-conn-{}", peer))
                    .spawn(move || {
                        let _guard = error_span!("conn", %peer).entered();
                        if let Err(e) = serve_connection(stream, &conn_shared) {
                            debug!("Connection ended: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    error!("Failed to spawn connection thread for {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_IVL),
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                thread::sleep(POLL_IVL);
            }
        }
    }
}

fn maint_loop(shared: Arc<Shared>) {
    let interval = shared.config.heartbeat_interval();
    let mut last_maint = Instant::now();
    while !shared.is_shutdown() {
        if last_maint.elapsed() >= interval {
            shared.update(|s| s.maint(Instant::now()));
            last_maint = Instant::now();
        }
        thread::sleep(
            interval
                .saturating_sub(last_maint.elapsed())
                .min(POLL_IVL),
        );
    }
}

/// Handshake, then read frames until the worker goes away. Runs on the
/// connection's own thread; the scheduler lock is only taken after a frame
/// has been fully read and decoded.
fn serve_connection(stream: TcpStream, shared: &Arc<Shared>) -> Result<(), ProtocolError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(shared.config.handshake_timeout()))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let (worker_id, capacity) = match read_message(&mut reader) {
        Ok(Message::Hello {
            worker_id,
            capacity,
        }) => (worker_id, capacity),
        Ok(other) => {
            let e = ProtocolError::Unexpected(other.kind());
            reject(&stream, &format!("expected HELLO: {}", e));
            return Err(e);
        }
        Err(e) => {
            if !e.is_disconnect() {
                reject(&stream, &format!("bad HELLO: {}", e));
            }
            return Err(e);
        }
    };
    stream.set_read_timeout(None)?;

    let (outbox, rx) = mpsc::channel();
    let conn = stream.try_clone()?;
    let registered =
        shared.update(|s| s.register(&worker_id, capacity, outbox, Some(conn), Instant::now()));
    let sid = match registered {
        Ok(sid) => sid,
        Err(e) => {
            warn!("Rejected worker `{}`: {}", worker_id, e);
            reject(&stream, &e.to_string());
            return Ok(());
        }
    };

    let writer_stream = stream.try_clone()?;
    let writer_shared = Arc::clone(shared);
    let sid_x = format!("{:x}", sid);
    let span = error_span!("session", id = &sid_x);
    let writer_span = span.clone();
    let spawned = thread::Builder::new()
        .name(format!("shoal-writer-{:x}", sid))
        .spawn(move || {
            let _guard = writer_span.entered();
            writer_loop(writer_stream, rx, sid, &writer_shared)
        });
    if let Err(e) = spawned {
        error!("Failed to spawn writer thread: {}", e);
        shared.update(|s| s.session_died(sid, TaskFailure::Disconnected, Instant::now()));
        return Err(e.into());
    }

    let _guard = span.entered();
    loop {
        match read_message(&mut reader) {
            Ok(Message::Heartbeat) => {
                trace!("hb");
                lock(&shared.scheduler).touch(sid, Instant::now());
            }
            Ok(Message::Result { task_id, outcome }) => {
                let disposition =
                    shared.update(|s| s.on_result(sid, task_id, outcome, Instant::now()));
                if disposition == Disposition::Stale {
                    debug!("Stale result for task {}", task_id);
                }
            }
            Ok(Message::Shutdown) => {
                info!("Worker `{}` signed off", worker_id);
                shared.update(|s| s.session_died(sid, TaskFailure::Disconnected, Instant::now()));
                return Ok(());
            }
            Ok(other) => {
                let e = ProtocolError::Unexpected(other.kind());
                shared.update(|s| {
                    s.session_died(sid, TaskFailure::Protocol(e.to_string()), Instant::now())
                });
                return Err(e);
            }
            Err(e) => {
                let failure = if e.is_disconnect() {
                    TaskFailure::Disconnected
                } else {
                    warn!("Protocol error from worker `{}`: {}", worker_id, e);
                    TaskFailure::Protocol(e.to_string())
                };
                shared.update(|s| s.session_died(sid, failure, Instant::now()));
                return Err(e);
            }
        }
    }
}

/// Drain the session's outbox onto the socket. Ends when the session is
/// dropped from the registry or a write fails, then half-closes so the
/// worker still reads everything queued before it.
fn writer_loop(mut stream: TcpStream, rx: Receiver<Message>, sid: SessionId, shared: &Shared) {
    for msg in rx {
        if let Err(e) = write_message(&mut stream, &msg) {
            debug!("Write failed: {}", e);
            shared.update(|s| s.session_died(sid, TaskFailure::Disconnected, Instant::now()));
            break;
        }
        if msg == Message::Shutdown {
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Write);
}

fn reject(stream: &TcpStream, reason: &str) {
    let mut w = stream;
    if let Err(e) = write_message(
        &mut w,
        &Message::Reject {
            reason: reason.to_string(),
        },
    ) {
        debug!("Failed to send REJECT: {}", e);
    }
    let _ = stream.shutdown(Shutdown::Both);
}
