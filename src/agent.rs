//! Worker side: connect to a coordinator, evaluate the genomes it sends and
//! report fitness back, reconnecting whenever the coordinator goes away.

use std::{
    any::Any,
    io::{BufReader, ErrorKind},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, info, trace, warn};

use crate::{
    GenomeId, TaskId,
    config::AgentConfig,
    protocol::{Message, Outcome, ProtocolError, read_message, write_message},
    util::lock,
};

const POLL_IVL: Duration = Duration::from_millis(50);
/// Coordinator heartbeats that may be missed before the link counts as dead
const HB_MISSES: u32 = 3;

/// A fitness function. Implemented for any matching closure.
pub trait Fitness: Send + Sync {
    fn evaluate(&self, genome_id: GenomeId, payload: &[u8]) -> Result<f64>;
}

impl<F> Fitness for F
where
    F: Fn(GenomeId, &[u8]) -> Result<f64> + Send + Sync,
{
    fn evaluate(&self, genome_id: GenomeId, payload: &[u8]) -> Result<f64> {
        self(genome_id, payload)
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: AtomicBool,
    conn: Mutex<Option<TcpStream>>,
}

impl StopSignal {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// Stops a running [`Agent`] from another thread
#[derive(Clone)]
pub struct AgentHandle {
    signal: Arc<StopSignal>,
}

impl AgentHandle {
    /// Make `Agent::run` return `Ok(())` as soon as possible. Evaluations
    /// already running are allowed to finish but their results are dropped.
    pub fn stop(&self) {
        self.signal.stopped.store(true, Ordering::Relaxed);
        if let Some(conn) = lock(&self.signal.conn).take() {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }
}

/// How one connection ended
enum SessionEnd {
    Shutdown,
    Stopped,
    Rejected(String),
    Lost(String),
}

pub struct Agent<F> {
    config: AgentConfig,
    fitness: F,
    signal: Arc<StopSignal>,
}

impl<F: Fitness> Agent<F> {
    pub fn new(config: AgentConfig, fitness: F) -> Self {
        Self {
            config,
            fitness,
            signal: Arc::default(),
        }
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            signal: Arc::clone(&self.signal),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Serve coordinators until told to stop.
    ///
    /// Returns `Ok` on SHUTDOWN from the coordinator or [`AgentHandle::stop`],
    /// and an error if the coordinator rejects this worker.
    pub fn run(&self) -> Result<()> {
        self.config.validate()?;
        let worker_id = self.config.worker_id();
        info!(
            "🐠 Shoal worker v{} starting as `{}` with capacity {}",
            env!("CARGO_PKG_VERSION"),
            &worker_id,
            self.config.capacity
        );

        let mut backoff = self.config.backoff_min();
        let mut tries = 0u32;
        let mut registered = false;
        while !self.signal.is_stopped() {
            match self.connect() {
                Ok(stream) => match self.session(stream, &worker_id) {
                    Ok(SessionEnd::Shutdown) => {
                        info!("🛑 Coordinator sent SHUTDOWN");
                        return Ok(());
                    }
                    Ok(SessionEnd::Stopped) => break,
                    // The coordinator may still hold our previous session
                    // until it notices the connection is gone
                    Ok(SessionEnd::Rejected(reason)) if registered => {
                        warn!("Coordinator rejected reconnect: {}", reason)
                    }
                    Ok(SessionEnd::Rejected(reason)) => {
                        bail!("Coordinator rejected worker `{}`: {}", worker_id, reason)
                    }
                    Ok(SessionEnd::Lost(reason)) => {
                        warn!("⛓️‍💥 Lost connection to coordinator ({}). Reconnecting...", reason);
                        registered = true;
                        backoff = self.config.backoff_min();
                        tries = 0;
                    }
                    Err(e) => warn!("Handshake with coordinator failed: {:#}", e),
                },
                Err(e) => warn!(
                    "Coordinator was unavailable at {}: {:#}",
                    &self.config.coordinator, e
                ),
            }

            if self.signal.is_stopped() {
                break;
            }
            tries += 1;
            debug!("Retrying in {:?} (attempt {})", backoff, tries);
            self.sleep(backoff);
            backoff = (backoff * 2).min(self.config.backoff_max());
        }

        info!("Worker `{}` stopped", worker_id);
        Ok(())
    }

    fn connect(&self) -> Result<TcpStream> {
        let addrs = self
            .config
            .coordinator
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve `{}`", &self.config.coordinator))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout()) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => anyhow!("`{}` resolved to no addresses", &self.config.coordinator),
        })
    }

    /// Handshake, then serve one connection until it ends
    fn session(&self, stream: TcpStream, worker_id: &str) -> Result<SessionEnd> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.config.coordinator_ttl()))?;
        *lock(&self.signal.conn) = Some(stream.try_clone()?);
        if self.signal.is_stopped() {
            return Ok(SessionEnd::Stopped);
        }

        let mut reader = BufReader::new(stream.try_clone()?);
        let writer = Mutex::new(stream.try_clone()?);

        write_message(
            &mut *lock(&writer),
            &Message::Hello {
                worker_id: worker_id.to_string(),
                capacity: self.config.capacity,
            },
        )?;

        let (hb_ivl, ttl) = match read_message(&mut reader) {
            Ok(Message::HelloAck {
                assigned_id,
                heartbeat_interval_ms,
            }) => {
                info!(
                    "🦈 Registered with coordinator at {} as session {:x}",
                    &self.config.coordinator, assigned_id
                );
                match heartbeat_interval_ms {
                    0 => (self.config.heartbeat_interval(), self.config.coordinator_ttl()),
                    ms => {
                        let announced = Duration::from_millis(ms);
                        (
                            announced.min(self.config.heartbeat_interval()),
                            announced
                                .saturating_mul(HB_MISSES)
                                .max(self.config.coordinator_ttl()),
                        )
                    }
                }
            }
            Ok(Message::Reject { reason }) => return Ok(SessionEnd::Rejected(reason)),
            Ok(other) => bail!("Expected HELLO_ACK, got {:?}", other.kind()),
            Err(_) if self.signal.is_stopped() => return Ok(SessionEnd::Stopped),
            Err(e) => return Err(e).context("No HELLO_ACK from coordinator"),
        };

        // A coordinator that pings slower than our TTL is not dead between pings
        reader.get_ref().set_read_timeout(Some(ttl))?;
        debug!("Coordinator TTL is {:?}", ttl);

        let (task_tx, task_rx) = mpsc::channel::<(TaskId, GenomeId, Vec<u8>)>();
        let task_rx = Mutex::new(task_rx);
        let done = AtomicBool::new(false);

        let end = thread::scope(|s| {
            for _ in 0..self.config.capacity {
                s.spawn(|| self.evaluate_loop(&task_rx, &writer));
            }
            s.spawn(|| heartbeat_loop(hb_ivl, &writer, &done));

            let end = self.read_loop(&mut reader, &task_tx, ttl);
            done.store(true, Ordering::Relaxed);
            drop(task_tx);
            let _ = stream.shutdown(Shutdown::Both);
            end
        });
        lock(&self.signal.conn).take();

        Ok(end)
    }

    fn read_loop(
        &self,
        reader: &mut BufReader<TcpStream>,
        tasks: &mpsc::Sender<(TaskId, GenomeId, Vec<u8>)>,
        ttl: Duration,
    ) -> SessionEnd {
        loop {
            let msg = read_message(reader);
            if self.signal.is_stopped() {
                return SessionEnd::Stopped;
            }

            match msg {
                Ok(Message::Heartbeat) => trace!("hb"),
                Ok(Message::Task {
                    task_id,
                    genome_id,
                    payload,
                }) => {
                    trace!("Received task {} (genome {})", task_id, genome_id);
                    if tasks.send((task_id, genome_id, payload)).is_err() {
                        return SessionEnd::Lost("evaluation threads exited".to_string());
                    }
                }
                Ok(Message::Shutdown) => return SessionEnd::Shutdown,
                Ok(Message::Reject { reason }) => return SessionEnd::Rejected(reason),
                Ok(other) => {
                    return SessionEnd::Lost(
                        ProtocolError::Unexpected(other.kind()).to_string(),
                    );
                }
                Err(ProtocolError::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    return SessionEnd::Lost(format!("nothing heard for {:?}", ttl));
                }
                Err(e) => return SessionEnd::Lost(e.to_string()),
            }
        }
    }

    /// Pull tasks until the channel closes, reporting each result
    fn evaluate_loop(
        &self,
        tasks: &Mutex<Receiver<(TaskId, GenomeId, Vec<u8>)>>,
        writer: &Mutex<TcpStream>,
    ) {
        loop {
            let next = lock(tasks).recv();
            let Ok((task_id, genome_id, payload)) = next else {
                return;
            };

            let started = Instant::now();
            let outcome = self.evaluate(genome_id, &payload);
            debug!(
                "Evaluated genome {} in {:.2?}: {:?}",
                genome_id,
                started.elapsed(),
                &outcome
            );

            let res = write_message(&mut *lock(writer), &Message::Result { task_id, outcome });
            if let Err(e) = res {
                debug!("Failed to send result for task {}: {}", task_id, e);
            }
        }
    }

    fn evaluate(&self, genome_id: GenomeId, payload: &[u8]) -> Outcome {
        match panic::catch_unwind(AssertUnwindSafe(|| {
            self.fitness.evaluate(genome_id, payload)
        })) {
            Ok(Ok(fitness)) => Outcome::Fitness(fitness),
            Ok(Err(e)) => {
                warn!("Fitness function failed on genome {}: {:#}", genome_id, e);
                Outcome::Error(format!("{:#}", e))
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!("Fitness function panicked on genome {}: {}", genome_id, msg);
                Outcome::Error(format!("panicked: {}", msg))
            }
        }
    }

    fn sleep(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        while !self.signal.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL_IVL));
        }
    }
}

fn heartbeat_loop(interval: Duration, writer: &Mutex<TcpStream>, done: &AtomicBool) {
    let mut last_hb = Instant::now();
    while !done.load(Ordering::Relaxed) {
        if last_hb.elapsed() >= interval {
            if let Err(e) = write_message(&mut *lock(writer), &Message::Heartbeat) {
                debug!("Failed to send heartbeat: {}", e);
                return;
            }
            last_hb = Instant::now();
        }
        thread::sleep(interval.saturating_sub(last_hb.elapsed()).min(POLL_IVL));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
