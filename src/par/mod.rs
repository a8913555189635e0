//! Master/worker work-unit dispatcher.
//!
//! The master owns a queue of work units and drives any number of
//! workers over an abstract [`Transport`]. Workers announce themselves
//! with `Ready`, receive `Assign` messages, stream captured output back
//! as `Log` chunks, and report `Done` with a status. The master requeues
//! failed units up to the retry limit, treats unit timeouts as failures,
//! appends logs per unit, and sends `Exit` to every worker once the
//! queue drains. Only transport errors are fatal to either loop;
//! per-unit failures are bookkeeping.

pub mod transport;

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::trace::trace_event;
use crate::util::{GridAlignError, GridAlignResult};

/// Node address on a transport; the master is always node 0.
pub type NodeId = usize;

/// The master's node id.
pub const MASTER: NodeId = 0;

/// Unique id of a work unit within one dispatch run.
pub type UnitId = u64;

/// What a work unit asks a worker to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Build and cache pyramid levels for one image.
    PyramidBuild,
    /// Register one (moving, reference) pair and write its map.
    PairRegister,
    /// Relax one color class of the adjacency graph.
    RelaxBlock,
}

/// A self-contained task executed by one worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: UnitId,
    pub kind: WorkKind,
    /// Command line for the unit: program followed by its arguments.
    pub args: Vec<String>,
}

/// Terminal status of one unit attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Ok,
    Fail { reason: String },
}

/// Protocol messages between master and workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// Worker to master: idle and requesting a unit.
    Ready,
    /// Worker to master: a unit attempt finished.
    Done { id: UnitId, status: UnitStatus },
    /// Worker to master: captured output for a running unit.
    Log { id: UnitId, bytes: Vec<u8> },
    /// Master to worker: run this unit.
    Assign { unit: WorkUnit },
    /// Master to worker: shut down.
    Exit,
}

/// Point-to-point message transport between dispatcher nodes.
pub trait Transport: Send {
    /// Sends a message to a node.
    fn send(&self, msg: Message, dest: NodeId) -> GridAlignResult<()>;
    /// Blocks until a message arrives.
    fn recv(&self) -> GridAlignResult<(Message, NodeId)>;
    /// Waits up to `timeout` for a message; `None` on expiry.
    fn recv_timeout(&self, timeout: Duration) -> GridAlignResult<Option<(Message, NodeId)>>;
}

/// Master-side dispatch parameters.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// How many times a failing unit is requeued before it is marked
    /// permanently failed.
    pub max_retries: usize,
    /// Wall-clock limit per unit attempt; expiry counts as a failure.
    pub unit_timeout: Option<Duration>,
    /// Directory for per-unit log files; `None` keeps logs in memory.
    pub log_dir: Option<PathBuf>,
    /// Poll interval of the master loop.
    pub tick: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            unit_timeout: None,
            log_dir: None,
            tick: Duration::from_millis(100),
        }
    }
}

/// Final accounting for one unit.
#[derive(Clone, Debug)]
pub struct UnitOutcome {
    pub id: UnitId,
    /// Attempts consumed, including the successful one.
    pub attempts: usize,
    /// `None` for completed units, the last reason otherwise.
    pub failure: Option<String>,
}

/// Shutdown report of a dispatch run.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<UnitOutcome>,
    /// In-memory logs per unit when no log directory is configured.
    pub logs: HashMap<UnitId, Vec<u8>>,
}

impl DispatchReport {
    /// True when every unit completed.
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.failure.is_none())
    }

    /// Units that failed permanently, in id order.
    pub fn failed(&self) -> Vec<&UnitOutcome> {
        self.outcomes.iter().filter(|o| o.failure.is_some()).collect()
    }
}

struct Running {
    worker: NodeId,
    unit: WorkUnit,
    deadline: Option<Instant>,
}

/// The master side of the dispatcher.
pub struct Dispatcher<T: Transport> {
    transport: T,
    cfg: DispatchConfig,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, cfg: DispatchConfig) -> Self {
        Self { transport, cfg }
    }

    /// Runs the queue to completion over the given workers and returns
    /// the shutdown report. Fatal only on transport errors.
    pub fn run(
        &mut self,
        units: Vec<WorkUnit>,
        workers: &[NodeId],
    ) -> GridAlignResult<DispatchReport> {
        let mut pending: VecDeque<WorkUnit> = units.into();
        let mut attempts: HashMap<UnitId, usize> = HashMap::new();
        let mut running: HashMap<UnitId, Running> = HashMap::new();
        let mut idle: VecDeque<NodeId> = VecDeque::new();
        let mut report = DispatchReport::default();

        while !pending.is_empty() || !running.is_empty() {
            // Hand queued units to idle workers.
            while !pending.is_empty() && !idle.is_empty() {
                let unit = pending.pop_front().expect("pending unit");
                let worker = idle.pop_front().expect("idle worker");
                *attempts.entry(unit.id).or_insert(0) += 1;
                let deadline = self.cfg.unit_timeout.map(|t| Instant::now() + t);
                self.transport
                    .send(Message::Assign { unit: unit.clone() }, worker)?;
                running.insert(
                    unit.id,
                    Running {
                        worker,
                        unit,
                        deadline,
                    },
                );
            }

            match self.transport.recv_timeout(self.cfg.tick)? {
                Some((Message::Ready, src)) => idle.push_back(src),
                Some((Message::Done { id, status }, src)) => {
                    // A unit already timed out here may still report from
                    // its original worker; such stale results are dropped.
                    let current = running.get(&id).map(|r| r.worker);
                    if current == Some(src) {
                        let running_unit = running.remove(&id).expect("tracked unit");
                        match status {
                            UnitStatus::Ok => report.outcomes.push(UnitOutcome {
                                id,
                                attempts: attempts[&id],
                                failure: None,
                            }),
                            UnitStatus::Fail { reason } => {
                                self.note_retry(&mut pending, &mut report, &attempts, running_unit.unit, &reason);
                            }
                        }
                    }
                }
                Some((Message::Log { id, bytes }, _)) => self.append_log(&mut report, id, &bytes)?,
                Some((_, src)) => {
                    return Err(GridAlignError::Transport {
                        reason: format!("unexpected master-bound message from node {src}"),
                    });
                }
                None => {}
            }

            // Expired units count as failed attempts and are requeued.
            let now = Instant::now();
            let expired: Vec<UnitId> = running
                .iter()
                .filter(|(_, r)| r.deadline.is_some_and(|d| d <= now))
                .map(|(&id, _)| id)
                .collect();
            for id in expired {
                let timed_out = running.remove(&id).expect("tracked unit");
                self.note_retry(
                    &mut pending,
                    &mut report,
                    &attempts,
                    timed_out.unit,
                    "timeout",
                );
            }
        }

        for &worker in workers {
            self.transport.send(Message::Exit, worker)?;
        }
        report.outcomes.sort_by_key(|o| o.id);
        trace_event!(
            "dispatch_done",
            units = report.outcomes.len(),
            failed = report.failed().len()
        );
        Ok(report)
    }

    fn note_retry(
        &self,
        pending: &mut VecDeque<WorkUnit>,
        report: &mut DispatchReport,
        attempts: &HashMap<UnitId, usize>,
        unit: WorkUnit,
        reason: &str,
    ) {
        let tried = attempts[&unit.id];
        if tried <= self.cfg.max_retries {
            pending.push_back(unit);
        } else {
            report.outcomes.push(UnitOutcome {
                id: unit.id,
                attempts: tried,
                failure: Some(reason.to_string()),
            });
        }
    }

    fn append_log(
        &self,
        report: &mut DispatchReport,
        id: UnitId,
        bytes: &[u8],
    ) -> GridAlignResult<()> {
        match &self.cfg.log_dir {
            Some(dir) => {
                let path = dir.join(format!("unit-{id}.log"));
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|err| GridAlignError::io(&path, err))?;
                file.write_all(bytes)
                    .map_err(|err| GridAlignError::io(&path, err))
            }
            None => {
                report.logs.entry(id).or_default().extend_from_slice(bytes);
                Ok(())
            }
        }
    }
}

/// How a worker executes one unit attempt.
pub trait UnitExecutor {
    /// Runs the unit, feeding captured output chunks to `log`.
    fn execute(&mut self, unit: &WorkUnit, log: &mut dyn FnMut(&[u8])) -> UnitStatus;
}

/// Executes units as child processes, forwarding their merged
/// stdout/stderr in chunks.
#[derive(Default)]
pub struct ProcessExecutor;

impl UnitExecutor for ProcessExecutor {
    fn execute(&mut self, unit: &WorkUnit, log: &mut dyn FnMut(&[u8])) -> UnitStatus {
        let Some((program, args)) = unit.args.split_first() else {
            return UnitStatus::Fail {
                reason: "empty command line".into(),
            };
        };
        let child = std::process::Command::new(program)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                return UnitStatus::Fail {
                    reason: format!("spawn failed: {err}"),
                }
            }
        };

        let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx.clone()));
        }
        drop(tx);
        for chunk in rx {
            log(&chunk);
        }
        for reader in readers {
            let _ = reader.join();
        }

        match child.wait() {
            Ok(status) if status.success() => UnitStatus::Ok,
            Ok(status) => UnitStatus::Fail {
                reason: match status.code() {
                    Some(code) => format!("exit code {code}"),
                    None => "killed by signal".into(),
                },
            },
            Err(err) => UnitStatus::Fail {
                reason: format!("wait failed: {err}"),
            },
        }
    }
}

fn spawn_reader(
    mut source: impl std::io::Read + Send + 'static,
    tx: std::sync::mpsc::Sender<Vec<u8>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// The worker side of the dispatcher.
pub struct Worker<T: Transport, E: UnitExecutor> {
    transport: T,
    executor: E,
}

impl<T: Transport, E: UnitExecutor> Worker<T, E> {
    pub fn new(transport: T, executor: E) -> Self {
        Self {
            transport,
            executor,
        }
    }

    /// Serves units until the master sends `Exit`.
    pub fn run(&mut self) -> GridAlignResult<()> {
        loop {
            self.transport.send(Message::Ready, MASTER)?;
            match self.transport.recv()? {
                (Message::Assign { unit }, _) => {
                    let id = unit.id;
                    let transport = &self.transport;
                    let mut log = |bytes: &[u8]| {
                        let _ = transport.send(
                            Message::Log {
                                id,
                                bytes: bytes.to_vec(),
                            },
                            MASTER,
                        );
                    };
                    let status = self.executor.execute(&unit, &mut log);
                    self.transport.send(Message::Done { id, status }, MASTER)?;
                }
                (Message::Exit, _) => return Ok(()),
                (other, src) => {
                    return Err(GridAlignError::Transport {
                        reason: format!("unexpected {other:?} from node {src}"),
                    });
                }
            }
        }
    }
}
