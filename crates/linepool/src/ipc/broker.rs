//! Loopback broker that authenticates worker connections.
//!
//! Every worker, forked or spawned, dials the broker and identifies itself:
//!
//! ```text
//!   worker                         broker
//!     |---- Hello{token,slot,gen} ---->|  token and slot generation checked
//!     |<--------- Init{flow} ----------|
//!     |------------ Ready ------------>|  slot published as ready
//!     |<======= Execute / ... ========>|  owned by the slot's monitor
//! ```
//!
//! After the handshake a reader thread forwards the worker's frames into an
//! in-process channel, so the monitor can poll with a timeout.

use std::io::BufReader;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::error::{PoolError, Result};

use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Binding of a slot to an OS process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub index: usize,
    pub process_id: u32,
    pub process_name: String,
}

/// A worker's private command/response pair.
pub struct WorkerChannel {
    writer: TcpStream,
    responses: Receiver<WorkerResponse>,
}

impl WorkerChannel {
    pub fn send(&mut self, command: &WorkerCommand) -> Result<()> {
        write_message(&mut self.writer, command)
    }

    /// Wait for the next frame. `Disconnected` means the connection closed.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<WorkerResponse, RecvTimeoutError> {
        self.responses.recv_timeout(timeout)
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

/// A ready worker as seen by its monitor thread.
pub struct WorkerSlot {
    pub info: ProcessInfo,
    pub channel: WorkerChannel,
}

/// Handshake state of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready(ProcessInfo),
    /// The worker connected but could not build its executor.
    Failed(String),
}

#[derive(Default)]
struct SlotEntry {
    generation: u64,
    process_name: String,
    info: Option<ProcessInfo>,
    channel: Option<WorkerChannel>,
    failure: Option<String>,
}

struct Shared {
    token: String,
    flow_json: Vec<u8>,
    handshake_timeout: Duration,
    slots: Mutex<FxHashMap<usize, SlotEntry>>,
    ready: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn is_current(&self, slot: usize, generation: u64) -> bool {
        self.slots
            .lock()
            .get(&slot)
            .is_some_and(|entry| entry.generation == generation)
    }
}

pub struct Broker {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Listen on an ephemeral loopback port with a fresh token.
    pub fn bind(flow_json: Vec<u8>, handshake_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            token: uuid::Uuid::new_v4().simple().to_string(),
            flow_json,
            handshake_timeout,
            slots: Mutex::new(FxHashMap::default()),
            ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let accept_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("linepool-broker".to_string())
            .spawn(move || accept_loop(listener, accept_shared))?;

        tracing::debug!(addr = %addr, "Broker listening");
        Ok(Self {
            addr,
            shared,
            accept_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn token(&self) -> &str {
        &self.shared.token
    }

    /// Expect a new process for `slot`. Connections from older generations
    /// are refused from now on.
    pub fn expect(&self, slot: usize, generation: u64, process_name: String) {
        let mut slots = self.shared.slots.lock();
        let entry = slots.entry(slot).or_default();
        entry.generation = generation;
        entry.process_name = process_name;
        entry.info = None;
        entry.channel = None;
        entry.failure = None;
    }

    /// Unpublish a slot, closing its channel if nobody claimed it.
    pub fn forget(&self, slot: usize) -> Option<ProcessInfo> {
        let mut slots = self.shared.slots.lock();
        let entry = slots.get_mut(&slot)?;
        entry.channel = None;
        entry.info.take()
    }

    pub fn readiness(&self, slot: usize) -> Readiness {
        let slots = self.shared.slots.lock();
        readiness_of(slots.get(&slot))
    }

    /// Block until the slot's handshake completes, fails, or `timeout` passes.
    pub fn wait_ready(&self, slot: usize, timeout: Duration) -> Readiness {
        let deadline = Instant::now() + timeout;
        let mut slots = self.shared.slots.lock();
        loop {
            let state = readiness_of(slots.get(&slot));
            if state != Readiness::Pending {
                return state;
            }
            let now = Instant::now();
            if now >= deadline {
                return Readiness::Pending;
            }
            self.shared.ready.wait_for(&mut slots, deadline - now);
        }
    }

    /// Claim the slot's channel. Only the first caller after a handshake gets it.
    pub fn take_channel(&self, slot: usize) -> Option<WorkerChannel> {
        self.shared
            .slots
            .lock()
            .get_mut(&slot)
            .and_then(|entry| entry.channel.take())
    }

    /// Snapshot of all ready slots, ordered by index.
    pub fn process_infos(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .shared
            .slots
            .lock()
            .values()
            .filter_map(|entry| entry.info.clone())
            .collect();
        infos.sort_by_key(|info| info.index);
        infos
    }

    /// Stop accepting connections and drop every unclaimed channel.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.lock().take()
            && handle.join().is_err()
        {
            tracing::warn!("Broker accept thread panicked");
        }
        self.shared.slots.lock().clear();
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn readiness_of(entry: Option<&SlotEntry>) -> Readiness {
    match entry {
        Some(SlotEntry {
            info: Some(info), ..
        }) => Readiness::Ready(info.clone()),
        Some(SlotEntry {
            failure: Some(message),
            ..
        }) => Readiness::Failed(message.clone()),
        _ => Readiness::Pending,
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                let spawned = thread::Builder::new()
                    .name("linepool-handshake".to_string())
                    .spawn(move || {
                        if let Err(e) = handshake(stream, &shared) {
                            tracing::warn!(peer = %peer, error = %e, "Rejected worker connection");
                        }
                    });
                if let Err(e) = spawned {
                    tracing::error!(error = %e, "Failed to spawn handshake thread");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!(error = %e, "Broker accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handshake(stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(shared.handshake_timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let (slot, generation, pid) = match read_message(&mut reader)? {
        WorkerResponse::Hello {
            token,
            slot,
            generation,
            pid,
        } => {
            if token != shared.token {
                return Err(PoolError::Ipc("invalid broker token".to_string()));
            }
            (slot as usize, generation, pid)
        }
        other => {
            return Err(PoolError::Ipc(format!("expected Hello, got {other:?}")));
        }
    };

    if !shared.is_current(slot, generation) {
        return Err(PoolError::Ipc(format!(
            "stale worker {pid} for slot {slot} (generation {generation})"
        )));
    }

    write_message(
        &mut writer,
        &WorkerCommand::Init {
            flow_json: shared.flow_json.clone(),
        },
    )?;

    match read_message(&mut reader)? {
        WorkerResponse::Ready => {}
        WorkerResponse::Error { message } => {
            let mut slots = shared.slots.lock();
            if let Some(entry) = slots.get_mut(&slot).filter(|e| e.generation == generation) {
                entry.failure = Some(message.clone());
            }
            shared.ready.notify_all();
            return Err(PoolError::Startup(format!(
                "worker {pid} for slot {slot} failed to initialize: {message}"
            )));
        }
        other => {
            return Err(PoolError::Ipc(format!("expected Ready, got {other:?}")));
        }
    }
    writer.set_read_timeout(None)?;

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("linepool-reader-{slot}"))
        .spawn(move || forward_responses(reader, tx))?;

    let mut slots = shared.slots.lock();
    let Some(entry) = slots.get_mut(&slot).filter(|e| e.generation == generation) else {
        return Err(PoolError::Ipc(format!(
            "slot {slot} moved past generation {generation} during handshake"
        )));
    };
    entry.info = Some(ProcessInfo {
        index: slot,
        process_id: pid,
        process_name: entry.process_name.clone(),
    });
    entry.channel = Some(WorkerChannel {
        writer,
        responses: rx,
    });
    shared.ready.notify_all();
    tracing::debug!(slot, pid, generation, "Worker ready");
    Ok(())
}

fn forward_responses(mut reader: BufReader<TcpStream>, tx: Sender<WorkerResponse>) {
    while let Ok(response) = read_message::<_, WorkerResponse>(&mut reader) {
        if tx.send(response).is_err() {
            break;
        }
    }
}
