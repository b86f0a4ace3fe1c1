//! Worker lifecycle tracking and event fan-out.
//!
//! Each worker owns one pump task that sequences host events into a
//! broadcast channel; each attached HTTP reader gets a forwarding task that
//! writes the current `online` flag first, then relays events until the
//! terminal event or the reader disconnects. All per-worker mutable state
//! sits behind a single mutex, and the broadcast send happens under that
//! mutex so a late subscriber never misses the event it straddles.

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::node::host::{HostCommand, HostEvent, WorkerHost};
use crate::protocol::{ControlFrame, EventFrame, SpawnOptions};

const EVENT_BUFFER: usize = 256;
const READER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Online,
    Exited,
}

struct WorkerState {
    lifecycle: Lifecycle,
    /// Number of currently-open outbound event streams.
    readers: usize,
    /// Terminal frame, kept so a reader attaching in the removal window
    /// still observes it.
    terminal: Option<EventFrame>,
}

pub struct WorkerEntry {
    pub id: Uuid,
    pub bundle_hash: String,
    stdin_enabled: bool,
    state: Mutex<WorkerState>,
    events: broadcast::Sender<EventFrame>,
    commands: mpsc::Sender<HostCommand>,
    /// Host events parked here until the creating reader has attached, so
    /// a fast worker cannot race its own event stream.
    pending_events: Mutex<Option<mpsc::Receiver<HostEvent>>>,
}

impl WorkerEntry {
    /// Snapshot the online flag and subscribe atomically with respect to
    /// lifecycle transitions.
    fn attach(&self) -> (bool, Option<EventFrame>, broadcast::Receiver<EventFrame>) {
        let mut state = self.state.lock().expect("worker state lock poisoned");
        state.readers += 1;
        let online = state.lifecycle == Lifecycle::Online;
        (online, state.terminal.clone(), self.events.subscribe())
    }

    pub fn is_exited(&self) -> bool {
        let state = self.state.lock().expect("worker state lock poisoned");
        state.lifecycle == Lifecycle::Exited
    }

    pub fn reader_count(&self) -> usize {
        let state = self.state.lock().expect("worker state lock poisoned");
        state.readers
    }

    /// Apply a host event under the state lock and broadcast the resulting
    /// frame. Returns the frame's terminality, or `None` when nothing was
    /// broadcast (duplicate online after transition).
    fn apply(&self, event: HostEvent) -> Option<bool> {
        let frame = {
            let mut state = self.state.lock().expect("worker state lock poisoned");
            let frame = match event {
                HostEvent::Online => {
                    if state.lifecycle != Lifecycle::Pending {
                        return None;
                    }
                    state.lifecycle = Lifecycle::Online;
                    EventFrame::Online(true)
                }
                HostEvent::Stdout(bytes) => EventFrame::Stdout(bytes),
                HostEvent::Stderr(bytes) => EventFrame::Stderr(bytes),
                HostEvent::Message(bytes) => EventFrame::Message(bytes),
                HostEvent::Exit(code) => {
                    state.lifecycle = Lifecycle::Exited;
                    state.terminal = Some(EventFrame::Exit(code));
                    EventFrame::Exit(code)
                }
                HostEvent::Fault(fault) => {
                    state.lifecycle = Lifecycle::Exited;
                    state.terminal = Some(EventFrame::Error(fault.clone()));
                    EventFrame::Error(fault)
                }
            };
            let _ = self.events.send(frame.clone());
            frame
        };
        Some(frame.is_terminal())
    }
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<Uuid, Arc<WorkerEntry>>>,
    host: Arc<dyn WorkerHost>,
    exit_grace: Duration,
    drain: CancellationToken,
}

impl WorkerRegistry {
    pub fn new(host: Arc<dyn WorkerHost>, exit_grace: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            host,
            exit_grace,
            drain: CancellationToken::new(),
        }
    }

    /// Close every open event stream. Readers observe a normal stream end
    /// (no terminal event), which clients surface as a disconnect; workers
    /// created with `exitOnRequestEnd` are then reclaimed via the grace
    /// window.
    pub fn drain(&self) {
        self.drain.cancel();
    }

    /// Spawn a worker for a cached bundle. The returned entry is already
    /// registered; its identifier goes into the `x-worker-id` header.
    pub async fn create_worker(
        self: &Arc<Self>,
        bundle_hash: String,
        artifact: PathBuf,
        options: SpawnOptions,
    ) -> Result<Arc<WorkerEntry>> {
        let stdin_enabled = options.stdin;
        let spawned = self.host.spawn(artifact, options).await?;

        let id = Uuid::new_v4();
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let entry = Arc::new(WorkerEntry {
            id,
            bundle_hash,
            stdin_enabled,
            state: Mutex::new(WorkerState {
                lifecycle: Lifecycle::Pending,
                readers: 0,
                terminal: None,
            }),
            events: events_tx,
            commands: spawned.commands,
            pending_events: Mutex::new(Some(spawned.events)),
        });

        self.workers.write().await.insert(id, entry.clone());
        tracing::info!(worker_id = %id, bundle_hash = %entry.bundle_hash, "Worker created");

        Ok(entry)
    }

    /// Start draining host events into the broadcast channel. Called once
    /// the creating reader is attached; later calls are no-ops.
    pub fn start_pump(self: &Arc<Self>, entry: &Arc<WorkerEntry>) {
        let parked = entry
            .pending_events
            .lock()
            .expect("pending events lock poisoned")
            .take();
        if let Some(events) = parked {
            let registry = self.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                registry.pump(entry, events).await;
            });
        }
    }

    async fn pump(self: Arc<Self>, entry: Arc<WorkerEntry>, mut events: mpsc::Receiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            match entry.apply(event) {
                Some(true) => break,
                Some(false) | None => {}
            }
        }
        self.workers.write().await.remove(&entry.id);
        tracing::debug!(worker_id = %entry.id, "Worker retired");
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<WorkerEntry>> {
        self.workers.read().await.get(id).cloned()
    }

    /// Identifiers of live (not yet exited) workers.
    pub async fn live_ids(&self) -> Vec<Uuid> {
        self.workers.read().await.keys().copied().collect()
    }

    pub async fn running_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Open an event stream for one reader. The stream carries encoded
    /// `name: value` lines and closes after the terminal event; a dropped
    /// reader never affects the child or other readers.
    pub fn event_stream(
        self: &Arc<Self>,
        entry: Arc<WorkerEntry>,
        exit_on_request_end: bool,
    ) -> ReceiverStream<std::result::Result<Bytes, Infallible>> {
        let (tx, rx) = mpsc::channel(READER_BUFFER);
        let (online, terminal, mut events) = entry.attach();
        let registry = self.clone();
        let drain = self.drain.clone();

        tokio::spawn(async move {
            let opening = EventFrame::Online(online).encode();
            if tx.send(Ok(Bytes::from(opening))).await.is_ok() {
                if let Some(frame) = terminal {
                    let _ = tx.send(Ok(Bytes::from(frame.encode()))).await;
                } else {
                    relay_events(&tx, &mut events, &drain).await;
                }
            }
            registry.reader_closed(&entry, exit_on_request_end);
        });

        ReceiverStream::new(rx)
    }

    fn reader_closed(&self, entry: &Arc<WorkerEntry>, exit_on_request_end: bool) {
        let should_schedule = {
            let mut state = entry.state.lock().expect("worker state lock poisoned");
            state.readers -= 1;
            state.readers == 0
                && exit_on_request_end
                && state.lifecycle != Lifecycle::Exited
        };
        if !should_schedule {
            return;
        }

        // Grace window: a reader reattaching in time cancels termination,
        // tolerating brief network interruptions.
        let grace = self.exit_grace;
        let entry = entry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_abandoned = {
                let state = entry.state.lock().expect("worker state lock poisoned");
                state.readers == 0 && state.lifecycle != Lifecycle::Exited
            };
            if still_abandoned {
                tracing::info!(worker_id = %entry.id, "No readers after grace window, terminating worker");
                let _ = entry.commands.send(HostCommand::Terminate).await;
            }
        });
    }

    /// Deliver one control frame to the worker. Stdin is dropped silently
    /// when the worker was spawned without it; frames to an exited worker
    /// are ignored.
    pub async fn deliver(&self, entry: &Arc<WorkerEntry>, frame: ControlFrame) {
        if entry.is_exited() {
            return;
        }
        let command = match frame {
            ControlFrame::Stdin(bytes) => {
                if !entry.stdin_enabled {
                    tracing::debug!(worker_id = %entry.id, "Dropping stdin for worker spawned without stdin");
                    return;
                }
                HostCommand::Stdin(bytes)
            }
            ControlFrame::WorkerMessage(bytes) => HostCommand::Message(bytes),
            ControlFrame::Terminate => HostCommand::Terminate,
        };
        if entry.commands.send(command).await.is_err() {
            tracing::debug!(worker_id = %entry.id, "Worker host gone, control frame dropped");
        }
    }
}

async fn relay_events(
    tx: &mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    events: &mut broadcast::Receiver<EventFrame>,
    drain: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = drain.cancelled() => break,
            _ = tx.closed() => break,
            received = events.recv() => match received {
                Ok(frame) => {
                    let terminal = frame.is_terminal();
                    if tx.send(Ok(Bytes::from(frame.encode()))).await.is_err() {
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Slow event reader lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
