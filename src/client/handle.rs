//! Client-side worker handle: event demultiplexer, control-stream writer
//! with silent reconnection, and the post-exit API guard.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::node_client::NodeClient;
use crate::error::{FleetError, Result};
use crate::protocol::{ControlFrame, CreateWorkerRequest, EventFrame, FaultPayload, LineParser};

const STREAM_BUFFER: usize = 64;

/// Lifecycle events surfaced to the caller. Stdout and stderr travel on
/// their own byte-chunk channels.
#[derive(Debug)]
pub enum WorkerEvent {
    Online,
    Message(Vec<u8>),
    Error(FleetError),
    Exit(i32),
}

#[derive(Debug, Clone)]
enum Terminal {
    Exit(i32),
    Fault(FaultPayload),
    Disconnected,
}

#[derive(Debug)]
struct HandleShared {
    id: Uuid,
    stdin_enabled: bool,
    control_tx: mpsc::UnboundedSender<ControlFrame>,
    terminal: watch::Sender<Option<Terminal>>,
    stop_control: CancellationToken,
    stdin_warned: AtomicBool,
    node: Arc<NodeClient>,
}

impl HandleShared {
    fn ensure_alive(&self) -> Result<()> {
        if self.terminal.borrow().is_some() {
            return Err(FleetError::WorkerAfterExit);
        }
        Ok(())
    }

    /// Record the terminal state exactly once; later calls are no-ops.
    fn finish(&self, terminal: Terminal) {
        let first = self.terminal.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(terminal.clone());
                true
            } else {
                false
            }
        });
        if first {
            self.stop_control.cancel();
            self.node.worker_finished();
        }
    }
}

/// Handle to one remote worker. Dropping the handle closes both streams,
/// which lets the node's `exitOnRequestEnd` grace logic reclaim the child.
#[derive(Debug)]
pub struct WorkerHandle {
    shared: Arc<HandleShared>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    stdout: Option<mpsc::Receiver<Vec<u8>>>,
    stderr: Option<mpsc::Receiver<Vec<u8>>>,
    demux_task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Open the event stream and the paired control stream for a new
    /// worker on `node`.
    pub(crate) async fn connect(
        node: Arc<NodeClient>,
        request: CreateWorkerRequest,
    ) -> Result<WorkerHandle> {
        let stdin_enabled = request.extra_data.stdin;
        let (id, byte_stream) = node.create_worker(&request).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stdout_tx, stdout_rx) = mpsc::channel(STREAM_BUFFER);
        let (stderr_tx, stderr_rx) = mpsc::channel(STREAM_BUFFER);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (terminal_tx, _) = watch::channel(None);
        let stop_control = CancellationToken::new();

        let shared = Arc::new(HandleShared {
            id,
            stdin_enabled,
            control_tx,
            terminal: terminal_tx,
            stop_control: stop_control.clone(),
            stdin_warned: AtomicBool::new(false),
            node: node.clone(),
        });

        node.worker_started();
        tracing::debug!(worker_id = %id, node = %node.base_url(), "Worker handle connected");

        let demux_shared = shared.clone();
        let demux_task = tokio::spawn(async move {
            demux(demux_shared, byte_stream, event_tx, stdout_tx, stderr_tx).await;
        });
        tokio::spawn(control_loop(node, id, control_rx, stop_control));

        Ok(WorkerHandle {
            shared,
            events: event_rx,
            stdout: Some(stdout_rx),
            stderr: Some(stderr_rx),
            demux_task,
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Receive the next lifecycle event; `None` once the stream is drained
    /// after the terminal event.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Take the stdout chunk receiver (first call only).
    pub fn take_stdout(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.stdout.take()
    }

    /// Take the stderr chunk receiver (first call only).
    pub fn take_stderr(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.stderr.take()
    }

    pub fn is_exited(&self) -> bool {
        self.shared.terminal.borrow().is_some()
    }

    /// Exit code, once a normal exit has been observed.
    pub fn exit_code(&self) -> Option<i32> {
        match self.shared.terminal.borrow().as_ref() {
            Some(Terminal::Exit(code)) => Some(*code),
            _ => None,
        }
    }

    /// Send an inter-process message to the worker.
    pub fn post_message(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.shared.ensure_alive()?;
        self.shared
            .control_tx
            .send(ControlFrame::WorkerMessage(payload.into()))
            .map_err(|_| FleetError::WorkerAfterExit)
    }

    /// Write bytes to the worker's standard input. When the worker was
    /// spawned without `stdin: true` this warns once; the node drops the
    /// data either way.
    pub fn write_stdin(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.shared.ensure_alive()?;
        if !self.shared.stdin_enabled && !self.shared.stdin_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(worker_id = %self.shared.id, "Worker was spawned without stdin; writes will be dropped");
        }
        self.shared
            .control_tx
            .send(ControlFrame::Stdin(bytes.into()))
            .map_err(|_| FleetError::WorkerAfterExit)
    }

    /// Request graceful termination and wait for the exit to be observed.
    ///
    /// Fails immediately with `WorkerAfterExit` once the worker is gone.
    pub async fn terminate(&self) -> Result<i32> {
        self.shared.ensure_alive()?;
        self.shared
            .control_tx
            .send(ControlFrame::Terminate)
            .map_err(|_| FleetError::WorkerAfterExit)?;

        let mut terminal = self.shared.terminal.subscribe();
        loop {
            let seen = terminal.borrow_and_update().clone();
            if let Some(terminal) = seen {
                return match terminal {
                    Terminal::Exit(code) => Ok(code),
                    Terminal::Fault(fault) => Err(FleetError::WorkerFault(fault)),
                    Terminal::Disconnected => Err(FleetError::WorkerDisconnected),
                };
            }
            if terminal.changed().await.is_err() {
                return Err(FleetError::WorkerDisconnected);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.shared.terminal.borrow().is_none() {
            self.shared.finish(Terminal::Disconnected);
        }
        // Dropping the demux task drops the HTTP response, closing the
        // node's read stream for this worker.
        self.demux_task.abort();
    }
}

/// Dispatch event-stream lines to the handle's channels. A stream that
/// ends before a terminal event surfaces `WorkerDisconnected`.
async fn demux(
    shared: Arc<HandleShared>,
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
) {
    let mut parser = LineParser::new();
    let mut online_emitted = false;
    let mut terminal_seen = false;
    let mut byte_stream = std::pin::pin!(byte_stream);

    'outer: while let Some(chunk) = byte_stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(worker_id = %shared.id, error = %e, "Event stream transport error");
                break;
            }
        };
        for (name, value) in parser.push(&bytes) {
            match EventFrame::decode(&name, &value) {
                Some(EventFrame::Online(flag)) => {
                    if flag && !online_emitted {
                        online_emitted = true;
                        let _ = event_tx.send(WorkerEvent::Online);
                    }
                }
                Some(EventFrame::Stdout(bytes)) => {
                    let _ = stdout_tx.send(bytes).await;
                }
                Some(EventFrame::Stderr(bytes)) => {
                    let _ = stderr_tx.send(bytes).await;
                }
                Some(EventFrame::Message(bytes)) => {
                    let _ = event_tx.send(WorkerEvent::Message(bytes));
                }
                Some(EventFrame::Exit(code)) => {
                    terminal_seen = true;
                    shared.finish(Terminal::Exit(code));
                    let _ = event_tx.send(WorkerEvent::Exit(code));
                    break 'outer;
                }
                Some(EventFrame::Error(fault)) => {
                    terminal_seen = true;
                    shared.finish(Terminal::Fault(fault.clone()));
                    deliver_error(&event_tx, FleetError::WorkerFault(fault));
                    break 'outer;
                }
                // Unknown names are ignored for forward compatibility.
                None => {}
            }
        }
    }

    if !terminal_seen {
        shared.finish(Terminal::Disconnected);
        deliver_error(&event_tx, FleetError::WorkerDisconnected);
    }
}

/// Errors must never vanish: when the caller has dropped the event
/// receiver, log instead.
fn deliver_error(event_tx: &mpsc::UnboundedSender<WorkerEvent>, error: FleetError) {
    if let Err(returned) = event_tx.send(WorkerEvent::Error(error)) {
        if let WorkerEvent::Error(error) = returned.0 {
            tracing::error!(error = %error, "Worker error with no event receiver attached");
        }
    }
}

/// Keep one control connection open to the worker, re-opening it silently
/// whenever the transport drops while the worker is still alive. The
/// node's read end is stateless, so reconnection is transparent.
async fn control_loop(
    node: Arc<NodeClient>,
    id: Uuid,
    mut frames: mpsc::UnboundedReceiver<ControlFrame>,
    stop: CancellationToken,
) {
    loop {
        let (chunk_tx, chunk_rx) = mpsc::channel::<std::result::Result<Bytes, Infallible>>(STREAM_BUFFER);
        let body = reqwest::Body::wrap_stream(ReceiverStream::new(chunk_rx));
        let send = node.post_control(id, body);
        tokio::pin!(send);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        let line = Bytes::from(frame.encode());
                        if chunk_tx.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    // Handle dropped; let the body end and the request finish.
                    None => return,
                },
                finished = &mut send => {
                    match finished {
                        Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                            tracing::debug!(worker_id = %id, "Control stream target gone");
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(worker_id = %id, error = %e, "Control stream transport error");
                            // Back off briefly so an unreachable node does
                            // not turn the reconnect into a busy loop.
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                    break;
                }
            }
        }

        if stop.is_cancelled() {
            return;
        }
        tracing::debug!(worker_id = %id, "Re-opening control stream");
    }
}
