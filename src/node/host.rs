//! Child-process host seam.
//!
//! The node core does not execute entrypoints itself; it drives a
//! [`WorkerHost`] that owns the child and reports its lifecycle over plain
//! channels. [`ProcessHost`] is the production implementation: it spawns a
//! configured runtime command with the artifact path appended, pipes the
//! standard streams, and exchanges inter-process messages over a Unix
//! domain socket handed to the child via `WORKER_FLEET_IPC`.

use std::path::PathBuf;
use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::protocol::{EventFrame, FaultPayload, LineParser, SpawnOptions};

/// Lifecycle and output reported by a hosted child.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Online,
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Message(Vec<u8>),
    Exit(i32),
    Fault(FaultPayload),
}

/// Input accepted by a hosted child.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Stdin(Vec<u8>),
    Message(Vec<u8>),
    Terminate,
}

/// Channel pair returned by a successful spawn. The host guarantees that
/// `Exit` or `Fault` is the last event and is emitted exactly once.
pub struct SpawnedWorker {
    pub events: mpsc::Receiver<HostEvent>,
    pub commands: mpsc::Sender<HostCommand>,
}

pub trait WorkerHost: Send + Sync + 'static {
    fn spawn(
        &self,
        artifact: PathBuf,
        options: SpawnOptions,
    ) -> BoxFuture<'static, Result<SpawnedWorker>>;
}

/// Executes bundles as OS processes.
#[derive(Debug, Clone)]
pub struct ProcessHost {
    runtime: Vec<String>,
}

impl ProcessHost {
    /// `runtime` is the command prefix, e.g. `["node"]`; the artifact path
    /// is appended as the final argument.
    pub fn new(runtime: Vec<String>) -> Self {
        Self { runtime }
    }
}

impl WorkerHost for ProcessHost {
    fn spawn(
        &self,
        artifact: PathBuf,
        options: SpawnOptions,
    ) -> BoxFuture<'static, Result<SpawnedWorker>> {
        let runtime = self.runtime.clone();
        Box::pin(async move { spawn_process(runtime, artifact, options).await })
    }
}

const CHANNEL_DEPTH: usize = 64;
const READ_CHUNK: usize = 8 * 1024;

async fn spawn_process(
    runtime: Vec<String>,
    artifact: PathBuf,
    options: SpawnOptions,
) -> Result<SpawnedWorker> {
    let program = runtime
        .first()
        .ok_or_else(|| FleetError::Internal("empty runtime command".to_string()))?;

    let ipc_path = std::env::temp_dir().join(format!("worker-fleet-{}.sock", Uuid::new_v4()));
    let listener = UnixListener::bind(&ipc_path)?;

    let mut cmd = Command::new(program);
    cmd.args(&runtime[1..]);
    if let Some(exec_argv) = &options.exec_argv {
        cmd.args(exec_argv);
    }
    // Heap/stack limits map onto runtime flags; limits without a flag
    // equivalent are ignored.
    if let Some(limits) = &options.resource_limits {
        if let Some(mb) = limits.max_old_generation_size_mb {
            cmd.arg(format!("--max-old-space-size={mb}"));
        }
        if let Some(mb) = limits.max_young_generation_size_mb {
            cmd.arg(format!("--max-semi-space-size={mb}"));
        }
        if let Some(mb) = limits.stack_size_mb {
            cmd.arg(format!("--stack-size={}", mb * 1024));
        }
    }
    cmd.arg(&artifact);
    if let Some(argv) = &options.argv {
        cmd.args(argv);
    }
    if let Some(env) = &options.env {
        cmd.envs(env);
    }
    if let Some(data) = &options.worker_data {
        cmd.env(
            "WORKER_FLEET_DATA",
            serde_json::to_string(data).unwrap_or_default(),
        );
    }
    cmd.env("WORKER_FLEET_IPC", &ipc_path);
    cmd.stdin(if options.stdin {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;
    tracing::info!(artifact = %artifact.display(), program, "Worker process spawned");

    let (ev_tx, ev_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_DEPTH);

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // The child begins executing as soon as the spawn succeeds. Queued
    // before the output pumps start so `online` precedes any data event.
    let _ = ev_tx.send(HostEvent::Online).await;

    let stdout_task = stdout.map(|out| tokio::spawn(pump_output(out, ev_tx.clone(), true)));
    let stderr_task = stderr.map(|err| tokio::spawn(pump_output(err, ev_tx.clone(), false)));

    tokio::spawn(supervise(
        child,
        stdin,
        listener,
        ipc_path,
        cmd_rx,
        ev_tx,
        stdout_task,
        stderr_task,
    ));

    Ok(SpawnedWorker {
        events: ev_rx,
        commands: cmd_tx,
    })
}

async fn pump_output<R>(mut reader: R, ev_tx: mpsc::Sender<HostEvent>, is_stdout: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                let event = if is_stdout {
                    HostEvent::Stdout(chunk)
                } else {
                    HostEvent::Stderr(chunk)
                };
                if ev_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Drive one child to completion: forward commands, relay IPC messages,
/// and emit the terminal event after the output pumps have drained.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    listener: UnixListener,
    ipc_path: PathBuf,
    mut cmd_rx: mpsc::Receiver<HostCommand>,
    ev_tx: mpsc::Sender<HostEvent>,
    stdout_task: Option<tokio::task::JoinHandle<()>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
) {
    let (conn_tx, mut conn_rx) = mpsc::channel::<OwnedWriteHalf>(1);
    let accept_ev = ev_tx.clone();
    let accept_task = tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let (read, write) = stream.into_split();
            let _ = conn_tx.send(write).await;
            relay_child_messages(read, accept_ev).await;
        }
    });

    let mut ipc_out: Option<OwnedWriteHalf> = None;
    let mut queued: Vec<Vec<u8>> = Vec::new();
    let mut commands_closed = false;

    let status = loop {
        tokio::select! {
            Some(write) = conn_rx.recv(), if ipc_out.is_none() => {
                let mut write = write;
                for msg in queued.drain(..) {
                    let line = EventFrame::Message(msg).encode();
                    if write.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                ipc_out = Some(write);
            }
            cmd = cmd_rx.recv(), if !commands_closed => match cmd {
                Some(HostCommand::Stdin(bytes)) => {
                    if let Some(pipe) = stdin.as_mut() {
                        if let Err(e) = pipe.write_all(&bytes).await {
                            tracing::debug!(error = %e, "Worker stdin write failed");
                        }
                    }
                }
                Some(HostCommand::Message(bytes)) => {
                    match ipc_out.as_mut() {
                        Some(write) => {
                            let line = EventFrame::Message(bytes).encode();
                            if let Err(e) = write.write_all(line.as_bytes()).await {
                                tracing::debug!(error = %e, "Worker IPC write failed");
                                ipc_out = None;
                            }
                        }
                        // Child has not connected yet; hold the message.
                        None => queued.push(bytes),
                    }
                }
                Some(HostCommand::Terminate) => {
                    let _ = child.start_kill();
                }
                // Registry gone; reclaim the child.
                None => {
                    commands_closed = true;
                    let _ = child.start_kill();
                }
            },
            status = child.wait() => break status,
        }
    };

    accept_task.abort();
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    let _ = tokio::fs::remove_file(&ipc_path).await;

    match status {
        Ok(status) => {
            // Signal deaths (including terminate) report code 1, matching
            // how a terminated in-process worker resolves.
            let code = status.code().unwrap_or(1);
            tracing::info!(code, "Worker process exited");
            let _ = ev_tx.send(HostEvent::Exit(code)).await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker process wait failed");
            let _ = ev_tx
                .send(HostEvent::Fault(FaultPayload::new("SpawnError", e.to_string())))
                .await;
        }
    }
}

/// Read `message: <base64>` lines from the child's IPC socket.
async fn relay_child_messages(
    mut read: tokio::net::unix::OwnedReadHalf,
    ev_tx: mpsc::Sender<HostEvent>,
) {
    let mut parser = LineParser::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for (name, value) in parser.push(&buf[..n]) {
                    if let Some(EventFrame::Message(bytes)) = EventFrame::decode(&name, &value) {
                        if ev_tx.send(HostEvent::Message(bytes)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
