//! Test harness for in-process node servers.
//!
//! Starts real HTTP servers on ephemeral ports and provides a scripted
//! worker host so lifecycle tests drive deterministic event sequences
//! without an external runtime.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use worker_fleet::config::{Credentials, NodeConfig};
use worker_fleet::node::{self, AppState, HostCommand, HostEvent, SpawnedWorker, WorkerHost};
use worker_fleet::protocol::{FaultPayload, SpawnOptions};

pub const TEST_USER: &str = "u";
pub const TEST_PASS: &str = "p";

/// Worker host that interprets the artifact as a line script instead of
/// spawning a process. Commands:
///
/// - `message <text>` / `stdout <text>` / `stderr <text>` emit events
/// - `exit <code>` / `fault <name> <message>` end the worker
///
/// A script without a terminal command leaves the worker alive in echo
/// mode: incoming messages are echoed back, stdin is echoed to stdout,
/// and terminate exits with code 0.
pub struct ScriptedHost;

impl WorkerHost for ScriptedHost {
    fn spawn(
        &self,
        artifact: PathBuf,
        _options: SpawnOptions,
    ) -> BoxFuture<'static, worker_fleet::Result<SpawnedWorker>> {
        Box::pin(async move {
            let script = tokio::fs::read_to_string(&artifact).await?;
            let (ev_tx, ev_rx) = mpsc::channel(64);
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            tokio::spawn(run_script(script, ev_tx, cmd_rx));
            Ok(SpawnedWorker {
                events: ev_rx,
                commands: cmd_tx,
            })
        })
    }
}

async fn run_script(
    script: String,
    ev_tx: mpsc::Sender<HostEvent>,
    mut cmd_rx: mpsc::Receiver<HostCommand>,
) {
    let _ = ev_tx.send(HostEvent::Online).await;

    for line in script.lines() {
        let (op, rest) = line.split_once(' ').unwrap_or((line, ""));
        match op {
            "message" => {
                let _ = ev_tx
                    .send(HostEvent::Message(rest.as_bytes().to_vec()))
                    .await;
            }
            "stdout" => {
                let _ = ev_tx.send(HostEvent::Stdout(rest.as_bytes().to_vec())).await;
            }
            "stderr" => {
                let _ = ev_tx.send(HostEvent::Stderr(rest.as_bytes().to_vec())).await;
            }
            "exit" => {
                let code = rest.parse().unwrap_or(0);
                let _ = ev_tx.send(HostEvent::Exit(code)).await;
                return;
            }
            "fault" => {
                let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
                let _ = ev_tx
                    .send(HostEvent::Fault(FaultPayload::new(name, message)))
                    .await;
                return;
            }
            _ => {}
        }
    }

    // Echo mode until terminated.
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            HostCommand::Message(bytes) => {
                let _ = ev_tx.send(HostEvent::Message(bytes)).await;
            }
            HostCommand::Stdin(bytes) => {
                let _ = ev_tx.send(HostEvent::Stdout(bytes)).await;
            }
            HostCommand::Terminate => {
                let _ = ev_tx.send(HostEvent::Exit(0)).await;
                return;
            }
        }
    }
}

/// Handle to a running test node server.
pub struct TestNode {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: CancellationToken,
    server_handle: JoinHandle<()>,
    _bundle_dir: tempfile::TempDir,
}

impl TestNode {
    /// Node URL carrying the test credentials in its userinfo.
    pub fn url(&self) -> String {
        format!("http://{TEST_USER}:{TEST_PASS}@{}", self.addr)
    }

    /// Bare endpoint without credentials.
    #[allow(dead_code)]
    pub fn bare_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        // Drain directly: the serve task may be aborted before its
        // graceful-shutdown path runs.
        self.state.registry.drain();
        self.shutdown.cancel();
        self.server_handle.abort();
    }
}

/// Start a node backed by the scripted host, with a short grace window
/// for faster tests.
pub async fn start_node() -> TestNode {
    start_node_with_grace(Duration::from_millis(300)).await
}

pub async fn start_node_with_grace(exit_grace: Duration) -> TestNode {
    let bundle_dir = tempfile::tempdir().expect("create bundle dir");
    let config = NodeConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        Credentials::new(TEST_USER, TEST_PASS),
    )
    .with_bundle_dir(bundle_dir.path())
    .with_exit_grace(exit_grace);

    let state = node::build_state_with_host(config, Arc::new(ScriptedHost))
        .await
        .expect("build node state");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");

    let shutdown = CancellationToken::new();
    let serve_state = state.clone();
    let serve_token = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = node::serve(listener, serve_state, serve_token).await {
            tracing::error!(error = %e, "Test node server failed");
        }
    });

    TestNode {
        addr,
        state,
        shutdown,
        server_handle,
        _bundle_dir: bundle_dir,
    }
}

/// Write an entrypoint script into a dir, returning its path.
#[allow(dead_code)]
pub fn write_entrypoint(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write entrypoint");
    path
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
#[allow(dead_code)]
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(25)).await;
    assert!(result, "{}", message);
}
