use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Shared credential pair checked by the node and presented by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Human-readable node name reported by `GET /`.
    pub name: String,
    pub listen_addr: SocketAddr,
    pub credentials: Credentials,
    /// Scratch directory holding cached bundle artifacts.
    pub bundle_dir: PathBuf,
    /// Command that executes a bundle artifact; the artifact path is
    /// appended as the final argument.
    pub runtime: Vec<String>,
    /// Bundle count above which the cache is wiped wholesale at startup.
    pub cache_clear_threshold: usize,
    /// How long a worker with `exitOnRequestEnd` survives with zero
    /// attached readers before it is terminated.
    pub exit_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "worker-fleet-node".to_string(),
            listen_addr: "127.0.0.1:9400".parse().unwrap(),
            credentials: Credentials::new("worker", "fleet"),
            bundle_dir: std::env::temp_dir().join("worker-fleet-bundles"),
            runtime: vec!["node".to_string()],
            cache_clear_threshold: 10,
            exit_grace: Duration::from_secs(1),
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr, credentials: Credentials) -> Self {
        Self {
            listen_addr,
            credentials,
            ..Default::default()
        }
    }

    pub fn with_bundle_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundle_dir = dir.into();
        self
    }

    pub fn with_runtime(mut self, runtime: Vec<String>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }
}
