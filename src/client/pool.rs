//! Node registration and per-spawn placement.

use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, RwLock};

use crate::client::bundler::{Bundler, FileBundler};
use crate::client::handle::WorkerHandle;
use crate::client::node_client::{LoadSample, NodeClient};
use crate::client::placement::{self, PlacementPolicy};
use crate::error::Result;
use crate::hash::bundle_fingerprint;
use crate::protocol::{CreateWorkerRequest, SpawnOptions};

/// Client-side entry point: registered nodes, a placement policy, and the
/// bundler that turns entrypoints into artifacts.
pub struct WorkerPool {
    nodes: RwLock<Vec<Arc<NodeClient>>>,
    policy: PlacementPolicy,
    cursor: AtomicUsize,
    bundler: Arc<dyn Bundler>,
}

impl WorkerPool {
    pub fn new(policy: PlacementPolicy) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            policy,
            cursor: AtomicUsize::new(0),
            bundler: Arc::new(FileBundler),
        }
    }

    pub fn with_bundler(mut self, bundler: Arc<dyn Bundler>) -> Self {
        self.bundler = bundler;
        self
    }

    /// Register a node by URL; credentials come from the URL userinfo.
    /// Registration order is preserved for deterministic rotation.
    pub fn register_node(&self, url: &str) -> Result<Arc<NodeClient>> {
        let node = Arc::new(NodeClient::from_url(url)?);
        self.register_node_client(node.clone());
        Ok(node)
    }

    pub fn register_node_client(&self, node: Arc<NodeClient>) {
        self.nodes.write().expect("node list lock poisoned").push(node);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().expect("node list lock poisoned").len()
    }

    /// Spawn the entrypoint on a node chosen by the placement policy and
    /// return a live handle.
    pub async fn spawn(&self, entrypoint: &Path, options: SpawnOptions) -> Result<WorkerHandle> {
        let node = self.pick_node()?;
        node.identity().await?;

        let mut options = options;
        if options.inherit_env {
            merge_ambient_env(&mut options);
        }

        let artifact = self.bundler.bundle(entrypoint).await?;
        let hash = bundle_fingerprint(&artifact);
        node.ensure_bundle(&hash, &artifact).await?;
        drop(artifact);

        let request = CreateWorkerRequest {
            bundle_hash: hash,
            extra_data: options,
            exit_on_request_end: true,
        };
        WorkerHandle::connect(node, request).await
    }

    fn pick_node(&self) -> Result<Arc<NodeClient>> {
        let nodes = self.nodes.read().expect("node list lock poisoned");
        let samples: Vec<Option<LoadSample>> = nodes.iter().map(|n| n.last_load()).collect();
        let index = placement::pick_index(self.policy, &self.cursor, &samples)?;
        tracing::debug!(index, policy = ?self.policy, "Node selected for spawn");
        Ok(nodes[index].clone())
    }
}

/// Opt-in merge of the caller's environment; keys the caller set
/// explicitly win.
fn merge_ambient_env(options: &mut SpawnOptions) {
    let mut merged: std::collections::HashMap<String, String> = std::env::vars().collect();
    if let Some(explicit) = options.env.take() {
        merged.extend(explicit);
    }
    options.env = Some(merged);
}
