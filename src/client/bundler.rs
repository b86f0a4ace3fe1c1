use std::path::Path;

use futures::future::BoxFuture;

use crate::error::Result;

/// Turns a caller-supplied entrypoint into a single self-contained program
/// artifact. The bundling itself is an external concern; the pool only
/// needs the artifact bytes to fingerprint and upload.
pub trait Bundler: Send + Sync + 'static {
    fn bundle(&self, entrypoint: &Path) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// Default bundler: the entrypoint file already is the artifact.
#[derive(Debug, Clone, Default)]
pub struct FileBundler;

impl Bundler for FileBundler {
    fn bundle(&self, entrypoint: &Path) -> BoxFuture<'_, Result<Vec<u8>>> {
        let entrypoint = entrypoint.to_path_buf();
        Box::pin(async move { Ok(tokio::fs::read(&entrypoint).await?) })
    }
}
