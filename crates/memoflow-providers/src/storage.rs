//! Filesystem payload storage.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use memoflow_core::provider::{Payload, PayloadStorage};
use memoflow_core::{ProcessingError, Result};

/// Reads payloads from files under a root directory. References are paths
/// relative to the root.
#[derive(Debug, Clone)]
pub struct FsPayloadStorage {
    root: PathBuf,
}

impl FsPayloadStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let relative = Path::new(reference);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if reference.is_empty() || escapes {
            return Err(ProcessingError::Storage(format!(
                "invalid payload reference '{}'",
                reference
            )));
        }
        Ok(self.root.join(relative))
    }
}

/// Content type from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("opus") => "audio/opus",
        Some("flac") => "audio/flac",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl PayloadStorage for FsPayloadStorage {
    async fn fetch(&self, reference: &str) -> Result<Payload> {
        let path = self.resolve(reference)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Payload::new(bytes, content_type_for(&path))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProcessingError::NotFound(
                format!("payload {}", path.display()),
            )),
            Err(e) => Err(ProcessingError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
