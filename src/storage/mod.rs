pub(crate) mod local;
pub(crate) mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::StorageError;
use crate::records::CloudCredential;

/// The byte stream type flowing between processes, storage backends and the
/// stream registry. Boxed so every producer looks the same to consumers.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Cumulative byte counter for progress reporting. Receivers only care about
/// the latest value, so a watch channel fits better than a queue.
pub type ProgressSender = watch::Sender<u64>;

#[derive(Debug, Clone)]
pub struct UploadedObject {
    pub url: String,
    pub etag: Option<String>,
    pub length: u64,
}

/// Uniform interface over local disk and cloud object storage. A backend is
/// resolved once per operation from the optional cloud credential and then
/// used for every byte of it.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Streams `source` to the destination object. Progress receives the
    /// cumulative byte count. Cancellation must leave no partial object
    /// behind.
    async fn upload(
        &self,
        name: &str,
        source: ByteSource,
        content_type: &str,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<UploadedObject, StorageError>;

    async fn download(&self, name: &str) -> Result<ByteSource, StorageError>;

    async fn delete(&self, name: &str) -> Result<(), StorageError>;

    async fn signed_download_url(&self, name: &str, ttl: Duration)
        -> Result<String, StorageError>;
}

/// Resolves the credential union exactly once: a credential means cloud
/// object storage, its absence means the local filesystem.
pub async fn resolve_backend(
    credential: Option<&CloudCredential>,
    local_root: &Path,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match credential {
        Some(cred) => Ok(Arc::new(S3Storage::from_credential(cred).await?)),
        None => Ok(Arc::new(LocalStorage::new(local_root))),
    }
}
