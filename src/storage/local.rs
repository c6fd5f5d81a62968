use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{ByteSource, ProgressSender, StorageBackend, UploadedObject};
use crate::errors::StorageError;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Filesystem-backed storage under a single root directory. Uploads stream
/// into a `.part` file and are renamed into place on success so a partial
/// object is never visible under its final name.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        // Object names are opaque ids, never paths.
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(StorageError::Upload(format!("invalid object name: {name}")));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn upload(
        &self,
        name: &str,
        mut source: ByteSource,
        _content_type: &str,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<UploadedObject, StorageError> {
        let final_path = self.object_path(name)?;
        let part_path = self.root.join(format!("{name}.part"));
        fs::create_dir_all(&self.root).await?;

        let result = async {
            let mut file = File::create(&part_path).await?;
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            let mut written: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                    read = source.read(&mut buf) => {
                        let n = read?;
                        if n == 0 {
                            break;
                        }
                        file.write_all(&buf[..n]).await?;
                        written += n as u64;
                        let _ = progress.send(written);
                    }
                }
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(written)
        }
        .await;

        match result {
            Ok(written) => {
                fs::rename(&part_path, &final_path).await?;
                Ok(UploadedObject {
                    url: format!("file://{}", final_path.display()),
                    etag: None,
                    length: written,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&part_path).await;
                Err(err)
            }
        }
    }

    async fn download(&self, name: &str) -> Result<ByteSource, StorageError> {
        let path = self.object_path(name)?;
        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(name.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.object_path(name)?;
        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(name.to_string())
            } else {
                StorageError::Delete(e.to_string())
            }
        })
    }

    async fn signed_download_url(
        &self,
        _name: &str,
        _ttl: Duration,
    ) -> Result<String, StorageError> {
        // Local backups are served directly by the host; only cloud objects
        // get presigned URLs.
        Err(StorageError::Unsupported(
            "signed URLs require cloud storage",
        ))
    }
}
