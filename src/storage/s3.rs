use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::presigning::PresigningConfig;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ByteSource, ProgressSender, StorageBackend, UploadedObject};
use crate::errors::StorageError;
use crate::records::CloudCredential;

/// Multipart part size. S3 requires at least 5 MiB for non-final parts.
const PART_SIZE: usize = 8 * 1024 * 1024;
const READ_BUF_SIZE: usize = 64 * 1024;

/// S3-compatible object storage (AWS, DigitalOcean Spaces, MinIO).
#[derive(Debug)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
}

impl S3Storage {
    /// Builds the client from a credential record. Fails fast on incomplete
    /// credentials so a bad configuration never reaches the upload path.
    pub async fn from_credential(cred: &CloudCredential) -> Result<Self, StorageError> {
        for (field, value) in [
            ("key_id", &cred.key_id),
            ("key_secret", &cred.key_secret),
            ("bucket", &cred.bucket),
            ("region", &cred.region),
        ] {
            if value.is_empty() {
                return Err(StorageError::Credential(format!("{field} is empty")));
            }
        }

        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(cred.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &cred.key_id,
                &cred.key_secret,
                None,
                None,
                "Static",
            ));
        if let Some(endpoint) = &cred.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        Ok(Self {
            client: s3::Client::new(&sdk_config),
            bucket: cred.bucket.clone(),
        })
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) {
        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(key, error = %err, "failed to abort multipart upload");
        }
    }

    /// Reads from the source until `buf` holds a full part or the source is
    /// exhausted. Returns true at end of stream.
    async fn fill_part(
        source: &mut ByteSource,
        buf: &mut Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<bool, StorageError> {
        let mut chunk = vec![0u8; READ_BUF_SIZE];
        while buf.len() < PART_SIZE {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                read = source.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(true);
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn upload(
        &self,
        name: &str,
        mut source: ByteSource,
        content_type: &str,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<UploadedObject, StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Upload(e.to_string()))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Upload("no upload id received".to_string()))?
            .to_string();

        let result = async {
            let mut parts: Vec<CompletedPart> = Vec::new();
            let mut part_number: i32 = 1;
            let mut sent: u64 = 0;

            loop {
                let mut buf = Vec::with_capacity(READ_BUF_SIZE);
                let eof = Self::fill_part(&mut source, &mut buf, cancel).await?;

                // An empty dump still has to produce an object, so the first
                // part is uploaded even with zero bytes.
                if !buf.is_empty() || parts.is_empty() {
                    let len = buf.len() as u64;
                    let uploaded = self
                        .client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(name)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(buf))
                        .send()
                        .await
                        .map_err(|e| StorageError::Upload(e.to_string()))?;
                    let etag = uploaded.e_tag().ok_or_else(|| {
                        StorageError::Upload(format!("no etag for part {part_number}"))
                    })?;
                    parts.push(
                        CompletedPart::builder()
                            .e_tag(etag)
                            .part_number(part_number)
                            .build(),
                    );
                    part_number += 1;
                    sent += len;
                    let _ = progress.send(sent);
                }

                if eof {
                    break;
                }
            }

            debug!(key = name, parts = parts.len(), bytes = sent, "completing multipart upload");
            let completed = self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(name)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| StorageError::Upload(e.to_string()))?;

            Ok((sent, completed.e_tag().map(str::to_string)))
        }
        .await;

        let (sent, etag) = match result {
            Ok(ok) => ok,
            Err(err) => {
                self.abort_upload(name, &upload_id).await;
                return Err(err);
            }
        };

        // Confirm the write landed; a silently truncated object is worse
        // than a failed backup.
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| StorageError::Upload(format!("post-upload verification: {e}")))?;
        let stored = head.content_length().unwrap_or(-1);
        if stored < 0 || stored as u64 != sent {
            let _ = self.delete(name).await;
            return Err(StorageError::LengthMismatch {
                name: name.to_string(),
                sent,
                stored: stored.max(0) as u64,
            });
        }

        Ok(UploadedObject {
            url: format!("s3://{}/{}", self.bucket, name),
            etag,
            length: sent,
        })
    }

    async fn download(&self, name: &str) -> Result<ByteSource, StorageError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound(name.to_string())
                } else {
                    StorageError::Download(e.to_string())
                }
            })?;

        // Pump the SDK stream into a channel so callers get a plain
        // AsyncRead without holding SDK types.
        let (tx, rx) = mpsc::channel::<std::io::Result<bytes::Bytes>>(16);
        let mut body = object.body;
        tokio::spawn(async move {
            loop {
                match body.try_next().await {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx
                            .send(Err(std::io::Error::other(err.to_string())))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Box::new(StreamReader::new(ReceiverStream::new(rx))))
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        Ok(())
    }

    async fn signed_download_url(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Download(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Download(e.to_string()))?;
        Ok(request.uri().to_string())
    }
}
