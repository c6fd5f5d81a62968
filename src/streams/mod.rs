use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::errors::StreamError;
use crate::storage::ByteSource;

/// Buffered chunks per stream before pushers are held back.
const CHANNEL_CAPACITY: usize = 16;
/// Remembered closed/evicted ids so late pushes stay safe no-ops.
const TOMBSTONE_LIMIT: usize = 1024;

struct TempStream {
    tx: mpsc::Sender<io::Result<Bytes>>,
    owner: String,
    pushed: u64,
    last_chunk: Instant,
}

#[derive(Default)]
struct RegistryState {
    streams: HashMap<String, TempStream>,
    tombstones: HashSet<String>,
}

/// Turns chunked out-of-band pushes into one ordered consumable byte
/// stream per id. Each entry is exclusively owned by its (pusher, reader)
/// pair; an abandoned entry has no natural close event, so idle eviction by
/// the cleanup sweep is what bounds memory.
#[derive(Default)]
pub struct StreamRegistry {
    state: Mutex<RegistryState>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a temp stream and hands back its id and the read side.
    /// Push order is preserved; the reader sees exactly the pushed bytes.
    pub fn open(&self, file_name: &str, owner: &str) -> (String, ByteSource) {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_CAPACITY);
        let stream_id = format!("{owner}-{file_name}");
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.tombstones.remove(&stream_id);
        if state
            .streams
            .insert(
                stream_id.clone(),
                TempStream {
                    tx,
                    owner: owner.to_string(),
                    pushed: 0,
                    last_chunk: Instant::now(),
                },
            )
            .is_some()
        {
            warn!(stream_id, "replacing existing temp stream with same id");
        }
        let reader: ByteSource = Box::new(StreamReader::new(ReceiverStream::new(rx)));
        (stream_id, reader)
    }

    /// Appends a chunk. The returned future resolving is the backpressure
    /// signal: callers must not push again before it completes. Pushing to a
    /// closed or evicted id is a safe no-op; an id that never existed is an
    /// error.
    pub async fn push(&self, stream_id: &str, chunk: Bytes) -> Result<(), StreamError> {
        let tx = {
            let mut state = self.state.lock().expect("registry lock poisoned");
            if state.tombstones.contains(stream_id) {
                return Ok(());
            }
            let entry = state
                .streams
                .get_mut(stream_id)
                .ok_or_else(|| StreamError::NotFound(stream_id.to_string()))?;
            entry.last_chunk = Instant::now();
            entry.pushed += chunk.len() as u64;
            entry.tx.clone()
        };
        tx.send(Ok(chunk))
            .await
            .map_err(|_| StreamError::Closed(stream_id.to_string()))
    }

    /// Finishes a stream: buffered chunks drain to the reader, then it sees
    /// a clean end of stream. Safe on unknown or already-closed ids.
    pub fn close(&self, stream_id: &str) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        if state.streams.remove(stream_id).is_some() {
            Self::remember(&mut state, stream_id);
        }
    }

    /// Tears a stream down, surfacing an error to the reader instead of a
    /// clean end of stream. Used for eviction and operation teardown.
    pub fn destroy(&self, stream_id: &str) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        if let Some(entry) = state.streams.remove(stream_id) {
            let _ = entry.tx.try_send(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "temp stream destroyed before close",
            )));
            Self::remember(&mut state, stream_id);
        }
    }

    /// Force-evicts entries idle past `max_idle`, discarding buffered data.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let stale: Vec<String> = state
            .streams
            .iter()
            .filter(|(_, e)| e.last_chunk.elapsed() > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(entry) = state.streams.remove(id) {
                debug!(stream_id = %id, owner = %entry.owner, "evicting idle temp stream");
                let _ = entry.tx.try_send(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "temp stream evicted after idle timeout",
                )));
            }
            Self::remember(&mut state, id);
        }
        stale
    }

    pub fn pushed_bytes(&self, stream_id: &str) -> Option<u64> {
        let state = self.state.lock().expect("registry lock poisoned");
        state.streams.get(stream_id).map(|e| e.pushed)
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("registry lock poisoned").streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remember(state: &mut RegistryState, stream_id: &str) {
        if state.tombstones.len() >= TOMBSTONE_LIMIT {
            state.tombstones.clear();
        }
        state.tombstones.insert(stream_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn preserves_push_order_including_empty_chunks() -> anyhow::Result<()> {
        let registry = StreamRegistry::new();
        let (id, mut reader) = registry.open("dump.bin", "user1");
        assert_eq!(id, "user1-dump.bin");

        registry.push(&id, Bytes::from_static(b"A")).await?;
        registry.push(&id, Bytes::new()).await?;
        registry.push(&id, Bytes::from_static(b"BB")).await?;
        registry.push(&id, Bytes::from_static(b"C")).await?;
        registry.close(&id);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        assert_eq!(out, b"ABBC");
        Ok(())
    }

    #[tokio::test]
    async fn consumed_bytes_equal_pushed_bytes_across_chunk_boundaries() -> anyhow::Result<()> {
        let registry = StreamRegistry::new();
        let (id, mut reader) = registry.open("big.bin", "u");

        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let pushes = payload.clone();
        let reg = &registry;
        let push_fut = async move {
            for chunk in pushes.chunks(313) {
                reg.push(&id, Bytes::copy_from_slice(chunk)).await?;
            }
            reg.close(&id);
            Ok::<_, StreamError>(())
        };
        let read_fut = async {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.map(|_| out)
        };
        let (pushed, read) = tokio::join!(push_fut, read_fut);
        pushed?;
        assert_eq!(read?, payload);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_id_errors_but_closed_id_is_noop() -> anyhow::Result<()> {
        let registry = StreamRegistry::new();
        let err = registry
            .push("nobody-nothing", Bytes::from_static(b"x"))
            .await
            .expect_err("never-registered id");
        assert!(matches!(err, StreamError::NotFound(_)));

        let (id, _reader) = registry.open("f", "u");
        registry.close(&id);
        registry.close(&id);
        registry.push(&id, Bytes::from_static(b"late")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn eviction_errors_reader_and_makes_pushes_noops() -> anyhow::Result<()> {
        let registry = StreamRegistry::new();
        let (id, mut reader) = registry.open("f", "u");
        registry.push(&id, Bytes::from_static(b"x")).await?;

        let evicted = registry.evict_idle(Duration::from_millis(0));
        assert_eq!(evicted, vec![id.clone()]);
        assert!(registry.is_empty());

        let mut out = Vec::new();
        let err = reader
            .read_to_end(&mut out)
            .await
            .expect_err("reader must see the eviction");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        registry.push(&id, Bytes::from_static(b"late")).await?;
        registry.close(&id);
        Ok(())
    }

    #[tokio::test]
    async fn distinct_ids_do_not_interfere() -> anyhow::Result<()> {
        let registry = StreamRegistry::new();
        let (a, mut ra) = registry.open("f", "alice");
        let (b, mut rb) = registry.open("f", "bob");

        registry.push(&a, Bytes::from_static(b"aaa")).await?;
        registry.push(&b, Bytes::from_static(b"b")).await?;
        registry.close(&a);
        registry.destroy(&b);

        let mut out = Vec::new();
        ra.read_to_end(&mut out).await?;
        assert_eq!(out, b"aaa");
        assert!(rb.read_to_end(&mut Vec::new()).await.is_err());
        Ok(())
    }
}
