use super::traits::{
    is_expired, validate_key, validate_payloads, validate_prefix, ChunkCache, EntryStream, LogEntry, LogStore,
    SequenceId, StoreError,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

const LOG_SUFFIX: &str = ".log";
const TOMBSTONE_SUFFIX: &str = ".remove";
const CHUNK_SUFFIX: &str = ".chunk";

/// Partition logs kept as one newline-delimited file per key under `root`.
///
/// Layout for prefix `p` and key `k`:
/// - `p_k.log` holds the records, one per line
/// - `p_k.log.remove` is a zero-byte marker scheduling the log for deletion
pub struct FileLogStore {
    root: PathBuf,
    prefix: String,
    ttl: Duration,
}

impl FileLogStore {
    pub fn new<P: AsRef<Path>>(root: P, prefix: &str, ttl: Duration) -> Result<Self, StoreError> {
        validate_prefix(prefix)?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            prefix: prefix.to_string(),
            ttl,
        })
    }

    pub fn log_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}_{}{}", self.prefix, key, LOG_SUFFIX))
    }

    fn tombstone_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}_{}{}{}", self.prefix, key, LOG_SUFFIX, TOMBSTONE_SUFFIX))
    }

    /// Sweep one tombstone. Returns true when the partition was purged.
    async fn sweep_tombstone(&self, tombstone: &Path, now: SystemTime) -> Result<bool, StoreError> {
        let name = tombstone.to_string_lossy();
        let log_path = PathBuf::from(name.trim_end_matches(TOMBSTONE_SUFFIX));

        match fs::metadata(&log_path).await {
            Ok(metadata) => {
                if !is_expired(now, metadata.modified()?, self.ttl) {
                    return Ok(false);
                }
                remove_if_present(&log_path).await?;
                remove_if_present(tombstone).await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Marked partition never received any records
                remove_if_present(tombstone).await?;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        match fs::metadata(self.log_path(key)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_batch(&self, key: &str, payloads: &[Vec<u8>]) -> Result<(), StoreError> {
        validate_key(key)?;
        validate_payloads(key, payloads)?;
        if payloads.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::with_capacity(payloads.iter().map(|p| p.len() + 1).sum());
        for payload in payloads {
            buffer.extend_from_slice(payload);
            buffer.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(key))
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }

    async fn commit(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(key))
            .await?;
        Ok(())
    }

    async fn read_range(
        &self,
        key: &str,
        after: Option<SequenceId>,
    ) -> Result<EntryStream, StoreError> {
        validate_key(key)?;
        let mut file = match File::open(self.log_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(partition = %key, "No log file for partition, reading as empty");
                return Ok(stream::empty().boxed());
            }
            Err(e) => return Err(e.into()),
        };

        let resume_at = match after {
            None => None,
            Some(SequenceId::Offset(position)) => Some(position),
            Some(other) => return Err(StoreError::InvalidCursor(other)),
        };

        let mut offset = 0;
        if let Some(position) = resume_at {
            file.seek(SeekFrom::Start(position)).await?;
            offset = position;
        }

        let mut reader = LineReader {
            reader: BufReader::new(file),
            offset,
        };
        if resume_at.is_some() {
            // The entry at the cursor was already seen
            reader.skip_line().await?;
        }

        Ok(stream::try_unfold(reader, LineReader::next_entry).boxed())
    }

    async fn mark_for_removal(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        fs::write(self.tombstone_path(key), b"").await?;
        tracing::debug!(partition = %key, "Marked partition for removal");
        Ok(())
    }

    async fn sweep_removals(&self) -> Result<usize, StoreError> {
        let now = SystemTime::now();
        let marker_prefix = format!("{}_", self.prefix);
        let marker_suffix = format!("{}{}", LOG_SUFFIX, TOMBSTONE_SUFFIX);
        let mut purged = 0;

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&marker_prefix) || !name.ends_with(&marker_suffix) {
                continue;
            }
            match self.sweep_tombstone(&entry.path(), now).await {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(file = %name, error = %e, "Failed to sweep partition"),
            }
        }

        tracing::info!(purged, "Partition logs cleared");
        Ok(purged)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        remove_if_present(&self.log_path(key)).await?;
        remove_if_present(&self.tombstone_path(key)).await?;
        Ok(())
    }
}

struct LineReader {
    reader: BufReader<File>,
    offset: u64,
}

impl LineReader {
    async fn skip_line(&mut self) -> Result<(), StoreError> {
        let mut discarded = Vec::new();
        let read = self.reader.read_until(b'\n', &mut discarded).await?;
        self.offset += read as u64;
        Ok(())
    }

    async fn next_entry(mut self) -> Result<Option<(LogEntry, Self)>, StoreError> {
        let mut line = Vec::new();
        loop {
            line.clear();
            let start = self.offset;
            let read = self.reader.read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Ok(None);
            }
            self.offset += read as u64;
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            let entry = LogEntry {
                sequence_id: SequenceId::Offset(start),
                payload: std::mem::take(&mut line),
            };
            return Ok(Some((entry, self)));
        }
    }
}

/// Replay memo kept as one file per cache key, `prefix_<key>.chunk`.
///
/// Entries age from their last write. The TTL given to `put` is not stored;
/// expiry is always judged against the TTL the cache was built with.
pub struct FileChunkCache {
    root: PathBuf,
    prefix: String,
    ttl: Duration,
}

impl FileChunkCache {
    pub fn new<P: AsRef<Path>>(root: P, prefix: &str, ttl: Duration) -> Result<Self, StoreError> {
        validate_prefix(prefix)?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            prefix: prefix.to_string(),
            ttl,
        })
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}_{}{}", self.prefix, key, CHUNK_SUFFIX))
    }
}

#[async_trait]
impl ChunkCache for FileChunkCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        let path = self.entry_path(key);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if is_expired(SystemTime::now(), metadata.modified()?, self.ttl) {
            tracing::debug!(key = %key, "Chunk memo expired");
            return Ok(None);
        }
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<(), StoreError> {
        validate_key(key)?;
        let path = self.entry_path(key);
        let staging = self
            .root
            .join(format!(".{}_{}.{}.tmp", self.prefix, key, Uuid::new_v4()));
        fs::write(&staging, value).await?;
        if let Err(e) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = SystemTime::now();
        let entry_prefix = format!("{}_", self.prefix);
        let mut removed = 0;

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&entry_prefix) || !name.ends_with(CHUNK_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let expired = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => is_expired(now, modified, self.ttl),
                Err(e) => {
                    tracing::error!(file = %name, error = %e, "Failed to stat chunk memo");
                    continue;
                }
            };
            if expired {
                match remove_if_present(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::error!(file = %name, error = %e, "Failed to remove chunk memo"),
                }
            }
        }

        tracing::info!(removed, "Chunk memos cleared");
        Ok(removed)
    }
}

async fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn age_file(path: &Path, age: Duration) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    async fn read_all(store: &FileLogStore, key: &str, after: Option<SequenceId>) -> Vec<LogEntry> {
        store
            .read_range(key, after)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::new(dir.path(), "t", HOUR).unwrap();

        assert!(!store.exists("p1").await.unwrap());
        store.append("p1", b"{\"a\":1}").await.unwrap();
        store
            .append_batch("p1", &[b"{\"a\":2}".to_vec(), b"{\"a\":3}".to_vec()])
            .await
            .unwrap();
        assert!(store.exists("p1").await.unwrap());

        let entries = read_all(&store, "p1", None).await;
        let payloads: Vec<&[u8]> = entries.iter().map(|e| e.payload.as_slice()).collect();
        assert_eq!(
            payloads,
            vec![&b"{\"a\":1}"[..], &b"{\"a\":2}"[..], &b"{\"a\":3}"[..]]
        );
        assert_eq!(entries[0].sequence_id, SequenceId::Offset(0));
        assert_eq!(entries[1].sequence_id, SequenceId::Offset(8));
    }

    #[tokio::test]
    async fn test_read_after_cursor() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::new(dir.path(), "t", HOUR).unwrap();
        store
            .append_batch(
                "p1",
                &[b"one".to_vec(), b"two".to_vec(), b"three".to_vec()],
            )
            .await
            .unwrap();

        let first = read_all(&store, "p1", None).await;
        let resumed = read_all(&store, "p1", Some(first[0].sequence_id.clone())).await;
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].payload, b"two");
        assert_eq!(resumed[1].payload, b"three");
        assert_eq!(resumed[0].sequence_id, first[1].sequence_id);

        // Re-invocable from the same cursor
        let again = read_all(&store, "p1", Some(first[0].sequence_id.clone())).await;
        assert_eq!(again, resumed);

        let tail = read_all(&store, "p1", Some(first[2].sequence_id.clone())).await;
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_partition_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::new(dir.path(), "t", HOUR).unwrap();
        assert!(read_all(&store, "missing", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_stream_cursor() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::new(dir.path(), "t", HOUR).unwrap();
        store.append("p1", b"x").await.unwrap();
        let result = store
            .read_range("p1", Some(SequenceId::Stream("1-0".to_string())))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidCursor(_))));
    }

    #[tokio::test]
    async fn test_commit_keeps_empty_partition() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::new(dir.path(), "t", HOUR).unwrap();

        store.commit("empty").await.unwrap();
        assert!(store.exists("empty").await.unwrap());
        assert!(read_all(&store, "empty", None).await.is_empty());

        store.append("full", b"{\"a\":1}").await.unwrap();
        store.commit("full").await.unwrap();
        assert_eq!(read_all(&store, "full", None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_newline_payload_without_partial_write() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::new(dir.path(), "t", HOUR).unwrap();
        let result = store
            .append_batch("p1", &[b"ok".to_vec(), b"bad\nline".to_vec()])
            .await;
        assert!(matches!(result, Err(StoreError::InvalidPayload(_))));
        assert!(!store.exists("p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_waits_for_ttl() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::new(dir.path(), "t", HOUR).unwrap();

        store.append("old", b"x").await.unwrap();
        store.append("young", b"y").await.unwrap();
        store.append("kept", b"z").await.unwrap();
        store.mark_for_removal("old").await.unwrap();
        store.mark_for_removal("young").await.unwrap();

        age_file(&store.log_path("old"), Duration::from_secs(7200));
        age_file(&store.log_path("kept"), Duration::from_secs(7200));

        let purged = store.sweep_removals().await.unwrap();
        assert_eq!(purged, 1);
        assert!(!store.exists("old").await.unwrap());
        assert!(!store.tombstone_path("old").exists());
        assert!(store.exists("young").await.unwrap());
        assert!(store.tombstone_path("young").exists());
        // Unmarked logs are never swept, however old
        assert!(store.exists("kept").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_clears_tombstone_without_log() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::new(dir.path(), "t", HOUR).unwrap();
        store.mark_for_removal("empty").await.unwrap();
        assert_eq!(store.sweep_removals().await.unwrap(), 1);
        assert!(!store.tombstone_path("empty").exists());
    }

    #[test]
    fn test_prefix_with_separator_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            FileLogStore::new(dir.path(), "rc_x", HOUR),
            Err(StoreError::InvalidPrefix(_))
        ));
        assert!(matches!(
            FileChunkCache::new(dir.path(), "rc_x", HOUR),
            Err(StoreError::InvalidPrefix(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_ignores_other_prefixes() {
        let dir = TempDir::new().unwrap();
        let mine = FileLogStore::new(dir.path(), "mine", HOUR).unwrap();
        let theirs = FileLogStore::new(dir.path(), "theirs", HOUR).unwrap();
        theirs.append("p", b"x").await.unwrap();
        theirs.mark_for_removal("p").await.unwrap();
        age_file(&theirs.log_path("p"), Duration::from_secs(7200));

        assert_eq!(mine.sweep_removals().await.unwrap(), 0);
        assert!(theirs.exists("p").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::new(dir.path(), "t", HOUR).unwrap();
        store.append("p", b"x").await.unwrap();
        store.mark_for_removal("p").await.unwrap();
        store.remove("p").await.unwrap();
        assert!(!store.exists("p").await.unwrap());
        assert!(!store.tombstone_path("p").exists());
        // Removing twice is fine
        store.remove("p").await.unwrap();
    }

    #[tokio::test]
    async fn test_chunk_cache_put_get() {
        let dir = TempDir::new().unwrap();
        let cache = FileChunkCache::new(dir.path(), "t", HOUR).unwrap();
        assert!(cache.get("abc").await.unwrap().is_none());
        cache.put("abc", b"[1,2]", HOUR).await.unwrap();
        assert_eq!(cache.get("abc").await.unwrap().unwrap(), b"[1,2]");
        cache.put("abc", b"[3]", HOUR).await.unwrap();
        assert_eq!(cache.get("abc").await.unwrap().unwrap(), b"[3]");
    }

    #[tokio::test]
    async fn test_chunk_cache_expiry() {
        let dir = TempDir::new().unwrap();
        let cache = FileChunkCache::new(dir.path(), "t", HOUR).unwrap();
        cache.put("old", b"[]", HOUR).await.unwrap();
        cache.put("fresh", b"[]", HOUR).await.unwrap();
        age_file(&cache.entry_path("old"), Duration::from_secs(3601));

        assert!(cache.get("old").await.unwrap().is_none());
        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
        assert!(!cache.entry_path("old").exists());
        assert!(cache.get("fresh").await.unwrap().is_some());
    }
}
