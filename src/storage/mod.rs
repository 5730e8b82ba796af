pub mod connection;
pub mod file;
pub mod stream;
pub mod traits;

pub use connection::{Connector, LazyConnection, RedisConnector};
pub use file::{FileChunkCache, FileLogStore};
pub use stream::{StreamChunkCache, StreamLogStore};
pub use traits::{ChunkCache, EntryStream, LogEntry, LogStore, SequenceId, StoreError};

use crate::config::types::{BackendType, StorageConfig};
use std::sync::Arc;
use std::time::Duration;

/// The log store and chunk cache of one backend family
#[derive(Clone)]
pub struct Backends {
    pub log_store: Arc<dyn LogStore>,
    pub chunk_cache: Arc<dyn ChunkCache>,
}

/// Build the backends selected by the storage config.
///
/// The stream backend shares a single lazily established connection between
/// its log store and chunk cache; nothing connects until first use.
pub fn open_backends(config: &StorageConfig, ttl: Duration) -> Result<Backends, StoreError> {
    match config.backend {
        BackendType::File => {
            tracing::info!(root = %config.root.display(), "Using file backend");
            Ok(Backends {
                log_store: Arc::new(FileLogStore::new(&config.root, &config.key_prefix, ttl)?),
                chunk_cache: Arc::new(FileChunkCache::new(
                    &config.root,
                    &config.key_prefix,
                    ttl,
                )?),
            })
        }
        BackendType::Stream => {
            let url = config.url.as_deref().ok_or_else(|| {
                StoreError::Connection("stream backend requires a url".to_string())
            })?;
            tracing::info!(prefix = %config.key_prefix, "Using stream backend");
            let connector = RedisConnector::new(url, config.connect_timeout)?;
            let connection = Arc::new(LazyConnection::new(connector));
            Ok(Backends {
                log_store: Arc::new(StreamLogStore::new(
                    connection.clone(),
                    &config.key_prefix,
                    ttl,
                    config.page_size,
                )),
                chunk_cache: Arc::new(StreamChunkCache::new(connection, &config.key_prefix)),
            })
        }
    }
}
