use super::traits::StoreError;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Something that can establish a backend connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Connection, StoreError>;
}

type PendingConnect<T> = Shared<BoxFuture<'static, Result<T, Arc<StoreError>>>>;

/// A connection established on first use and shared by every caller.
///
/// Concurrent callers wait on the same in-flight attempt instead of opening
/// their own, and all of them see its outcome. A failed attempt empties the
/// slot so the next call tries again.
pub struct LazyConnection<C: Connector> {
    connector: Arc<C>,
    slot: Mutex<Option<PendingConnect<C::Connection>>>,
}

impl<C: Connector> LazyConnection<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            slot: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<C::Connection, StoreError> {
        let pending = self.pending();
        match pending.clone().await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
                // A later attempt may already occupy the slot
                if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
                    *slot = None;
                }
                Err(match e.as_ref() {
                    StoreError::Connection(message) => StoreError::Connection(message.clone()),
                    other => StoreError::Connection(other.to_string()),
                })
            }
        }
    }

    /// The in-flight or settled attempt, starting one if the slot is empty
    fn pending(&self) -> PendingConnect<C::Connection> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.as_ref() {
            return pending.clone();
        }

        let connector = self.connector.clone();
        let pending = async move {
            tracing::debug!("Connecting to backend");
            match connector.connect().await {
                Ok(connection) => {
                    tracing::info!("Backend connected");
                    Ok(connection)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Backend connection failed");
                    Err(Arc::new(e))
                }
            }
        }
        .boxed()
        .shared();
        *slot = Some(pending.clone());
        pending
    }

    pub fn is_connected(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(slot.as_ref().and_then(|pending| pending.peek()), Some(Ok(_)))
    }
}

/// Connects to a Redis server through a self-healing connection manager
pub struct RedisConnector {
    client: redis::Client,
    timeout: Duration,
}

impl RedisConnector {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            timeout,
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = redis::aio::ConnectionManager;

    async fn connect(&self) -> Result<Self::Connection, StoreError> {
        match tokio::time::timeout(self.timeout, self.client.get_connection_manager()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Connection(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }
}
