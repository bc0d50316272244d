//! Shared memory drivers and the handle bots use.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use super::{Acquire, Bucket, LockStatus, SharedError, SharedKey, SharedSnapshot, SharedStore};
use crate::bridge::protocol::IpcBootstrap;
use crate::ipc::IpcClient;

/// Backend for [`SharedMemory`].
#[async_trait]
pub trait SharedDriver: Send + Sync {
    async fn bucket(&self, key: &SharedKey) -> Result<Bucket, SharedError>;
    async fn set(
        &self,
        bucket: &SharedKey,
        key: &str,
        value: Value,
    ) -> Result<Option<Value>, SharedError>;
    async fn delete(&self, key: &SharedKey) -> Result<bool, SharedError>;
    async fn list(&self) -> Result<Vec<SharedKey>, SharedError>;
    async fn lock_acquire(&self, id: &SharedKey) -> Result<(), SharedError>;
    async fn lock_release(&self, id: &SharedKey) -> Result<(), SharedError>;
    async fn lock_status(&self, id: &SharedKey) -> Result<LockStatus, SharedError>;
    async fn export(&self) -> Result<SharedSnapshot, SharedError>;
    async fn import(&self, snapshot: SharedSnapshot) -> Result<(), SharedError>;
}

/// Store in this process. Lock waiters park on a oneshot.
#[derive(Debug, Default)]
pub struct LocalDriver {
    store: Mutex<SharedStore<oneshot::Sender<()>>>,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, SharedStore<oneshot::Sender<()>>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SharedDriver for LocalDriver {
    async fn bucket(&self, key: &SharedKey) -> Result<Bucket, SharedError> {
        Ok(self.store().get(key))
    }

    async fn set(
        &self,
        bucket: &SharedKey,
        key: &str,
        value: Value,
    ) -> Result<Option<Value>, SharedError> {
        Ok(self.store().set(bucket, key.to_string(), value))
    }

    async fn delete(&self, key: &SharedKey) -> Result<bool, SharedError> {
        Ok(self.store().delete(key))
    }

    async fn list(&self) -> Result<Vec<SharedKey>, SharedError> {
        Ok(self.store().list())
    }

    async fn lock_acquire(&self, id: &SharedKey) -> Result<(), SharedError> {
        let (tx, rx) = oneshot::channel();
        let queued = matches!(self.store().acquire(id, tx), Acquire::Queued);
        if queued {
            rx.await.map_err(|_| SharedError::Closed)?;
        }
        Ok(())
    }

    async fn lock_release(&self, id: &SharedKey) -> Result<(), SharedError> {
        self.store().release(id, |waiter| waiter.send(()).is_ok())
    }

    async fn lock_status(&self, id: &SharedKey) -> Result<LockStatus, SharedError> {
        Ok(self.store().status(id))
    }

    async fn export(&self) -> Result<SharedSnapshot, SharedError> {
        Ok(self.store().export())
    }

    async fn import(&self, snapshot: SharedSnapshot) -> Result<(), SharedError> {
        self.store().import(snapshot, |waiter| waiter.send(()).is_ok());
        Ok(())
    }
}

/// Idle lock connections kept around for reuse.
const MAX_IDLE_LOCK_CONNECTIONS: usize = 4;

/// Store owned by the IPC host, reached over a dedicated connection.
///
/// `lock_acquire` may wait indefinitely for its reply, so each waiting acquire gets
/// a connection of its own; everything else shares `client`. Dropping an acquire
/// mid-wait closes its connection and the host forgets the waiter.
#[derive(Debug)]
pub struct IpcDriver {
    bootstrap: IpcBootstrap,
    client: tokio::sync::Mutex<IpcClient>,
    lock_clients: Mutex<Vec<IpcClient>>,
}

impl IpcDriver {
    pub async fn connect(bootstrap: &IpcBootstrap) -> Result<Self, SharedError> {
        Ok(Self {
            bootstrap: bootstrap.clone(),
            client: tokio::sync::Mutex::new(IpcClient::connect_with_retry(bootstrap).await?),
            lock_clients: Mutex::new(Vec::new()),
        })
    }

    async fn lock_client(&self) -> Result<IpcClient, SharedError> {
        let idle = self
            .lock_clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(client) => Ok(client),
            None => Ok(IpcClient::connect(&self.bootstrap).await?),
        }
    }

    fn return_lock_client(&self, client: IpcClient) {
        let mut idle = self
            .lock_clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_LOCK_CONNECTIONS {
            idle.push(client);
        }
    }
}

#[async_trait]
impl SharedDriver for IpcDriver {
    async fn bucket(&self, key: &SharedKey) -> Result<Bucket, SharedError> {
        Ok(self.client.lock().await.shared_get(key).await?)
    }

    async fn set(
        &self,
        bucket: &SharedKey,
        key: &str,
        value: Value,
    ) -> Result<Option<Value>, SharedError> {
        let previous = self.client.lock().await.shared_set(bucket, key, value).await?;
        Ok(Some(previous).filter(|v| !v.is_null()))
    }

    async fn delete(&self, key: &SharedKey) -> Result<bool, SharedError> {
        Ok(self.client.lock().await.shared_delete(key).await?)
    }

    async fn list(&self) -> Result<Vec<SharedKey>, SharedError> {
        Ok(self.client.lock().await.shared_list().await?)
    }

    async fn lock_acquire(&self, id: &SharedKey) -> Result<(), SharedError> {
        let mut client = self.lock_client().await?;
        client.lock_acquire(id).await?;
        self.return_lock_client(client);
        Ok(())
    }

    async fn lock_release(&self, id: &SharedKey) -> Result<(), SharedError> {
        Ok(self.client.lock().await.lock_release(id).await?)
    }

    async fn lock_status(&self, id: &SharedKey) -> Result<LockStatus, SharedError> {
        Ok(self.client.lock().await.lock_status(id).await?)
    }

    async fn export(&self) -> Result<SharedSnapshot, SharedError> {
        let mut client = self.client.lock().await;
        let buckets = client.shared_export().await?;
        let locks = client.lock_export().await?;
        Ok(SharedSnapshot { buckets, locks })
    }

    async fn import(&self, snapshot: SharedSnapshot) -> Result<(), SharedError> {
        let mut client = self.client.lock().await;
        client.shared_import(snapshot.buckets).await?;
        client.lock_import(snapshot.locks).await?;
        Ok(())
    }
}

/// Handle to shared memory, cheap to clone.
#[derive(Clone)]
pub struct SharedMemory {
    driver: Arc<dyn SharedDriver>,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory").finish_non_exhaustive()
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::local()
    }
}

impl SharedMemory {
    pub fn new(driver: Arc<dyn SharedDriver>) -> Self {
        Self { driver }
    }

    pub fn local() -> Self {
        Self::new(Arc::new(LocalDriver::new()))
    }

    pub async fn bucket(&self, key: &SharedKey) -> Result<Bucket, SharedError> {
        self.driver.bucket(key).await
    }

    /// Read a bucket, running `init` and storing its result when this read created it.
    pub async fn bucket_with_init<F>(&self, key: &SharedKey, init: F) -> Result<Bucket, SharedError>
    where
        F: FnOnce(&mut Map<String, Value>) + Send,
    {
        let mut bucket = self.driver.bucket(key).await?;
        if bucket.is_new {
            init(&mut bucket.values);
            for (name, value) in &bucket.values {
                self.driver.set(key, name, value.clone()).await?;
            }
        }
        Ok(bucket)
    }

    pub async fn get(&self, bucket: &SharedKey, key: &str) -> Result<Option<Value>, SharedError> {
        Ok(self.driver.bucket(bucket).await?.values.remove(key))
    }

    pub async fn set(
        &self,
        bucket: &SharedKey,
        key: &str,
        value: Value,
    ) -> Result<Option<Value>, SharedError> {
        self.driver.set(bucket, key, value).await
    }

    pub async fn delete(&self, key: &SharedKey) -> Result<bool, SharedError> {
        self.driver.delete(key).await
    }

    pub async fn list(&self) -> Result<Vec<SharedKey>, SharedError> {
        self.driver.list().await
    }

    pub async fn lock_acquire(&self, id: &SharedKey) -> Result<(), SharedError> {
        self.driver.lock_acquire(id).await
    }

    pub async fn lock_release(&self, id: &SharedKey) -> Result<(), SharedError> {
        self.driver.lock_release(id).await
    }

    pub async fn lock_status(&self, id: &SharedKey) -> Result<LockStatus, SharedError> {
        self.driver.lock_status(id).await
    }

    /// Run `f` while holding the lock `id`.
    pub async fn with_lock<F, Fut, T>(&self, id: &SharedKey, f: F) -> Result<T, SharedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.lock_acquire(id).await?;
        let out = f().await;
        self.lock_release(id).await?;
        Ok(out)
    }

    /// Move all buckets and lock states onto `driver` and use it from now on.
    pub async fn switch_driver(&mut self, driver: Arc<dyn SharedDriver>) -> Result<(), SharedError> {
        let snapshot = self.driver.export().await?;
        tracing::debug!(
            buckets = snapshot.buckets.len(),
            locks = snapshot.locks.len(),
            "Switching shared memory driver"
        );
        driver.import(snapshot).await?;
        self.driver = driver;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn key(s: &str) -> SharedKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn bucket_init_runs_once() {
        let shared = SharedMemory::local();
        let id = key("bot:settings");

        let first = shared
            .bucket_with_init(&id, |values| {
                values.insert("lang".to_string(), json!("en"));
            })
            .await
            .unwrap();
        assert!(first.is_new);

        let second = shared
            .bucket_with_init(&id, |values| {
                values.insert("lang".to_string(), json!("fi"));
            })
            .await
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(shared.get(&id, "lang").await.unwrap(), Some(json!("en")));
    }

    #[tokio::test]
    async fn local_lock_blocks_until_release() {
        let shared = SharedMemory::local();
        let id = key("bot:lock");
        shared.lock_acquire(&id).await.unwrap();

        let waiter = {
            let shared = shared.clone();
            let id = id.clone();
            tokio::spawn(async move { shared.lock_acquire(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(shared.lock_status(&id).await.unwrap().waiters, 1);

        shared.lock_release(&id).await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(shared.lock_status(&id).await.unwrap().held);
    }

    #[tokio::test]
    async fn cancelled_local_waiter_is_skipped() {
        let shared = SharedMemory::local();
        let id = key("bot:lock");
        shared.lock_acquire(&id).await.unwrap();

        let gone = {
            let shared = shared.clone();
            let id = id.clone();
            tokio::spawn(async move { shared.lock_acquire(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gone.abort();
        let _ = gone.await;

        shared.lock_release(&id).await.unwrap();
        assert!(!shared.lock_status(&id).await.unwrap().held);
    }

    #[tokio::test]
    async fn with_lock_releases_afterwards() {
        let shared = SharedMemory::local();
        let id = key("bot:lock");
        let n = shared.with_lock(&id, || async { 7 }).await.unwrap();
        assert_eq!(n, 7);
        assert!(!shared.lock_status(&id).await.unwrap().held);
    }

    #[tokio::test]
    async fn switch_between_local_drivers_keeps_state() {
        let mut shared = SharedMemory::local();
        shared.set(&key("bot:a"), "n", json!(1)).await.unwrap();
        shared.lock_acquire(&key("bot:held")).await.unwrap();

        shared.switch_driver(Arc::new(LocalDriver::new())).await.unwrap();
        assert_eq!(shared.get(&key("bot:a"), "n").await.unwrap(), Some(json!(1)));
        assert!(shared.lock_status(&key("bot:held")).await.unwrap().held);
    }
}
