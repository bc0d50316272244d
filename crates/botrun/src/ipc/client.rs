//! Blocking-call IPC client: one request in flight per connection.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{JsonCodec, ProtocolError, read_frame, write_frame};
use crate::bridge::protocol::{Command, IpcBootstrap, Reply, Request, Response};
use crate::jobs::{Job, JobReply, WorkerId};
use crate::shared::{Bucket, LockSnapshot, LockStatus, SharedKey};

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The host went away mid-call. Fatal for workers and updaters.
    #[error("IPC server crashed")]
    ServerCrashed,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind IPC socket: {0}")]
    Bind(#[source] io::Error),
    #[error("unexpected reply payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<ProtocolError> for IpcError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed => Self::ServerCrashed,
            other => Self::Protocol(other),
        }
    }
}

pub struct IpcClient {
    reader: FramedRead<OwnedReadHalf, JsonCodec<Response>>,
    writer: FramedWrite<OwnedWriteHalf, JsonCodec<Request>>,
    next_id: u64,
    address: SocketAddr,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("address", &self.address)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl IpcClient {
    /// Connect and authenticate.
    pub async fn connect(bootstrap: &IpcBootstrap) -> Result<Self, IpcError> {
        let mut client = Self::connect_unauthenticated(bootstrap.address).await?;
        client
            .command(Command::Authenticate(bootstrap.auth_key.clone()))
            .await?;
        tracing::debug!(address = %bootstrap.address, "IPC client authenticated");
        Ok(client)
    }

    /// Like [`connect`](Self::connect), retrying while the host is not yet accepting.
    pub async fn connect_with_retry(bootstrap: &IpcBootstrap) -> Result<Self, IpcError> {
        let mut attempt = 1;
        loop {
            match Self::connect(bootstrap).await {
                Err(IpcError::Connect { source, .. })
                    if source.kind() == io::ErrorKind::ConnectionRefused
                        && attempt < CONNECT_ATTEMPTS =>
                {
                    tracing::debug!(attempt, "IPC host not accepting yet, retrying");
                    attempt += 1;
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                result => return result,
            }
        }
    }

    pub async fn connect_unauthenticated(address: SocketAddr) -> Result<Self, IpcError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| IpcError::Connect { address, source })?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(read_half, JsonCodec::new()),
            writer: FramedWrite::new(write_half, JsonCodec::new()),
            next_id: 1,
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Send one command and wait for its reply.
    pub async fn command(&mut self, command: Command) -> Result<Value, IpcError> {
        let (name, args) = command.into_parts()?;
        let id = self.next_id;
        self.next_id += 1;

        tracing::trace!(id, command = name, "IPC request");
        write_frame(
            &mut self.writer,
            Request {
                id,
                command: name.to_string(),
                args,
            },
        )
        .await?;

        loop {
            let response: Response = read_frame(&mut self.reader).await?;
            if response.id != id {
                // Reply to a call whose caller gave up waiting.
                tracing::debug!(expected = id, got = response.id, "Skipping stale IPC reply");
                continue;
            }
            return match response.result {
                Reply::Ok(value) => Ok(value),
                Reply::Error(message) => Err(IpcError::Rejected(message)),
            };
        }
    }

    async fn call<T: DeserializeOwned>(&mut self, command: Command) -> Result<T, IpcError> {
        let value = self.command(command).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn jobs_bulk_put(&mut self, jobs: Vec<Job>) -> Result<(), IpcError> {
        self.command(Command::JobsBulkPut(jobs)).await.map(drop)
    }

    /// Blocks until the host has a job for this worker or the queue shuts down.
    pub async fn jobs_get(&mut self, worker_id: WorkerId) -> Result<JobReply, IpcError> {
        self.call(Command::JobsGet(worker_id)).await
    }

    pub async fn jobs_shutdown(&mut self) -> Result<(), IpcError> {
        self.command(Command::JobsShutdown).await.map(drop)
    }

    pub async fn shared_get(&mut self, key: &SharedKey) -> Result<Bucket, IpcError> {
        self.call(Command::SharedGet(key.clone())).await
    }

    /// Returns the previous value, `Null` when there was none.
    pub async fn shared_set(
        &mut self,
        bucket: &SharedKey,
        key: impl Into<String>,
        value: Value,
    ) -> Result<Value, IpcError> {
        self.command(Command::SharedSet {
            bucket: bucket.clone(),
            key: key.into(),
            value,
        })
        .await
    }

    pub async fn shared_delete(&mut self, key: &SharedKey) -> Result<bool, IpcError> {
        self.call(Command::SharedDelete(key.clone())).await
    }

    pub async fn shared_list(&mut self) -> Result<Vec<SharedKey>, IpcError> {
        self.call(Command::SharedList).await
    }

    pub async fn shared_export(
        &mut self,
    ) -> Result<BTreeMap<SharedKey, Map<String, Value>>, IpcError> {
        self.call(Command::SharedExport).await
    }

    pub async fn shared_import(
        &mut self,
        buckets: BTreeMap<SharedKey, Map<String, Value>>,
    ) -> Result<(), IpcError> {
        self.command(Command::SharedImport(buckets)).await.map(drop)
    }

    /// Blocks until the lock is granted. There is no timeout.
    pub async fn lock_acquire(&mut self, id: &SharedKey) -> Result<(), IpcError> {
        self.command(Command::LockAcquire(id.clone())).await.map(drop)
    }

    pub async fn lock_release(&mut self, id: &SharedKey) -> Result<(), IpcError> {
        self.command(Command::LockRelease(id.clone())).await.map(drop)
    }

    pub async fn lock_status(&mut self, id: &SharedKey) -> Result<LockStatus, IpcError> {
        self.call(Command::LockStatus(id.clone())).await
    }

    pub async fn lock_import(&mut self, locks: Vec<LockSnapshot>) -> Result<(), IpcError> {
        self.command(Command::LockImport(locks)).await.map(drop)
    }

    pub async fn lock_export(&mut self) -> Result<Vec<LockSnapshot>, IpcError> {
        self.call(Command::LockExport).await
    }

    /// Ask the host to shut its server down.
    pub async fn stop(&mut self, stop_key: &str) -> Result<(), IpcError> {
        self.command(Command::Stop(stop_key.to_string()))
            .await
            .map(drop)
    }
}
