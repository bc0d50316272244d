//! The IPC host: job queue and shared memory behind the command table.

use serde_json::Value;

use crate::bridge::protocol::Command;
use crate::ipc::{CommandHandler, ConnectionId, Responder};
use crate::jobs::{JobQueue, JobReply};
use crate::shared::{Acquire, SharedStore};

#[derive(Debug)]
pub struct Host {
    jobs: JobQueue<Responder>,
    shared: SharedStore<Responder>,
}

impl Host {
    pub fn new(worker_count: usize) -> Self {
        Self {
            jobs: JobQueue::new(worker_count),
            shared: SharedStore::new(),
        }
    }

    pub fn jobs(&self) -> &JobQueue<Responder> {
        &self.jobs
    }
}

impl CommandHandler for Host {
    fn handle(&mut self, command: Command, responder: Responder) {
        match command {
            Command::JobsBulkPut(jobs) => {
                let count = jobs.len();
                match self.jobs.bulk_put(jobs, Responder::send_job) {
                    Ok(()) => {
                        tracing::debug!(
                            count,
                            queued = self.jobs.len(),
                            waiting = self.jobs.waiting(),
                            "Jobs submitted"
                        );
                        responder.ok(Value::Bool(true));
                    }
                    Err(e) => {
                        responder.error(e.to_string());
                    }
                }
            }
            Command::JobsGet(worker_id) => {
                if let Some((waiter, reply)) = self.jobs.get(worker_id, responder) {
                    waiter.ok_json(&reply);
                }
            }
            Command::JobsShutdown => {
                tracing::info!(
                    queued = self.jobs.len(),
                    waiting = self.jobs.waiting(),
                    "Job queue shutting down"
                );
                self.jobs.shutdown(|waiter| {
                    waiter.ok_json(&JobReply::Stop);
                });
                responder.ok(Value::Bool(true));
            }
            Command::SharedGet(key) => {
                responder.ok_json(&self.shared.get(&key));
            }
            Command::SharedSet { bucket, key, value } => {
                let previous = self.shared.set(&bucket, key, value);
                responder.ok(previous.unwrap_or(Value::Null));
            }
            Command::SharedDelete(key) => {
                responder.ok(Value::Bool(self.shared.delete(&key)));
            }
            Command::SharedList => {
                responder.ok_json(&self.shared.list());
            }
            Command::SharedExport => {
                responder.ok_json(&self.shared.export_buckets());
            }
            Command::SharedImport(buckets) => {
                self.shared.import_buckets(buckets);
                responder.ok(Value::Bool(true));
            }
            Command::LockAcquire(id) => {
                if let Acquire::Granted(waiter) = self.shared.acquire(&id, responder) {
                    waiter.ok(Value::Bool(true));
                }
            }
            Command::LockRelease(id) => {
                match self
                    .shared
                    .release(&id, |waiter| !waiter.is_closed() && waiter.ok(Value::Bool(true)))
                {
                    Ok(()) => responder.ok(Value::Bool(true)),
                    Err(e) => responder.error(e.to_string()),
                };
            }
            Command::LockStatus(id) => {
                responder.ok_json(&self.shared.status(&id));
            }
            Command::LockImport(locks) => {
                self.shared
                    .import_locks(locks, |waiter| !waiter.is_closed() && waiter.ok(Value::Bool(true)));
                responder.ok(Value::Bool(true));
            }
            Command::LockExport => {
                responder.ok_json(&self.shared.export_locks());
            }
            Command::Authenticate(_) | Command::Stop(_) => {
                // Handled by the server loop before dispatch.
                responder.error("unexpected control command");
            }
        }
    }

    fn connection_closed(&mut self, connection: ConnectionId) {
        self.jobs
            .retain_waiters(|waiter| waiter.connection() != connection);
        self.shared
            .retain_waiters(|waiter| waiter.connection() != connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::HostBootstrap;
    use crate::inline::InlineKey;
    use crate::ipc::{IpcClient, IpcError, IpcServer};
    use crate::jobs::Job;
    use crate::shared::{IpcDriver, SharedKey, SharedMemory};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn start(worker_count: usize) -> (HostBootstrap, tokio::task::JoinHandle<()>) {
        let server = IpcServer::bind().await.unwrap();
        let bootstrap = server.bootstrap();
        let handle = tokio::spawn(async move {
            let mut host = Host::new(worker_count);
            server.run(&mut host).await;
        });
        (bootstrap, handle)
    }

    fn key(s: &str) -> SharedKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn waiting_worker_gets_job_over_ipc() {
        let (bootstrap, _host) = start(2).await;
        let mut worker = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        let mut producer = IpcClient::connect(&bootstrap.ipc).await.unwrap();

        let get = tokio::spawn(async move { worker.jobs_get(1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!get.is_finished());

        let job = Job::update("bot", json!({"update_id": 1}));
        producer.jobs_bulk_put(vec![job.clone()]).await.unwrap();
        assert_eq!(get.await.unwrap().unwrap(), JobReply::Job { job });
    }

    #[tokio::test]
    async fn shutdown_drains_then_stops() {
        let (bootstrap, _host) = start(1).await;
        let mut client = IpcClient::connect(&bootstrap.ipc).await.unwrap();

        let job = Job::update("bot", json!({"update_id": 1}));
        client.jobs_bulk_put(vec![job.clone()]).await.unwrap();
        client.jobs_shutdown().await.unwrap();

        let err = client.jobs_bulk_put(vec![job.clone()]).await.unwrap_err();
        assert!(matches!(err, IpcError::Rejected(ref m) if m.contains("shut down")));

        assert_eq!(client.jobs_get(0).await.unwrap(), JobReply::Job { job });
        assert_eq!(client.jobs_get(0).await.unwrap(), JobReply::Stop);
    }

    #[tokio::test]
    async fn inline_jobs_reach_their_worker_over_ipc() {
        let worker_count = 3;
        let (bootstrap, _host) = start(worker_count).await;
        let target = InlineKey::new(8, "pics").target(worker_count);

        let mut waits = Vec::new();
        for worker_id in 0..worker_count {
            let mut client = IpcClient::connect(&bootstrap.ipc).await.unwrap();
            waits.push(tokio::spawn(async move { client.jobs_get(worker_id).await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut producer = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        let job = Job::update(
            "bot",
            json!({"inline_query": {"from": {"id": 8}, "query": "pics"}}),
        );
        producer.jobs_bulk_put(vec![job]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for (worker_id, wait) in waits.iter().enumerate() {
            assert_eq!(wait.is_finished(), worker_id == target, "worker {worker_id}");
        }
    }

    #[tokio::test]
    async fn dead_worker_connection_does_not_swallow_jobs() {
        let (bootstrap, _host) = start(1).await;

        let mut dead = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        let get = tokio::spawn(async move { dead.jobs_get(0).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        get.abort();
        let _ = get.await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut client = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        let job = Job::update("bot", json!({"update_id": 5}));
        client.jobs_bulk_put(vec![job.clone()]).await.unwrap();
        assert_eq!(client.jobs_get(0).await.unwrap(), JobReply::Job { job });
    }

    #[tokio::test]
    async fn locks_are_granted_fifo_over_ipc() {
        let (bootstrap, _host) = start(1).await;
        let id = key("bot:lock");

        let mut holder = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        holder.lock_acquire(&id).await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        for name in ["a", "b", "c"] {
            let mut client = IpcClient::connect(&bootstrap.ipc).await.unwrap();
            let id = id.clone();
            let order_tx = order_tx.clone();
            tasks.push(tokio::spawn(async move {
                client.lock_acquire(&id).await.unwrap();
                order_tx.send(name).unwrap();
                client.lock_release(&id).await.unwrap();
            }));
            // Queue each contender before the next one asks.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(holder.lock_status(&id).await.unwrap().waiters, 3);

        holder.lock_release(&id).await.unwrap();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(order_rx.recv().await, Some("a"));
        assert_eq!(order_rx.recv().await, Some("b"));
        assert_eq!(order_rx.recv().await, Some("c"));
        assert!(!holder.lock_status(&id).await.unwrap().held);

        let err = holder.lock_release(&id).await.unwrap_err();
        assert!(matches!(err, IpcError::Rejected(ref m) if m.contains("not held")));
    }

    #[tokio::test]
    async fn contended_lock_over_ipc_driver_is_released() {
        let (bootstrap, _host) = start(1).await;
        let driver = IpcDriver::connect(&bootstrap.ipc).await.unwrap();
        let shared = SharedMemory::new(Arc::new(driver));
        let id = key("bot:lock");

        shared.lock_acquire(&id).await.unwrap();
        let waiter = tokio::spawn({
            let shared = shared.clone();
            let id = id.clone();
            async move { shared.lock_acquire(&id).await }
        });
        while shared.lock_status(&id).await.unwrap().waiters == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::timeout(Duration::from_secs(2), shared.lock_release(&id))
            .await
            .expect("release must not wait behind the queued acquire")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(shared.lock_status(&id).await.unwrap().held);

        // The second acquire reuses the pooled connection and still works.
        shared.lock_release(&id).await.unwrap();
        shared.lock_acquire(&id).await.unwrap();
        shared.lock_release(&id).await.unwrap();
        assert!(!shared.lock_status(&id).await.unwrap().held);
    }

    #[tokio::test]
    async fn buckets_over_ipc() {
        let (bootstrap, _host) = start(1).await;
        let mut client = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        let id = key("bot:counter:chat-1");

        assert!(client.shared_get(&id).await.unwrap().is_new);
        assert_eq!(client.shared_set(&id, "n", json!(1)).await.unwrap(), Value::Null);
        assert_eq!(client.shared_set(&id, "n", json!(2)).await.unwrap(), json!(1));

        let bucket = client.shared_get(&id).await.unwrap();
        assert!(!bucket.is_new);
        assert_eq!(bucket.values.get("n"), Some(&json!(2)));
        assert_eq!(client.shared_list().await.unwrap(), vec![id.clone()]);

        assert!(client.shared_delete(&id).await.unwrap());
        assert!(client.shared_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_state_survives_switch_to_ipc_driver() {
        let (bootstrap, _host) = start(1).await;

        let mut shared = SharedMemory::local();
        shared.set(&key("bot:prefs"), "lang", json!("fi")).await.unwrap();
        shared.lock_acquire(&key("bot:busy")).await.unwrap();
        shared.lock_acquire(&key("bot:idle")).await.unwrap();
        shared.lock_release(&key("bot:idle")).await.unwrap();

        let driver = IpcDriver::connect(&bootstrap.ipc).await.unwrap();
        shared.switch_driver(Arc::new(driver)).await.unwrap();

        // Observed from an unrelated connection: the host has the state now.
        let mut observer = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        let bucket = observer.shared_get(&key("bot:prefs")).await.unwrap();
        assert_eq!(bucket.values.get("lang"), Some(&json!("fi")));
        assert!(observer.lock_status(&key("bot:busy")).await.unwrap().held);
        assert!(!observer.lock_status(&key("bot:idle")).await.unwrap().held);

        // The lock carried over is still ours to release.
        shared.lock_release(&key("bot:busy")).await.unwrap();
        assert!(!observer.lock_status(&key("bot:busy")).await.unwrap().held);
    }
}
