//! Runner: owns child lifecycle, the timer control loop, and ordered shutdown.
//!
//! Flow:
//! 1. Start the IPC host, read its bootstrap from `Ready`
//! 2. Connect the runner's own IPC client
//! 3. Start workers, then one updater per bot
//! 4. Tick: once per whole second, submit due timers as jobs
//! 5. On signal or [`RunnerHandle::stop`]: stop updaters, drain and stop workers,
//!    then stop the host

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::bot::Bots;
use crate::bridge::codec::ProtocolError;
use crate::bridge::protocol::{ControlRequest, ControlResponse, HostBootstrap, IpcBootstrap};
use crate::config::RunnerConfig;
use crate::ipc::{IpcClient, IpcError};
use crate::jobs::Job;
use crate::process::{ChildProcess, ProcessSpawner, Role, SpawnError};
use crate::scheduler::{Scheduler, SchedulerError, SecondGate};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("{role} failed to start: {error}")]
    Startup { role: String, error: String },
    #[error("{role} did not report ready within {timeout:?}")]
    StartupTimeout { role: String, timeout: Duration },
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("control channel error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Stops a running [`Runner`] from elsewhere.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl RunnerHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

pub struct Runner {
    config: RunnerConfig,
    bots: Bots,
    stop: Arc<watch::Sender<bool>>,
}

impl Runner {
    pub fn new(config: RunnerConfig, bots: Bots) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            bots,
            stop: Arc::new(stop),
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Run until SIGINT/SIGTERM or [`RunnerHandle::stop`], then shut everything down.
    pub async fn run(self) -> Result<(), RunnerError> {
        let mut schedulers = self
            .bots
            .iter()
            .map(|bot| Scheduler::with_timers(bot.id(), &bot.timers()))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            workers = self.config.workers,
            bots = self.bots.len(),
            "Starting runner"
        );

        let mut children = Children::default();
        if let Err(e) = self.start(&mut children).await {
            tracing::error!(error = %e, "Runner startup failed, cleaning up");
            children.shutdown().await;
            return Err(e);
        }
        tracing::info!("Runner started");

        if let Some(client) = children.client.as_mut() {
            self.control_loop(client, &mut schedulers).await;
        }

        children.shutdown().await;
        tracing::info!("Runner stopped");
        Ok(())
    }

    /// Submit due timers once per second until a signal, a stop request, or the
    /// host going away.
    async fn control_loop(&self, client: &mut IpcClient, schedulers: &mut [Scheduler]) {
        let mut stop_rx = self.stop.subscribe();
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut gate = SecondGate::default();
        let signal = shutdown_signal();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => return,
                _ = stop_requested(&mut stop_rx) => {
                    tracing::info!("Stop requested");
                    return;
                }
                _ = tick.tick() => {
                    let now = Utc::now();
                    if !gate.admit(now) {
                        continue;
                    }
                    let jobs: Vec<Job> = schedulers
                        .iter_mut()
                        .flat_map(|scheduler| scheduler.due(now))
                        .map(|task| Job::task(&task))
                        .collect();
                    if jobs.is_empty() {
                        continue;
                    }
                    let count = jobs.len();
                    match client.jobs_bulk_put(jobs).await {
                        Ok(()) => tracing::debug!(count, "Submitted due timers"),
                        Err(IpcError::ServerCrashed) => {
                            tracing::error!("IPC host crashed, shutting down");
                            return;
                        }
                        Err(e) => tracing::warn!(count, error = %e, "Failed to submit timers"),
                    }
                }
            }
        }
    }

    async fn start(&self, children: &mut Children) -> Result<(), RunnerError> {
        let spawner = self.config.spawner.as_ref();
        let timeout = self.config.startup_timeout;

        let role = Role::IpcHost {
            worker_count: self.config.workers,
        };
        let (host, bootstrap) = start_child(spawner, role, None, timeout).await?;
        children.host = Some(host);
        let bootstrap = bootstrap.ok_or_else(|| RunnerError::Startup {
            role: "ipc-host".to_string(),
            error: "ready without bootstrap".to_string(),
        })?;
        children.stop_key = Some(bootstrap.stop_key.clone());
        tracing::info!(address = %bootstrap.ipc.address, "IPC host ready");

        children.client = Some(IpcClient::connect_with_retry(&bootstrap.ipc).await?);

        for worker_id in 0..self.config.workers {
            let role = Role::Worker { worker_id };
            let (worker, _) =
                start_child(spawner, role, Some(bootstrap.ipc.clone()), timeout).await?;
            children.workers.push(worker);
        }
        tracing::info!(workers = children.workers.len(), "Workers ready");

        let fetch_timeout_ms = u64::try_from(self.config.fetch_timeout.as_millis()).unwrap_or(u64::MAX);
        for bot_id in self.bots.ids() {
            let role = Role::Updater {
                bot_id: bot_id.to_string(),
                fetch_timeout_ms,
                clean_checks: self.config.clean_checks,
            };
            let (updater, _) =
                start_child(spawner, role, Some(bootstrap.ipc.clone()), timeout).await?;
            children.updaters.push(updater);
        }
        tracing::info!(updaters = children.updaters.len(), "Updaters ready");

        Ok(())
    }
}

/// Spawn a child, send `Init`, and wait for it to report ready. A child that fails
/// or times out is killed.
async fn start_child(
    spawner: &dyn ProcessSpawner,
    role: Role,
    ipc: Option<IpcBootstrap>,
    timeout: Duration,
) -> Result<(ChildProcess, Option<HostBootstrap>), RunnerError> {
    let label = role.label();
    let mut child = spawner.spawn(&role)?;
    tracing::debug!(child = %label, "Waiting for Ready");

    let ready = tokio::time::timeout(timeout, handshake(&mut child, role, ipc)).await;

    match ready {
        Ok(Ok(host)) => Ok((child, host)),
        Ok(Err(e)) => {
            child.kill().await;
            Err(e)
        }
        Err(_) => {
            child.kill().await;
            Err(RunnerError::StartupTimeout {
                role: label,
                timeout,
            })
        }
    }
}

async fn handshake(
    child: &mut ChildProcess,
    role: Role,
    ipc: Option<IpcBootstrap>,
) -> Result<Option<HostBootstrap>, RunnerError> {
    child.send(ControlRequest::Init { role, ipc }).await?;
    match child.recv().await? {
        ControlResponse::Ready { host } => Ok(host),
        ControlResponse::Failed { error } => Err(RunnerError::Startup {
            role: child.label().to_string(),
            error,
        }),
    }
}

#[derive(Default)]
struct Children {
    host: Option<ChildProcess>,
    stop_key: Option<String>,
    client: Option<IpcClient>,
    workers: Vec<ChildProcess>,
    updaters: Vec<ChildProcess>,
}

impl Children {
    /// Stop updaters, then drain and stop workers, then stop the host. Each stage is
    /// joined before the next starts. Failures are logged and the sequence goes on.
    async fn shutdown(self) {
        let Self {
            host,
            stop_key,
            mut client,
            workers,
            mut updaters,
        } = self;

        for updater in &mut updaters {
            if let Err(e) = updater.send(ControlRequest::Stop).await {
                tracing::warn!(child = %updater.label(), error = %e, "Failed to send Stop");
            }
        }
        join_all("updater", updaters).await;

        if let Some(client) = client.as_mut()
            && !workers.is_empty()
            && let Err(e) = client.jobs_shutdown().await
        {
            tracing::warn!(error = %e, "Failed to shut the job queue down");
        }
        join_all("worker", workers).await;

        let Some(host) = host else {
            return;
        };
        match (client.as_mut(), stop_key) {
            (Some(client), Some(stop_key)) => {
                if let Err(e) = client.stop(&stop_key).await {
                    tracing::warn!(error = %e, "Failed to stop the IPC host");
                }
            }
            _ => {
                // Without a client the host only sees its control channel close.
                tracing::debug!("Stopping IPC host by closing its control channel");
            }
        }
        join_all("ipc-host", vec![host]).await;
    }
}

async fn join_all(kind: &str, children: Vec<ChildProcess>) {
    let count = children.len();
    for child in children {
        let label = child.label().to_string();
        match child.wait().await {
            Ok(()) => tracing::debug!(child = %label, "Child exited"),
            Err(e) => tracing::warn!(child = %label, error = %e, "Child exited with error"),
        }
    }
    if count > 0 {
        tracing::info!(kind, count, "Children stopped");
    }
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
