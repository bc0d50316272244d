//! Child processes: roles, spawning, and the child-side entry point.
//!
//! Every child speaks the control protocol on a pair of pipes (stdin/stdout for
//! real processes, in-memory duplex streams for in-process children):
//! 1. Orchestrator sends `Init { role, ipc }`
//! 2. Child replies `Ready` (the IPC host includes its bootstrap) or `Failed`
//! 3. Updaters wait for `Stop`; workers and the host stop through IPC

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

use crate::bot::Bots;
use crate::bridge::codec::{JsonCodec, ProtocolError, read_frame, write_frame};
use crate::bridge::protocol::{ControlRequest, ControlResponse, IpcBootstrap};
use crate::host::Host;
use crate::ipc::{IpcClient, IpcServer};
use crate::jobs::WorkerId;
use crate::shared::{IpcDriver, SharedMemory};
use crate::updater::{Updater, UpdaterConfig};
use crate::worker::Worker;

/// Set on re-executed children so `main` knows to run a role instead of a runner.
pub const ROLE_ENV: &str = "BOTRUN_ROLE";

/// Size of each in-memory control pipe for in-process children.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Role {
    IpcHost {
        worker_count: usize,
    },
    Worker {
        worker_id: WorkerId,
    },
    Updater {
        bot_id: String,
        fetch_timeout_ms: u64,
        clean_checks: u32,
    },
}

impl Role {
    /// Short name for logs and the role environment variable.
    pub fn label(&self) -> String {
        match self {
            Self::IpcHost { .. } => "ipc-host".to_string(),
            Self::Worker { worker_id } => format!("worker-{worker_id}"),
            Self::Updater { bot_id, .. } => format!("updater-{bot_id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{label} exited with {status}")]
    Exited { label: String, status: String },
    #[error("{label} failed: {message}")]
    Task { label: String, message: String },
    #[error("spawn failed: {0}")]
    Other(String),
}

type ControlReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, JsonCodec<ControlResponse>>;
type ControlWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<ControlRequest>>;

enum ChildExit {
    Process(tokio::process::Child),
    Task(JoinHandle<anyhow::Result<()>>),
}

/// Orchestrator-side handle to one child.
pub struct ChildProcess {
    label: String,
    reader: ControlReader,
    writer: ControlWriter,
    exit: ChildExit,
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl ChildProcess {
    fn new(
        label: String,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        exit: ChildExit,
    ) -> Self {
        Self {
            label,
            reader: FramedRead::new(reader, JsonCodec::new()),
            writer: FramedWrite::new(writer, JsonCodec::new()),
            exit,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn send(&mut self, request: ControlRequest) -> Result<(), ProtocolError> {
        write_frame(&mut self.writer, request).await
    }

    pub async fn recv(&mut self) -> Result<ControlResponse, ProtocolError> {
        read_frame(&mut self.reader).await
    }

    /// Close the control channel and wait for the child to exit on its own.
    pub async fn wait(self) -> Result<(), SpawnError> {
        let Self {
            label,
            reader,
            writer,
            exit,
        } = self;
        drop(writer);
        drop(reader);

        match exit {
            ChildExit::Process(mut child) => {
                let status = child.wait().await?;
                if status.success() {
                    Ok(())
                } else {
                    Err(SpawnError::Exited {
                        label,
                        status: status.to_string(),
                    })
                }
            }
            ChildExit::Task(handle) => match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(SpawnError::Task {
                    label,
                    message: format!("{e:#}"),
                }),
                Err(e) => Err(SpawnError::Task {
                    label,
                    message: e.to_string(),
                }),
            },
        }
    }

    /// Terminate a child that never became ready.
    pub async fn kill(self) {
        match self.exit {
            ChildExit::Process(mut child) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(child = %self.label, error = %e, "Failed to kill child");
                }
            }
            ChildExit::Task(handle) => handle.abort(),
        }
    }
}

/// Extension point for how children are started.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, role: &Role) -> Result<ChildProcess, SpawnError>;
}

/// Re-executes the current binary with [`ROLE_ENV`] set. The binary's `main`
/// must call [`run_child_if_requested`] before anything else.
#[derive(Debug, Default)]
pub struct ExecSpawner;

impl ProcessSpawner for ExecSpawner {
    fn spawn(&self, role: &Role) -> Result<ChildProcess, SpawnError> {
        let exe = std::env::current_exe()?;
        let label = role.label();
        let mut child = tokio::process::Command::new(exe)
            .env(ROLE_ENV, &label)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        tracing::debug!(child = %label, pid = ?child.id(), "Spawned child process");
        Ok(ChildProcess::new(
            label,
            Box::new(stdout),
            Box::new(stdin),
            ChildExit::Process(child),
        ))
    }
}

/// Runs each role as a task in this process, over in-memory pipes.
#[derive(Debug, Clone)]
pub struct InProcessSpawner {
    bots: Bots,
}

impl InProcessSpawner {
    pub fn new(bots: Bots) -> Self {
        Self { bots }
    }
}

impl ProcessSpawner for InProcessSpawner {
    fn spawn(&self, role: &Role) -> Result<ChildProcess, SpawnError> {
        let (parent_to_child, child_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (child_writer, child_to_parent) = tokio::io::duplex(PIPE_CAPACITY);
        let handle = tokio::spawn(run_child(self.bots.clone(), child_reader, child_writer));

        Ok(ChildProcess::new(
            role.label(),
            Box::new(child_to_parent),
            Box::new(parent_to_child),
            ChildExit::Task(handle),
        ))
    }
}

/// Run as a child when [`ROLE_ENV`] is set, returning the child's result. Returns
/// `None` in the orchestrator.
pub async fn run_child_if_requested(bots: &Bots) -> Option<anyhow::Result<()>> {
    let label = std::env::var(ROLE_ENV).ok()?;
    tracing::debug!(role = %label, "Starting as child process");
    if let Err(e) = ignore_termination_signals() {
        return Some(Err(e.into()));
    }
    Some(run_child(bots.clone(), tokio::io::stdin(), tokio::io::stdout()).await)
}

/// Children share the orchestrator's process group, so a Ctrl+C reaches them too.
/// They leave shutdown to the orchestrator.
fn ignore_termination_signals() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = interrupt.recv() => {
                        tracing::debug!("Ignoring SIGINT in child, waiting for orchestrator");
                    }
                    Some(()) = terminate.recv() => {
                        tracing::debug!("Ignoring SIGTERM in child, waiting for orchestrator");
                    }
                    else => break,
                }
            }
        });
    }
    Ok(())
}

/// Child-side entry point: read `Init`, become the role.
pub async fn run_child<R, W>(bots: Bots, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = FramedRead::new(reader, JsonCodec::<ControlRequest>::new());
    let mut writer = FramedWrite::new(writer, JsonCodec::<ControlResponse>::new());

    let (role, ipc) = match read_frame(&mut reader).await? {
        ControlRequest::Init { role, ipc } => (role, ipc),
        ControlRequest::Stop => {
            tracing::debug!("Stopped before Init");
            return Ok(());
        }
    };

    let span = tracing::info_span!("child", role = %role.label());
    async move {
        tracing::debug!("Received Init");
        match role {
            Role::IpcHost { worker_count } => run_host(worker_count, reader, writer).await,
            Role::Worker { worker_id } => {
                let Some(ipc) = ipc else {
                    return fail(&mut writer, "worker needs IPC bootstrap".to_string()).await;
                };
                drop(reader);
                run_worker(worker_id, bots, ipc, writer).await
            }
            Role::Updater {
                bot_id,
                fetch_timeout_ms,
                clean_checks,
            } => {
                let Some(ipc) = ipc else {
                    return fail(&mut writer, "updater needs IPC bootstrap".to_string()).await;
                };
                let config = UpdaterConfig {
                    fetch_timeout: Duration::from_millis(fetch_timeout_ms),
                    clean_checks,
                    ..UpdaterConfig::default()
                };
                run_updater(bot_id, config, bots, ipc, reader, writer).await
            }
        }
    }
    .instrument(span)
    .await
}

type ChildReader<R> = FramedRead<R, JsonCodec<ControlRequest>>;
type ChildWriter<W> = FramedWrite<W, JsonCodec<ControlResponse>>;

/// Report a startup failure to the orchestrator and return it as an error.
async fn fail<W>(writer: &mut ChildWriter<W>, error: String) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    tracing::error!(%error, "Child failed to start");
    if let Err(e) = write_frame(writer, ControlResponse::Failed { error: error.clone() }).await {
        tracing::warn!(error = %e, "Failed to report startup failure");
    }
    Err(anyhow::anyhow!(error))
}

async fn run_host<R, W>(
    worker_count: usize,
    mut reader: ChildReader<R>,
    mut writer: ChildWriter<W>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let server = match IpcServer::bind().await {
        Ok(server) => server,
        Err(e) => return fail(&mut writer, e.to_string()).await,
    };
    write_frame(
        &mut writer,
        ControlResponse::Ready {
            host: Some(server.bootstrap()),
        },
    )
    .await?;

    let mut host = Host::new(worker_count);
    tokio::select! {
        _ = server.run(&mut host) => {}
        _ = control_closed(&mut reader) => {
            tracing::warn!("Control channel closed, IPC host exiting");
        }
    }
    Ok(())
}

/// Resolves once the orchestrator end of the control channel goes away.
async fn control_closed<R: AsyncRead + Unpin>(reader: &mut ChildReader<R>) {
    loop {
        match read_frame(reader).await {
            Ok(request) => {
                tracing::debug!(?request, "Ignoring control message");
            }
            Err(ProtocolError::ConnectionClosed) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Control channel error");
                return;
            }
        }
    }
}

async fn run_worker<W>(
    worker_id: WorkerId,
    bots: Bots,
    ipc: IpcBootstrap,
    mut writer: ChildWriter<W>,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let connected = async {
        let client = IpcClient::connect_with_retry(&ipc).await?;
        let driver = IpcDriver::connect(&ipc).await?;
        anyhow::Ok((client, driver))
    };
    let (client, driver) = match connected.await {
        Ok(pair) => pair,
        Err(e) => return fail(&mut writer, format!("{e:#}")).await,
    };
    write_frame(&mut writer, ControlResponse::Ready { host: None }).await?;

    let shared = SharedMemory::new(Arc::new(driver));
    Worker::new(worker_id, client, bots, shared).run().await?;
    Ok(())
}

async fn run_updater<R, W>(
    bot_id: String,
    config: UpdaterConfig,
    bots: Bots,
    ipc: IpcBootstrap,
    mut reader: ChildReader<R>,
    mut writer: ChildWriter<W>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Unpin,
{
    let Some(bot) = bots.get(&bot_id).cloned() else {
        return fail(&mut writer, format!("unknown bot {bot_id}")).await;
    };
    let client = match IpcClient::connect_with_retry(&ipc).await {
        Ok(client) => client,
        Err(e) => return fail(&mut writer, e.to_string()).await,
    };
    write_frame(&mut writer, ControlResponse::Ready { host: None }).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_listener = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(ControlRequest::Stop) => {
                    tracing::debug!("Stop received");
                    break;
                }
                Ok(other) => tracing::warn!(request = ?other, "Unexpected control message"),
                Err(ProtocolError::ConnectionClosed) => {
                    tracing::debug!("Control channel closed, stopping");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Control channel error, stopping");
                    break;
                }
            }
        }
        let _ = stop_tx.send(true);
    });

    let result = Updater::new(bot_id, bot.fetcher(), client, stop_rx, config)
        .run()
        .await;
    stop_listener.abort();
    result?;
    Ok(())
}
