//! IPC server: one event loop owning all connection state.
//!
//! Each accepted connection gets a reader task that forwards whole frames into the
//! loop and a writer task that drains a reply channel onto the socket. The loop is
//! the only place the [`CommandHandler`] runs, so handler state needs no locking.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use super::client::IpcError;
use crate::bridge::codec::{JsonCodec, ProtocolError, read_frame, write_frame};
use crate::bridge::protocol::{
    AUTHENTICATE, Command, HostBootstrap, IpcBootstrap, Reply, Request, Response,
};
use crate::jobs::{Job, JobReply};

const PORT_RANGE_START: u16 = 49152;
const BIND_ATTEMPTS: usize = 16;

pub type ConnectionId = u64;

/// Receives every authenticated command except `__authenticate__` and `__stop__`.
pub trait CommandHandler {
    /// Handle one command. The reply may be sent right away or kept in `responder`
    /// and sent later.
    fn handle(&mut self, command: Command, responder: Responder);

    /// The peer went away; drop anything still waiting to reply to it.
    fn connection_closed(&mut self, connection: ConnectionId);
}

/// Reply handle for one request.
#[derive(Debug)]
pub struct Responder {
    connection: ConnectionId,
    request_id: u64,
    tx: mpsc::UnboundedSender<Response>,
}

impl Responder {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// The connection's writer is gone; a reply would be lost.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Returns `false` when the connection is gone.
    pub fn reply(self, result: Reply) -> bool {
        self.tx
            .send(Response {
                id: self.request_id,
                result,
            })
            .is_ok()
    }

    pub fn ok(self, value: Value) -> bool {
        self.reply(Reply::Ok(value))
    }

    pub fn ok_json<T: Serialize>(self, value: &T) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.ok(value),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode reply");
                self.error(format!("failed to encode reply: {e}"))
            }
        }
    }

    pub fn error(self, message: impl Into<String>) -> bool {
        self.reply(Reply::Error(message.into()))
    }

    /// Hand a job to the worker waiting on this responder, or give it back if the
    /// worker is gone.
    pub fn send_job(self, job: Job) -> Result<(), Job> {
        if self.is_closed() {
            return Err(job);
        }
        let reply = JobReply::Job { job };
        let value = match serde_json::to_value(&reply) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode job, dropping it");
                self.error(format!("failed to encode job: {e}"));
                return Ok(());
            }
        };
        let Self {
            request_id, tx, ..
        } = self;
        match tx.send(Response {
            id: request_id,
            result: Reply::Ok(value),
        }) {
            Ok(()) => Ok(()),
            Err(_) => reply.into_job().map_or(Ok(()), Err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Authenticating,
    Authenticated,
}

struct Connection {
    state: ConnectionState,
    tx: mpsc::UnboundedSender<Response>,
}

enum Event {
    Frame(ConnectionId, Request),
    Closed(ConnectionId),
}

enum Flow {
    Continue,
    Stop,
}

pub struct IpcServer {
    listener: TcpListener,
    address: SocketAddr,
    auth_key: String,
    stop_key: String,
}

fn random_key() -> String {
    Uuid::new_v4().simple().to_string()
}

fn random_port() -> u16 {
    rand::rng().random_range(PORT_RANGE_START..=u16::MAX)
}

impl IpcServer {
    /// Listen on a random loopback port in the ephemeral range.
    pub async fn bind() -> Result<Self, IpcError> {
        let mut last_error = None;
        for attempt in 1..=BIND_ATTEMPTS {
            let port = random_port();
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => {
                    let address = listener.local_addr().map_err(IpcError::Bind)?;
                    tracing::info!(%address, "IPC server listening");
                    return Ok(Self {
                        listener,
                        address,
                        auth_key: random_key(),
                        stop_key: random_key(),
                    });
                }
                Err(e) => {
                    tracing::debug!(attempt, port, error = %e, "IPC bind failed, trying another port");
                    last_error = Some(e);
                }
            }
        }
        Err(IpcError::Bind(last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "no bind attempts made")
        })))
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn bootstrap(&self) -> HostBootstrap {
        HostBootstrap {
            ipc: IpcBootstrap {
                address: self.address,
                auth_key: self.auth_key.clone(),
            },
            stop_key: self.stop_key.clone(),
        }
    }

    /// Serve until a valid `__stop__` arrives.
    pub async fn run<H: CommandHandler>(self, handler: &mut H) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let mut connections: HashMap<ConnectionId, Connection> = HashMap::new();
        let mut readers = JoinSet::new();
        let mut next_connection: ConnectionId = 0;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            next_connection += 1;
                            let id = next_connection;
                            tracing::debug!(connection = id, %peer, "IPC connection accepted");
                            let tx = spawn_connection(id, stream, event_tx.clone(), &mut readers);
                            connections.insert(
                                id,
                                Connection {
                                    state: ConnectionState::Authenticating,
                                    tx,
                                },
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "IPC accept failed");
                        }
                    }
                }

                Some(event) = event_rx.recv() => {
                    match event {
                        Event::Frame(id, request) => {
                            if let Flow::Stop = self.dispatch(id, request, &mut connections, handler) {
                                break;
                            }
                        }
                        Event::Closed(id) => {
                            tracing::debug!(connection = id, "IPC connection closed");
                            connections.remove(&id);
                            handler.connection_closed(id);
                        }
                    }
                }

                Some(_) = readers.join_next() => {}
            }
        }

        readers.abort_all();
        tracing::info!(connections = connections.len(), "IPC server stopped");
    }

    fn dispatch<H: CommandHandler>(
        &self,
        id: ConnectionId,
        request: Request,
        connections: &mut HashMap<ConnectionId, Connection>,
        handler: &mut H,
    ) -> Flow {
        let Some(connection) = connections.get_mut(&id) else {
            return Flow::Continue;
        };
        let responder = Responder {
            connection: id,
            request_id: request.id,
            tx: connection.tx.clone(),
        };

        if connection.state == ConnectionState::Authenticating && request.command != AUTHENTICATE
        {
            tracing::warn!(connection = id, command = %request.command, "Command before authentication");
            responder.error("not authenticated");
            return Flow::Continue;
        }

        let command = match Command::from_parts(&request.command, request.args) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(connection = id, error = %e, "Rejected IPC request");
                responder.error(e.to_string());
                return Flow::Continue;
            }
        };

        match command {
            Command::Authenticate(key) => {
                if key == self.auth_key {
                    connection.state = ConnectionState::Authenticated;
                    responder.ok(Value::Bool(true));
                } else {
                    tracing::warn!(connection = id, "IPC authentication failed");
                    responder.error("authentication failed");
                }
                Flow::Continue
            }
            Command::Stop(key) => {
                if key == self.stop_key {
                    tracing::info!(connection = id, "IPC server stop requested");
                    responder.ok(Value::Bool(true));
                    Flow::Stop
                } else {
                    tracing::warn!(connection = id, "Invalid stop key");
                    responder.error("invalid stop key");
                    Flow::Continue
                }
            }
            command => {
                tracing::trace!(connection = id, command = command.name(), "Dispatching");
                handler.handle(command, responder);
                Flow::Continue
            }
        }
    }
}

fn spawn_connection(
    id: ConnectionId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<Event>,
    readers: &mut JoinSet<()>,
) -> mpsc::UnboundedSender<Response> {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<Request>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<Response>::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    readers.spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(request) => {
                    if events.send(Event::Frame(id, request)).is_err() {
                        return;
                    }
                }
                Err(ProtocolError::ConnectionClosed) => break,
                Err(e) => {
                    tracing::warn!(connection = id, error = %e, "IPC connection error");
                    break;
                }
            }
        }
        let _ = events.send(Event::Closed(id));
    });

    tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, response).await {
                tracing::debug!(connection = id, error = %e, "IPC write failed");
                break;
            }
        }
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcClient;
    use serde_json::json;

    /// Echoes every command's name back.
    struct Echo {
        closed: Vec<ConnectionId>,
    }

    impl CommandHandler for Echo {
        fn handle(&mut self, command: Command, responder: Responder) {
            responder.ok(json!(command.name()));
        }

        fn connection_closed(&mut self, connection: ConnectionId) {
            self.closed.push(connection);
        }
    }

    async fn start() -> (HostBootstrap, tokio::task::JoinHandle<Echo>) {
        let server = IpcServer::bind().await.unwrap();
        let bootstrap = server.bootstrap();
        let handle = tokio::spawn(async move {
            let mut echo = Echo { closed: Vec::new() };
            server.run(&mut echo).await;
            echo
        });
        (bootstrap, handle)
    }

    #[test]
    fn random_ports_stay_in_the_ephemeral_range() {
        for _ in 0..1000 {
            assert!(random_port() >= PORT_RANGE_START);
        }
    }

    #[tokio::test]
    async fn binds_in_ephemeral_range_with_distinct_keys() {
        let server = IpcServer::bind().await.unwrap();
        let bootstrap = server.bootstrap();
        assert!(server.address().port() >= PORT_RANGE_START);
        assert!(server.address().ip().is_loopback());
        assert_eq!(bootstrap.ipc.auth_key.len(), 32);
        assert_ne!(bootstrap.ipc.auth_key, bootstrap.stop_key);
    }

    #[tokio::test]
    async fn commands_before_authentication_are_rejected() {
        let (bootstrap, _server) = start().await;
        let mut client = IpcClient::connect_unauthenticated(bootstrap.ipc.address)
            .await
            .unwrap();

        let err = client.command(Command::SharedList).await.unwrap_err();
        assert!(matches!(err, IpcError::Rejected(ref m) if m == "not authenticated"));

        let err = client
            .command(Command::Authenticate("wrong".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Rejected(_)));

        // Still open, still unauthenticated.
        assert!(client.command(Command::SharedList).await.is_err());

        client
            .command(Command::Authenticate(bootstrap.ipc.auth_key.clone()))
            .await
            .unwrap();
        let value = client.command(Command::SharedList).await.unwrap();
        assert_eq!(value, json!("shared.list"));
    }

    #[tokio::test]
    async fn unknown_command_gets_an_error_reply() {
        let (bootstrap, _server) = start().await;
        let stream = TcpStream::connect(bootstrap.ipc.address).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, JsonCodec::<Response>::new());
        let mut writer = FramedWrite::new(write_half, JsonCodec::<Request>::new());

        let requests = [
            (AUTHENTICATE, json!(bootstrap.ipc.auth_key)),
            ("jobs.steal", Value::Null),
            ("jobs.get", json!("three")),
            ("shared.list", Value::Null),
        ];
        for (id, (command, args)) in requests.into_iter().enumerate() {
            let request = Request {
                id: id as u64,
                command: command.to_string(),
                args,
            };
            write_frame(&mut writer, request).await.unwrap();
        }

        let mut results = Vec::new();
        for _ in 0..4 {
            let response: Response = read_frame(&mut reader).await.unwrap();
            results.push((response.id, response.result));
        }
        assert_eq!(results[0], (0, Reply::Ok(json!(true))));
        assert!(matches!(&results[1], (1, Reply::Error(m)) if m.contains("unknown command")));
        assert!(matches!(&results[2], (2, Reply::Error(m)) if m.contains("invalid arguments")));
        assert_eq!(results[3], (3, Reply::Ok(json!("shared.list"))));
    }

    #[tokio::test]
    async fn wrong_stop_key_does_not_stop() {
        let (bootstrap, server) = start().await;
        let mut client = IpcClient::connect(&bootstrap.ipc).await.unwrap();

        let err = client.stop("nope").await.unwrap_err();
        assert!(matches!(err, IpcError::Rejected(_)));
        assert!(!server.is_finished());
        assert!(client.command(Command::SharedList).await.is_ok());

        client.stop(&bootstrap.stop_key).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_connections_are_reported_to_the_handler() {
        let (bootstrap, server) = start().await;
        let client = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        drop(client);

        let mut stopper = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        // Give the loop a moment to observe the first connection's EOF.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stopper.stop(&bootstrap.stop_key).await.unwrap();

        let echo = server.await.unwrap();
        assert_eq!(echo.closed, vec![1]);
    }

    #[tokio::test]
    async fn stop_closes_other_connections() {
        let (bootstrap, server) = start().await;
        let mut idle = IpcClient::connect(&bootstrap.ipc).await.unwrap();
        let mut stopper = IpcClient::connect(&bootstrap.ipc).await.unwrap();

        stopper.stop(&bootstrap.stop_key).await.unwrap();
        server.await.unwrap();

        let err = idle.command(Command::SharedList).await.unwrap_err();
        assert!(matches!(err, IpcError::ServerCrashed));
    }
}
