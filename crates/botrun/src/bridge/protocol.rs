//! Wire protocol types.
//!
//! Two channels:
//! - **IPC socket** (loopback TCP): `Request`/`Response` frames carrying a [`Command`]
//! - **Control channel** (child stdin/stdout): `Init`, `Stop` from the orchestrator,
//!   `Ready`, `Failed` from the child

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jobs::{Job, WorkerId};
use crate::process::Role;
use crate::shared::{LockSnapshot, SharedKey};

/// One RPC call on the IPC socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Echoed back in the matching [`Response`].
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Reply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Error(String),
}

pub const AUTHENTICATE: &str = "__authenticate__";
pub const STOP: &str = "__stop__";
pub const JOBS_BULK_PUT: &str = "jobs.bulk_put";
pub const JOBS_GET: &str = "jobs.get";
pub const JOBS_SHUTDOWN: &str = "jobs.shutdown";
pub const SHARED_GET: &str = "shared.get";
pub const SHARED_SET: &str = "shared.set";
pub const SHARED_DELETE: &str = "shared.delete";
pub const SHARED_LIST: &str = "shared.list";
pub const SHARED_EXPORT: &str = "shared.export";
pub const SHARED_IMPORT: &str = "shared.import";
pub const LOCK_ACQUIRE: &str = "shared.lock_acquire";
pub const LOCK_RELEASE: &str = "shared.lock_release";
pub const LOCK_STATUS: &str = "shared.lock_status";
pub const LOCK_IMPORT: &str = "shared.lock_import";
pub const LOCK_EXPORT: &str = "shared.lock_export";

/// Every command the IPC host understands.
///
/// The wire carries the command as a name plus JSON arguments; [`Command::from_parts`]
/// and [`Command::into_parts`] are the only places the two representations meet.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Authenticate(String),
    Stop(String),
    JobsBulkPut(Vec<Job>),
    JobsGet(WorkerId),
    JobsShutdown,
    SharedGet(SharedKey),
    SharedSet {
        bucket: SharedKey,
        key: String,
        value: Value,
    },
    SharedDelete(SharedKey),
    SharedList,
    SharedExport,
    SharedImport(BTreeMap<SharedKey, Map<String, Value>>),
    LockAcquire(SharedKey),
    LockRelease(SharedKey),
    LockStatus(SharedKey),
    LockImport(Vec<LockSnapshot>),
    LockExport,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("invalid arguments for {command}: {source}")]
    InvalidArgs {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct SetArgs {
    bucket: SharedKey,
    key: String,
    value: Value,
}

fn args<T: serde::de::DeserializeOwned>(
    command: &'static str,
    value: Value,
) -> Result<T, CommandError> {
    serde_json::from_value(value).map_err(|source| CommandError::InvalidArgs { command, source })
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => AUTHENTICATE,
            Self::Stop(_) => STOP,
            Self::JobsBulkPut(_) => JOBS_BULK_PUT,
            Self::JobsGet(_) => JOBS_GET,
            Self::JobsShutdown => JOBS_SHUTDOWN,
            Self::SharedGet(_) => SHARED_GET,
            Self::SharedSet { .. } => SHARED_SET,
            Self::SharedDelete(_) => SHARED_DELETE,
            Self::SharedList => SHARED_LIST,
            Self::SharedExport => SHARED_EXPORT,
            Self::SharedImport(_) => SHARED_IMPORT,
            Self::LockAcquire(_) => LOCK_ACQUIRE,
            Self::LockRelease(_) => LOCK_RELEASE,
            Self::LockStatus(_) => LOCK_STATUS,
            Self::LockImport(_) => LOCK_IMPORT,
            Self::LockExport => LOCK_EXPORT,
        }
    }

    /// Decode a command from its wire name and arguments.
    pub fn from_parts(name: &str, value: Value) -> Result<Self, CommandError> {
        let command = match name {
            AUTHENTICATE => Self::Authenticate(args(AUTHENTICATE, value)?),
            STOP => Self::Stop(args(STOP, value)?),
            JOBS_BULK_PUT => Self::JobsBulkPut(args(JOBS_BULK_PUT, value)?),
            JOBS_GET => Self::JobsGet(args(JOBS_GET, value)?),
            JOBS_SHUTDOWN => Self::JobsShutdown,
            SHARED_GET => Self::SharedGet(args(SHARED_GET, value)?),
            SHARED_SET => {
                let SetArgs { bucket, key, value } = args(SHARED_SET, value)?;
                Self::SharedSet { bucket, key, value }
            }
            SHARED_DELETE => Self::SharedDelete(args(SHARED_DELETE, value)?),
            SHARED_LIST => Self::SharedList,
            SHARED_EXPORT => Self::SharedExport,
            SHARED_IMPORT => Self::SharedImport(args(SHARED_IMPORT, value)?),
            LOCK_ACQUIRE => Self::LockAcquire(args(LOCK_ACQUIRE, value)?),
            LOCK_RELEASE => Self::LockRelease(args(LOCK_RELEASE, value)?),
            LOCK_STATUS => Self::LockStatus(args(LOCK_STATUS, value)?),
            LOCK_IMPORT => Self::LockImport(args(LOCK_IMPORT, value)?),
            LOCK_EXPORT => Self::LockExport,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }

    /// Split a command into its wire name and JSON arguments.
    pub fn into_parts(self) -> Result<(&'static str, Value), serde_json::Error> {
        let name = self.name();
        let value = match self {
            Self::Authenticate(key) | Self::Stop(key) => Value::String(key),
            Self::JobsBulkPut(jobs) => serde_json::to_value(jobs)?,
            Self::JobsGet(worker_id) => Value::from(worker_id),
            Self::SharedGet(key)
            | Self::SharedDelete(key)
            | Self::LockAcquire(key)
            | Self::LockRelease(key)
            | Self::LockStatus(key) => Value::String(key.to_string()),
            Self::SharedSet { bucket, key, value } => {
                serde_json::to_value(SetArgs { bucket, key, value })?
            }
            Self::SharedImport(buckets) => serde_json::to_value(buckets)?,
            Self::LockImport(locks) => serde_json::to_value(locks)?,
            Self::JobsShutdown | Self::SharedList | Self::SharedExport | Self::LockExport => {
                Value::Null
            }
        };
        Ok((name, value))
    }
}

/// Where and how to reach the IPC host. Handed to every child except the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcBootstrap {
    pub address: SocketAddr,
    pub auth_key: String,
}

/// Everything the IPC host reports once its socket is listening.
///
/// The stop key stays with the orchestrator and is never forwarded to other children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBootstrap {
    pub ipc: IpcBootstrap,
    pub stop_key: String,
}

/// Control messages from orchestrator to child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Must be the first message a child receives.
    Init {
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        ipc: Option<IpcBootstrap>,
    },
    /// Only updaters act on this; workers stop through the job queue and the host
    /// through `__stop__`.
    Stop,
}

/// Control messages from child to orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Ready {
        /// Only set by the IPC host.
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<HostBootstrap>,
    },
    Failed {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobFunction;
    use serde_json::json;

    fn key(s: &str) -> SharedKey {
        s.parse().unwrap()
    }

    #[test]
    fn request_serializes() {
        let req = Request {
            id: 42,
            command: JOBS_GET.to_string(),
            args: json!(2),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "id": 42,
          "command": "jobs.get",
          "args": 2
        }
        "#);
    }

    #[test]
    fn ok_response_serializes() {
        let resp = Response {
            id: 42,
            result: Reply::Ok(json!(true)),
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": 42,
          "result": {
            "ok": true
          }
        }
        "#);
    }

    #[test]
    fn error_response_serializes() {
        let resp = Response {
            id: 3,
            result: Reply::Error("not authenticated".to_string()),
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": 3,
          "result": {
            "error": "not authenticated"
          }
        }
        "#);
    }

    #[test]
    fn request_without_args_defaults_to_null() {
        let req: Request = serde_json::from_str(r#"{"id": 1, "command": "shared.list"}"#).unwrap();
        assert_eq!(req.args, Value::Null);
        assert_eq!(
            Command::from_parts(&req.command, req.args).unwrap(),
            Command::SharedList
        );
    }

    #[test]
    fn every_command_survives_the_wire() {
        let commands = vec![
            Command::Authenticate("secret".to_string()),
            Command::Stop("stop-secret".to_string()),
            Command::JobsBulkPut(vec![Job {
                bot_id: "bot".to_string(),
                function: JobFunction::ProcessUpdate,
                metadata: json!({"update_id": 1}),
            }]),
            Command::JobsGet(4),
            Command::JobsShutdown,
            Command::SharedGet(key("bot:counter")),
            Command::SharedSet {
                bucket: key("bot:counter:chat-9"),
                key: "hits".to_string(),
                value: json!(3),
            },
            Command::SharedDelete(key("bot:counter")),
            Command::SharedList,
            Command::SharedExport,
            Command::SharedImport(BTreeMap::from([(key("bot:c"), Map::new())])),
            Command::LockAcquire(key("bot:lock:x")),
            Command::LockRelease(key("bot:lock:x")),
            Command::LockStatus(key("bot:lock:x")),
            Command::LockImport(vec![LockSnapshot {
                id: key("bot:lock:x"),
                held: true,
            }]),
            Command::LockExport,
        ];

        for command in commands {
            let (name, value) = command.clone().into_parts().unwrap();
            let text = serde_json::to_string(&value).unwrap();
            let value: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(Command::from_parts(name, value).unwrap(), command, "{name}");
        }
    }

    #[test]
    fn unknown_command_is_reported_by_name() {
        let err = Command::from_parts("jobs.steal", Value::Null).unwrap_err();
        assert!(matches!(err, CommandError::Unknown(ref name) if name == "jobs.steal"));
    }

    #[test]
    fn bad_arguments_are_reported() {
        let err = Command::from_parts(JOBS_GET, json!("three")).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgs { command: JOBS_GET, .. }));
    }

    #[test]
    fn control_init_serializes() {
        let req = ControlRequest::Init {
            role: Role::Worker { worker_id: 1 },
            ipc: Some(IpcBootstrap {
                address: "127.0.0.1:50123".parse().unwrap(),
                auth_key: "abc".to_string(),
            }),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "init",
          "role": {
            "role": "worker",
            "worker_id": 1
          },
          "ipc": {
            "address": "127.0.0.1:50123",
            "auth_key": "abc"
          }
        }
        "#);
    }

    #[test]
    fn control_ready_without_host_serializes() {
        let resp = ControlResponse::Ready { host: None };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "type": "ready"
        }
        "#);
    }

    #[test]
    fn control_stop_roundtrips() {
        let text = serde_json::to_string(&ControlRequest::Stop).unwrap();
        assert_eq!(text, r#"{"type":"stop"}"#);
        let parsed: ControlRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, ControlRequest::Stop);
    }
}
