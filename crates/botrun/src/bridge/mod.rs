//! Wire formats shared by every botrun process.
//!
//! # Architecture
//!
//! - **protocol**: IPC commands and replies, plus the control messages the runner
//!   exchanges with its children over stdin/stdout
//! - **codec**: length-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
