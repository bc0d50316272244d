//! botrun: multiprocess execution runtime for chat bots.

mod config;
mod inline;
mod logging;

pub mod bot;
pub mod bridge;
pub mod host;
pub mod ipc;
pub mod jobs;
pub mod orchestrator;
pub mod process;
pub mod scheduler;
pub mod shared;
pub mod updater;
pub mod worker;

pub use bot::{Bot, Bots, Context, FetchError, Update, UpdateFetcher};
pub use config::RunnerConfig;
pub use inline::{InlineKey, InlineSession, InlineSessions};
pub use logging::init_tracing;
pub use orchestrator::{Runner, RunnerError, RunnerHandle, shutdown_signal};
pub use process::run_child_if_requested;
pub use scheduler::{TaskRef, TimerSpec};
pub use shared::{SharedKey, SharedMemory};
pub use updater::UpdaterConfig;
