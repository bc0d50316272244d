//! The interface bot implementations provide to the runtime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::inline::InlineSessions;
use crate::jobs::WorkerId;
use crate::scheduler::{TaskRef, TimerSpec};
use crate::shared::SharedMemory;

/// An update from the messaging API. The runtime never looks inside except to
/// find inline query routing keys.
pub type Update = Value;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Another process is polling the same bot.
    #[error("another instance is fetching updates for this bot")]
    Conflict,
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Long-polls the messaging API for one bot. Lives in that bot's updater process.
#[async_trait]
pub trait UpdateFetcher: Send {
    /// Wait up to `timeout` for new updates. An empty batch is a clean poll.
    async fn fetch(&mut self, timeout: Duration) -> Result<Vec<Update>, FetchError>;
}

/// What a bot sees while running inside a worker.
#[derive(Debug)]
pub struct Context {
    pub worker_id: WorkerId,
    pub shared: SharedMemory,
    pub inline: InlineSessions,
}

impl Context {
    pub fn new(worker_id: WorkerId, shared: SharedMemory) -> Self {
        Self {
            worker_id,
            shared,
            inline: InlineSessions::default(),
        }
    }
}

#[async_trait]
pub trait Bot: Send + Sync {
    fn id(&self) -> &str;

    /// Timers to schedule for this bot.
    fn timers(&self) -> Vec<TimerSpec> {
        Vec::new()
    }

    async fn process(&self, update: Update, cx: &mut Context) -> anyhow::Result<()>;

    async fn run_task(&self, task: &TaskRef, cx: &mut Context) -> anyhow::Result<()> {
        let _ = cx;
        anyhow::bail!("bot {} has no task named {}", self.id(), task.name)
    }

    /// A fresh fetcher, created inside the updater process.
    fn fetcher(&self) -> Box<dyn UpdateFetcher>;
}

/// Registry of bots by id. Every process builds the same registry.
#[derive(Clone, Default)]
pub struct Bots {
    bots: BTreeMap<String, Arc<dyn Bot>>,
}

impl std::fmt::Debug for Bots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.bots.keys()).finish()
    }
}

impl Bots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, bot: impl Bot + 'static) -> Self {
        self.insert(Arc::new(bot));
        self
    }

    pub fn insert(&mut self, bot: Arc<dyn Bot>) {
        let id = bot.id().to_string();
        if self.bots.insert(id.clone(), bot).is_some() {
            tracing::warn!(bot_id = %id, "Bot registered twice, keeping the last one");
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Bot>> {
        self.bots.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Bot>> {
        self.bots.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.bots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }
}
