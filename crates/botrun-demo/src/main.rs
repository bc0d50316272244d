//! A self-contained bot on the multiprocess runtime.
//!
//! The fetcher invents an update every few seconds, and a heartbeat timer bumps a
//! counter in shared memory under a lock. Run with `BOTRUN_LOG=debug` to watch the
//! job flow between processes; Ctrl+C shuts everything down in order.

use std::time::Duration;

use async_trait::async_trait;
use botrun::{
    Bot, Bots, Context, FetchError, Runner, RunnerConfig, SharedKey, TaskRef, TimerSpec, Update,
    UpdateFetcher,
};
use serde_json::json;

const BOT_ID: &str = "demo";
const HEARTBEAT: &str = "heartbeat";
const UPDATE_EVERY: Duration = Duration::from_secs(3);

struct SyntheticFetcher {
    next_id: u64,
}

#[async_trait]
impl UpdateFetcher for SyntheticFetcher {
    async fn fetch(&mut self, timeout: Duration) -> Result<Vec<Update>, FetchError> {
        // Short recovery polls come back empty, like a quiet chat.
        if timeout < UPDATE_EVERY {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        }
        tokio::time::sleep(UPDATE_EVERY).await;
        self.next_id += 1;
        Ok(vec![json!({
            "update_id": self.next_id,
            "message": {"chat": {"id": 1}, "text": format!("hello #{}", self.next_id)},
        })])
    }
}

struct DemoBot;

impl DemoBot {
    fn counter() -> SharedKey {
        SharedKey::new(BOT_ID, "stats")
    }
}

#[async_trait]
impl Bot for DemoBot {
    fn id(&self) -> &str {
        BOT_ID
    }

    fn timers(&self) -> Vec<TimerSpec> {
        vec![TimerSpec::new(HEARTBEAT, Duration::from_secs(5))]
    }

    async fn process(&self, update: Update, cx: &mut Context) -> anyhow::Result<()> {
        let text = update["message"]["text"].as_str().unwrap_or_default();
        tracing::info!(worker_id = cx.worker_id, text, "Got message");
        Ok(())
    }

    async fn run_task(&self, task: &TaskRef, cx: &mut Context) -> anyhow::Result<()> {
        if task.name != HEARTBEAT {
            anyhow::bail!("unknown task {}", task.name);
        }
        let key = Self::counter();
        let shared = cx.shared.clone();
        let beats = shared
            .with_lock(&key, || async {
                let beats = shared
                    .get(&key, "beats")
                    .await?
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
                    + 1;
                shared.set(&key, "beats", json!(beats)).await?;
                anyhow::Ok(beats)
            })
            .await??;
        tracing::info!(worker_id = cx.worker_id, beats, "Heartbeat");
        Ok(())
    }

    fn fetcher(&self) -> Box<dyn UpdateFetcher> {
        Box::new(SyntheticFetcher { next_id: 0 })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    botrun::init_tracing();

    let bots = Bots::new().with(DemoBot);
    if let Some(result) = botrun::run_child_if_requested(&bots).await {
        return result;
    }

    let config = RunnerConfig::from_env();
    tracing::info!(?config, "Starting demo");
    Runner::new(config, bots).run().await?;
    Ok(())
}
