//! Updater loop: long-poll one bot's updates and submit them as jobs.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::bot::{FetchError, UpdateFetcher};
use crate::ipc::{IpcClient, IpcError};
use crate::jobs::Job;

/// Poll timeout while waiting for a competing instance to go away.
pub const RECOVERY_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLEAN_CHECKS: u32 = 4;
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Where fetched updates go.
#[async_trait]
pub trait JobSink: Send {
    async fn submit(&mut self, jobs: Vec<Job>) -> Result<(), IpcError>;
}

#[async_trait]
impl JobSink for IpcClient {
    async fn submit(&mut self, jobs: Vec<Job>) -> Result<(), IpcError> {
        self.jobs_bulk_put(jobs).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterConfig {
    pub fetch_timeout: Duration,
    /// Consecutive clean polls needed to leave conflict recovery.
    pub clean_checks: u32,
    /// Pause after an upstream error.
    pub error_backoff: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            clean_checks: DEFAULT_CLEAN_CHECKS,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Enough clean polls in a row; resume normal fetching.
    Alone,
    /// Stopped while still recovering.
    NotAlone,
}

pub struct Updater<S> {
    bot_id: String,
    fetcher: Box<dyn UpdateFetcher>,
    sink: S,
    stop: watch::Receiver<bool>,
    config: UpdaterConfig,
}

impl<S: JobSink> Updater<S> {
    pub fn new(
        bot_id: impl Into<String>,
        fetcher: Box<dyn UpdateFetcher>,
        sink: S,
        stop: watch::Receiver<bool>,
        config: UpdaterConfig,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            fetcher,
            sink,
            stop,
            config,
        }
    }

    /// A dropped stop sender counts as a stop.
    fn stopped(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    /// Fetch and submit until stopped. An in-flight fetch is finished and its
    /// updates submitted before the stop is noticed.
    pub async fn run(mut self) -> Result<(), IpcError> {
        tracing::info!(bot_id = %self.bot_id, "Updater started");

        while !self.stopped() {
            match self.fetcher.fetch(self.config.fetch_timeout).await {
                Ok(updates) if updates.is_empty() => {}
                Ok(updates) => {
                    let count = updates.len();
                    let bot_id = self.bot_id.as_str();
                    let jobs = updates
                        .into_iter()
                        .map(|update| Job::update(bot_id, update))
                        .collect();
                    match self.sink.submit(jobs).await {
                        Ok(()) => tracing::debug!(bot_id, count, "Submitted updates"),
                        Err(IpcError::ServerCrashed) => {
                            tracing::error!(bot_id, "IPC server crashed, updater stopping");
                            return Err(IpcError::ServerCrashed);
                        }
                        Err(e) => {
                            tracing::error!(bot_id, count, error = %e, "Failed to submit updates");
                        }
                    }
                }
                Err(FetchError::Conflict) => {
                    if self.block_until_alone().await == Recovery::NotAlone {
                        break;
                    }
                }
                Err(FetchError::Upstream(e)) => {
                    tracing::warn!(bot_id = %self.bot_id, error = %e, "Fetching updates failed");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        tracing::info!(bot_id = %self.bot_id, "Updater stopped");
        Ok(())
    }

    /// Poll with a short timeout until `clean_checks` polls in a row come back with
    /// neither a conflict nor an error nor updates.
    ///
    /// A conflict resets the streak. Updates are dropped (the fetcher has already
    /// moved past them) and leave the streak as it was; so do upstream errors.
    pub async fn block_until_alone(&mut self) -> Recovery {
        tracing::warn!(
            bot_id = %self.bot_id,
            "Another instance is fetching updates for this bot, waiting for it to go away"
        );
        let mut streak = 0;
        while streak < self.config.clean_checks {
            if self.stopped() {
                tracing::info!(bot_id = %self.bot_id, streak, "Stopped during conflict recovery");
                return Recovery::NotAlone;
            }
            match self.fetcher.fetch(RECOVERY_POLL_TIMEOUT).await {
                Ok(updates) if updates.is_empty() => streak += 1,
                Ok(updates) => {
                    tracing::debug!(
                        bot_id = %self.bot_id,
                        count = updates.len(),
                        "Discarding updates received during conflict recovery"
                    );
                }
                Err(FetchError::Conflict) => {
                    if streak > 0 {
                        tracing::debug!(bot_id = %self.bot_id, streak, "Conflict again, streak reset");
                    }
                    streak = 0;
                }
                Err(FetchError::Upstream(e)) => {
                    tracing::debug!(bot_id = %self.bot_id, error = %e, "Upstream error during conflict recovery");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }
        tracing::info!(bot_id = %self.bot_id, "Conflict cleared, resuming");
        Recovery::Alone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::Update;
    use crate::bot::testing::{ScriptedFetcher, Step};
    use serde_json::json;

    /// Collects submissions; optionally stops the updater after the first one.
    struct Collect {
        jobs: std::sync::Arc<std::sync::Mutex<Vec<Job>>>,
        stop_after_submit: Option<watch::Sender<bool>>,
        fail_with_crash: bool,
    }

    #[async_trait]
    impl JobSink for Collect {
        async fn submit(&mut self, jobs: Vec<Job>) -> Result<(), IpcError> {
            if self.fail_with_crash {
                return Err(IpcError::ServerCrashed);
            }
            self.jobs.lock().unwrap().extend(jobs);
            if let Some(stop) = &self.stop_after_submit {
                let _ = stop.send(true);
            }
            Ok(())
        }
    }

    fn config() -> UpdaterConfig {
        UpdaterConfig {
            fetch_timeout: Duration::from_secs(30),
            clean_checks: 4,
            error_backoff: Duration::from_millis(1),
        }
    }

    fn updates(ids: &[u64]) -> Step {
        Step::Updates(ids.iter().map(|id| json!({"update_id": id})).collect::<Vec<Update>>())
    }

    fn empty() -> Step {
        Step::Updates(Vec::new())
    }

    #[tokio::test]
    async fn conflict_recovery_resets_on_conflict_and_ignores_updates() {
        let fetcher = ScriptedFetcher::new(vec![
            Step::Conflict,
            // Recovery polls.
            empty(),
            Step::Conflict,
            empty(),
            updates(&[100]),
            Step::Upstream,
            empty(),
            empty(),
            empty(),
            // Back to normal.
            updates(&[1, 2]),
        ]);
        let timeouts = fetcher.timeouts.clone();

        let (stop_tx, stop_rx) = watch::channel(false);
        let collected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Collect {
            jobs: collected.clone(),
            stop_after_submit: Some(stop_tx),
            fail_with_crash: false,
        };

        Updater::new("bot", Box::new(fetcher), sink, stop_rx, config())
            .run()
            .await
            .unwrap();

        let ids: Vec<u64> = collected
            .lock()
            .unwrap()
            .iter()
            .map(|job| job.metadata["update_id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);

        let timeouts = timeouts.lock().unwrap().clone();
        let secs: Vec<u64> = timeouts.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![30, 1, 1, 1, 1, 1, 1, 1, 1, 30]);
    }

    #[tokio::test]
    async fn stop_abandons_recovery() {
        let fetcher = ScriptedFetcher::new((0..10_000).map(|_| Step::Conflict).collect());
        let started = fetcher.started.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let sink = Collect {
            jobs: Default::default(),
            stop_after_submit: None,
            fail_with_crash: false,
        };

        let updater = tokio::spawn(
            Updater::new("bot", Box::new(fetcher), sink, stop_rx, config()).run(),
        );
        for _ in 0..3 {
            started.notified().await;
        }
        stop_tx.send(true).unwrap();
        updater.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn recovery_with_stop_already_set_does_not_poll() {
        let fetcher = ScriptedFetcher::new(Vec::new());
        let timeouts = fetcher.timeouts.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();
        let sink = Collect {
            jobs: Default::default(),
            stop_after_submit: None,
            fail_with_crash: false,
        };

        let mut updater = Updater::new("bot", Box::new(fetcher), sink, stop_rx, config());
        assert_eq!(updater.block_until_alone().await, Recovery::NotAlone);
        assert!(timeouts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_errors_are_skipped() {
        let fetcher = ScriptedFetcher::new(vec![Step::Upstream, Step::Upstream, updates(&[7])]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let collected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Collect {
            jobs: collected.clone(),
            stop_after_submit: Some(stop_tx),
            fail_with_crash: false,
        };

        Updater::new("bot", Box::new(fetcher), sink, stop_rx, config())
            .run()
            .await
            .unwrap();
        assert_eq!(collected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn server_crash_stops_the_updater() {
        let fetcher = ScriptedFetcher::new(vec![updates(&[1])]);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let sink = Collect {
            jobs: Default::default(),
            stop_after_submit: None,
            fail_with_crash: true,
        };

        let err = Updater::new("bot", Box::new(fetcher), sink, stop_rx, config())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::ServerCrashed));
    }

    #[tokio::test]
    async fn dropped_stop_sender_stops() {
        let fetcher = ScriptedFetcher::new(Vec::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);
        let sink = Collect {
            jobs: Default::default(),
            stop_after_submit: None,
            fail_with_crash: false,
        };
        Updater::new("bot", Box::new(fetcher), sink, stop_rx, config())
            .run()
            .await
            .unwrap();
    }
}
