//! Worker loop: take a job from the host, run it, repeat.

use std::time::Instant;

use crate::bot::{Bots, Context};
use crate::ipc::{IpcClient, IpcError};
use crate::jobs::{Job, JobFunction, JobReply, WorkerId};
use crate::shared::SharedMemory;

pub struct Worker {
    worker_id: WorkerId,
    client: IpcClient,
    bots: Bots,
    cx: Context,
}

impl Worker {
    pub fn new(worker_id: WorkerId, client: IpcClient, bots: Bots, shared: SharedMemory) -> Self {
        Self {
            worker_id,
            client,
            bots,
            cx: Context::new(worker_id, shared),
        }
    }

    /// Run jobs until the queue shuts down. Returns an error only when the host is
    /// gone or answers nonsense.
    pub async fn run(mut self) -> Result<(), IpcError> {
        let worker_id = self.worker_id;
        tracing::info!(worker_id, "Worker started");

        loop {
            let reply = match self.client.jobs_get(worker_id).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Worker lost the IPC host");
                    return Err(e);
                }
            };

            match reply {
                JobReply::Job { job } => self.run_job(job).await,
                JobReply::Stop => break,
            }

            let expired = self.cx.inline.prune(Instant::now());
            if expired > 0 {
                tracing::trace!(worker_id, expired, "Pruned inline sessions");
            }
        }

        tracing::info!(worker_id, "Worker stopped");
        Ok(())
    }

    async fn run_job(&mut self, job: Job) {
        let worker_id = self.worker_id;
        let Some(bot) = self.bots.get(&job.bot_id).cloned() else {
            tracing::warn!(worker_id, bot_id = %job.bot_id, "Job for unknown bot, skipping");
            return;
        };

        let result = match job.function {
            JobFunction::ProcessUpdate => {
                tracing::debug!(worker_id, bot_id = %job.bot_id, "Processing update");
                bot.process(job.metadata, &mut self.cx).await
            }
            JobFunction::ProcessTask => match job.task_ref() {
                Some(task) => {
                    tracing::debug!(worker_id, bot_id = %job.bot_id, task = %task.name, "Running task");
                    bot.run_task(&task, &mut self.cx).await
                }
                None => Err(anyhow::anyhow!("malformed task reference: {}", job.metadata)),
            },
        };

        if let Err(e) = result {
            tracing::error!(worker_id, bot_id = %job.bot_id, error = %format!("{e:#}"), "Job failed");
        }
    }
}
