//! Job queue with sticky routing for inline queries.
//!
//! The queue is a plain state machine: it never touches sockets. Waiting consumers are
//! opaque handles of type `W` (an IPC responder on the host, anything in tests), and
//! hand-offs go through a `deliver` callback supplied by the caller. A delivery that
//! fails hands the job back so it can go to another worker or back on the queue.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inline::InlineKey;
use crate::scheduler::TaskRef;

/// Index of a worker in the pool, `0..worker_count`.
pub type WorkerId = usize;

/// The closed set of handlers a job can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFunction {
    ProcessUpdate,
    ProcessTask,
}

/// One unit of dispatchable work addressed to a bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub bot_id: String,
    pub function: JobFunction,
    pub metadata: Value,
}

impl Job {
    pub fn update(bot_id: impl Into<String>, update: Value) -> Self {
        Self {
            bot_id: bot_id.into(),
            function: JobFunction::ProcessUpdate,
            metadata: update,
        }
    }

    pub fn task(task: &TaskRef) -> Self {
        Self {
            bot_id: task.bot_id.clone(),
            function: JobFunction::ProcessTask,
            metadata: serde_json::json!({
                "bot_id": task.bot_id,
                "name": task.name,
            }),
        }
    }

    /// The timer this job fires, for `process_task` jobs.
    pub fn task_ref(&self) -> Option<TaskRef> {
        if self.function != JobFunction::ProcessTask {
            return None;
        }
        serde_json::from_value(self.metadata.clone()).ok()
    }

    /// Routing key when this job is an inline query update.
    pub fn inline_key(&self) -> Option<InlineKey> {
        if self.function != JobFunction::ProcessUpdate {
            return None;
        }
        InlineKey::from_update(&self.metadata)
    }

    /// The only worker allowed to run this job, if it is pinned.
    pub fn pinned_worker(&self, worker_count: usize) -> Option<WorkerId> {
        self.inline_key().map(|key| key.target(worker_count))
    }
}

/// Reply to `jobs.get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobReply {
    Job { job: Job },
    /// The queue is shut down and holds nothing more for this worker.
    Stop,
}

impl JobReply {
    pub fn into_job(self) -> Option<Job> {
        match self {
            Self::Job { job } => Some(job),
            Self::Stop => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobQueueError {
    #[error("job queue is shut down")]
    Closed,
}

/// FIFO job queue with deferred consumers.
#[derive(Debug)]
pub struct JobQueue<W> {
    jobs: VecDeque<Job>,
    /// Consumers blocked in `get`, in arrival order.
    waiting: Vec<(WorkerId, W)>,
    seen: BTreeSet<WorkerId>,
    worker_count: usize,
    closed: bool,
}

impl<W> JobQueue<W> {
    pub fn new(worker_count: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            waiting: Vec::new(),
            seen: BTreeSet::new(),
            worker_count: worker_count.max(1),
            closed: false,
        }
    }

    /// Submit a batch, applied in order.
    ///
    /// Each job is handed to an eligible waiting worker if there is one, otherwise
    /// queued. `deliver` returns the job back when the waiter is gone.
    pub fn bulk_put<F>(&mut self, jobs: Vec<Job>, mut deliver: F) -> Result<(), JobQueueError>
    where
        F: FnMut(W, Job) -> Result<(), Job>,
    {
        if self.closed {
            return Err(JobQueueError::Closed);
        }

        for mut job in jobs {
            loop {
                let pinned = job.pinned_worker(self.worker_count);
                let slot = match pinned {
                    Some(target) => self.waiting.iter().position(|(id, _)| *id == target),
                    None if self.waiting.is_empty() => None,
                    None => Some(0),
                };

                let Some(index) = slot else {
                    if let Some(target) = pinned
                        && !self.seen.contains(&target)
                    {
                        tracing::debug!(
                            target_worker = target,
                            "Inline job queued for a worker that has not asked yet"
                        );
                    }
                    self.jobs.push_back(job);
                    break;
                };

                let (worker_id, waiter) = self.waiting.remove(index);
                match deliver(waiter, job) {
                    Ok(()) => {
                        tracing::trace!(worker_id, "Job handed off to waiting worker");
                        break;
                    }
                    Err(returned) => {
                        tracing::warn!(worker_id, "Waiting worker is gone, rerouting job");
                        job = returned;
                    }
                }
            }
        }
        Ok(())
    }

    /// Ask for the next job on behalf of `worker_id`.
    ///
    /// Returns the waiter together with its reply when one is available right away,
    /// `None` when the reply is deferred until a later `bulk_put` or `shutdown`.
    pub fn get(&mut self, worker_id: WorkerId, waiter: W) -> Option<(W, JobReply)> {
        self.seen.insert(worker_id);

        let worker_count = self.worker_count;
        let position = self.jobs.iter().position(|job| {
            job.pinned_worker(worker_count)
                .is_none_or(|target| target == worker_id)
        });
        if let Some(job) = position.and_then(|index| self.jobs.remove(index)) {
            return Some((waiter, JobReply::Job { job }));
        }

        if self.closed {
            return Some((waiter, JobReply::Stop));
        }

        // A worker only ever has one outstanding get; a newer one supersedes.
        self.waiting.retain(|(id, _)| *id != worker_id);
        self.waiting.push((worker_id, waiter));
        None
    }

    /// Close the queue to submissions and release every waiting worker.
    ///
    /// Jobs already queued stay retrievable through `get` until drained.
    pub fn shutdown<F>(&mut self, mut stop: F)
    where
        F: FnMut(W),
    {
        self.closed = true;
        for (worker_id, waiter) in self.waiting.drain(..) {
            tracing::debug!(worker_id, "Releasing waiting worker");
            stop(waiter);
        }
    }

    /// Drop waiters that no longer have anyone listening.
    pub fn retain_waiters<F>(&mut self, mut keep: F)
    where
        F: FnMut(&W) -> bool,
    {
        self.waiting.retain(|(_, waiter)| keep(waiter));
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn seen_workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.seen.iter().copied()
    }
}
