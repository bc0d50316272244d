//! Interval timers, sampled by the control loop once per second.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reference to a bot's timer callback, resolved by name in the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub bot_id: String,
    pub name: String,
}

impl TaskRef {
    pub fn new(bot_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            name: name.into(),
        }
    }
}

/// A timer a bot asks to have scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSpec {
    pub name: String,
    pub interval: Duration,
}

impl TimerSpec {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("timer {name} has a zero interval")]
    ZeroInterval { name: String },
    #[error("timer {name} interval is out of range")]
    OutOfRange { name: String },
}

#[derive(Debug, Clone)]
struct Timer {
    interval: TimeDelta,
    last_run: Option<DateTime<Utc>>,
    task: TaskRef,
}

/// Flat list of timers for one bot.
#[derive(Debug, Clone)]
pub struct Scheduler {
    bot_id: String,
    timers: Vec<Timer>,
}

impl Scheduler {
    pub fn new(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            timers: Vec::new(),
        }
    }

    /// Build a scheduler holding every timer in `specs`.
    pub fn with_timers<'a>(
        bot_id: impl Into<String>,
        specs: impl IntoIterator<Item = &'a TimerSpec>,
    ) -> Result<Self, SchedulerError> {
        let mut scheduler = Self::new(bot_id);
        for spec in specs {
            scheduler.add(spec.interval, &spec.name)?;
        }
        Ok(scheduler)
    }

    pub fn add(&mut self, interval: Duration, name: &str) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval {
                name: name.to_string(),
            });
        }
        let interval = TimeDelta::from_std(interval).map_err(|_| SchedulerError::OutOfRange {
            name: name.to_string(),
        })?;
        self.timers.push(Timer {
            interval,
            last_run: None,
            task: TaskRef::new(self.bot_id.clone(), name),
        });
        Ok(())
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Timers due at `now`. Each yielded timer has its `last_run` set to `now`, so
    /// a second call with the same `now` yields nothing.
    pub fn due(&mut self, now: DateTime<Utc>) -> impl Iterator<Item = TaskRef> + '_ {
        self.timers.iter_mut().filter_map(move |timer| {
            let due = timer
                .last_run
                .is_none_or(|last| now - last >= timer.interval);
            if !due {
                return None;
            }
            timer.last_run = Some(now);
            Some(timer.task.clone())
        })
    }
}

/// Admits at most one check per whole wall-clock second.
#[derive(Debug, Default)]
pub struct SecondGate {
    last: Option<i64>,
}

impl SecondGate {
    pub fn admit(&mut self, now: DateTime<Utc>) -> bool {
        let second = now.timestamp();
        if self.last == Some(second) {
            return false;
        }
        self.last = Some(second);
        true
    }
}
