//! Typed per-worker job queues with cooldown and performance tracking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{
    COOLDOWN_BASE, COOLDOWN_MAX, COOLDOWN_MAX_EXPONENT, JOB_TIME_EWMA_DECAY,
};
use crate::error::JobError;

/// Geometric cooldown with ±10% jitter, capped both in exponent and in
/// absolute duration.
#[must_use]
pub fn cooldown_duration(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(COOLDOWN_MAX_EXPONENT);
    let base = COOLDOWN_BASE.as_secs_f64() * (1u64 << exponent) as f64;
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(base * jitter).min(COOLDOWN_MAX)
}

/// Exponentially weighted average of job execution times.
#[derive(Clone, Copy, Debug, Default)]
pub struct JobTimeEstimate {
    avg_secs: f64,
    seeded: bool,
}

impl JobTimeEstimate {
    /// Initialize the average; used once the first price table round trip
    /// gives a lower bound on host latency.
    pub fn seed(&mut self, duration: Duration) {
        if !self.seeded {
            self.avg_secs = duration.as_secs_f64();
            self.seeded = true;
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if !self.seeded {
            self.seed(duration);
            return;
        }
        self.avg_secs = self.avg_secs * JOB_TIME_EWMA_DECAY
            + duration.as_secs_f64() * (1.0 - JOB_TIME_EWMA_DECAY);
    }

    #[must_use]
    pub fn estimate(&self) -> Duration {
        Duration::from_secs_f64(self.avg_secs)
    }

    #[must_use]
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }
}

/// A job that can sit on a queue. Discarding consumes the job so its
/// response channel always hears about the outcome.
pub trait QueueJob: Send + 'static {
    fn discard(self, err: JobError);
    /// Expected (upload, download) bytes, reserved before execution.
    fn expected_bandwidth(&self) -> (u64, u64);
}

/// Snapshot of a queue for diagnostics.
#[derive(Clone, Debug)]
pub struct QueueStatus {
    pub kind: &'static str,
    pub queued: usize,
    pub on_cooldown: bool,
    pub consecutive_failures: u32,
    pub recent_err: Option<String>,
    pub job_time_estimate: Duration,
}

struct QueueInner<J> {
    jobs: VecDeque<J>,
    killed: bool,
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
    recent_err: Option<String>,
    estimate: JobTimeEstimate,
}

/// FIFO of jobs of one kind for one worker.
pub struct JobQueue<J: QueueJob> {
    kind: &'static str,
    inner: Mutex<QueueInner<J>>,
    wake: Arc<Notify>,
}

impl<J: QueueJob> JobQueue<J> {
    #[must_use]
    pub fn new(kind: &'static str, wake: Arc<Notify>) -> Self {
        Self {
            kind,
            inner: Mutex::new(QueueInner {
                jobs: VecDeque::new(),
                killed: false,
                cooldown_until: None,
                consecutive_failures: 0,
                recent_err: None,
                estimate: JobTimeEstimate::default(),
            }),
            wake,
        }
    }

    /// Append a job and wake the worker. A job offered to a killed queue is
    /// discarded; a queue on cooldown rejects the job. Either way the job's
    /// response channel hears the reason and `false` comes back.
    pub fn add(&self, job: J) -> bool {
        let now = Instant::now();
        {
            let mut inner = self.inner.lock();
            if inner.killed {
                drop(inner);
                job.discard(JobError::Discarded);
                return false;
            }
            if let Some(until) = inner.cooldown_until {
                if now < until {
                    drop(inner);
                    job.discard(JobError::OnCooldown);
                    return false;
                }
            }
            inner.jobs.push_back(job);
        }
        self.wake.notify_one();
        true
    }

    /// Take the next job if the queue is live and not cooling down.
    pub fn pop(&self) -> Option<J> {
        let mut inner = self.inner.lock();
        if inner.killed {
            return None;
        }
        if let Some(until) = inner.cooldown_until {
            if Instant::now() < until {
                return None;
            }
        }
        inner.jobs.pop_front()
    }

    /// Kill the queue and discard everything on it.
    pub fn kill(&self) {
        let drained: Vec<J> = {
            let mut inner = self.inner.lock();
            inner.killed = true;
            inner.jobs.drain(..).collect()
        };
        for job in drained {
            job.discard(JobError::Discarded);
        }
    }

    /// First success after any failure clears the cooldown state.
    pub fn report_success(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.cooldown_until = None;
        inner.recent_err = None;
        inner.estimate.record(duration);
    }

    pub fn report_failure(&self, err: &JobError) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.recent_err = Some(err.to_string());
        inner.cooldown_until =
            Some(Instant::now() + cooldown_duration(inner.consecutive_failures));
    }

    pub fn seed_estimate(&self, duration: Duration) {
        self.inner.lock().estimate.seed(duration);
    }

    #[must_use]
    pub fn is_on_cooldown(&self) -> bool {
        let inner = self.inner.lock();
        match inner.cooldown_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn status(&self) -> QueueStatus {
        let inner = self.inner.lock();
        QueueStatus {
            kind: self.kind,
            queued: inner.jobs.len(),
            on_cooldown: inner
                .cooldown_until
                .is_some_and(|until| Instant::now() < until),
            consecutive_failures: inner.consecutive_failures,
            recent_err: inner.recent_err.clone(),
            job_time_estimate: inner.estimate.estimate(),
        }
    }
}
