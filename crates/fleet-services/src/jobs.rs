//! Persisted long-running jobs (backups, restores).
//!
//! A job's identity is independent of any session: progress and results are
//! matched by job id, so a job started on one stream can finish on the
//! stream the agent opens after reconnecting.
//!
//! Starting a job that cannot reach its agent schedules a restart with
//! exponential backoff, up to the job's retry budget. An agent-reported
//! failure is restarted the same way. Canceled jobs are never restarted.
//!
//! Log output is kept in memory per job and dropped once the job has been
//! terminal for the configured retention period.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use fleet_core::{
    AgentEvent, AgentId, Dispatch, DispatchError, Job, JobId, JobStatus, JobStore, LogChunk,
    LogStore, NotificationHub, RequestPayload, Topic,
    config::JobConfig,
    message::{JobOutcome, JobProgress, JobResult, StartJobRequest},
    traits::{JobFilter, StorageError},
};
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};

use crate::StopReceiver;

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    /// Time the agent gives the job; 0 means no limit.
    #[serde(default)]
    pub timeout_ms: u64,
    /// Overrides the configured retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Job error.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// What a retry decision did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    Scheduled(Duration),
    Exhausted,
    Skipped,
}

struct JobLogs {
    store: Arc<LogStore>,
    /// When the job became terminal.
    finished_at: Option<Instant>,
}

/// Submits jobs to agents and tracks them to completion.
pub struct JobService {
    dispatch: Arc<dyn Dispatch>,
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
    config: JobConfig,
    logs: Mutex<HashMap<JobId, JobLogs>>,
    // Serializes read-modify-write cycles against the store.
    updates: tokio::sync::Mutex<()>,
    retries: mpsc::UnboundedSender<(Instant, JobId)>,
    retries_rx: Mutex<Option<mpsc::UnboundedReceiver<(Instant, JobId)>>>,
}

impl JobService {
    #[must_use]
    pub fn new(
        dispatch: Arc<dyn Dispatch>,
        store: Arc<dyn JobStore>,
        hub: Arc<NotificationHub>,
        config: JobConfig,
    ) -> Arc<Self> {
        let (retries, retries_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            dispatch,
            store,
            hub,
            config,
            logs: Mutex::new(HashMap::new()),
            updates: tokio::sync::Mutex::new(()),
            retries,
            retries_rx: Mutex::new(Some(retries_rx)),
        })
    }

    fn logs_map(&self) -> MutexGuard<'_, HashMap<JobId, JobLogs>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log store of a known job, created on first use.
    fn open_logs(&self, job_id: JobId) -> Arc<LogStore> {
        let mut logs = self.logs_map();
        let entry = logs.entry(job_id).or_insert_with(|| JobLogs {
            store: Arc::new(LogStore::new(self.config.log_history_bytes)),
            finished_at: None,
        });
        Arc::clone(&entry.store)
    }

    fn existing_logs(&self, job_id: JobId) -> Option<Arc<LogStore>> {
        self.logs_map()
            .get(&job_id)
            .map(|entry| Arc::clone(&entry.store))
    }

    /// End a terminal job's log and start its retention period.
    fn finish_logs(&self, job_id: JobId) {
        if let Some(entry) = self.logs_map().get_mut(&job_id) {
            entry.store.finish();
            entry.finished_at.get_or_insert_with(Instant::now);
        }
    }

    fn sweep_logs(&self) {
        let now = Instant::now();
        let retention = self.config.log_retention();
        let mut logs = self.logs_map();
        let before = logs.len();
        logs.retain(|_, entry| {
            entry
                .finished_at
                .is_none_or(|at| now.duration_since(at) < retention)
        });
        let expired = before - logs.len();
        if expired > 0 {
            tracing::debug!(expired, retained = logs.len(), "Expired job logs");
        }
    }

    /// Persist a job and ask the agent to start it.
    ///
    /// If the agent is unreachable the job stays `Pending` and is restarted
    /// later; the id is still returned.
    ///
    /// # Errors
    ///
    /// Storage failures, or a non-retryable dispatch error (the job is then
    /// marked `Failed`).
    #[tracing::instrument(skip(self, spec), fields(kind = %spec.kind))]
    pub async fn submit(&self, agent_id: &AgentId, spec: JobSpec) -> Result<JobId, JobError> {
        let mut job = Job::new(agent_id.clone(), spec.kind, spec.params);
        job.max_retries = spec.max_retries.unwrap_or(self.config.max_retries);
        job.timeout_ms = spec.timeout_ms;
        self.store.create(&job).await?;
        self.open_logs(job.id);
        tracing::info!(job_id = %job.id, "Job submitted");

        self.start_attempt(&job).await?;
        Ok(job.id)
    }

    /// Current job record.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, or a storage failure.
    pub async fn get(&self, job_id: JobId) -> Result<Job, JobError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    /// List jobs, newest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.store.list(filter).await?)
    }

    /// Retained log chunks of a job.
    #[must_use]
    pub fn logs(&self, job_id: JobId) -> Vec<LogChunk> {
        self.existing_logs(job_id)
            .map(|logs| logs.history())
            .unwrap_or_default()
    }

    /// Log history followed by live chunks, ending with the last chunk.
    ///
    /// Unknown jobs and jobs whose logs expired yield an empty stream.
    #[must_use]
    pub fn follow_logs(&self, job_id: JobId) -> BoxStream<'static, LogChunk> {
        self.existing_logs(job_id)
            .map_or_else(|| futures::stream::empty().boxed(), |logs| logs.follow())
    }

    /// Cancel a job.
    ///
    /// Sends `StopJob` if the agent is connected; otherwise the job is only
    /// marked `Canceled` here. Finished jobs are returned unchanged.
    ///
    /// # Errors
    ///
    /// `NotFound`, storage failures, or the dispatch error if the agent
    /// refused the stop request.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, job_id: JobId) -> Result<Job, JobError> {
        let job = self.get(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        if self.dispatch.is_connected(&job.agent_id) {
            match self
                .dispatch
                .dispatch(
                    &job.agent_id,
                    RequestPayload::StopJob { job_id },
                    self.config.dispatch_timeout(),
                )
                .await
            {
                Ok(_) => tracing::info!(agent_id = %job.agent_id, "Stop request delivered"),
                Err(DispatchError::NotConnected(_) | DispatchError::ConnectionError(_)) => {
                    tracing::info!(agent_id = %job.agent_id, "Agent went away, canceling locally");
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            tracing::info!(agent_id = %job.agent_id, "Agent is not connected, canceling locally");
        }

        let job = self
            .update(job_id, |job| {
                if job.status.is_terminal() {
                    return false;
                }
                job.transition(JobStatus::Canceled);
                true
            })
            .await?;
        if job.status == JobStatus::Canceled {
            self.finish_logs(job_id);
        }
        Ok(job)
    }

    /// Restart scheduled jobs and consume job notifications until `stop` fires.
    #[tracing::instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut stop: StopReceiver) {
        let Some(mut retries) = self
            .retries_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            tracing::error!("Job service is already running");
            return;
        };
        let mut events = self.hub.subscribe(&[Topic::Jobs]);
        let mut queue: BinaryHeap<Reverse<(Instant, JobId)>> = BinaryHeap::new();
        let mut restarts = JoinSet::new();
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next = queue.peek().map(|Reverse((at, _))| *at);
            let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = stop.recv() => break,
                _ = sweep.tick() => self.sweep_logs(),
                Some(entry) = retries.recv() => queue.push(Reverse(entry)),
                () = tokio::time::sleep_until(wake), if next.is_some() => {
                    while let Some(Reverse((at, job_id))) = queue.peek().copied() {
                        if at > Instant::now() {
                            break;
                        }
                        queue.pop();
                        let this = Arc::clone(&self);
                        restarts.spawn(async move { this.restart(job_id).await });
                    }
                }
                Some(notification) = events.recv() => match notification.event {
                    AgentEvent::JobProgress(progress) => self.handle_progress(&notification.agent_id, &progress).await,
                    AgentEvent::JobResult(result) => self.handle_result(&notification.agent_id, result).await,
                    _ => {}
                },
                Some(joined) = restarts.join_next(), if !restarts.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "Job restart task failed");
                    }
                }
            }
        }

        restarts.shutdown().await;
        tracing::debug!(scheduled = queue.len(), "Job service stopped");
    }

    async fn update<F>(&self, job_id: JobId, f: F) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job) -> bool + Send,
    {
        let _guard = self.updates.lock().await;
        let mut job = self
            .store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        if f(&mut job) {
            self.store.update(&job).await?;
        }
        Ok(job)
    }

    async fn start_attempt(&self, job: &Job) -> Result<(), JobError> {
        let request = RequestPayload::StartJob(StartJobRequest {
            job_id: job.id,
            kind: job.kind.clone(),
            params: job.params.clone(),
            timeout_ms: job.timeout_ms,
        });

        match self
            .dispatch
            .dispatch(&job.agent_id, request, self.config.dispatch_timeout())
            .await
        {
            Ok(_) => {
                self.update(job.id, |job| {
                    if job.status != JobStatus::Pending {
                        return false;
                    }
                    job.transition(JobStatus::Running);
                    true
                })
                .await?;
                tracing::info!(job_id = %job.id, agent_id = %job.agent_id, "Job started");
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(job_id = %job.id, error = %err, "Failed to start job");
                self.retry_or_fail(job.id, err.to_string()).await
            }
            Err(err) => {
                tracing::error!(job_id = %job.id, error = %err, "Failed to start job");
                let message = err.to_string();
                self.update(job.id, |job| {
                    if job.status.is_terminal() {
                        return false;
                    }
                    job.error = Some(message);
                    job.transition(JobStatus::Failed);
                    true
                })
                .await?;
                self.finish_logs(job.id);
                Err(err.into())
            }
        }
    }

    /// Schedule a restart if the retry budget allows, otherwise fail the job.
    async fn retry_or_fail(&self, job_id: JobId, error: String) -> Result<(), JobError> {
        let mut decision = RetryDecision::Skipped;
        let backoff = |attempt| self.config.backoff(attempt);
        let job = self
            .update(job_id, |job| {
                if job.status.is_terminal() {
                    return false;
                }
                job.error = Some(error);
                if job.retries < job.max_retries {
                    decision = RetryDecision::Scheduled(backoff(job.retries));
                    job.retries += 1;
                    job.transition(JobStatus::Pending);
                } else {
                    decision = RetryDecision::Exhausted;
                    job.transition(JobStatus::Failed);
                }
                true
            })
            .await?;

        match decision {
            RetryDecision::Scheduled(delay) => {
                tracing::info!(%job_id, retry = job.retries, ?delay, "Restarting job later");
                let _ = self.retries.send((Instant::now() + delay, job_id));
            }
            RetryDecision::Exhausted => {
                tracing::warn!(%job_id, retries = job.retries, "Job retries exhausted");
                self.finish_logs(job_id);
            }
            RetryDecision::Skipped => {}
        }
        Ok(())
    }

    async fn restart(&self, job_id: JobId) {
        let job = match self.get(job_id).await {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(%job_id, error = %err, "Failed to load job for restart");
                return;
            }
        };
        if job.status != JobStatus::Pending {
            tracing::debug!(%job_id, status = ?job.status, "Job no longer pending, not restarting");
            return;
        }
        tracing::debug!(%job_id, retry = job.retries, "Restarting job");
        if let Err(err) = self.start_attempt(&job).await {
            tracing::error!(%job_id, error = %err, "Job restart failed");
        }
    }

    async fn handle_progress(&self, agent_id: &AgentId, progress: &JobProgress) {
        let job_id = progress.job_id;
        let Some(data) = progress.decode_data() else {
            tracing::warn!(%agent_id, %job_id, chunk_id = progress.chunk_id, "Undecodable job log chunk");
            return;
        };
        let logs = match self.existing_logs(job_id) {
            Some(logs) => logs,
            None => match self.store.get(job_id).await {
                Ok(Some(job)) if !job.status.is_terminal() => self.open_logs(job_id),
                Ok(_) => {
                    tracing::debug!(%agent_id, %job_id, "Dropping log chunk for unknown or finished job");
                    return;
                }
                Err(err) => {
                    tracing::error!(%agent_id, %job_id, error = %err, "Failed to load job for log chunk");
                    return;
                }
            },
        };
        logs.push(LogChunk {
            chunk_id: progress.chunk_id,
            data,
            last: progress.done,
        });
    }

    async fn handle_result(&self, agent_id: &AgentId, result: JobResult) {
        let job_id = result.job_id;
        let outcome = match result.outcome {
            JobOutcome::Succeeded { artifact } => {
                self.update(job_id, |job| {
                    if job.status.is_terminal() {
                        return false;
                    }
                    job.artifact = artifact;
                    job.error = None;
                    job.transition(JobStatus::Succeeded);
                    true
                })
                .await
                .map(|job| {
                    tracing::info!(%agent_id, %job_id, "Job succeeded");
                    self.finish_logs(job.id);
                })
            }
            JobOutcome::Failed { message } => {
                tracing::warn!(%agent_id, %job_id, %message, "Job failed on agent");
                self.retry_or_fail(job_id, message).await
            }
        };
        if let Err(err) = outcome {
            tracing::error!(%agent_id, %job_id, error = %err, "Failed to save job result");
        }
    }
}
