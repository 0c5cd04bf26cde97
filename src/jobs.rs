use crate::{models::ApiError, pipeline::Pipeline};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<Statuses>>,
}

/// Job states by id. Only the most recent `history` finished jobs are
/// kept; the scheduler enqueues sweeps for the life of the process.
struct Statuses {
    states: HashMap<Uuid, JobState>,
    finished: VecDeque<Uuid>,
    history: usize,
}

impl Statuses {
    fn new(history: usize) -> Self {
        Self {
            states: HashMap::new(),
            finished: VecDeque::new(),
            history,
        }
    }

    fn set(&mut self, id: Uuid, state: JobState) {
        let done = matches!(state, JobState::Completed { .. } | JobState::Failed { .. });
        self.states.insert(id, state);
        if done {
            self.finished.push_back(id);
            while self.finished.len() > self.history {
                if let Some(oldest) = self.finished.pop_front() {
                    self.states.remove(&oldest);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Advance { inspection_id: String },
    AdvanceOpen,
    RefreshTokens,
}

impl JobKind {
    fn label(&self) -> &'static str {
        match self {
            JobKind::Advance { .. } => "advance",
            JobKind::AdvanceOpen => "advance_open",
            JobKind::RefreshTokens => "refresh_tokens",
        }
    }
}

struct Job {
    id: Uuid,
    kind: JobKind,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: Value },
    Failed { error: String, stage: Option<String> },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    /// Starts the worker. It drains jobs one at a time until `cancel` fires.
    pub fn spawn(pipeline: Pipeline, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        Self::spawn_with_history(pipeline, cancel, job_history_from_env())
    }

    fn spawn_with_history(
        pipeline: Pipeline,
        cancel: CancellationToken,
        history: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(Statuses::new(history)));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.set(job.id, JobState::Running);
                }

                let state = run(&pipeline, &job.kind, &cancel).await;
                if let JobState::Failed { error, stage } = &state {
                    warn!(target = "vinrelay.jobs", job_id = %job.id, kind = job.kind.label(), stage = ?stage, error = %error, "job_failed");
                } else {
                    info!(target = "vinrelay.jobs", job_id = %job.id, kind = job.kind.label(), "job_completed");
                }
                let mut guard = statuses_bg.lock().await;
                guard.set(job.id, state);
            }
            info!(target = "vinrelay.jobs", "job_worker_stopped");
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue(&self, kind: JobKind) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.set(id, JobState::Queued);
        }
        let label = kind.label();
        if self.tx.send(Job { id, kind }).await.is_err() {
            self.statuses.lock().await.states.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        info!(target = "vinrelay.jobs", job_id = %id, kind = label, "job_enqueued");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.states.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

async fn run(pipeline: &Pipeline, kind: &JobKind, cancel: &CancellationToken) -> JobState {
    let result = match kind {
        JobKind::Advance { inspection_id } => pipeline
            .advance(inspection_id, cancel)
            .await
            .map(|outcome| serde_json::to_value(outcome).unwrap_or(Value::Null)),
        JobKind::AdvanceOpen => pipeline
            .advance_all_open(cancel)
            .await
            .map(|summary| serde_json::to_value(summary).unwrap_or(Value::Null)),
        JobKind::RefreshTokens => pipeline
            .refresh_tokens()
            .await
            .map(|summary| serde_json::to_value(summary).unwrap_or(Value::Null)),
    };
    match result {
        Ok(result) => JobState::Completed { result },
        Err(err) => JobState::Failed {
            error: err.detail().to_string(),
            stage: Some(err.stage().to_string()),
        },
    }
}

/// Enqueues a sweep every `interval` until `cancel` fires. The first tick
/// is skipped so startup does not race the HTTP listener.
pub fn spawn_scheduler(
    queue: JobQueue,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = queue.enqueue(JobKind::AdvanceOpen).await {
                        warn!(target = "vinrelay.jobs", error = %err.error, "scheduled_sweep_not_enqueued");
                    }
                }
            }
        }
        info!(target = "vinrelay.jobs", "scheduler_stopped");
    })
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

fn job_history_from_env() -> usize {
    std::env::var("JOB_HISTORY_LIMIT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256)
}

pub fn scheduler_interval_from_env() -> Duration {
    Duration::from_secs(crate::http::env_secs("SCHEDULER_INTERVAL_SECS", 300).max(1))
}
