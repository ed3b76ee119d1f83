//! The task registry: background download jobs keyed by an opaque UUID.
//!
//! `submit` spawns a worker through the bounded queue and returns
//! immediately; consumers poll `progress`/`result` by id. A task is
//! mutated only by its worker (and the progress sink it hands to the
//! orchestrator); the registry holds one mutex per task for snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::AdapterSet;
use crate::app::model::{DownloadTask, TaskState};
use crate::app::queue::WorkerQueue;
use crate::assemble::{Assembler, OutputFormat, verify_artifact};
use crate::config::Config;
use crate::download::{Orchestrator, ProgressSink};
use crate::error::{Error, Result};
use crate::toc;

pub struct TaskSlot {
    task: Mutex<DownloadTask>,
    cancel: CancellationToken,
    done: Notify,
}

impl TaskSlot {
    fn new(task: DownloadTask) -> Self {
        Self {
            task: Mutex::new(task),
            cancel: CancellationToken::new(),
            done: Notify::new(),
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, DownloadTask> {
        // A poisoned task mutex still holds a usable snapshot.
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> DownloadTask {
        self.lock_task().clone()
    }
}

impl ProgressSink for TaskSlot {
    fn on_chapter(&self, completed: u32, failed: u32, current_title: &str) {
        let mut task = self.lock_task();
        // Counters only move forward; a late-arriving update never
        // regresses the snapshot.
        task.completed_chapters = task.completed_chapters.max(completed);
        task.failed_chapters = task.failed_chapters.max(failed);
        task.current_chapter_title = Some(current_title.to_string());
    }
}

/// What `result(task_id)` found.
pub enum TaskPoll {
    Ready(ArtifactHandle),
    Running(DownloadTask),
    Failed { reason: String },
    NotFound,
}

pub struct ArtifactHandle {
    pub path: PathBuf,
    pub file_size: u64,
    pub filename: String,
    pub content_type: &'static str,
    pub task: DownloadTask,
}

pub struct TaskRegistry {
    tasks: RwLock<HashMap<Uuid, Arc<TaskSlot>>>,
    queue: WorkerQueue,
    adapters: Arc<AdapterSet>,
    orchestrator: Orchestrator,
    assembler: Assembler,
    config: Arc<Config>,
}

impl TaskRegistry {
    pub fn new(adapters: Arc<AdapterSet>, config: Arc<Config>, worker_concurrency: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            queue: WorkerQueue::new(worker_concurrency),
            adapters,
            orchestrator: Orchestrator::new(Arc::clone(&config)),
            assembler: Assembler::new(config.download_dir.clone()),
            config,
        }
    }

    fn tasks_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<TaskSlot>>> {
        self.tasks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<TaskSlot>>> {
        self.tasks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, task_id: Uuid) -> Option<Arc<TaskSlot>> {
        self.tasks_read().get(&task_id).cloned()
    }

    /// Start a background download; returns the task id right away.
    pub fn submit(
        self: &Arc<Self>,
        detail_url: &str,
        source_id: u32,
        format: OutputFormat,
    ) -> Result<Uuid> {
        // Unknown sources fail at submit, not inside the worker.
        self.adapters.get(source_id)?;

        let task_id = Uuid::new_v4();
        let slot = Arc::new(TaskSlot::new(DownloadTask::new(
            task_id,
            detail_url.to_string(),
            source_id,
            format,
        )));
        self.tasks_write().insert(task_id, Arc::clone(&slot));

        let registry = Arc::clone(self);
        self.queue.spawn(async move {
            registry.run_task(slot).await;
        });

        tracing::info!(task = %task_id, source = source_id, url = detail_url, "download task submitted");
        Ok(task_id)
    }

    async fn run_task(self: Arc<Self>, slot: Arc<TaskSlot>) {
        let (detail_url, source_id, format) = {
            let task = slot.lock_task();
            (task.detail_url.clone(), task.source_id, task.format)
        };

        let outcome = self
            .run_pipeline(&slot, &detail_url, source_id, format)
            .await;

        {
            let mut task = slot.lock_task();
            match outcome {
                Ok(artifact_path) => {
                    task.artifact_path = Some(artifact_path);
                    task.current_chapter_title = None;
                    task.advance(TaskState::Ready);
                    tracing::info!(task = %task.task_id, completed = task.completed_chapters, failed = task.failed_chapters, "download task ready");
                }
                Err(err) => {
                    let reason = if slot.cancel.is_cancelled() {
                        "cancelled".to_string()
                    } else {
                        err.to_string()
                    };
                    tracing::warn!(task = %task.task_id, %reason, "download task failed");
                    task.fail(reason);
                }
            }
        }
        slot.done.notify_waiters();
    }

    async fn run_pipeline(
        &self,
        slot: &Arc<TaskSlot>,
        detail_url: &str,
        source_id: u32,
        format: OutputFormat,
    ) -> Result<PathBuf> {
        let adapter = self.adapters.get(source_id)?;

        slot.lock_task().advance(TaskState::FetchingMeta);
        let detail = adapter.detail(detail_url).await?;
        let raw_toc = adapter.toc(detail_url).await?;
        let chapters = toc::normalize(raw_toc);
        if chapters.is_empty() {
            return Err(Error::parse("toc has no valid chapters"));
        }

        {
            let mut task = slot.lock_task();
            task.total_chapters = chapters.len() as u32;
            task.advance(TaskState::FetchingChapters);
        }

        let sink: Arc<dyn ProgressSink> = Arc::clone(slot) as Arc<dyn ProgressSink>;
        let outcome = self
            .orchestrator
            .download_chapters(adapter, &chapters, sink, &slot.cancel)
            .await?;
        if outcome.failure_is_fatal() {
            return Err(Error::internal(format!(
                "{} of {} chapters failed",
                outcome.failed,
                outcome.completed + outcome.failed
            )));
        }

        slot.lock_task().advance(TaskState::Assembling);
        self.assembler.assemble(&detail, &outcome.chapters, format).await
    }

    pub fn progress(&self, task_id: Uuid) -> Option<DownloadTask> {
        self.slot(task_id).map(|slot| slot.snapshot())
    }

    /// Fetch the finished artifact, or report where the task stands. The
    /// artifact is only handed out once the file on disk is verifiably
    /// complete.
    pub async fn result(&self, task_id: Uuid) -> TaskPoll {
        let Some(slot) = self.slot(task_id) else {
            return TaskPoll::NotFound;
        };
        let task = slot.snapshot();
        match task.state {
            TaskState::Failed => TaskPoll::Failed {
                reason: task.error.clone().unwrap_or_else(|| "unknown".to_string()),
            },
            TaskState::Ready => {
                let Some(path) = task.artifact_path.clone() else {
                    return TaskPoll::Failed {
                        reason: "artifact path missing".to_string(),
                    };
                };
                match wait_for_stable_artifact(&path, task.format).await {
                    Ok(file_size) => TaskPoll::Ready(ArtifactHandle {
                        filename: path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_else(|| format!("novel.{}", task.format.extension())),
                        content_type: task.format.content_type(),
                        path,
                        file_size,
                        task,
                    }),
                    Err(err) => {
                        tracing::error!(task = %task_id, %err, "ready artifact failed materialization check");
                        TaskPoll::Failed {
                            reason: "artifact is not readable".to_string(),
                        }
                    }
                }
            }
            _ => TaskPoll::Running(task),
        }
    }

    /// Cancel a running task. Already-cached chapters stay cached.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let Some(slot) = self.slot(task_id) else {
            return false;
        };
        let terminal = slot.snapshot().state.is_terminal();
        if !terminal {
            slot.cancel.cancel();
        }
        !terminal
    }

    /// Block until the task reaches `Ready` or `Failed`; used by the
    /// synchronous download endpoint.
    pub async fn wait_terminal(&self, task_id: Uuid) -> Result<DownloadTask> {
        let Some(slot) = self.slot(task_id) else {
            return Err(Error::not_found(format!("task {task_id}")));
        };
        loop {
            let notified = slot.done.notified();
            let task = slot.snapshot();
            if task.state.is_terminal() {
                return Ok(task);
            }
            notified.await;
        }
    }

    /// Drop terminal tasks older than the retention window. Returns how
    /// many were collected.
    pub fn gc_once(&self) -> usize {
        let retention =
            chrono::Duration::from_std(self.config.task_retention).unwrap_or(chrono::Duration::hours(1));
        let cutoff = chrono::Utc::now() - retention;
        let mut tasks = self.tasks_write();
        let before = tasks.len();
        tasks.retain(|_, slot| {
            let task = slot.lock_task();
            !(task.state.is_terminal() && task.finished_at.is_some_and(|at| at < cutoff))
        });
        before - tasks.len()
    }

    /// Periodic GC sweep; runs until the registry is dropped.
    pub fn spawn_gc(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let collected = registry.gc_once();
                if collected > 0 {
                    tracing::debug!(collected, "task registry gc");
                }
            }
        });
    }

    pub fn task_count(&self) -> usize {
        self.tasks_read().len()
    }

    pub fn active_worker_count(&self) -> usize {
        self.queue.active_count()
    }

    /// Drain point for shutdown: cancel everything still running.
    pub fn cancel_all(&self) {
        for slot in self.tasks_read().values() {
            if !slot.snapshot().state.is_terminal() {
                slot.cancel.cancel();
            }
        }
    }
}

/// The artifact must exist, parse as its format, and hold a stable size
/// across two checks a short delay apart. Bigger files get more patience.
async fn wait_for_stable_artifact(path: &Path, format: OutputFormat) -> anyhow::Result<u64> {
    let first = tokio::fs::metadata(path).await?.len();
    let attempts = (3 + first / 5_000_000).min(10);
    let mut previous = first;

    for _ in 0..attempts {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let current = tokio::fs::metadata(path).await?.len();
        if current == previous && current > 0 {
            verify_artifact(path, format)?;
            return Ok(current);
        }
        previous = current;
    }
    anyhow::bail!("artifact size never stabilized: {}", path.display());
}
