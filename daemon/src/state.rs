use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use common::error::AppError;
use ingestion_pipeline::pipeline::FileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Transient ingestion task record; lives only in daemon memory.
#[derive(Debug, Clone)]
pub struct IngestionTask {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paths: Vec<String>,
    pub watching: bool,
    pub files_processed: usize,
    pub chunks_stored: usize,
    pub errors: Vec<FileError>,
    pub status: TaskStatus,
}

impl IngestionTask {
    fn new(paths: Vec<String>, watching: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            completed_at: None,
            paths,
            watching,
            files_processed: 0,
            chunks_stored: 0,
            errors: Vec::new(),
            status: TaskStatus::Running,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidationLock {
    pub locked: bool,
    pub task_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Everything the router mutates: the task map, the consolidation lock and
/// the auto-watch registry. All process-local.
#[derive(Default)]
pub struct DaemonState {
    tasks: Mutex<HashMap<String, IngestionTask>>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
    lock: Mutex<ConsolidationLock>,
    watches: Mutex<HashMap<String, String>>,
    shutdown: tokio::sync::Notify,
}

impl DaemonState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_task(&self, paths: Vec<String>, watching: bool) -> IngestionTask {
        let task = IngestionTask::new(paths, watching);
        lock(&self.tasks).insert(task.id.clone(), task.clone());
        task
    }

    pub fn register_handle(&self, task_id: &str, handle: JoinHandle<()>) {
        lock(&self.handles).insert(task_id.to_string(), handle);
    }

    pub fn get_task(&self, task_id: &str) -> Option<IngestionTask> {
        lock(&self.tasks).get(task_id).cloned()
    }

    pub fn list_tasks(&self) -> Vec<IngestionTask> {
        let mut tasks: Vec<IngestionTask> = lock(&self.tasks).values().cloned().collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        tasks
    }

    /// Apply `update` to a task, if present.
    pub fn update_task(&self, task_id: &str, update: impl FnOnce(&mut IngestionTask)) {
        if let Some(task) = lock(&self.tasks).get_mut(task_id) {
            update(task);
        }
    }

    /// Cancel a running task. Stopping a nonexistent task is an error.
    pub fn stop_task(&self, task_id: &str) -> Result<IngestionTask, AppError> {
        let handle = lock(&self.handles).remove(task_id);
        let mut tasks = lock(&self.tasks);
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::NotFound(format!("ingestion task {task_id}")))?;

        if let Some(handle) = handle {
            handle.abort();
        }
        if task.status == TaskStatus::Running {
            task.status = TaskStatus::Stopped;
            task.completed_at = Some(Utc::now());
        }
        Ok(task.clone())
    }

    /// Compare-and-set acquire: `Ok(())` when this call took the lock,
    /// `Err(existing_task_id)` when someone already holds it.
    pub fn try_acquire_consolidation(&self, task_id: &str) -> Result<(), String> {
        let mut guard = lock(&self.lock);
        if guard.locked {
            return Err(guard.task_id.clone().unwrap_or_default());
        }
        *guard = ConsolidationLock {
            locked: true,
            task_id: Some(task_id.to_string()),
            started_at: Some(Utc::now()),
        };
        Ok(())
    }

    /// Unconditional release.
    pub fn release_consolidation(&self) {
        *lock(&self.lock) = ConsolidationLock::default();
    }

    pub fn consolidation_lock(&self) -> ConsolidationLock {
        lock(&self.lock).clone()
    }

    pub fn register_watch(&self, path: String, task_id: String) {
        lock(&self.watches).insert(path, task_id);
    }

    pub fn watches(&self) -> HashMap<String, String> {
        lock(&self.watches).clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_lifecycle() {
        let state = DaemonState::new();
        let task = state.create_task(vec!["notes".to_string()], false);
        assert_eq!(task.status, TaskStatus::Running);

        state.update_task(&task.id, |t| {
            t.files_processed = 2;
            t.chunks_stored = 9;
        });
        let fetched = state.get_task(&task.id).expect("present");
        assert_eq!(fetched.chunks_stored, 9);

        let stopped = state.stop_task(&task.id).expect("stop");
        assert_eq!(stopped.status, TaskStatus::Stopped);
        assert!(stopped.completed_at.is_some());

        assert_eq!(state.list_tasks().len(), 1);
    }

    #[test]
    fn stopping_a_nonexistent_task_is_an_error() {
        let state = DaemonState::new();
        assert!(matches!(
            state.stop_task("missing"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn consolidation_lock_is_exclusive() {
        let state = DaemonState::new();
        assert!(state.try_acquire_consolidation("t1").is_ok());
        assert_eq!(
            state.try_acquire_consolidation("t2"),
            Err("t1".to_string())
        );

        let snapshot = state.consolidation_lock();
        assert!(snapshot.locked);
        assert_eq!(snapshot.task_id.as_deref(), Some("t1"));

        state.release_consolidation();
        assert!(!state.consolidation_lock().locked);
        assert!(state.try_acquire_consolidation("t2").is_ok());
    }
}
