//! Task store adapter — the scheduler's only view of persisted tasks.
//!
//! `FileTaskStore` keeps tasks in memory and, when opened on a directory,
//! mirrors them to `tasks.json` (human-readable, git-friendly). The SQLite
//! adapter lives in `persistence.rs`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use notiflow_core::error::{NotiflowError, Result};

use crate::tasks::{ExecutionRecord, Frequency, Task};

/// Read/write access to persisted tasks.
///
/// The scheduler only reads tasks, appends execution records, flips the
/// one-time `executed` flag and backfills webhook URLs.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Active tasks of one frequency class. Executed one-time tasks are excluded.
    async fn find_active_by_frequency(&self, frequency: Frequency) -> Result<Vec<Task>>;

    /// Append to a task's ledger. Rejects a second record in the same minute.
    async fn append_execution_record(&self, task_id: &str, record: ExecutionRecord) -> Result<()>;

    async fn set_executed(&self, task_id: &str) -> Result<()>;

    async fn set_default_webhook(&self, task_id: &str, url: &str) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Task>;

    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Insert or replace a task document. Existing ledger entries are kept.
    async fn save_task(&self, task: &Task) -> Result<()>;

    /// The task's ledger in append order.
    async fn execution_history(&self, task_id: &str) -> Result<Vec<ExecutionRecord>>;

    /// Append a record and optionally set `executed`, as one write where the store allows it.
    async fn record_firing(
        &self,
        task_id: &str,
        record: ExecutionRecord,
        mark_executed: bool,
    ) -> Result<()> {
        self.append_execution_record(task_id, record).await?;
        if mark_executed {
            self.set_executed(task_id).await?;
        }
        Ok(())
    }
}

/// In-memory task store with optional JSON-file persistence.
pub struct FileTaskStore {
    file: Option<PathBuf>,
    tasks: Mutex<Vec<Task>>,
}

impl FileTaskStore {
    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_tasks(Vec::new())
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            file: None,
            tasks: Mutex::new(tasks),
        }
    }

    /// Open `<dir>/tasks.json`, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join("tasks.json");
        let tasks = if file.exists() {
            let json = std::fs::read_to_string(&file)?;
            serde_json::from_str(&json)?
        } else {
            Vec::new()
        };
        tracing::debug!("📂 Loaded {} tasks from {}", tasks.len(), file.display());
        Ok(Self {
            file: Some(file),
            tasks: Mutex::new(tasks),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Task>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, tasks: &[Task]) -> Result<()> {
        if let Some(file) = &self.file {
            let json = serde_json::to_string_pretty(tasks)?;
            std::fs::write(file, json)?;
            tracing::debug!("💾 Saved {} tasks to {}", tasks.len(), file.display());
        }
        Ok(())
    }

    /// Mutate one task and persist.
    fn update<F>(&self, task_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut tasks = self.lock();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| NotiflowError::NotFound(format!("task {task_id}")))?;
        f(task)?;
        self.persist(&tasks)
    }
}

fn append_unique(task: &mut Task, record: ExecutionRecord) -> Result<()> {
    if task.has_record_for_minute(&record.executed_at) {
        return Err(NotiflowError::DuplicateExecution {
            task_id: task.id.clone(),
            minute: record.minute_key(),
        });
    }
    task.execution_history.push(record);
    Ok(())
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn find_active_by_frequency(&self, frequency: Frequency) -> Result<Vec<Task>> {
        Ok(self
            .lock()
            .iter()
            .filter(|t| t.frequency == frequency && t.is_schedulable())
            .cloned()
            .collect())
    }

    async fn append_execution_record(&self, task_id: &str, record: ExecutionRecord) -> Result<()> {
        self.update(task_id, |task| append_unique(task, record))
    }

    async fn set_executed(&self, task_id: &str) -> Result<()> {
        self.update(task_id, |task| {
            task.executed = true;
            Ok(())
        })
    }

    async fn set_default_webhook(&self, task_id: &str, url: &str) -> Result<()> {
        self.update(task_id, |task| {
            task.webhook_url = Some(url.to_string());
            Ok(())
        })
    }

    async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.lock()
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
            .ok_or_else(|| NotiflowError::NotFound(format!("task {task_id}")))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.lock().clone())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.lock();
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => {
                let history = std::mem::take(&mut existing.execution_history);
                *existing = task.clone();
                existing.execution_history = history;
                for record in &task.execution_history {
                    if !existing.has_record_for_minute(&record.executed_at) {
                        existing.execution_history.push(record.clone());
                    }
                }
            }
            None => tasks.push(task.clone()),
        }
        self.persist(&tasks)
    }

    async fn execution_history(&self, task_id: &str) -> Result<Vec<ExecutionRecord>> {
        Ok(self.get_task(task_id).await?.execution_history)
    }

    async fn record_firing(
        &self,
        task_id: &str,
        record: ExecutionRecord,
        mark_executed: bool,
    ) -> Result<()> {
        self.update(task_id, |task| {
            append_unique(task, record)?;
            if mark_executed {
                task.executed = true;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::ExecutionStatus;
    use chrono::{DateTime, Utc};

    fn record(at: &str, status: ExecutionStatus) -> ExecutionRecord {
        ExecutionRecord {
            executed_at: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
            status,
            execution_id: "x".into(),
            webhook_url: String::new(),
            manual_trigger: false,
            triggered_rules: vec![],
            logs: vec![],
            version_used: None,
            compiled_template: None,
            reference: None,
            error: None,
            error_details: None,
            email_config: None,
        }
    }

    #[tokio::test]
    async fn test_find_active_by_frequency() {
        let mut inactive = Task::daily("t2", "off", "09:00");
        inactive.is_active = false;
        let mut done = Task::once("t4", "done", Utc::now());
        done.executed = true;
        let store = FileTaskStore::with_tasks(vec![
            Task::daily("t1", "on", "09:00"),
            inactive,
            Task::weekly("t3", "weekly", "Monday", "09:00"),
            done,
        ]);

        let daily = store.find_active_by_frequency(Frequency::Daily).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].id, "t1");
        assert!(store.find_active_by_frequency(Frequency::OneTime).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_rejects_same_minute() {
        let store = FileTaskStore::with_tasks(vec![Task::daily("t1", "on", "09:00")]);
        store
            .append_execution_record("t1", record("2026-03-02T09:00:01Z", ExecutionStatus::Success))
            .await
            .unwrap();
        let dup = store
            .append_execution_record("t1", record("2026-03-02T09:00:40Z", ExecutionStatus::Failed))
            .await;
        assert!(matches!(dup, Err(NotiflowError::DuplicateExecution { .. })));
        store
            .append_execution_record("t1", record("2026-03-03T09:00:00Z", ExecutionStatus::Success))
            .await
            .unwrap();
        assert_eq!(store.execution_history("t1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let store = FileTaskStore::in_memory();
        assert!(matches!(store.set_executed("nope").await, Err(NotiflowError::NotFound(_))));
        assert!(matches!(store.get_task("nope").await, Err(NotiflowError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_persists_to_json_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileTaskStore::open(dir.path()).unwrap();
            store.save_task(&Task::once("t1", "launch", Utc::now())).await.unwrap();
            store
                .record_firing("t1", record("2026-03-02T09:00:00Z", ExecutionStatus::Success), true)
                .await
                .unwrap();
            store.set_default_webhook("t1", "http://hook.test/x").await.unwrap();
        }

        let reopened = FileTaskStore::open(dir.path()).unwrap();
        let task = reopened.get_task("t1").await.unwrap();
        assert!(task.executed);
        assert_eq!(task.webhook_url.as_deref(), Some("http://hook.test/x"));
        assert_eq!(task.execution_history.len(), 1);
    }

    #[tokio::test]
    async fn test_save_task_keeps_ledger() {
        let store = FileTaskStore::with_tasks(vec![Task::daily("t1", "old", "09:00")]);
        store
            .append_execution_record("t1", record("2026-03-02T09:00:00Z", ExecutionStatus::Success))
            .await
            .unwrap();

        store.save_task(&Task::daily("t1", "renamed", "10:00")).await.unwrap();
        let task = store.get_task("t1").await.unwrap();
        assert_eq!(task.description, "renamed");
        assert_eq!(task.execution_history.len(), 1);
    }
}
