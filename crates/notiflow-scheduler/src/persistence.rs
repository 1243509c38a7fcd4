//! SQLite-backed task store.
//! Survives restarts; the execution ledger has a `UNIQUE(task_id, minute_key)`
//! constraint so the one-record-per-minute rule holds even across processes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use notiflow_core::error::{NotiflowError, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::store::TaskStore;
use crate::tasks::{ExecutionRecord, Frequency, Task};

/// SQLite-backed `TaskStore`.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

fn store_err(context: &str) -> impl FnOnce(rusqlite::Error) -> NotiflowError + '_ {
    move |e| NotiflowError::Store(format!("{context}: {e}"))
}

impl SqliteTaskStore {
    /// Open or create the task database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err("DB open"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        tracing::debug!("🗄️ Task store opened at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err("DB open"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            PRAGMA foreign_keys = ON;

            -- Task documents. Ledger entries live in execution_records.
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                frequency TEXT NOT NULL,          -- 'daily', 'weekly', 'selected', 'one-time'
                is_active INTEGER NOT NULL DEFAULT 1,
                executed INTEGER NOT NULL DEFAULT 0,
                webhook_url TEXT,
                document TEXT NOT NULL,           -- task JSON without executionHistory
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(frequency, is_active, executed);

            -- Append-only execution ledger
            CREATE TABLE IF NOT EXISTS execution_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                minute_key INTEGER NOT NULL,      -- unix minutes of executed_at
                executed_at TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,             -- JSON ExecutionRecord
                UNIQUE (task_id, minute_key),
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );
         ",
            )
            .map_err(store_err("Migration"))
    }
}

fn load_history(conn: &Connection, task_id: &str) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = conn
        .prepare("SELECT record FROM execution_records WHERE task_id = ?1 ORDER BY id")
        .map_err(store_err("Load history"))?;
    let rows = stmt
        .query_map([task_id], |row| row.get::<_, String>(0))
        .map_err(store_err("Load history"))?;

    let mut records = Vec::new();
    for row in rows {
        let json = row.map_err(store_err("Load history"))?;
        records.push(serde_json::from_str(&json)?);
    }
    Ok(records)
}

/// Rebuild a task from its document, its authoritative columns and its ledger.
fn hydrate(
    conn: &Connection,
    document: &str,
    executed: bool,
    webhook_url: Option<String>,
) -> Result<Task> {
    let mut task: Task = serde_json::from_str(document)?;
    task.executed = executed;
    task.webhook_url = webhook_url;
    task.execution_history = load_history(conn, &task.id)?;
    Ok(task)
}

fn query_tasks(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql).map_err(store_err("Load tasks"))?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i32>(1)? != 0,
                row.get::<_, Option<String>>(2)?,
            ))
        })
        .map_err(store_err("Load tasks"))?;

    let mut tasks = Vec::new();
    for row in rows {
        let (document, executed, webhook_url) = row.map_err(store_err("Load tasks"))?;
        match hydrate(conn, &document, executed, webhook_url) {
            Ok(task) => tasks.push(task),
            Err(e) => tracing::warn!("⚠️ Skipping unreadable task document: {e}"),
        }
    }
    Ok(tasks)
}

fn insert_record(conn: &Connection, task_id: &str, record: &ExecutionRecord) -> Result<()> {
    let json = serde_json::to_string(record)?;
    let result = conn.execute(
        "INSERT INTO execution_records (task_id, minute_key, executed_at, status, record)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            task_id,
            record.minute_key(),
            record.executed_at.to_rfc3339(),
            record.status.to_string(),
            json,
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(NotiflowError::DuplicateExecution {
                task_id: task_id.to_string(),
                minute: record.minute_key(),
            })
        }
        Err(e) => Err(store_err("Append record")(e)),
    }
}

fn ensure_task(conn: &Connection, task_id: &str) -> Result<()> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM tasks WHERE id = ?1", [task_id], |row| row.get(0))
        .optional()
        .map_err(store_err("Find task"))?;
    match found {
        Some(_) => Ok(()),
        None => Err(NotiflowError::NotFound(format!("task {task_id}"))),
    }
}

fn update_task(conn: &Connection, task_id: &str, sql: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
    let changed = conn
        .execute(sql, params![value, Utc::now().to_rfc3339(), task_id])
        .map_err(store_err("Update task"))?;
    if changed == 0 {
        return Err(NotiflowError::NotFound(format!("task {task_id}")));
    }
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn find_active_by_frequency(&self, frequency: Frequency) -> Result<Vec<Task>> {
        let conn = self.conn();
        query_tasks(
            &conn,
            "SELECT document, executed, webhook_url FROM tasks
             WHERE frequency = ?1 AND is_active = 1 AND NOT (frequency = 'one-time' AND executed = 1)
             ORDER BY created_at",
            &[&frequency.as_str()],
        )
    }

    async fn append_execution_record(&self, task_id: &str, record: ExecutionRecord) -> Result<()> {
        let conn = self.conn();
        ensure_task(&conn, task_id)?;
        insert_record(&conn, task_id, &record)
    }

    async fn set_executed(&self, task_id: &str) -> Result<()> {
        update_task(
            &self.conn(),
            task_id,
            "UPDATE tasks SET executed = ?1, updated_at = ?2 WHERE id = ?3",
            &true,
        )
    }

    async fn set_default_webhook(&self, task_id: &str, url: &str) -> Result<()> {
        update_task(
            &self.conn(),
            task_id,
            "UPDATE tasks SET webhook_url = ?1, updated_at = ?2 WHERE id = ?3",
            &url,
        )
    }

    async fn get_task(&self, task_id: &str) -> Result<Task> {
        let conn = self.conn();
        query_tasks(
            &conn,
            "SELECT document, executed, webhook_url FROM tasks WHERE id = ?1",
            &[&task_id],
        )?
        .pop()
        .ok_or_else(|| NotiflowError::NotFound(format!("task {task_id}")))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        query_tasks(
            &conn,
            "SELECT document, executed, webhook_url FROM tasks ORDER BY created_at",
            &[],
        )
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(store_err("Save task"))?;

        let mut document = task.clone();
        document.execution_history.clear();
        tx.execute(
            "INSERT INTO tasks (id, frequency, is_active, executed, webhook_url, document, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                frequency = excluded.frequency,
                is_active = excluded.is_active,
                executed = excluded.executed,
                webhook_url = excluded.webhook_url,
                document = excluded.document,
                updated_at = excluded.updated_at",
            params![
                task.id,
                task.frequency.as_str(),
                task.is_active,
                task.executed,
                task.webhook_url,
                serde_json::to_string(&document)?,
                task.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(store_err("Save task"))?;

        for record in &task.execution_history {
            match insert_record(&tx, &task.id, record) {
                Ok(()) | Err(NotiflowError::DuplicateExecution { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        tx.commit().map_err(store_err("Save task"))
    }

    async fn execution_history(&self, task_id: &str) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn();
        ensure_task(&conn, task_id)?;
        load_history(&conn, task_id)
    }

    async fn record_firing(
        &self,
        task_id: &str,
        record: ExecutionRecord,
        mark_executed: bool,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(store_err("Record firing"))?;
        ensure_task(&tx, task_id)?;
        insert_record(&tx, task_id, &record)?;
        if mark_executed {
            update_task(
                &tx,
                task_id,
                "UPDATE tasks SET executed = ?1, updated_at = ?2 WHERE id = ?3",
                &true,
            )?;
        }
        tx.commit().map_err(store_err("Record firing"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::ExecutionStatus;
    use chrono::DateTime;

    fn record(at: &str) -> ExecutionRecord {
        ExecutionRecord {
            executed_at: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
            status: ExecutionStatus::Success,
            execution_id: format!("t1-{at}"),
            webhook_url: "http://hook.test".into(),
            manual_trigger: false,
            triggered_rules: vec![],
            logs: vec!["Execution completed successfully".into()],
            version_used: Some(1),
            compiled_template: Some("hi".into()),
            reference: Some("200".into()),
            error: None,
            error_details: None,
            email_config: None,
        }
    }

    #[tokio::test]
    async fn test_open_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTaskStore::open(&dir.path().join("nested").join("tasks.db")).unwrap();
        assert!(store.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_query_by_frequency() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut off = Task::daily("t2", "off", "09:00");
        off.is_active = false;
        store.save_task(&Task::daily("t1", "digest", "09:00")).await.unwrap();
        store.save_task(&off).await.unwrap();
        store.save_task(&Task::selected_days("t3", "gym", &["Monday"], "18:00")).await.unwrap();

        let daily = store.find_active_by_frequency(Frequency::Daily).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].description, "digest");
        let selected = store.find_active_by_frequency(Frequency::SelectedDays).await.unwrap();
        assert_eq!(selected[0].selected_days, vec!["Monday"]);
    }

    #[tokio::test]
    async fn test_unique_minute_constraint() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.save_task(&Task::daily("t1", "digest", "09:00")).await.unwrap();

        store.append_execution_record("t1", record("2026-03-02T09:00:03Z")).await.unwrap();
        let dup = store.append_execution_record("t1", record("2026-03-02T09:00:30Z")).await;
        assert!(matches!(dup, Err(NotiflowError::DuplicateExecution { .. })));

        let history = store.execution_history("t1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reference.as_deref(), Some("200"));
    }

    #[tokio::test]
    async fn test_record_firing_flips_executed_atomically() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let at = DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z").unwrap().with_timezone(&Utc);
        store.save_task(&Task::once("t1", "launch", at)).await.unwrap();

        store.record_firing("t1", record("2026-03-02T09:00:00Z"), true).await.unwrap();
        assert!(store.get_task("t1").await.unwrap().executed);
        assert!(store.find_active_by_frequency(Frequency::OneTime).await.unwrap().is_empty());

        // A rejected duplicate leaves no partial write behind.
        let dup = store.record_firing("t1", record("2026-03-02T09:00:10Z"), true).await;
        assert!(dup.is_err());
        assert_eq!(store.execution_history("t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_updates_on_unknown_task() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        assert!(matches!(store.set_executed("nope").await, Err(NotiflowError::NotFound(_))));
        assert!(matches!(
            store.append_execution_record("nope", record("2026-03-02T09:00:00Z")).await,
            Err(NotiflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_backfill_and_reimport() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut task = Task::daily("t1", "digest", "09:00");
        task.execution_history.push(record("2026-03-01T09:00:00Z"));
        store.save_task(&task).await.unwrap();
        store.set_default_webhook("t1", "http://default.test/hook").await.unwrap();

        // Re-importing the same document does not duplicate its ledger.
        task.webhook_url = Some("http://default.test/hook".into());
        store.save_task(&task).await.unwrap();

        let loaded = store.get_task("t1").await.unwrap();
        assert_eq!(loaded.webhook_url.as_deref(), Some("http://default.test/hook"));
        assert_eq!(loaded.execution_history.len(), 1);
    }
}
