//! Async persistence gateway used by the orchestrator.

use super::Database;
use crate::error::{ConductorError, ConductorResult};
use crate::types::Task;
use async_trait::async_trait;

/// Durable storage for finished and stored tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_history(&self, tasks: Vec<Task>) -> ConductorResult<()>;

    /// Finished tasks whose end time lies within the last `retention_hours`.
    async fn load_history(&self, retention_hours: u32) -> ConductorResult<Vec<Task>>;

    async fn save_stored_tasks(&self, tasks: Vec<Task>) -> ConductorResult<()>;

    async fn load_stored_tasks(&self) -> ConductorResult<Vec<Task>>;
}

/// [`TaskStore`] backed by [`Database`]; SQLite calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteTaskStore {
    db: Database,
}

impl SqliteTaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> ConductorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(ConductorError::internal)?
            .map_err(ConductorError::persistence)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save_history(&self, tasks: Vec<Task>) -> ConductorResult<()> {
        let saved = self.blocking(move |db| db.save_history(&tasks)).await?;
        tracing::debug!(saved, "history saved");
        Ok(())
    }

    async fn load_history(&self, retention_hours: u32) -> ConductorResult<Vec<Task>> {
        self.blocking(move |db| db.load_history(retention_hours)).await
    }

    async fn save_stored_tasks(&self, tasks: Vec<Task>) -> ConductorResult<()> {
        self.blocking(move |db| db.save_stored_tasks(&tasks)).await?;
        Ok(())
    }

    async fn load_stored_tasks(&self) -> ConductorResult<Vec<Task>> {
        self.blocking(|db| db.load_stored_tasks()).await
    }
}
