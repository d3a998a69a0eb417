//! Task history and stored-task tables.
//!
//! Each row carries the full task as a JSON record next to a few indexed
//! columns used for filtering. Records are written and read back whole, so
//! optional fields keep their `None` through a round trip.

use super::{now_ms, Database};
use crate::types::Task;
use anyhow::Result;
use rusqlite::{params, Row};

const HOUR_MS: i64 = 60 * 60 * 1000;

fn parse_record(row: &Row) -> rusqlite::Result<String> {
    row.get("record")
}

fn decode(records: Vec<String>) -> Result<Vec<Task>> {
    records
        .iter()
        .map(|r| serde_json::from_str(r).map_err(Into::into))
        .collect()
}

impl Database {
    /// Upsert finished tasks into the history table.
    pub fn save_history(&self, tasks: &[Task]) -> Result<usize> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO task_history
                        (id, number, status, project_path, created_at, end_time, record, saved_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        number = excluded.number,
                        status = excluded.status,
                        project_path = excluded.project_path,
                        created_at = excluded.created_at,
                        end_time = excluded.end_time,
                        record = excluded.record,
                        saved_at = excluded.saved_at",
                )?;
                for task in tasks {
                    let record = serde_json::to_string(task)?;
                    stmt.execute(params![
                        task.id,
                        task.number as i64,
                        task.status.as_str(),
                        task.project_path,
                        task.created_at,
                        task.end_time,
                        record,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(tasks.len())
        })
    }

    /// History records whose end time lies within the last `retention_hours`,
    /// oldest first. Older rows are pruned as a side effect.
    pub fn load_history(&self, retention_hours: u32) -> Result<Vec<Task>> {
        let cutoff = now_ms() - i64::from(retention_hours) * HOUR_MS;
        let records = self.with_conn(|conn| {
            let pruned = conn.execute(
                "DELETE FROM task_history WHERE COALESCE(end_time, created_at) < ?1",
                params![cutoff],
            )?;
            if pruned > 0 {
                tracing::debug!(pruned, "pruned expired history records");
            }

            let mut stmt = conn.prepare(
                "SELECT record FROM task_history
                 WHERE COALESCE(end_time, created_at) >= ?1
                 ORDER BY COALESCE(end_time, created_at) ASC, number ASC",
            )?;
            let records = stmt
                .query_map(params![cutoff], parse_record)?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(records)
        })?;
        decode(records)
    }

    /// Replace the stored-task list with `tasks`, keeping their order.
    pub fn save_stored_tasks(&self, tasks: &[Task]) -> Result<usize> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM stored_tasks", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO stored_tasks (id, position, record, saved_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (position, task) in tasks.iter().enumerate() {
                    let record = serde_json::to_string(task)?;
                    stmt.execute(params![task.id, position as i64, record, now])?;
                }
            }
            tx.commit()?;
            Ok(tasks.len())
        })
    }

    pub fn load_stored_tasks(&self) -> Result<Vec<Task>> {
        let records = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT record FROM stored_tasks ORDER BY position ASC")?;
            let records = stmt
                .query_map([], parse_record)?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(records)
        })?;
        decode(records)
    }
}
