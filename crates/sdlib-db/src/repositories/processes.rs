//! Engine process state mirror.
//!
//! The process registry is the in-memory source of truth; this table
//! reflects its latest state so other local processes can observe which
//! engines are up without talking to the HTTP API.

use sqlx::{Row, SqlitePool};

use sdlib_core::RepositoryError;

use super::{map_storage_error, now_str};

/// One mirrored process state row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStateRow {
    pub model_id: String,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub status: String,
}

#[derive(Clone)]
pub struct ProcessStateRepository {
    pool: SqlitePool,
}

impl ProcessStateRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the latest state for a model's engine process.
    pub async fn upsert(
        &self,
        model_id: &str,
        status: &str,
        pid: Option<u32>,
        port: Option<u16>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO model_processes (model_id, pid, port, status, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(model_id) DO UPDATE SET
                pid = excluded.pid,
                port = excluded.port,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(model_id)
        .bind(pid.map(i64::from))
        .bind(port.map(i64::from))
        .bind(status)
        .bind(now_str())
        .execute(&self.pool)
        .await
        .map_err(map_storage_error)?;
        Ok(())
    }

    pub async fn all(&self) -> Result<Vec<ProcessStateRow>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM model_processes ORDER BY model_id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_storage_error)?;

        rows.iter()
            .map(|row| {
                let pid: Option<i64> = row.try_get("pid").map_err(map_storage_error)?;
                let port: Option<i64> = row.try_get("port").map_err(map_storage_error)?;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Ok(ProcessStateRow {
                    model_id: row.try_get("model_id").map_err(map_storage_error)?,
                    pid: pid.map(|v| v as u32),
                    port: port.map(|v| v as u16),
                    status: row.try_get("status").map_err(map_storage_error)?,
                })
            })
            .collect()
    }

    /// Drop every row. Run at boot: any previous state is stale by
    /// definition once this instance owns the registry.
    pub async fn clear(&self) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM model_processes")
            .execute(&self.pool)
            .await
            .map_err(map_storage_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::setup_test_database;

    #[tokio::test]
    async fn upsert_keeps_the_latest_state() {
        let repo = ProcessStateRepository::new(setup_test_database().await.unwrap());

        repo.upsert("m1", "starting", Some(42), Some(8001))
            .await
            .unwrap();
        repo.upsert("m1", "running", Some(42), Some(8001))
            .await
            .unwrap();

        let rows = repo.all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "running");
        assert_eq!(rows[0].port, Some(8001));
    }

    #[tokio::test]
    async fn clear_empties_the_mirror() {
        let repo = ProcessStateRepository::new(setup_test_database().await.unwrap());
        repo.upsert("m1", "running", None, None).await.unwrap();
        repo.clear().await.unwrap();
        assert!(repo.all().await.unwrap().is_empty());
    }
}
