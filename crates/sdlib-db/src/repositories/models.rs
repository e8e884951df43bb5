//! Model mirror: configured descriptors reflected into SQLite.
//!
//! The config document is the source of truth; this table only exists so
//! other local processes can see what is configured without parsing the
//! document themselves.

use sqlx::SqlitePool;

use sdlib_core::{ModelDescriptor, RepositoryError};

use super::{map_storage_error, now_str};

#[derive(Clone)]
pub struct ModelMirrorRepository {
    pool: SqlitePool,
}

impl ModelMirrorRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Reflect the loaded config into the mirror table, removing rows for
    /// models no longer configured.
    pub async fn sync(&self, models: &[ModelDescriptor]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_storage_error)?;

        sqlx::query("DELETE FROM models")
            .execute(&mut *tx)
            .await
            .map_err(map_storage_error)?;

        let now = now_str();
        for model in models {
            let capabilities = serde_json::to_string(&model.capabilities)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO models (
                    id, name, description, exec_mode, load_mode,
                    capabilities, registry_repo, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&model.id)
            .bind(&model.name)
            .bind(&model.description)
            .bind(model.exec_mode.as_str())
            .bind(match model.load_mode {
                sdlib_core::LoadMode::OnDemand => "on_demand",
                sdlib_core::LoadMode::Preload => "preload",
            })
            .bind(capabilities)
            .bind(&model.registry_repo)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(map_storage_error)?;
        }

        tx.commit().await.map_err(map_storage_error)
    }

    /// Ids currently present in the mirror.
    pub async fn ids(&self) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM models ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_storage_error)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
