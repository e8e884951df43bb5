//! Database setup and initialization.
//!
//! `setup_database()` opens (or creates) the SQLite file and ensures the
//! schema exists. All DDL uses `IF NOT EXISTS`, and column additions are
//! issued as `ALTER TABLE … ADD COLUMN` with the already-exists error
//! ignored, so setup is idempotent across versions.

use std::path::Path;

use anyhow::Result;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;

/// Open the database at `db_path`, creating file and schema as needed.
pub async fn setup_database(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true),
    )
    .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// In-memory database with the full production schema, for tests.
///
/// Pinned to a single pooled connection: every `:memory:` connection is
/// its own database, so a wider pool would hand out empty schemas.
#[cfg(any(test, feature = "test-utils"))]
pub async fn setup_test_database() -> Result<SqlitePool> {
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes. Safe to call repeatedly.
async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Jobs: queue and history merged into one table. Status/progress
    // columns drive the queue; timing and error columns are the history.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            model_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            negative_prompt TEXT,
            size TEXT,
            seed INTEGER,
            n INTEGER NOT NULL DEFAULT 1,
            quality TEXT,
            style TEXT,
            source_image TEXT,
            mask_image TEXT,
            strength REAL,
            cfg_scale REAL,
            sample_steps INTEGER,
            sampling_method TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            progress REAL NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            model_loading_time_ms INTEGER,
            generation_time_ms INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The claim query scans pending jobs oldest-first.
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at)")
        .execute(pool)
        .await?;

    // Migration: clip_skip arrived after the initial schema.
    // Ignore error if column already exists.
    let _ = sqlx::query("ALTER TABLE jobs ADD COLUMN clip_skip INTEGER")
        .execute(pool)
        .await;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generated_images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            batch_index INTEGER NOT NULL,
            mime_type TEXT NOT NULL,
            data BLOB NOT NULL,
            revised_prompt TEXT,
            width INTEGER,
            height INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_job ON generated_images(job_id)")
        .execute(pool)
        .await?;

    // Config mirror so other local processes can see what is configured.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS models (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            exec_mode TEXT NOT NULL,
            load_mode TEXT NOT NULL,
            capabilities TEXT NOT NULL DEFAULT '[]',
            registry_repo TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Latest known engine process state, mirrored from the in-memory
    // registry so other local processes can observe it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS model_processes (
            model_id TEXT PRIMARY KEY,
            pid INTEGER,
            port INTEGER,
            status TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
            id TEXT PRIMARY KEY,
            repo TEXT NOT NULL,
            status TEXT NOT NULL,
            bytes_downloaded INTEGER NOT NULL DEFAULT 0,
            total_bytes INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-file rows persist the original file list so an interrupted
    // download can resume with range requests after a restart.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS download_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            download_id TEXT NOT NULL,
            remote_path TEXT NOT NULL,
            destination TEXT NOT NULL,
            total_bytes INTEGER NOT NULL DEFAULT 0,
            downloaded_bytes INTEGER NOT NULL DEFAULT 0,
            complete INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE,
            UNIQUE(download_id, remote_path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_download_files_download ON download_files(download_id)")
        .execute(pool)
        .await?;

    Ok(())
}
