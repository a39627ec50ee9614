use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{RepositoryError, Source, SourceRepository};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id        TEXT PRIMARY KEY,
    feed_url  TEXT NOT NULL DEFAULT '',
    metadata  TEXT NOT NULL DEFAULT '{}'
)
"#;

// ============================================================================
// SQLite Repository
// ============================================================================

/// Reference [`SourceRepository`] backed by SQLite.
///
/// Host systems embedding the pipeline typically supply their own repository;
/// this one serves the CLI and the test suite. Each update commits
/// immediately, so the trait's end-of-batch flush stays a no-op.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open (creating if missing) the source database at `path`.
    /// `":memory:"` yields a private in-memory database.
    pub async fn open(path: &str) -> Result<Self, RepositoryError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout: wait out transient lock contention instead of
        // surfacing SQLITE_BUSY to the pipeline, where it would abort a run.
        let options = SqliteConnectOptions::from_str(&url)?.pragma("busy_timeout", "5000");

        // Single connection: writes are serialized per source by contract,
        // and an in-memory database must not be split across connections.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a source, or update its URL and metadata when the id exists.
    pub async fn insert_source(&self, source: &Source) -> Result<(), RepositoryError> {
        let metadata = serde_json::to_string(&source.metadata)?;
        sqlx::query(
            "INSERT INTO sources (id, feed_url, metadata) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET feed_url = excluded.feed_url, metadata = excluded.metadata",
        )
        .bind(&source.id)
        .bind(&source.feed_url)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_source(&self, id: &str) -> Result<Option<Source>, RepositoryError> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT id, feed_url, metadata FROM sources WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_source).transpose()
    }
}

fn row_to_source((id, feed_url, metadata): (String, String, String)) -> Result<Source, RepositoryError> {
    let metadata = serde_json::from_str(&metadata)?;
    Ok(Source {
        id,
        feed_url,
        metadata,
    })
}

#[async_trait]
impl SourceRepository for SqliteRepository {
    async fn all_sources(&self) -> Result<Vec<Source>, RepositoryError> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT id, feed_url, metadata FROM sources ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(row_to_source).collect()
    }

    async fn update_source(&self, source: &Source) -> Result<(), RepositoryError> {
        let metadata = serde_json::to_string(&source.metadata)?;
        let result = sqlx::query("UPDATE sources SET feed_url = ?, metadata = ? WHERE id = ?")
            .bind(&source.feed_url)
            .bind(metadata)
            .bind(&source.id)
            .execute(&self.pool)
            .await?;
        // Zero rows means the source was deleted out from under us; a
        // silently dropped watermark write must be fatal to the run.
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(source.id.clone()));
        }
        Ok(())
    }
}
