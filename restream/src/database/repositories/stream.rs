//! Stream repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::StreamDbModel;
use crate::database::time::now_ms;
use crate::domain::{StreamDefinition, StreamStatus};
use crate::{Error, Result};

/// Record store for stream definitions.
#[async_trait]
pub trait StreamRepository: Send + Sync {
    /// Fetch one definition, `Error::NotFound` if absent.
    async fn get_stream(&self, id: &str) -> Result<StreamDefinition>;
    async fn list_streams_by_owner(&self, user_id: &str) -> Result<Vec<StreamDefinition>>;
    async fn create_stream(&self, stream: &StreamDefinition) -> Result<()>;
    /// Overwrite the editable fields (platform, destination, source, loop).
    /// Status is left alone. `Error::NotFound` if the row is gone.
    async fn update_stream(&self, stream: &StreamDefinition) -> Result<()>;
    /// Set the persisted status, `Error::NotFound` if the row is gone.
    async fn update_status(&self, id: &str, status: StreamStatus) -> Result<()>;
    async fn delete_stream(&self, id: &str) -> Result<()>;
    /// Mark every active stream inactive. Returns the number of rows changed.
    async fn reset_all_status(&self) -> Result<u64>;
}

/// SQLx implementation of StreamRepository.
pub struct SqlxStreamRepository {
    pool: SqlitePool,
}

impl SqlxStreamRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StreamRepository for SqlxStreamRepository {
    async fn get_stream(&self, id: &str) -> Result<StreamDefinition> {
        let model = sqlx::query_as::<_, StreamDbModel>("SELECT * FROM streams WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Stream", id))?;
        StreamDefinition::try_from(model)
    }

    async fn list_streams_by_owner(&self, user_id: &str) -> Result<Vec<StreamDefinition>> {
        let models = sqlx::query_as::<_, StreamDbModel>(
            "SELECT * FROM streams WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        models.into_iter().map(StreamDefinition::try_from).collect()
    }

    async fn create_stream(&self, stream: &StreamDefinition) -> Result<()> {
        let model = stream.to_db_model();
        sqlx::query(
            r#"
            INSERT INTO streams (
                id, user_id, platform, stream_url, stream_key,
                source_type, source_url, loop_enabled, status,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&model.id)
        .bind(&model.user_id)
        .bind(&model.platform)
        .bind(&model.stream_url)
        .bind(&model.stream_key)
        .bind(&model.source_type)
        .bind(&model.source_url)
        .bind(model.loop_enabled)
        .bind(&model.status)
        .bind(model.created_at)
        .bind(model.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_stream(&self, stream: &StreamDefinition) -> Result<()> {
        let model = stream.to_db_model();
        let result = sqlx::query(
            r#"
            UPDATE streams SET
                platform = ?, stream_url = ?, stream_key = ?,
                source_type = ?, source_url = ?, loop_enabled = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&model.platform)
        .bind(&model.stream_url)
        .bind(&model.stream_key)
        .bind(&model.source_type)
        .bind(&model.source_url)
        .bind(model.loop_enabled)
        .bind(model.updated_at)
        .bind(&model.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Stream", &stream.id));
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, status: StreamStatus) -> Result<()> {
        let result = sqlx::query("UPDATE streams SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_ref())
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Stream", id));
        }
        Ok(())
    }

    async fn delete_stream(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM streams WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Stream", id));
        }
        Ok(())
    }

    async fn reset_all_status(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE streams SET status = ?, updated_at = ? WHERE status = ?")
            .bind(StreamStatus::Inactive.as_ref())
            .bind(now_ms())
            .bind(StreamStatus::Active.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
