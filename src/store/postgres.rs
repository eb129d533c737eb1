use super::{dedup_last_wins, BulkWriteReport, DocumentStore, StagedDocument};
use crate::config::StoreConfig;
use crate::document::Document;
use crate::error::StoreError;
use log::{info, trace};
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

static STORE_MIGRATOR: Migrator = sqlx::migrate!("./migrations/store");

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Documents kept as JSONB rows keyed by `(collection, id)`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.connection_url())
            .await?;

        STORE_MIGRATOR.run(&pool).await?;
        info!("document store: connected to {}", config.display_target());

        Ok(Self { pool })
    }

    /// Wrap an existing pool. Migrations are the caller's responsibility.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        STORE_MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl DocumentStore for PgDocumentStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let body: Option<Value> =
            sqlx::query_scalar("SELECT body FROM documents WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match body {
            Some(value) => Document::try_from(value)
                .map(Some)
                .map_err(|err| StoreError::Unavailable(format!("stored document {}: {}", id, err))),
            None => Ok(None),
        }
    }

    /// One `INSERT ... SELECT FROM UNNEST` statement per call. Rows whose body is
    /// unchanged are left untouched and counted as `unchanged`.
    async fn bulk_upsert(
        &self,
        collection: &str,
        documents: Vec<StagedDocument>,
    ) -> Result<BulkWriteReport, StoreError> {
        let mut report = BulkWriteReport::default();
        let mut ids = Vec::with_capacity(documents.len());
        let mut bodies = Vec::with_capacity(documents.len());

        for staged in dedup_last_wins(documents) {
            match serde_json::to_string(&staged.document) {
                Ok(body) => {
                    ids.push(staged.id);
                    bodies.push(body);
                }
                Err(err) => {
                    report.failed.insert(staged.id, err.to_string());
                }
            }
        }

        if ids.is_empty() {
            return Ok(report);
        }

        let rows: Vec<(String, bool)> = sqlx::query_as(
            r#"INSERT INTO documents (collection, id, body)
               SELECT $1, id, body::jsonb
               FROM UNNEST($2::text[], $3::text[]) AS t(id, body)
               ON CONFLICT (collection, id) DO UPDATE
               SET body = EXCLUDED.body,
                   updated_at = NOW()
               WHERE documents.body IS DISTINCT FROM EXCLUDED.body
               RETURNING id, (xmax = 0) AS inserted"#,
        )
        .bind(collection)
        .bind(&ids)
        .bind(&bodies)
        .fetch_all(&self.pool)
        .await?;

        for (_, inserted) in &rows {
            if *inserted {
                report.inserted += 1;
            } else {
                report.updated += 1;
            }
        }
        report.unchanged = ids.len() - rows.len();

        trace!(
            "document store: upserted {} documents into {} ({} inserted, {} updated, {} unchanged)",
            ids.len(),
            collection,
            report.inserted,
            report.updated,
            report.unchanged
        );
        Ok(report)
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = $1")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
