//! Embedded SQLite store for usage records.

use futures_util::TryStreamExt;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, Database,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use crate::entities::usage_records;
use crate::record::{TokenCounts, UsageRecord};

pub type UsageStoreResult<T> = Result<T, UsageStoreError>;

#[derive(Debug, thiserror::Error)]
pub enum UsageStoreError {
    #[error("usage store: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("usage store: timestamp format: {0}")]
    Format(#[from] time::error::Format),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageAggregate {
    pub matched_rows: i64,
    pub tokens: TokenCounts,
}

pub struct UsageStore {
    connection: DatabaseConnection,
}

impl UsageStore {
    /// Opens (or creates) the database file, switching it to WAL journaling
    /// with a 5-second busy timeout.
    pub async fn open(path: &str) -> UsageStoreResult<Self> {
        let dsn = format!("sqlite://{path}?mode=rwc");
        let connection = Database::connect(&dsn).await?;
        connection
            .execute_unprepared("PRAGMA journal_mode=WAL;")
            .await?;
        connection
            .execute_unprepared("PRAGMA busy_timeout=5000;")
            .await?;
        Ok(Self { connection })
    }

    pub async fn ensure_schema(&self) -> UsageStoreResult<()> {
        self.connection
            .execute_unprepared(
                "CREATE TABLE IF NOT EXISTS usage_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    api TEXT NOT NULL,
                    model TEXT NOT NULL,
                    ts TEXT NOT NULL,
                    source TEXT NOT NULL DEFAULT '',
                    auth_index TEXT NOT NULL DEFAULT '',
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    reasoning_tokens INTEGER NOT NULL DEFAULT 0,
                    cached_tokens INTEGER NOT NULL DEFAULT 0,
                    total_tokens INTEGER NOT NULL DEFAULT 0,
                    failed INTEGER NOT NULL DEFAULT 0
                )",
            )
            .await?;
        self.connection
            .execute_unprepared(
                "CREATE INDEX IF NOT EXISTS idx_usage_ts ON usage_records(ts)",
            )
            .await?;
        self.connection
            .execute_unprepared(
                "CREATE INDEX IF NOT EXISTS idx_usage_api_model ON usage_records(api, model)",
            )
            .await?;
        Ok(())
    }

    pub async fn insert(&self, record: &UsageRecord) -> UsageStoreResult<()> {
        let row = usage_records::ActiveModel {
            api: Set(record.api().to_string()),
            model: Set(record.model.clone()),
            ts: Set(record.requested_at.format(&Rfc3339)?),
            source: Set(record.source.clone()),
            auth_index: Set(record.auth_index.clone()),
            input_tokens: Set(record.tokens.input),
            output_tokens: Set(record.tokens.output),
            reasoning_tokens: Set(record.tokens.reasoning),
            cached_tokens: Set(record.tokens.cached),
            total_tokens: Set(record.tokens.total),
            failed: Set(record.failed),
            ..Default::default()
        };
        row.insert(&self.connection).await?;
        Ok(())
    }

    /// Streams all rows in timestamp order. Rows with malformed timestamps
    /// are skipped with a warning rather than failing the replay.
    pub async fn load_all(&self) -> UsageStoreResult<Vec<UsageRecord>> {
        let mut rows = usage_records::Entity::find()
            .order_by_asc(usage_records::Column::Ts)
            .stream(&self.connection)
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let requested_at = match OffsetDateTime::parse(&row.ts, &Rfc3339) {
                Ok(at) => at,
                Err(err) => {
                    warn!(ts = %row.ts, error = %err, "skipping record with invalid timestamp");
                    continue;
                }
            };
            records.push(UsageRecord {
                requested_at,
                provider: String::new(),
                model: row.model,
                api_key: row.api,
                source: row.source,
                auth_index: row.auth_index,
                failed: row.failed,
                tokens: TokenCounts {
                    input: row.input_tokens,
                    output: row.output_tokens,
                    reasoning: row.reasoning_tokens,
                    cached: row.cached_tokens,
                    total: row.total_tokens,
                },
            });
        }
        Ok(records)
    }

    /// Token sums over a half-open `[from, to)` time range.
    pub async fn aggregate(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> UsageStoreResult<UsageAggregate> {
        let from = from.format(&Rfc3339)?;
        let to = to.format(&Rfc3339)?;

        let row: Option<(i64, Option<i64>, Option<i64>, Option<i64>, Option<i64>, Option<i64>)> =
            usage_records::Entity::find()
                .select_only()
                .column_as(usage_records::Column::Id.count(), "matched_rows")
                .column_as(usage_records::Column::InputTokens.sum(), "input")
                .column_as(usage_records::Column::OutputTokens.sum(), "output")
                .column_as(usage_records::Column::ReasoningTokens.sum(), "reasoning")
                .column_as(usage_records::Column::CachedTokens.sum(), "cached")
                .column_as(usage_records::Column::TotalTokens.sum(), "total")
                .filter(usage_records::Column::Ts.gte(from))
                .filter(usage_records::Column::Ts.lt(to))
                .into_tuple()
                .one(&self.connection)
                .await?;

        let Some((matched_rows, input, output, reasoning, cached, total)) = row else {
            return Ok(UsageAggregate::default());
        };
        Ok(UsageAggregate {
            matched_rows,
            tokens: TokenCounts {
                input: input.unwrap_or(0),
                output: output.unwrap_or(0),
                reasoning: reasoning.unwrap_or(0),
                cached: cached.unwrap_or(0),
                total: total.unwrap_or(0),
            },
        })
    }

    pub async fn close(self) -> UsageStoreResult<()> {
        self.connection.close().await?;
        Ok(())
    }
}
