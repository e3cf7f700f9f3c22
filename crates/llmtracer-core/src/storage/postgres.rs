//! PostgreSQL trace store

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

use super::{into_page, start_after, Completion, SpanCompletion, TraceCompletion, TraceStore};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{
    ProjectStats, PurgeReport, Span, Trace, TraceDetail, TraceListQuery, TracePage, TraceTotals,
};

const TRACE_COLUMNS: &str = "trace_id, project_id, name, status, start_time, end_time, \
    duration_ms, output, error, metadata, tags, user_id, session_id, span_count, \
    total_tokens, total_cost_usd, ttl_expiry";

const SPAN_COLUMNS: &str = "span_id, trace_id, parent_span_id, name, span_type, status, \
    start_time, end_time, duration_ms, input_data, output_data, metadata, model, \
    tokens_input, tokens_output, cost_usd, error, ttl_expiry";

/// Trace store backed by PostgreSQL
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a pool using the `[database]` section
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::StorageUnavailable(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TraceStore for PostgresStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn put_trace(&self, trace: &Trace) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO traces (
                trace_id, project_id, name, status, start_time, end_time, duration_ms,
                output, error, metadata, tags, user_id, session_id, span_count,
                total_tokens, total_cost_usd, ttl_expiry
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17
            )
            ON CONFLICT (trace_id) DO NOTHING
            "#,
        )
        .bind(&trace.trace_id)
        .bind(&trace.project_id)
        .bind(&trace.name)
        .bind(trace.status.as_str())
        .bind(trace.start_time)
        .bind(trace.end_time)
        .bind(trace.duration_ms)
        .bind(&trace.output)
        .bind(&trace.error)
        .bind(&trace.metadata)
        .bind(&trace.tags)
        .bind(&trace.user_id)
        .bind(&trace.session_id)
        .bind(trace.span_count)
        .bind(trace.total_tokens)
        .bind(trace.total_cost_usd)
        .bind(trace.ttl_expiry)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query(
                r#"
                INSERT INTO project_stats (project_id, total_traces)
                VALUES ($1, 1)
                ON CONFLICT (project_id) DO UPDATE
                SET total_traces = project_stats.total_traces + 1
                "#,
            )
            .bind(&trace.project_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn put_span(&self, span: &Span) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO spans (
                span_id, trace_id, parent_span_id, name, span_type, status, start_time,
                end_time, duration_ms, input_data, output_data, metadata, model,
                tokens_input, tokens_output, cost_usd, error, ttl_expiry
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18
            )
            ON CONFLICT (span_id) DO NOTHING
            "#,
        )
        .bind(&span.span_id)
        .bind(&span.trace_id)
        .bind(&span.parent_span_id)
        .bind(&span.name)
        .bind(span.span_type.as_str())
        .bind(span.status.as_str())
        .bind(span.start_time)
        .bind(span.end_time)
        .bind(span.duration_ms)
        .bind(&span.input_data)
        .bind(&span.output_data)
        .bind(&span.metadata)
        .bind(&span.model)
        .bind(span.tokens_input)
        .bind(span.tokens_output)
        .bind(span.cost_usd)
        .bind(&span.error)
        .bind(span.ttl_expiry)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_trace_record(&self, trace_id: &str) -> Result<Option<Trace>> {
        let row = sqlx::query(&format!(
            "SELECT {TRACE_COLUMNS} FROM traces WHERE trace_id = $1 AND ttl_expiry > NOW()"
        ))
        .bind(trace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_trace).transpose()
    }

    async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceDetail>> {
        let Some(trace) = self.get_trace_record(trace_id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(&format!(
            "SELECT {SPAN_COLUMNS} FROM spans WHERE trace_id = $1 AND ttl_expiry > NOW()"
        ))
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        let spans = rows.iter().map(row_to_span).collect::<Result<Vec<_>>>()?;
        Ok(Some(TraceDetail { trace, spans }))
    }

    async fn get_span(&self, span_id: &str) -> Result<Option<Span>> {
        let row = sqlx::query(&format!(
            "SELECT {SPAN_COLUMNS} FROM spans WHERE span_id = $1 AND ttl_expiry > NOW()"
        ))
        .bind(span_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_span).transpose()
    }

    async fn complete_span(
        &self,
        span_id: &str,
        completion: SpanCompletion,
    ) -> Result<Completion<Span>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {SPAN_COLUMNS} FROM spans WHERE span_id = $1 FOR UPDATE"
        ))
        .bind(span_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found("Span", span_id))?;
        let mut span = row_to_span(&row)?;

        if span.is_complete() {
            tx.commit().await?;
            return Ok(Completion::AlreadyCompleted(span));
        }
        completion.apply(&mut span);

        sqlx::query(
            r#"
            UPDATE spans SET
                status = $2, end_time = $3, duration_ms = $4, input_data = $5,
                output_data = $6, metadata = $7, tokens_input = $8, tokens_output = $9,
                cost_usd = $10, error = $11
            WHERE span_id = $1
            "#,
        )
        .bind(&span.span_id)
        .bind(span.status.as_str())
        .bind(span.end_time)
        .bind(span.duration_ms)
        .bind(&span.input_data)
        .bind(&span.output_data)
        .bind(&span.metadata)
        .bind(span.tokens_input)
        .bind(span.tokens_output)
        .bind(span.cost_usd)
        .bind(&span.error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Completion::Completed(span))
    }

    async fn complete_trace(
        &self,
        trace_id: &str,
        completion: TraceCompletion,
    ) -> Result<Completion<Trace>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {TRACE_COLUMNS} FROM traces WHERE trace_id = $1 FOR UPDATE"
        ))
        .bind(trace_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found("Trace", trace_id))?;
        let mut trace = row_to_trace(&row)?;

        if trace.is_complete() {
            tx.commit().await?;
            return Ok(Completion::AlreadyCompleted(trace));
        }

        let totals_row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS span_count,
                LEAST(
                    COALESCE(SUM(COALESCE(tokens_input, 0)::NUMERIC + COALESCE(tokens_output, 0)), 0),
                    9223372036854775807
                )::BIGINT AS total_tokens,
                COALESCE(SUM(cost_usd), 0)::DOUBLE PRECISION AS total_cost_usd
            FROM spans
            WHERE trace_id = $1 AND ttl_expiry > NOW()
            "#,
        )
        .bind(trace_id)
        .fetch_one(&mut *tx)
        .await?;
        let totals = TraceTotals {
            span_count: totals_row.try_get("span_count")?,
            total_tokens: totals_row.try_get("total_tokens")?,
            total_cost_usd: totals_row.try_get("total_cost_usd")?,
        };

        completion.apply_fields(&mut trace);
        trace.finish(completion.end_time, completion.status, totals);

        sqlx::query(
            r#"
            UPDATE traces SET
                status = $2, end_time = $3, duration_ms = $4, output = $5, error = $6,
                metadata = $7, span_count = $8, total_tokens = $9, total_cost_usd = $10
            WHERE trace_id = $1
            "#,
        )
        .bind(&trace.trace_id)
        .bind(trace.status.as_str())
        .bind(trace.end_time)
        .bind(trace.duration_ms)
        .bind(&trace.output)
        .bind(&trace.error)
        .bind(&trace.metadata)
        .bind(trace.span_count)
        .bind(trace.total_tokens)
        .bind(trace.total_cost_usd)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO project_stats (project_id, total_spans, total_tokens, total_cost)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (project_id) DO UPDATE SET
                total_spans = project_stats.total_spans + EXCLUDED.total_spans,
                total_tokens = LEAST(
                    project_stats.total_tokens::NUMERIC + EXCLUDED.total_tokens,
                    9223372036854775807
                )::BIGINT,
                total_cost = project_stats.total_cost + EXCLUDED.total_cost
            "#,
        )
        .bind(&trace.project_id)
        .bind(totals.span_count)
        .bind(totals.total_tokens)
        .bind(totals.total_cost_usd)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Completion::Completed(trace))
    }

    async fn list_traces(&self, query: &TraceListQuery) -> Result<TracePage> {
        let after = start_after(query)?;
        let (after_time, after_id) = match after {
            Some(cursor) => (Some(cursor.start_time), Some(cursor.trace_id)),
            None => (None, None),
        };
        let fetch = i64::try_from(query.limit + 1).map_err(|e| Error::internal(e.to_string()))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRACE_COLUMNS}
            FROM traces
            WHERE project_id = $1
              AND ttl_expiry > NOW()
              AND ($2::TIMESTAMPTZ IS NULL OR (start_time, trace_id) < ($2, $3::TEXT))
              AND ($4::TEXT IS NULL OR user_id = $4)
              AND ($5::TEXT IS NULL OR session_id = $5)
              AND ($6::TEXT IS NULL OR status = $6)
              AND (CARDINALITY($7::TEXT[]) = 0 OR tags && $7)
            ORDER BY start_time DESC, trace_id DESC
            LIMIT $8
            "#
        ))
        .bind(&query.project_id)
        .bind(after_time)
        .bind(after_id)
        .bind(&query.user_id)
        .bind(&query.session_id)
        .bind(query.status.map(|s| s.as_str()))
        .bind(&query.tags)
        .bind(fetch)
        .fetch_all(&self.pool)
        .await?;

        let traces = rows.iter().map(row_to_trace).collect::<Result<Vec<_>>>()?;
        into_page(traces, query.limit)
    }

    async fn get_stats(&self, project_id: &str) -> Result<ProjectStats> {
        let row = sqlx::query(
            r#"
            SELECT total_traces, total_spans, total_tokens, total_cost
            FROM project_stats
            WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(ProjectStats::default());
        };
        Ok(ProjectStats {
            total_traces: row.try_get("total_traces")?,
            total_spans: row.try_get("total_spans")?,
            total_tokens: row.try_get("total_tokens")?,
            total_cost: row.try_get("total_cost")?,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            r#"
            DELETE FROM traces
            WHERE ttl_expiry <= $1
            RETURNING trace_id, project_id, status, span_count, total_tokens, total_cost_usd
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut trace_ids = Vec::with_capacity(removed.len());
        let mut per_project: HashMap<String, ProjectStats> = HashMap::new();
        for row in &removed {
            trace_ids.push(row.try_get::<String, _>("trace_id")?);
            let project_id: String = row.try_get("project_id")?;
            let status: String = row.try_get("status")?;

            let delta = per_project.entry(project_id).or_default();
            delta.total_traces += 1;
            if status != "open" {
                delta.total_spans = delta
                    .total_spans
                    .saturating_add(row.try_get::<i64, _>("span_count")?);
                delta.total_tokens = delta
                    .total_tokens
                    .saturating_add(row.try_get::<i64, _>("total_tokens")?);
                delta.total_cost += row.try_get::<f64, _>("total_cost_usd")?;
            }
        }

        for (project_id, delta) in &per_project {
            sqlx::query(
                r#"
                UPDATE project_stats SET
                    total_traces = total_traces - $2,
                    total_spans = GREATEST(total_spans - $3, 0),
                    total_tokens = GREATEST(total_tokens - $4, 0),
                    total_cost = total_cost - $5
                WHERE project_id = $1
                "#,
            )
            .bind(project_id)
            .bind(delta.total_traces)
            .bind(delta.total_spans)
            .bind(delta.total_tokens)
            .bind(delta.total_cost)
            .execute(&mut *tx)
            .await?;
        }

        let spans = sqlx::query("DELETE FROM spans WHERE ttl_expiry <= $1 OR trace_id = ANY($2)")
            .bind(now)
            .bind(&trace_ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        let report = PurgeReport {
            traces: removed.len() as u64,
            spans,
        };
        debug!(traces = report.traces, spans = report.spans, "purged expired records");
        Ok(report)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Ok(())
    }
}

fn row_to_trace(row: &PgRow) -> Result<Trace> {
    Ok(Trace {
        trace_id: row.try_get("trace_id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_ms: row.try_get("duration_ms")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        metadata: row.try_get("metadata")?,
        tags: row.try_get("tags")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        span_count: row.try_get("span_count")?,
        total_tokens: row.try_get("total_tokens")?,
        total_cost_usd: row.try_get("total_cost_usd")?,
        ttl_expiry: row.try_get("ttl_expiry")?,
    })
}

fn row_to_span(row: &PgRow) -> Result<Span> {
    Ok(Span {
        span_id: row.try_get("span_id")?,
        trace_id: row.try_get("trace_id")?,
        parent_span_id: row.try_get("parent_span_id")?,
        name: row.try_get("name")?,
        span_type: row.try_get::<String, _>("span_type")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_ms: row.try_get("duration_ms")?,
        input_data: row.try_get("input_data")?,
        output_data: row.try_get("output_data")?,
        metadata: row.try_get("metadata")?,
        model: row.try_get("model")?,
        tokens_input: row.try_get("tokens_input")?,
        tokens_output: row.try_get("tokens_output")?,
        cost_usd: row.try_get("cost_usd")?,
        error: row.try_get("error")?,
        ttl_expiry: row.try_get("ttl_expiry")?,
    })
}
