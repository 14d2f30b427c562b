use crate::checkpoint::CheckpointStore;
use crate::forward::{Envelope, Forwarder};
use crate::model::{
    Domain, ForwardableRecord, QueryOutcome, CONNECTION_ERROR_CODE, UNCLASSIFIED_SQL_ERROR_CODE,
};
use agent_core::config::{QuerySchedule, QuerySource};
use agent_core::timefmt::{replace_token, DB_TIME};
use agent_core::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::TryStreamExt;
use metrics::histogram;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// The two independent polling cadences. Only the short horizon is
/// checkpoint-filtered; long-horizon queries aggregate historical ranges
/// and run unfiltered by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizon {
    Short,
    Long,
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Horizon::Short => write!(f, "short-horizon"),
            Horizon::Long => write!(f, "long-horizon"),
        }
    }
}

/// Polls the configured SQL templates, serializes result rows, forwards
/// each batch, and advances the database checkpoint after a short-horizon
/// batch with at least one successful query.
pub struct DbExtractor {
    pool: PgPool,
    max_rows: u32,
    short: QuerySchedule,
    long: QuerySchedule,
    checkpoints: Arc<CheckpointStore>,
    forwarder: Arc<dyn Forwarder>,
    envelope: Envelope,
}

impl DbExtractor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        max_rows: u32,
        short: QuerySchedule,
        long: QuerySchedule,
        checkpoints: Arc<CheckpointStore>,
        forwarder: Arc<dyn Forwarder>,
        envelope: Envelope,
    ) -> Self {
        Self {
            pool,
            max_rows,
            short,
            long,
            checkpoints,
            forwarder,
            envelope,
        }
    }

    /// One scheduled batch over every configured query slot. A rejected
    /// query is classified and reported without aborting its siblings.
    #[instrument(skip(self))]
    pub async fn run_scheduled(&self, horizon: Horizon) -> Result<()> {
        let schedule = match horizon {
            Horizon::Short => &self.short,
            Horizon::Long => &self.long,
        };
        info!(
            horizon = %horizon,
            queries = schedule.queries.len(),
            "Starting scheduled database extraction"
        );

        let window = match horizon {
            Horizon::Short => Some(self.checkpoints.load(Domain::Db).await),
            Horizon::Long => None,
        };

        let mut ok_queries = 0usize;
        for slot in &schedule.queries {
            let (outcome, elapsed_ms) = self.execute_slot(slot, window).await;
            if outcome.is_ok() {
                ok_queries += 1;
            }
            if let Err(e) = self.report(&outcome, &slot.method, elapsed_ms).await {
                error!(method = %slot.method, error = %e, "Failed to forward query results");
            }
        }

        if horizon == Horizon::Short && ok_queries > 0 {
            // The committed value is the batch completion time, not a record
            // watermark. A partial batch (some OK, some rejected) advances
            // the window for every slot, including the failed ones.
            if let Err(e) = self.checkpoints.commit_now(Domain::Db).await {
                error!(error = %e, "Failed to persist db checkpoint");
            }
        }

        info!(horizon = %horizon, ok_queries, "Finished scheduled database extraction");
        Ok(())
    }

    /// On-demand execution of one literal query. `Skipped` and classified
    /// engine rejections surface as explicit failures; the interactive
    /// caller always gets a definite answer.
    pub async fn run_query(&self, query: &str, forward: bool) -> Result<Vec<String>> {
        let slot = QuerySource {
            query: query.to_string(),
            method: "custom_query".to_string(),
        };
        let (outcome, elapsed_ms) = self.execute_slot(&slot, None).await;

        if forward {
            self.report(&outcome, &slot.method, elapsed_ms).await?;
        }

        match outcome {
            QueryOutcome::Ok { rows } => Ok(rows),
            QueryOutcome::SqlError { code } => Err(Error::QueryRejected { code }),
            QueryOutcome::Skipped => Err(Error::QueryNotConfigured),
        }
    }

    async fn execute_slot(
        &self,
        slot: &QuerySource,
        window: Option<NaiveDateTime>,
    ) -> (QueryOutcome, u64) {
        let sql = match render_query(&slot.query, window) {
            Some(sql) => sql,
            None => return (QueryOutcome::Skipped, 0),
        };
        debug!(method = %slot.method, sql = %sql, "Executing query");

        let started = Instant::now();
        let outcome = self.fetch_rows(&sql).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        histogram!("agent_db_query_duration_ms", "method" => slot.method.clone())
            .record(elapsed_ms as f64);
        (outcome, elapsed_ms)
    }

    /// Streams at most `max_rows` result rows, serializing each one
    /// independently. A row that fails to decode is dropped and logged; an
    /// engine rejection terminates the query with a classified code.
    async fn fetch_rows(&self, sql: &str) -> QueryOutcome {
        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut rows = Vec::new();
        let mut fetched = 0u32;

        while fetched < self.max_rows {
            match stream.try_next().await {
                Ok(Some(row)) => {
                    fetched += 1;
                    match row_to_json(&row) {
                        Ok(serialized) => rows.push(serialized),
                        Err(e) => warn!(error = %e, "Dropping row that failed to serialize"),
                    }
                }
                Ok(None) => break,
                Err(e) => return classify_sql_error(&e),
            }
        }

        QueryOutcome::Ok { rows }
    }

    /// Wraps a terminal outcome in the batch envelope and forwards it.
    /// `Skipped` slots produce nothing.
    async fn report(&self, outcome: &QueryOutcome, method: &str, elapsed_ms: u64) -> Result<()> {
        let rows: &[String] = match outcome {
            QueryOutcome::Ok { rows } => rows,
            QueryOutcome::SqlError { .. } => &[],
            QueryOutcome::Skipped => {
                debug!(method = %method, "Nothing configured at this slot, not forwarding");
                return Ok(());
            }
        };

        let payload = self
            .envelope
            .db_batch(rows, method, outcome.response_code(), elapsed_ms)?;
        self.forwarder
            .forward(&ForwardableRecord {
                payload,
                source_label: method.to_string(),
                observed_at: None,
            })
            .await
    }
}

/// Renders a query template for execution. `None` means the slot holds no
/// query. With a checkpoint window, the single `<<...>>` token becomes the
/// quoted checkpoint literal; without one the template runs as-is.
fn render_query(template: &str, window: Option<NaiveDateTime>) -> Option<String> {
    if template.trim().is_empty() {
        return None;
    }
    Some(match window {
        Some(checkpoint) => replace_token(template, &format!("'{}'", DB_TIME.format(checkpoint))),
        None => template.to_string(),
    })
}

fn classify_sql_error(e: &sqlx::Error) -> QueryOutcome {
    let code = match e {
        // Engine rejection: relay the engine's own code when it is numeric.
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            .unwrap_or(UNCLASSIFIED_SQL_ERROR_CODE),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            CONNECTION_ERROR_CODE
        }
        _ => UNCLASSIFIED_SQL_ERROR_CODE,
    };
    warn!(error = %e, code, "Query failed");
    QueryOutcome::SqlError { code }
}

fn row_to_json(row: &PgRow) -> Result<String> {
    let mut doc = serde_json::Map::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index, column.type_info().name())?;
        doc.insert(column.name().to_string(), value);
    }
    Ok(serde_json::Value::Object(doc).to_string())
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Result<serde_json::Value> {
    use serde_json::Value;

    let value = match type_name {
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::from),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(Value::from),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::from),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(index)?
            .map(|v| Value::String(v.to_string())),
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::from),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(|v| Value::String(DB_TIME.format(v))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|v| Value::String(v.to_rfc3339())),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(|v| Value::String(v.to_string())),
        _ => row.try_get::<Option<String>, _>(index)?.map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_horizon_substitutes_quoted_checkpoint_literal() {
        let checkpoint = DB_TIME.parse("2024-03-05 12:00:00.000000").unwrap();
        let rendered = render_query(
            "SELECT * FROM tx WHERE created_at > <<LAST_RUN>>",
            Some(checkpoint),
        );
        assert_eq!(
            rendered.unwrap(),
            "SELECT * FROM tx WHERE created_at > '2024-03-05 12:00:00.000000'"
        );
    }

    #[test]
    fn long_horizon_leaves_the_template_untouched() {
        let rendered = render_query("SELECT count(*) FROM tx WHERE day = <<TOKEN>>", None);
        assert_eq!(
            rendered.unwrap(),
            "SELECT count(*) FROM tx WHERE day = <<TOKEN>>"
        );
    }

    #[test]
    fn rendering_is_deterministic_for_an_unmoved_checkpoint() {
        let checkpoint = DB_TIME.parse("2024-03-05 12:00:00.000000").unwrap();
        let template = "SELECT * FROM tx WHERE created_at > <<LAST_RUN>>";
        assert_eq!(
            render_query(template, Some(checkpoint)),
            render_query(template, Some(checkpoint))
        );
    }

    #[test]
    fn empty_slot_is_skipped_before_reaching_the_engine() {
        assert_eq!(render_query("", None), None);
        assert_eq!(render_query("   ", Some(DB_TIME.parse("2024-03-05 12:00:00.000000").unwrap())), None);
    }

    #[test]
    fn connection_failures_use_the_connection_class_code() {
        let outcome = classify_sql_error(&sqlx::Error::PoolTimedOut);
        assert_eq!(
            outcome,
            QueryOutcome::SqlError {
                code: CONNECTION_ERROR_CODE
            }
        );
    }

    #[test]
    fn unrecognized_failures_fall_back_to_the_unclassified_code() {
        let outcome = classify_sql_error(&sqlx::Error::RowNotFound);
        assert_eq!(
            outcome,
            QueryOutcome::SqlError {
                code: UNCLASSIFIED_SQL_ERROR_CODE
            }
        );
    }
}
