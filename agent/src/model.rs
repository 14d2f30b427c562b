use agent_core::timefmt::{TimeFormat, DB_TIME, LOG_TIME};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One independent extraction pipeline with its own checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Log,
    Db,
}

impl Domain {
    /// The fixed textual timestamp pattern this domain's checkpoint and
    /// records use.
    pub fn time_format(&self) -> TimeFormat {
        match self {
            Domain::Log => LOG_TIME,
            Domain::Db => DB_TIME,
        }
    }

    /// Name of the single-line checkpoint file for this domain.
    pub fn checkpoint_file(&self) -> &'static str {
        match self {
            Domain::Log => "log_last_run",
            Domain::Db => "db_last_run",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Domain::Log => write!(f, "log"),
            Domain::Db => write!(f, "db"),
        }
    }
}

/// The unit handed to the sink. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ForwardableRecord {
    /// Already-serialized payload, one sink line.
    pub payload: String,
    pub source_label: String,
    pub observed_at: Option<NaiveDateTime>,
}

/// Transient per-invocation state for one extraction cycle. Never persisted;
/// the candidate checkpoint becomes durable only through an explicit commit.
#[derive(Debug)]
pub struct ExtractionRun {
    pub started_at: NaiveDateTime,
    pub candidate_checkpoint: Option<NaiveDateTime>,
    pub success_count: usize,
}

impl ExtractionRun {
    pub fn new(started_at: NaiveDateTime) -> Self {
        Self {
            started_at,
            candidate_checkpoint: None,
            success_count: 0,
        }
    }

    /// Folds a forwarded record's timestamp into the watermark. The maximum
    /// wins even when records are visited out of chronological order.
    pub fn observe(&mut self, ts: NaiveDateTime) {
        match self.candidate_checkpoint {
            Some(current) if current >= ts => {}
            _ => self.candidate_checkpoint = Some(ts),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

/// The synthesized result of one health probe. Populated once by the probe
/// handler and never mutated by the aggregator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationHealth {
    #[serde(skip)]
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Reported when a query executed but no engine code is available to relay.
pub const UNCLASSIFIED_SQL_ERROR_CODE: i32 = -1;
/// Reported when the connection itself was unavailable.
pub const CONNECTION_ERROR_CODE: i32 = -2;

const OK_RESPONSE_CODE: i32 = 200;
const SKIP_RESPONSE_CODE: i32 = 0;

/// Terminal classification of one query execution. `Skipped` is decided
/// before the query ever reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Ok { rows: Vec<String> },
    SqlError { code: i32 },
    Skipped,
}

impl QueryOutcome {
    /// The wire code carried in the forwarded batch envelope.
    pub fn response_code(&self) -> i32 {
        match self {
            QueryOutcome::Ok { .. } => OK_RESPONSE_CODE,
            QueryOutcome::SqlError { code } => *code,
            QueryOutcome::Skipped => SKIP_RESPONSE_CODE,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, QueryOutcome::Ok { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ts(s: &str) -> NaiveDateTime {
        LOG_TIME.parse(s).unwrap()
    }

    #[test]
    fn watermark_keeps_maximum_regardless_of_visit_order() {
        let mut run = ExtractionRun::new(ts("01-Jan-2024 00:00:00.000"));
        run.observe(ts("01-Jan-2024 10:00:00.000"));
        run.observe(ts("01-Jan-2024 09:00:00.000"));
        run.observe(ts("01-Jan-2024 11:00:00.500"));
        run.observe(ts("01-Jan-2024 08:00:00.000"));
        assert_eq!(run.candidate_checkpoint, Some(ts("01-Jan-2024 11:00:00.500")));
    }

    #[test]
    fn outcome_maps_to_wire_codes() {
        assert_eq!(QueryOutcome::Ok { rows: vec![] }.response_code(), 200);
        assert_eq!(QueryOutcome::SqlError { code: -206 }.response_code(), -206);
        assert_eq!(QueryOutcome::Skipped.response_code(), 0);
    }
}
