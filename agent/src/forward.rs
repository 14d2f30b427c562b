use crate::model::ForwardableRecord;
use agent_core::backoff::retry_with_backoff;
use agent_core::config::AgentConfig;
use agent_core::{Error, Result};
use async_trait::async_trait;
use chrono::Local;
use metrics::counter;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

const STAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// The external sink collaborator: durably records one serialized payload
/// per line for downstream pickup.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, record: &ForwardableRecord) -> Result<()>;
}

/// Appends records to a flat file tailed by the external log shipper.
/// Delivery is at-least-once: writes are retried with backoff and the
/// checkpoint only advances after a successful hand-off.
pub struct FileSink {
    path: PathBuf,
    max_retries: u32,
    retry_base_delay_ms: u64,
    forwarded: AtomicU64,
}

impl FileSink {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            path: PathBuf::from(&config.sink_path),
            max_retries: config.max_retries,
            retry_base_delay_ms: config.retry_base_delay_ms,
            forwarded: AtomicU64::new(0),
        }
    }

    async fn append(&self, record: &ForwardableRecord) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(record.payload.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Process-local count of records handed off since startup.
    pub fn forwarded_count(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Forwarder for FileSink {
    async fn forward(&self, record: &ForwardableRecord) -> Result<()> {
        retry_with_backoff(
            || self.append(record),
            self.max_retries,
            self.retry_base_delay_ms,
            "sink_append",
        )
        .await
        .map_err(|e| Error::Forward(format!("sink write failed: {e}")))?;

        let count = self.forwarded.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("agent_records_forwarded", "source" => record.source_label.clone()).increment(1);
        debug!(source = %record.source_label, total = count, "Forwarded record");
        Ok(())
    }
}

/// Stamps outbound payloads with the identity fields every forwarded
/// document carries.
#[derive(Clone)]
pub struct Envelope {
    host: String,
    ip_address: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogLineDoc<'a> {
    date_time: String,
    uniqueid: String,
    host: &'a str,
    message: &'a str,
    file_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DbBatchDoc<'a> {
    date_time: String,
    uniqueid: String,
    host: &'a str,
    response_code: i32,
    response_time_ms: u64,
    method_name: &'a str,
    query_results: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReportDoc<'a> {
    date_time: String,
    uniqueid: String,
    host: &'a str,
    ip_address: &'a str,
    project_name: &'a str,
    method_name: &'a str,
    response_time_ms: u64,
    /// Pre-rendered merged document, ordering preserved as produced by the
    /// aggregator.
    app_status: &'a str,
}

impl Envelope {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            host: config.host.clone(),
            ip_address: config.ip_address.clone(),
        }
    }

    fn stamp() -> (String, String) {
        let date_time = Local::now().format(STAMP_FORMAT).to_string();
        let uniqueid = Uuid::new_v4().to_string();
        (date_time, uniqueid)
    }

    pub fn log_line(&self, message: &str, file_name: &str) -> Result<String> {
        let (date_time, uniqueid) = Self::stamp();
        let doc = LogLineDoc {
            date_time,
            uniqueid,
            host: &self.host,
            message,
            file_name,
        };
        Ok(serde_json::to_string(&doc)?)
    }

    pub fn db_batch(
        &self,
        rows: &[String],
        method_name: &str,
        response_code: i32,
        response_time_ms: u64,
    ) -> Result<String> {
        let (date_time, uniqueid) = Self::stamp();
        let doc = DbBatchDoc {
            date_time,
            uniqueid,
            host: &self.host,
            response_code,
            response_time_ms,
            method_name,
            query_results: rows,
        };
        Ok(serde_json::to_string(&doc)?)
    }

    pub fn health_report(
        &self,
        app_status: &str,
        project_name: &str,
        method_name: &str,
        response_time_ms: u64,
    ) -> Result<String> {
        let (date_time, uniqueid) = Self::stamp();
        let doc = HealthReportDoc {
            date_time,
            uniqueid,
            host: &self.host,
            ip_address: &self.ip_address,
            project_name,
            method_name,
            response_time_ms,
            app_status,
        };
        Ok(serde_json::to_string(&doc)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_config(sink: &str) -> AgentConfig {
        AgentConfig {
            host: "store-42".to_string(),
            ip_address: "10.0.0.42".to_string(),
            project_name: "test-project".to_string(),
            sink_path: sink.to_string(),
            max_retries: 2,
            retry_base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn sink_appends_one_line_per_record() {
        let tmp = tempfile::tempdir().unwrap();
        let sink_path = tmp.path().join("out.log");
        let sink = FileSink::new(&test_config(&sink_path.to_string_lossy()));

        for payload in ["{\"a\":1}", "{\"b\":2}"] {
            sink.forward(&ForwardableRecord {
                payload: payload.to_string(),
                source_label: "test".to_string(),
                observed_at: None,
            })
            .await
            .unwrap();
        }

        let written = std::fs::read_to_string(&sink_path).unwrap();
        assert_eq!(written, "{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(sink.forwarded_count(), 2);
    }

    #[test]
    fn log_line_envelope_carries_identity_and_message() {
        let envelope = Envelope::new(&test_config("unused"));
        let payload = envelope.log_line("ERROR something", "app.log").unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(value["host"], "store-42");
        assert_eq!(value["message"], "ERROR something");
        assert_eq!(value["fileName"], "app.log");
        assert!(value["uniqueid"].as_str().is_some());
    }

    #[test]
    fn db_batch_envelope_reports_code_and_timing() {
        let envelope = Envelope::new(&test_config("unused"));
        let rows = vec!["{\"total\":11}".to_string()];
        let payload = envelope.db_batch(&rows, "tx_count", 200, 37).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(value["responseCode"], 200);
        assert_eq!(value["responseTimeMs"], 37);
        assert_eq!(value["methodName"], "tx_count");
        assert_eq!(value["queryResults"][0], "{\"total\":11}");
    }
}
