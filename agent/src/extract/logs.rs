use crate::checkpoint::CheckpointStore;
use crate::filter::{check_mode_for, is_eligible, CheckMode};
use crate::forward::{Envelope, Forwarder};
use crate::model::{Domain, ExtractionRun, ForwardableRecord};
use agent_core::config::LogSource;
use agent_core::timefmt::{resolve_date_token, LOG_TIME};
use agent_core::{Error, Result};
use chrono::{Local, NaiveDateTime};
use metrics::{counter, histogram};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, instrument, warn};

/// Tails the configured log files by timestamp: each scheduled run scans
/// only the window after the log-domain checkpoint and advances it once the
/// forwarded records are safely handed off.
pub struct LogExtractor {
    sources: Vec<LogSource>,
    checkpoints: Arc<CheckpointStore>,
    forwarder: Arc<dyn Forwarder>,
    envelope: Envelope,
}

impl LogExtractor {
    pub fn new(
        sources: Vec<LogSource>,
        checkpoints: Arc<CheckpointStore>,
        forwarder: Arc<dyn Forwarder>,
        envelope: Envelope,
    ) -> Self {
        Self {
            sources,
            checkpoints,
            forwarder,
            envelope,
        }
    }

    /// One scheduled extraction cycle over every configured source. A bad
    /// source is logged and skipped; it never aborts the run. The checkpoint
    /// advances only when at least one record was forwarded.
    #[instrument(skip(self))]
    pub async fn run_scheduled(&self) -> Result<()> {
        info!(sources = self.sources.len(), "Starting scheduled log extraction");

        let checkpoint = self.checkpoints.load(Domain::Log).await;
        let mut run = ExtractionRun::new(Local::now().naive_local());
        let today = Local::now().date_naive();

        for source in &self.sources {
            let path = resolve_date_token(&source.path, today);
            match self
                .extract_file(
                    &path,
                    &source.search,
                    &source.exclude,
                    Some(checkpoint),
                    Some(&mut run),
                )
                .await
            {
                Ok(forwarded) => debug!(path = %path, forwarded, "Source complete"),
                Err(e) => {
                    error!(path = %path, error = %e, "Skipping log source");
                    counter!("agent_log_source_failures").increment(1);
                }
            }
        }

        if run.success_count > 0 {
            if let Some(candidate) = run.candidate_checkpoint {
                if let Err(e) = self.checkpoints.commit(Domain::Log, candidate).await {
                    // Non-fatal: the next run reuses the stale in-memory value.
                    error!(error = %e, "Failed to persist log checkpoint");
                }
            }
        } else {
            debug!("No records forwarded, checkpoint not advanced");
        }

        info!(forwarded = run.success_count, "Finished scheduled log extraction");
        Ok(())
    }

    /// On-demand extraction of one explicit file. Always keyword-only; the
    /// checkpoint applies to the scheduled path exclusively.
    pub async fn run_once(
        &self,
        path: &str,
        search: &[String],
        exclude: &[String],
    ) -> Result<usize> {
        if search.is_empty() {
            return Err(Error::Extraction {
                source_name: path.to_string(),
                details: "no search keywords provided".to_string(),
            });
        }
        self.extract_file(path, search, exclude, None, None).await
    }

    async fn extract_file(
        &self,
        path: &str,
        search: &[String],
        exclude: &[String],
        window: Option<NaiveDateTime>,
        mut run: Option<&mut ExtractionRun>,
    ) -> Result<usize> {
        let started = Instant::now();
        let file_name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path)
            .to_string();

        // The first record decides the mode for the entire run of this
        // source: no valid timestamp prefix means keyword-only, never a
        // hybrid.
        let mode = match window {
            Some(_) => {
                let first = self.first_line(path).await?;
                let mode = check_mode_for(first.as_deref(), LOG_TIME);
                if mode == CheckMode::KeywordOnly {
                    warn!(path = %path, "First record has no timestamp prefix, keyword-only for this run");
                }
                mode
            }
            None => CheckMode::KeywordOnly,
        };

        let checkpoint = window.unwrap_or_default();
        let now = Local::now().naive_local();

        let file = tokio::fs::File::open(path).await.map_err(|e| Error::Extraction {
            source_name: path.to_string(),
            details: format!("open failed: {e}"),
        })?;
        let mut lines = BufReader::new(file).lines();
        let mut forwarded = 0usize;

        while let Some(line) = lines.next_line().await.map_err(|e| Error::Extraction {
            source_name: path.to_string(),
            details: format!("read failed: {e}"),
        })? {
            if !is_eligible(&line, checkpoint, search, exclude, mode, now, LOG_TIME) {
                continue;
            }

            let payload = match self.envelope.log_line(&line, &file_name) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Dropping record that failed to serialize");
                    continue;
                }
            };
            let observed_at = LOG_TIME.parse_prefix(&line);

            self.forwarder
                .forward(&ForwardableRecord {
                    payload,
                    source_label: file_name.clone(),
                    observed_at,
                })
                .await?;
            forwarded += 1;

            if let Some(run) = run.as_deref_mut() {
                run.success_count += 1;
                // The watermark tracks only timestamp-filtered records.
                if mode == CheckMode::DateFiltered {
                    if let Some(ts) = observed_at {
                        run.observe(ts);
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        histogram!("agent_log_extract_duration_ms").record(elapsed.as_millis() as f64);
        info!(
            path = %path,
            forwarded,
            duration_ms = elapsed.as_millis() as u64,
            "Extracted log source"
        );
        Ok(forwarded)
    }

    async fn first_line(&self, path: &str) -> Result<Option<String>> {
        let file = tokio::fs::File::open(path).await.map_err(|e| Error::Extraction {
            source_name: path.to_string(),
            details: format!("open failed: {e}"),
        })?;
        let mut lines = BufReader::new(file).lines();
        lines.next_line().await.map_err(|e| Error::Extraction {
            source_name: path.to_string(),
            details: format!("read failed: {e}"),
        })
    }
}
