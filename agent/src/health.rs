use crate::forward::{Envelope, Forwarder};
use crate::model::{ApplicationHealth, ForwardableRecord, HealthStatus};
use agent_core::config::{AgentConfig, HealthConfig, HealthEndpoint};
use agent_core::Result;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Placeholder carried when a probe produced no error text of its own.
const NO_ERROR: &str = "NA";

/// Gateway-timeout code reported when the probe never got an HTTP response.
const TRANSPORT_FAILURE_CODE: u16 = 504;

/// Deepest nesting level the error search descends into a response body.
const ERROR_SEARCH_DEPTH: usize = 8;

const ERROR_TEXT_LIMIT: usize = 200;

/// Probes every configured endpoint concurrently and merges the results
/// into one deterministic report.
pub struct HealthAggregator {
    client: reqwest::Client,
    endpoints: Vec<HealthEndpoint>,
    project_name: String,
    forwarder: Arc<dyn Forwarder>,
    envelope: Envelope,
}

impl HealthAggregator {
    pub fn new(
        health: &HealthConfig,
        agent: &AgentConfig,
        forwarder: Arc<dyn Forwarder>,
        envelope: Envelope,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(health.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoints: health.endpoints.clone(),
            project_name: agent.project_name.clone(),
            forwarder,
            envelope,
        })
    }

    /// Probes all endpoints, one task each, and blocks until every probe
    /// settles. A slow or failing endpoint never delays a sibling's result.
    pub async fn extract_health(&self) -> Vec<ApplicationHealth> {
        let probes = self.endpoints.iter().map(|endpoint| {
            let client = self.client.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move { probe(client, endpoint).await })
        });

        let mut results = Vec::with_capacity(self.endpoints.len());
        for (joined, endpoint) in join_all(probes).await.into_iter().zip(&self.endpoints) {
            match joined {
                Ok(health) => results.push(health),
                Err(e) => {
                    error!(endpoint = %endpoint.name, error = %e, "Health probe task failed");
                    results.push(ApplicationHealth {
                        name: endpoint.name.clone(),
                        status: HealthStatus::Unknown,
                        http_code: None,
                        error: Some(NO_ERROR.to_string()),
                        details: None,
                    });
                }
            }
        }
        results
    }

    /// One full health cycle: probe, merge, and optionally forward the
    /// wrapped report. Returns the merged document either way.
    #[instrument(skip(self))]
    pub async fn snapshot(&self, forward: bool) -> Result<String> {
        let started = Instant::now();
        let results = self.extract_health().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        for app in &results {
            counter!(
                "agent_health_probes",
                "endpoint" => app.name.clone(),
                "status" => match app.status {
                    HealthStatus::Up => "up",
                    HealthStatus::Down => "down",
                    HealthStatus::Unknown => "unknown",
                }
            )
            .increment(1);
        }
        histogram!("agent_health_snapshot_duration_ms").record(elapsed_ms as f64);

        let merged = merge_report(&results)?;
        info!(endpoints = results.len(), elapsed_ms, "Health snapshot complete");

        if forward {
            let payload = self.envelope.health_report(
                &merged,
                &self.project_name,
                "health_metrics",
                elapsed_ms,
            )?;
            self.forwarder
                .forward(&ForwardableRecord {
                    payload,
                    source_label: "health".to_string(),
                    observed_at: None,
                })
                .await?;
        }

        Ok(merged)
    }
}

async fn probe(client: reqwest::Client, endpoint: HealthEndpoint) -> ApplicationHealth {
    debug!(endpoint = %endpoint.name, url = %endpoint.url, "Probing");

    let mut request = client.get(&endpoint.url);
    for header in &endpoint.headers {
        if let Some((name, value)) = header.split_once(':') {
            request = request.header(name.trim(), value.trim());
        } else {
            warn!(endpoint = %endpoint.name, header = %header, "Ignoring malformed header");
        }
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(endpoint = %endpoint.name, error = %e, "Health probe transport failure");
            return ApplicationHealth {
                name: endpoint.name,
                status: HealthStatus::Down,
                http_code: Some(TRANSPORT_FAILURE_CODE),
                error: Some(truncate_error(&e.to_string())),
                details: None,
            };
        }
    };

    let http_code = response.status().as_u16();
    let error_class = response.status().is_client_error() || response.status().is_server_error();
    let body: Option<Value> = response.json().await.ok();

    // The body's own top-level error field is adopted before the status
    // decision; an endpoint reporting an error is Down even on a 200.
    let body_error = body.as_ref().and_then(|b| b.get("error")).map(|found| {
        match found {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    });

    let status = if error_class || body_error.is_some() {
        HealthStatus::Down
    } else if endpoint.expect_status {
        let reported_up = body
            .as_ref()
            .and_then(|b| b.get("status"))
            .and_then(Value::as_str)
            == Some("UP");
        if reported_up {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        }
    } else {
        HealthStatus::Up
    };

    let error = body_error
        .or_else(|| body.as_ref().and_then(|b| find_error(b, ERROR_SEARCH_DEPTH)))
        .map(|text| truncate_error(&text))
        .unwrap_or_else(|| NO_ERROR.to_string());

    let details = if endpoint.with_details {
        body.as_ref().and_then(|b| b.get("details")).cloned()
    } else {
        None
    };

    ApplicationHealth {
        name: endpoint.name,
        status,
        http_code: Some(http_code),
        error: Some(error),
        details,
    }
}

/// Depth-first search for the first key literally named `error` anywhere in
/// the body, bounded so a pathological document cannot recurse unboundedly.
fn find_error(value: &Value, depth: usize) -> Option<String> {
    if depth == 0 {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get("error") {
                return Some(match found {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
            map.values().find_map(|v| find_error(v, depth - 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_error(v, depth - 1)),
        _ => None,
    }
}

/// Renders the merged report with entries ordered reverse-lexicographically
/// by endpoint name, so the document is identical regardless of which probe
/// settled first.
fn merge_report(results: &[ApplicationHealth]) -> Result<String> {
    let mut ordered: Vec<&ApplicationHealth> = results.iter().collect();
    ordered.sort_by(|a, b| b.name.cmp(&a.name));

    let mut parts = Vec::with_capacity(ordered.len());
    for app in ordered {
        parts.push(format!(
            "{}:{}",
            serde_json::to_string(&app.name)?,
            serde_json::to_string(app)?
        ));
    }
    Ok(format!("{{{}}}", parts.join(",")))
}

fn truncate_error(text: &str) -> String {
    text.chars().take(ERROR_TEXT_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn find_error_returns_the_first_nested_error_key() {
        let body = json!({
            "status": "DOWN",
            "details": {
                "db": { "status": "UP" },
                "queue": { "status": "DOWN", "error": "broker unreachable" }
            }
        });
        assert_eq!(
            find_error(&body, ERROR_SEARCH_DEPTH),
            Some("broker unreachable".to_string())
        );
    }

    #[test]
    fn find_error_renders_non_string_errors_and_respects_the_depth_bound() {
        let body = json!({ "details": { "io": { "error": { "code": 13 } } } });
        assert_eq!(
            find_error(&body, ERROR_SEARCH_DEPTH),
            Some("{\"code\":13}".to_string())
        );
        assert_eq!(find_error(&body, 2), None);
    }

    #[test]
    fn merged_report_is_reverse_lexicographic_by_name() {
        let app = |name: &str| ApplicationHealth {
            name: name.to_string(),
            status: HealthStatus::Up,
            http_code: Some(200),
            error: Some("NA".to_string()),
            details: None,
        };
        let forward = merge_report(&[app("alpha"), app("mid"), app("zeta")]).unwrap();
        let reverse = merge_report(&[app("zeta"), app("mid"), app("alpha")]).unwrap();

        assert_eq!(forward, reverse);
        let alpha = forward.find("\"alpha\"").unwrap();
        let mid = forward.find("\"mid\"").unwrap();
        let zeta = forward.find("\"zeta\"").unwrap();
        assert!(zeta < mid && mid < alpha);
    }

    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/actuator/health")
    }

    async fn unreachable_url() -> String {
        // Bind then drop so the port is free and the connection refused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/actuator/health")
    }

    fn endpoint(name: &str, url: &str, expect_status: bool) -> HealthEndpoint {
        HealthEndpoint {
            name: name.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            expect_status,
            with_details: false,
        }
    }

    fn probe_client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_millis(2_000))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn probe_accepts_a_body_reporting_up() {
        let url = serve_once("HTTP/1.1 200 OK", "{\"status\":\"UP\"}").await;
        let health = probe(probe_client(), endpoint("orders", &url, true)).await;

        assert_eq!(health.status, HealthStatus::Up);
        assert_eq!(health.http_code, Some(200));
        assert_eq!(health.error.as_deref(), Some("NA"));
    }

    #[tokio::test]
    async fn body_error_field_forces_down_even_with_up_status() {
        let url = serve_once("HTTP/1.1 200 OK", "{\"status\":\"UP\",\"error\":\"boom\"}").await;
        let health = probe(probe_client(), endpoint("orders", &url, true)).await;

        assert_eq!(health.status, HealthStatus::Down);
        assert_eq!(health.http_code, Some(200));
        assert_eq!(health.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn probe_downgrades_a_successful_response_with_a_down_body() {
        let url = serve_once("HTTP/1.1 200 OK", "{\"status\":\"DOWN\"}").await;
        let health = probe(probe_client(), endpoint("orders", &url, true)).await;

        assert_eq!(health.status, HealthStatus::Down);
        assert_eq!(health.http_code, Some(200));
    }

    #[tokio::test]
    async fn probe_without_status_expectation_is_up_on_any_ok_code() {
        let url = serve_once("HTTP/1.1 204 No Content", "").await;
        let health = probe(probe_client(), endpoint("ping", &url, false)).await;

        assert_eq!(health.status, HealthStatus::Up);
        assert_eq!(health.http_code, Some(204));
    }

    #[tokio::test]
    async fn transport_failure_reports_gateway_timeout() {
        let url = unreachable_url().await;
        let health = probe(probe_client(), endpoint("gone", &url, true)).await;

        assert_eq!(health.status, HealthStatus::Down);
        assert_eq!(health.http_code, Some(TRANSPORT_FAILURE_CODE));
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn hanging_endpoint_times_out_without_delaying_a_fast_sibling() {
        // Accepts the connection but never answers; the probe must give up
        // at its own timeout.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((_socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
        let hang_url = format!("http://{addr}/actuator/health");
        let up_url = serve_once("HTTP/1.1 200 OK", "{\"status\":\"UP\"}").await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let started = std::time::Instant::now();
        let (fast, hung) = tokio::join!(
            probe(client.clone(), endpoint("fast", &up_url, true)),
            probe(client, endpoint("hung", &hang_url, true)),
        );

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fast.status, HealthStatus::Up);
        assert_eq!(hung.status, HealthStatus::Down);
        assert_eq!(hung.http_code, Some(TRANSPORT_FAILURE_CODE));
    }

    #[tokio::test]
    async fn one_failing_endpoint_does_not_disturb_its_siblings() {
        let up_url = serve_once("HTTP/1.1 200 OK", "{\"status\":\"UP\"}").await;
        let down_url = unreachable_url().await;

        let config = HealthConfig {
            interval_secs: 300,
            timeout_ms: 2_000,
            endpoints: vec![
                endpoint("steady", &up_url, true),
                endpoint("flaky", &down_url, true),
            ],
        };
        let agent = AgentConfig {
            host: "test-host".to_string(),
            ip_address: "127.0.0.1".to_string(),
            project_name: "test-project".to_string(),
            sink_path: "unused".to_string(),
            max_retries: 1,
            retry_base_delay_ms: 1,
        };
        let forwarder: Arc<dyn Forwarder> = Arc::new(NullForwarder);
        let aggregator =
            HealthAggregator::new(&config, &agent, forwarder, Envelope::new(&agent)).unwrap();

        let results = aggregator.extract_health().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "steady");
        assert_eq!(results[0].status, HealthStatus::Up);
        assert_eq!(results[1].name, "flaky");
        assert_eq!(results[1].status, HealthStatus::Down);
    }

    struct NullForwarder;

    #[async_trait::async_trait]
    impl Forwarder for NullForwarder {
        async fn forward(&self, _record: &ForwardableRecord) -> Result<()> {
            Ok(())
        }
    }
}
