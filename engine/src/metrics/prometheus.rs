//! Prometheus queries and Grafana annotations over HTTP

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::config::settings::MonitoringSettings;
use crate::errors::DeployError;
use crate::metrics::{DeploymentAnnotation, MetricsBackend};
use crate::utils::render_template;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpMetricsBackend {
    client: reqwest::Client,
    query_url: Url,
    annotations_url: Option<Url>,
    grafana_token: Option<SecretString>,
    error_rate_query: String,
    latency_query: String,
}

impl HttpMetricsBackend {
    pub fn from_settings(settings: &MonitoringSettings) -> Result<Self, DeployError> {
        let query_url = base_url(&settings.prometheus_url)?
            .join("api/v1/query")
            .map_err(|e| DeployError::Configuration(format!("invalid Prometheus URL: {}", e)))?;

        let annotations_url = settings
            .grafana_url
            .as_deref()
            .map(|raw| {
                base_url(raw)?
                    .join("api/annotations")
                    .map_err(|e| DeployError::Configuration(format!("invalid Grafana URL: {}", e)))
            })
            .transpose()?;

        let grafana_token = match &settings.grafana_token_env {
            Some(name) => Some(
                std::env::var(name)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .map(SecretString::from)
                    .ok_or_else(|| {
                        DeployError::Configuration(format!(
                            "Grafana token variable {} is not set",
                            name
                        ))
                    })?,
            ),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            query_url,
            annotations_url,
            grafana_token,
            error_rate_query: settings.error_rate_query.clone(),
            latency_query: settings.latency_query.clone(),
        })
    }

    async fn instant_query(&self, query: &str) -> Result<Option<f64>, DeployError> {
        debug!(%query, "querying Prometheus");
        let response = self
            .client
            .get(self.query_url.clone())
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| DeployError::Metrics(format!("Prometheus unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(DeployError::Metrics(format!(
                "Prometheus returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| DeployError::Metrics(format!("invalid Prometheus response: {}", e)))?;
        parse_instant_value(&body)
    }
}

/// Ensure a trailing slash so `join` appends rather than replaces
fn base_url(raw: &str) -> Result<Url, DeployError> {
    let mut url = Url::parse(raw)
        .map_err(|e| DeployError::Configuration(format!("invalid URL {}: {}", raw, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn render_query(template: &str, service: &str, version: &str, window: Duration) -> String {
    let window = format!("{}s", window.as_secs().max(1));
    render_template(
        template,
        &[("service", service), ("version", version), ("window", window.as_str())],
    )
}

/// First sample of an instant query result.
///
/// Vector and scalar results are accepted. An empty vector yields `None`.
fn parse_instant_value(body: &Value) -> Result<Option<f64>, DeployError> {
    if body["status"] != "success" {
        let reason = body["error"].as_str().unwrap_or("unknown error");
        return Err(DeployError::Metrics(format!("query failed: {}", reason)));
    }

    let data = &body["data"];
    let sample = match data["resultType"].as_str() {
        Some("vector") => match data["result"].as_array().and_then(|r| r.first()) {
            Some(first) => &first["value"],
            None => return Ok(None),
        },
        Some("scalar") => &data["result"],
        other => {
            return Err(DeployError::Metrics(format!(
                "unsupported result type {:?}",
                other
            )))
        }
    };

    let raw = sample[1]
        .as_str()
        .ok_or_else(|| DeployError::Metrics("malformed sample".to_string()))?;
    let value: f64 = raw
        .parse()
        .map_err(|_| DeployError::Metrics(format!("non-numeric sample {}", raw)))?;

    // 0/0 when the service received no traffic in the window
    if value.is_nan() {
        return Ok(None);
    }
    Ok(Some(value))
}

#[async_trait]
impl MetricsBackend for HttpMetricsBackend {
    async fn error_rate(
        &self,
        service: &str,
        version: &str,
        window: Duration,
    ) -> Result<f64, DeployError> {
        let query = render_query(&self.error_rate_query, service, version, window);
        // No samples is not a zero error rate
        self.instant_query(&query).await?.ok_or_else(|| {
            DeployError::Metrics(format!("no error rate samples for {} {}", service, version))
        })
    }

    async fn p99_latency_ms(
        &self,
        service: &str,
        version: &str,
        window: Duration,
    ) -> Result<Option<f64>, DeployError> {
        let query = render_query(&self.latency_query, service, version, window);
        self.instant_query(&query).await
    }

    async fn annotate(&self, annotation: &DeploymentAnnotation) -> Result<(), DeployError> {
        let Some(url) = &self.annotations_url else {
            debug!("no annotation endpoint configured");
            return Ok(());
        };

        let mut request = self.client.post(url.clone()).json(&json!({
            "time": chrono::Utc::now().timestamp_millis(),
            "tags": annotation.tags,
            "text": annotation.text,
        }));
        if let Some(token) = &self.grafana_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeployError::Metrics(format!("Grafana unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(DeployError::Metrics(format!(
                "Grafana returned {}",
                response.status()
            )));
        }

        info!(version = %annotation.version, "deployment annotation created");
        Ok(())
    }
}
