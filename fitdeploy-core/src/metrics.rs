//! Training metrics: extraction from entry-point output and dispatch to a sink.
//!
//! Entry points print one `Metric: NAME=VALUE//` line per metric. A
//! [`MetricExtractor`] scrapes them back out of the captured output using
//! per-metric regexes, and a [`MetricsDispatcher`] pushes the values to a
//! [`MetricsSink`]. Sinks are fire-and-forget: delivery failures are logged,
//! never returned.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Namespace metrics are published under unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "FitDeployJobs";

/// Dimension name identifying the training job.
pub const DEFAULT_DIMENSION: &str = "Model";

/// One metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDatum {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Vec<Dimension>,
    pub unit: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// Destination for metric values.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one datum. Must not fail the caller.
    async fn emit(&self, datum: &MetricDatum);
}

/// Posts metric data as JSON to an ingestion URL.
pub struct HttpMetricsSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct PutMetricData<'a> {
    namespace: &'a str,
    metric_data: [&'a MetricDatum; 1],
}

impl HttpMetricsSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
            token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl MetricsSink for HttpMetricsSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn emit(&self, datum: &MetricDatum) {
        let body = PutMetricData {
            namespace: &datum.namespace,
            metric_data: [datum],
        };
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(
                metric = %datum.metric_name,
                status = %resp.status(),
                "Metrics sink rejected datum"
            ),
            Err(e) => warn!(metric = %datum.metric_name, error = %e, "Failed to send metric"),
        }
    }
}

/// Writes metrics to the tracing log.
#[derive(Debug, Default)]
pub struct LogMetricsSink;

#[async_trait]
impl MetricsSink for LogMetricsSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn emit(&self, datum: &MetricDatum) {
        let job = datum
            .dimensions
            .first()
            .map(|d| d.value.as_str())
            .unwrap_or_default();
        info!(
            namespace = %datum.namespace,
            job,
            metric = %datum.metric_name,
            value = datum.value,
            "{}",
            metric_line(&datum.metric_name, datum.value)
        );
    }
}

/// Keeps every datum in memory.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    data: Mutex<Vec<MetricDatum>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn data(&self) -> Vec<MetricDatum> {
        self.data.lock().await.clone()
    }
}

#[async_trait]
impl MetricsSink for RecordingMetricsSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn emit(&self, datum: &MetricDatum) {
        self.data.lock().await.push(datum.clone());
    }
}

/// The line an entry point prints for each metric.
pub fn metric_line(name: &str, value: f64) -> String {
    format!("Metric: {name}={value}//")
}

/// Emits a job's metrics under one namespace with a `Model=<job>` dimension.
pub struct MetricsDispatcher {
    sink: Arc<dyn MetricsSink>,
    namespace: String,
    dimension_name: String,
}

impl MetricsDispatcher {
    pub fn new(sink: Arc<dyn MetricsSink>, namespace: impl Into<String>) -> Self {
        Self {
            sink,
            namespace: namespace.into(),
            dimension_name: DEFAULT_DIMENSION.to_string(),
        }
    }

    pub fn with_dimension_name(mut self, name: impl Into<String>) -> Self {
        self.dimension_name = name.into();
        self
    }

    pub async fn emit(&self, job: &str, metric: &str, value: f64) {
        let datum = MetricDatum {
            namespace: self.namespace.clone(),
            metric_name: metric.to_string(),
            dimensions: vec![Dimension {
                name: self.dimension_name.clone(),
                value: job.to_string(),
            }],
            unit: "None".to_string(),
            value,
            timestamp: Utc::now(),
        };
        self.sink.emit(&datum).await;
    }

    pub async fn emit_all(&self, job: &str, metrics: &BTreeMap<String, f64>) {
        for (metric, value) in metrics {
            self.emit(job, metric, *value).await;
        }
        info!(job, sink = self.sink.name(), count = metrics.len(), "Metrics dispatched");
    }
}

/// A named metric and the regex whose first capture group holds its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub regex: String,
}

impl MetricDefinition {
    /// Matches `NAME=<number>` where NAME is not the tail of a longer name
    /// (so `MSE` does not match inside `RMSE=`).
    pub fn for_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            regex: format!(
                r"(?m)(?:^|[^\w.]){}=(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)",
                regex::escape(name)
            ),
        }
    }
}

/// Metrics reported by regression searches.
pub fn regression_definitions() -> Vec<MetricDefinition> {
    ["MAE", "MSE", "RMSE", "R2", "RMSLE", "MAPE"]
        .into_iter()
        .map(MetricDefinition::for_name)
        .collect()
}

/// Metrics reported by classification searches.
pub fn classification_definitions() -> Vec<MetricDefinition> {
    ["Accuracy", "AUC", "Recall", "Prec.", "F1", "Kappa", "MCC"]
        .into_iter()
        .map(MetricDefinition::for_name)
        .collect()
}

/// Compiled metric definitions.
#[derive(Debug, Clone)]
pub struct MetricExtractor {
    patterns: Vec<(String, Regex)>,
}

impl MetricExtractor {
    pub fn new(definitions: &[MetricDefinition]) -> Result<Self, regex::Error> {
        let patterns = definitions
            .iter()
            .map(|d| Regex::new(&d.regex).map(|re| (d.name.clone(), re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Last value reported for each metric. Metrics never printed are absent.
    pub fn extract(&self, log: &str) -> BTreeMap<String, f64> {
        let mut found = BTreeMap::new();
        for (name, pattern) in &self.patterns {
            let last = pattern
                .captures_iter(log)
                .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
                .last();
            if let Some(value) = last {
                found.insert(name.clone(), value);
            }
        }
        found
    }
}

/// Compile `definitions` and extract from `log` in one go.
pub fn extract_metrics(
    log: &str,
    definitions: &[MetricDefinition],
) -> Result<BTreeMap<String, f64>, regex::Error> {
    Ok(MetricExtractor::new(definitions)?.extract(log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const REGRESSION_LOG: &str = "\
fitting 10 folds
Metric: MAE=0.1234//
Metric: MSE=0.0456//
Metric: RMSE=0.2135//
Metric: R2=-0.12//
Metric: RMSLE=0.0811//
Metric: MAPE=0.3302//
saved model!
";

    #[test]
    fn test_extract_regression_metrics() {
        let extractor = MetricExtractor::new(&regression_definitions()).unwrap();
        let metrics = extractor.extract(REGRESSION_LOG);
        assert_eq!(metrics.len(), 6);
        assert_eq!(metrics["MSE"], 0.0456);
        assert_eq!(metrics["RMSE"], 0.2135);
        assert_eq!(metrics["R2"], -0.12);
    }

    #[test]
    fn test_mse_does_not_match_inside_rmse() {
        let extractor = MetricExtractor::new(&[MetricDefinition::for_name("MSE")]).unwrap();
        assert!(extractor.extract("Metric: RMSE=0.5//").is_empty());
    }

    #[test]
    fn test_prec_dot_is_literal() {
        let extractor = MetricExtractor::new(&classification_definitions()).unwrap();
        let metrics = extractor.extract("Metric: PrecX=0.1//\nMetric: Prec.=0.75//\n");
        assert_eq!(metrics.get("Prec."), Some(&0.75));
    }

    #[test]
    fn test_last_value_wins() {
        let extractor = MetricExtractor::new(&[MetricDefinition::for_name("AUC")]).unwrap();
        let metrics = extractor.extract("AUC=0.5\nAUC=0.9\n");
        assert_eq!(metrics["AUC"], 0.9);
    }

    #[test]
    fn test_extract_metrics_shortcut() {
        let metrics = extract_metrics(REGRESSION_LOG, &regression_definitions()).unwrap();
        assert_eq!(metrics["MAE"], 0.1234);
        assert!(!metrics.contains_key("Accuracy"));
    }

    #[test]
    fn test_invalid_custom_regex() {
        let defs = vec![MetricDefinition {
            name: "broken".into(),
            regex: "(".into(),
        }];
        assert!(MetricExtractor::new(&defs).is_err());
    }

    #[test]
    fn test_metric_line_is_extractable() {
        let line = metric_line("Kappa", 0.61);
        assert_eq!(line, "Metric: Kappa=0.61//");
        let extractor = MetricExtractor::new(&[MetricDefinition::for_name("Kappa")]).unwrap();
        assert_eq!(extractor.extract(&line)["Kappa"], 0.61);
    }

    #[tokio::test]
    async fn test_dispatcher_tags_job_dimension() {
        let sink = Arc::new(RecordingMetricsSink::new());
        let dispatcher = MetricsDispatcher::new(sink.clone(), DEFAULT_NAMESPACE);
        let mut metrics = BTreeMap::new();
        metrics.insert("Accuracy".to_string(), 0.91);
        metrics.insert("F1".to_string(), 0.88);

        dispatcher.emit_all("model1", &metrics).await;

        let data = sink.data().await;
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].metric_name, "Accuracy");
        assert_eq!(data[0].namespace, DEFAULT_NAMESPACE);
        assert_eq!(
            data[0].dimensions,
            vec![Dimension {
                name: "Model".into(),
                value: "model1".into()
            }]
        );
        assert_eq!(data[0].unit, "None");
    }
}
