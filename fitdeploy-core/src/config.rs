//! Configuration system for fitdeploy.
//!
//! Uses `figment` for layered configuration: defaults -> config files -> environment -> CLI args.
//! Configuration is loaded from `~/.config/fitdeploy/config.toml` and/or
//! `.fitdeploy/config.toml` in the workspace directory.

use crate::codec::CodecSpec;
use crate::error::ConfigError;
use crate::hosting::{ModelSpec, SimulationSettings};
use crate::metrics::{self, MetricDefinition};
use crate::reconciler::{DeploymentRequest, PollSettings};
use crate::training::TrainingJob;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Workspace directory holding local config and state.
pub const WORKSPACE_DIR: &str = ".fitdeploy";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitDeployConfig {
    #[serde(default)]
    pub hosting: HostingConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl FitDeployConfig {
    /// Human-readable warnings for suspicious but usable values.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.hosting.poll_interval_secs > self.hosting.poll_timeout_secs {
            warnings.push(format!(
                "hosting.poll_interval_secs ({}) exceeds poll_timeout_secs ({}); only one describe call will be made",
                self.hosting.poll_interval_secs, self.hosting.poll_timeout_secs
            ));
        }
        if self.hosting.backoff_factor < 1.0 {
            warnings.push(format!(
                "hosting.backoff_factor ({}) is below 1.0 and will be treated as 1.0",
                self.hosting.backoff_factor
            ));
        }
        for poll in [self.hosting.provision_poll(), self.hosting.delete_poll()] {
            if let Err(e) = poll {
                warnings.push(e.to_string());
            }
        }
        if self.deployment.instance_count == 0 {
            warnings.push("deployment.instance_count is 0; deploy will reject it".to_string());
        }
        if let Err(e) = self.deployment.codec().resolve() {
            warnings.push(format!("deployment codec: {e}"));
        }
        if self.training.command.is_empty() {
            warnings.push("training.command is empty; `train` and `run` need --skip-training".to_string());
        }
        warnings
    }
}

/// Managed hosting control plane settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostingConfig {
    /// Control plane base URL. When unset, an in-memory simulator is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the bearer token.
    pub token_env: String,
    pub request_timeout_secs: u64,
    pub poll_interval_secs: f64,
    pub poll_timeout_secs: f64,
    pub delete_poll_interval_secs: f64,
    pub delete_poll_timeout_secs: f64,
    /// Interval multiplier after each poll; 1.0 polls at a fixed interval.
    pub backoff_factor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_poll_interval_secs: Option<f64>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_env: "FITDEPLOY_HOSTING_TOKEN".to_string(),
            request_timeout_secs: 60,
            poll_interval_secs: 30.0,
            poll_timeout_secs: 600.0,
            delete_poll_interval_secs: 5.0,
            delete_poll_timeout_secs: 300.0,
            backoff_factor: 1.0,
            max_poll_interval_secs: None,
            simulation: SimulationConfig::default(),
        }
    }
}

impl HostingConfig {
    pub fn provision_poll(&self) -> Result<PollSettings, ConfigError> {
        self.poll(
            "poll_interval_secs",
            self.poll_interval_secs,
            "poll_timeout_secs",
            self.poll_timeout_secs,
        )
    }

    pub fn delete_poll(&self) -> Result<PollSettings, ConfigError> {
        self.poll(
            "delete_poll_interval_secs",
            self.delete_poll_interval_secs,
            "delete_poll_timeout_secs",
            self.delete_poll_timeout_secs,
        )
    }

    fn poll(
        &self,
        interval_key: &str,
        interval: f64,
        timeout_key: &str,
        timeout: f64,
    ) -> Result<PollSettings, ConfigError> {
        let interval = seconds(interval_key, interval)?;
        let poll = PollSettings::fixed(interval, seconds(timeout_key, timeout)?);
        if !self.backoff_factor.is_finite() || self.backoff_factor > MAX_BACKOFF_FACTOR {
            return Err(ConfigError::Invalid {
                message: format!(
                    "hosting.backoff_factor must be a finite number no greater than {MAX_BACKOFF_FACTOR}, got {}",
                    self.backoff_factor
                ),
            });
        }
        if self.backoff_factor > 1.0 {
            let max = match self.max_poll_interval_secs {
                Some(max) => seconds("max_poll_interval_secs", max)?,
                None => interval.mul_f64(8.0),
            };
            return Ok(poll.with_backoff(self.backoff_factor, max));
        }
        Ok(poll)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The bearer token, if the configured variable is set and non-empty.
    pub fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn is_simulated(&self) -> bool {
        self.base_url.is_none()
    }
}

/// Larger factors reach `max_poll_interval_secs` after a single poll anyway.
const MAX_BACKOFF_FACTOR: f64 = 10.0;

fn seconds(key: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::Invalid {
        message: format!("hosting.{key} must be a non-negative number of seconds, got {value}"),
    })
}

/// Behaviour of the in-memory control plane used when no base URL is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub creating_polls: u32,
    pub deleting_polls: u32,
    pub fail_provisioning: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            creating_polls: 1,
            deleting_polls: 1,
            fail_provisioning: false,
        }
    }
}

impl SimulationConfig {
    pub fn settings(&self) -> SimulationSettings {
        SimulationSettings {
            creating_polls: self.creating_polls,
            deleting_polls: self.deleting_polls,
            fail_provisioning: self.fail_provisioning,
            describe_delay: Duration::ZERO,
        }
    }
}

/// What gets deployed and how it is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub endpoint_name: String,
    pub model_name: String,
    pub image_uri: String,
    pub entry_point: String,
    /// Artifact URI. Defaults to the training job's final artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_data: Option<String>,
    pub instance_type: String,
    pub instance_count: u32,
    pub content_type: String,
    pub accept: String,
    /// JSON document sent as the sample prediction by `run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_payload: Option<String>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            endpoint_name: "model-endpoint".to_string(),
            model_name: "model".to_string(),
            image_uri: "fitdeploy/linear-serving:latest".to_string(),
            entry_point: "serve".to_string(),
            model_data: None,
            instance_type: "ml.t2.medium".to_string(),
            instance_count: 1,
            content_type: crate::codec::APPLICATION_JSON.to_string(),
            accept: crate::codec::APPLICATION_JSON.to_string(),
            sample_payload: None,
        }
    }
}

impl DeploymentConfig {
    pub fn codec(&self) -> CodecSpec {
        CodecSpec::new(&self.content_type, &self.accept)
    }

    /// Build a deployment request, using `default_model_data` when no
    /// artifact URI is configured.
    pub fn request(&self, default_model_data: &str) -> DeploymentRequest {
        DeploymentRequest {
            endpoint_name: self.endpoint_name.clone(),
            model: ModelSpec {
                name: self.model_name.clone(),
                image_uri: self.image_uri.clone(),
                model_data: self
                    .model_data
                    .clone()
                    .unwrap_or_else(|| default_model_data.to_string()),
                entry_point: self.entry_point.clone(),
            },
            instance_count: self.instance_count,
            instance_type: self.instance_type.clone(),
            codec: self.codec(),
        }
    }

    pub fn sample_payload(&self) -> Result<Option<serde_json::Value>, ConfigError> {
        self.sample_payload
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .map_err(|e| ConfigError::Invalid {
                message: format!("deployment.sample_payload is not valid JSON: {e}"),
            })
    }
}

/// Where model artifacts are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the local object store; relative paths resolve against the workspace.
    pub root: PathBuf,
    pub bucket: String,
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(WORKSPACE_DIR).join("objects"),
            bucket: "fitdeploy-artifacts".to_string(),
            prefix: "models".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn resolved_root(&self, workspace: &Path) -> PathBuf {
        resolve(workspace, &self.root)
    }
}

/// Where training metrics go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub namespace: String,
    pub dimension: String,
    /// Ingestion URL. When unset, metrics are written to the log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub token_env: String,
    pub timeout_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: metrics::DEFAULT_NAMESPACE.to_string(),
            dimension: metrics::DEFAULT_DIMENSION.to_string(),
            url: None,
            token_env: "FITDEPLOY_METRICS_TOKEN".to_string(),
            timeout_secs: 10,
        }
    }
}

impl MetricsConfig {
    pub fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

/// Built-in metric sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricPreset {
    #[default]
    Regression,
    Classification,
    None,
}

/// The training entry point and its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub job_name: String,
    /// Program and arguments of the entry point.
    #[serde(default)]
    pub command: Vec<String>,
    pub channel_dir: PathBuf,
    pub model_dir: PathBuf,
    pub artifact_name: String,
    pub timeout_secs: u64,
    pub metric_preset: MetricPreset,
    /// Extra metric definitions on top of the preset.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricDefinition>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            job_name: "model".to_string(),
            command: Vec::new(),
            channel_dir: PathBuf::from("data").join("train"),
            model_dir: PathBuf::from(WORKSPACE_DIR).join("model"),
            artifact_name: "model.pkl".to_string(),
            timeout_secs: 3600,
            metric_preset: MetricPreset::Regression,
            metrics: Vec::new(),
        }
    }
}

impl TrainingConfig {
    pub fn metric_definitions(&self) -> Vec<MetricDefinition> {
        let mut definitions = match self.metric_preset {
            MetricPreset::Regression => metrics::regression_definitions(),
            MetricPreset::Classification => metrics::classification_definitions(),
            MetricPreset::None => Vec::new(),
        };
        definitions.extend(self.metrics.iter().cloned());
        definitions
    }

    pub fn job(&self, workspace: &Path) -> TrainingJob {
        TrainingJob {
            job_name: self.job_name.clone(),
            command: self.command.clone(),
            channel_dir: resolve(workspace, &self.channel_dir),
            model_dir: resolve(workspace, &self.model_dir),
            artifact_name: self.artifact_name.clone(),
            metric_definitions: self.metric_definitions(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// Values set from the command line, applied last.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub endpoint_name: Option<String>,
    pub base_url: Option<String>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut FitDeployConfig) {
        if let Some(name) = &self.endpoint_name {
            config.deployment.endpoint_name = name.clone();
        }
        if let Some(url) = &self.base_url {
            config.hosting.base_url = Some(url.clone());
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "fitdeploy", "fitdeploy")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// `<workspace>/.fitdeploy/config.toml`.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(WORKSPACE_DIR).join("config.toml")
}

/// Load configuration from all sources.
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables (prefixed with `FITDEPLOY_`, `__` between sections)
/// 3. Explicit config file
/// 4. Workspace-local config (`.fitdeploy/config.toml`)
/// 5. User config (`~/.config/fitdeploy/config.toml`)
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<FitDeployConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(FitDeployConfig::default()));

    if let Some(user_config) = user_config_path().filter(|p| p.exists()) {
        figment = figment.merge(Toml::file(user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // FITDEPLOY_DEPLOYMENT__ENDPOINT_NAME, FITDEPLOY_HOSTING__BASE_URL, ...
    figment = figment.merge(
        Env::prefixed("FITDEPLOY_")
            .split("__")
            .ignore(&["hosting_token", "metrics_token"]),
    );

    let mut config: FitDeployConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    if let Some(overrides) = overrides {
        overrides.apply(&mut config);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = FitDeployConfig::default();
        assert!(config.hosting.is_simulated());
        assert_eq!(config.deployment.instance_count, 1);
        assert_eq!(config.metrics.namespace, "FitDeployJobs");
        assert_eq!(config.training.metric_preset, MetricPreset::Regression);
    }

    #[test]
    fn test_default_poll_settings() {
        let hosting = HostingConfig::default();
        assert_eq!(
            hosting.provision_poll().unwrap(),
            PollSettings::provisioning_default()
        );
        assert_eq!(
            hosting.delete_poll().unwrap(),
            PollSettings::deletion_default()
        );
    }

    #[test]
    fn test_backoff_poll_settings() {
        let hosting = HostingConfig {
            poll_interval_secs: 2.0,
            backoff_factor: 2.0,
            max_poll_interval_secs: Some(10.0),
            ..HostingConfig::default()
        };
        let poll = hosting.provision_poll().unwrap();
        assert_eq!(poll.backoff_factor, 2.0);
        assert_eq!(poll.max_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_negative_interval_rejected() {
        let hosting = HostingConfig {
            poll_interval_secs: -1.0,
            ..HostingConfig::default()
        };
        assert!(matches!(
            hosting.provision_poll(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_unbounded_backoff_factor_rejected() {
        for factor in [f64::INFINITY, f64::NAN, 1e300] {
            let config = FitDeployConfig {
                hosting: HostingConfig {
                    backoff_factor: factor,
                    ..HostingConfig::default()
                },
                ..FitDeployConfig::default()
            };
            assert!(matches!(
                config.hosting.provision_poll(),
                Err(ConfigError::Invalid { .. })
            ));
            assert!(
                config
                    .validate()
                    .iter()
                    .any(|w| w.contains("backoff_factor")),
                "no warning for factor {factor}"
            );
        }
    }

    #[test]
    fn test_huge_timeout_saturates_bound() {
        let hosting = HostingConfig {
            poll_timeout_secs: 1e19,
            ..HostingConfig::default()
        };
        let poll = hosting.provision_poll().unwrap();
        assert!(poll.bound() >= Duration::from_secs_f64(1e19));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = FitDeployConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: FitDeployConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(dir.path()), None, None).unwrap();
        assert_eq!(config.deployment.endpoint_name, "model-endpoint");
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(WORKSPACE_DIR)).unwrap();
        std::fs::write(
            workspace_config_path(dir.path()),
            r#"
[deployment]
endpoint_name = "model2-endpoint"
content_type = "text/csv"

[training]
job_name = "model2"
metric_preset = "classification"
command = ["python", "train.py"]
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None, None).unwrap();
        assert_eq!(config.deployment.endpoint_name, "model2-endpoint");
        assert_eq!(config.deployment.content_type, "text/csv");
        // Unset keys keep their defaults.
        assert_eq!(config.deployment.accept, "application/json");
        assert_eq!(config.training.command, vec!["python", "train.py"]);
        assert!(
            config
                .training
                .metric_definitions()
                .iter()
                .any(|d| d.name == "Prec.")
        );
    }

    #[test]
    fn test_explicit_file_overrides_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(WORKSPACE_DIR)).unwrap();
        std::fs::write(
            workspace_config_path(dir.path()),
            "[deployment]\nendpoint_name = \"from-workspace\"\n",
        )
        .unwrap();
        let explicit = dir.path().join("prod.toml");
        std::fs::write(&explicit, "[deployment]\nendpoint_name = \"from-explicit\"\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit), None).unwrap();
        assert_eq!(config.deployment.endpoint_name, "from-explicit");
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(None, Some(&dir.path().join("nope.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_overrides_win() {
        let overrides = ConfigOverrides {
            endpoint_name: Some("e1".into()),
            base_url: Some("http://localhost:9000".into()),
        };
        let config = load_config(None, None, Some(&overrides)).unwrap();
        assert_eq!(config.deployment.endpoint_name, "e1");
        assert!(!config.hosting.is_simulated());
    }

    #[test]
    fn test_env_layer() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("FITDEPLOY_DEPLOYMENT__INSTANCE_COUNT", "3");
            jail.set_env("FITDEPLOY_HOSTING__POLL_INTERVAL_SECS", "0.5");
            let config = load_config(None, None, None)
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config.deployment.instance_count, 3);
            assert_eq!(config.hosting.poll_interval_secs, 0.5);
            Ok(())
        });
    }

    #[test]
    fn test_deployment_request_uses_default_artifact() {
        let deployment = DeploymentConfig::default();
        let request = deployment.request("file:///tmp/final_model.pkl");
        assert_eq!(request.model.model_data, "file:///tmp/final_model.pkl");
        assert_eq!(request.config_name(), "model-endpoint");
    }

    #[test]
    fn test_sample_payload_must_be_json() {
        let deployment = DeploymentConfig {
            sample_payload: Some("{not json".into()),
            ..DeploymentConfig::default()
        };
        assert!(deployment.sample_payload().is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = FitDeployConfig::default();
        config.deployment.accept = "application/xml".into();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("application/xml")));
        assert!(warnings.iter().any(|w| w.contains("training.command")));
    }

    #[test]
    fn test_training_job_resolves_relative_paths() {
        let job = TrainingConfig::default().job(Path::new("/work"));
        assert_eq!(job.channel_dir, PathBuf::from("/work/data/train"));
        assert_eq!(job.model_dir, PathBuf::from("/work/.fitdeploy/model"));
        assert_eq!(job.timeout, Duration::from_secs(3600));
    }
}
