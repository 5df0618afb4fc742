//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::simulate::ArtifactBackedHandler;
use anyhow::{Context as _, bail};
use fitdeploy_core::config::{self, ConfigOverrides, FitDeployConfig, WORKSPACE_DIR};
use fitdeploy_core::hosting::{HostingControlPlane, HttpControlPlane, InMemoryControlPlane};
use fitdeploy_core::metrics::{HttpMetricsSink, LogMetricsSink, MetricsDispatcher, MetricsSink};
use fitdeploy_core::persistence::{atomic_write_json, load_json};
use fitdeploy_core::pipeline::{PipelineReport, TrainAndDeploy};
use fitdeploy_core::reconciler::{EndpointHandle, EndpointReconciler, StepOutcome, StepResult};
use fitdeploy_core::storage::{LocalObjectStore, ModelArtifactStore};
use fitdeploy_core::training::TrainingRunner;
use fitdeploy_core::EndpointStatus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Flags that apply to every subcommand.
#[derive(Debug, Default)]
pub struct GlobalOptions {
    pub config_file: Option<PathBuf>,
    pub base_url: Option<String>,
}

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    options: &GlobalOptions,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, options),
        Commands::Status { name } => {
            handle_status(&load_context(workspace, options, None)?, &name).await
        }
        Commands::EnsureAbsent { name } => {
            handle_ensure_absent(&load_context(workspace, options, None)?, &name).await
        }
        Commands::Deploy { endpoint } => {
            handle_deploy(&load_context(workspace, options, endpoint)?).await
        }
        Commands::Predict { name, payload } => {
            handle_predict(&load_context(workspace, options, None)?, &name, &payload).await
        }
        Commands::Teardown { name } => {
            handle_teardown(&load_context(workspace, options, None)?, &name).await
        }
        Commands::Train => handle_train(&load_context(workspace, options, None)?).await,
        Commands::Run {
            payload,
            skip_training,
        } => {
            let ctx = load_context(workspace, options, None)?;
            handle_run(&ctx, payload.as_deref(), skip_training).await
        }
    }
}

fn load_context(
    workspace: &Path,
    options: &GlobalOptions,
    endpoint_name: Option<String>,
) -> anyhow::Result<Context> {
    let overrides = ConfigOverrides {
        endpoint_name,
        base_url: options.base_url.clone(),
    };
    let config = config::load_config(
        Some(workspace),
        options.config_file.as_deref(),
        Some(&overrides),
    )
    .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    for warning in config.validate() {
        warn!("{warning}");
    }
    Context::new(workspace, config)
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    options: &GlobalOptions,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = config::workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let toml_str = toml::to_string_pretty(&FitDeployConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config =
                config::load_config(Some(workspace), options.config_file.as_deref(), None)
                    .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            for warning in config.validate() {
                eprintln!("warning: {warning}");
            }
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

/// Everything a command needs, built from configuration.
struct Context {
    workspace: PathBuf,
    config: FitDeployConfig,
    artifacts: Arc<ModelArtifactStore>,
    reconciler: Arc<EndpointReconciler>,
}

impl Context {
    fn new(workspace: &Path, config: FitDeployConfig) -> anyhow::Result<Self> {
        let store = LocalObjectStore::new(config.storage.resolved_root(workspace));
        let artifacts = Arc::new(
            ModelArtifactStore::new(Arc::new(store), &config.storage.bucket)
                .with_prefix(&config.storage.prefix),
        );

        let plane: Arc<dyn HostingControlPlane> = match &config.hosting.base_url {
            Some(url) => {
                let mut plane =
                    HttpControlPlane::with_timeout(url, config.hosting.request_timeout())?;
                if let Some(token) = config.hosting.bearer_token() {
                    plane = plane.with_bearer_token(token);
                }
                Arc::new(plane)
            }
            None => {
                info!("No hosting.base_url configured, using the simulated control plane");
                let handler =
                    ArtifactBackedHandler::new(artifacts.clone(), &config.training.job_name);
                Arc::new(
                    InMemoryControlPlane::with_settings(config.hosting.simulation.settings())
                        .with_handler(Arc::new(handler)),
                )
            }
        };

        let reconciler = EndpointReconciler::new(plane)
            .with_provision_poll(config.hosting.provision_poll()?)
            .with_delete_poll(config.hosting.delete_poll()?);

        Ok(Self {
            workspace: workspace.to_path_buf(),
            config,
            artifacts,
            reconciler: Arc::new(reconciler),
        })
    }

    fn handle_path(&self, name: &str) -> PathBuf {
        self.workspace
            .join(WORKSPACE_DIR)
            .join("endpoints")
            .join(format!("{name}.json"))
    }

    fn save_handle(&self, handle: &EndpointHandle) -> anyhow::Result<()> {
        let path = self.handle_path(&handle.endpoint_name);
        atomic_write_json(&path, handle)
            .with_context(|| format!("Failed to save endpoint handle to {}", path.display()))
    }

    fn load_handle(&self, name: &str) -> anyhow::Result<Option<EndpointHandle>> {
        Ok(load_json(&self.handle_path(name))?)
    }

    fn forget_handle(&self, name: &str) {
        let path = self.handle_path(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove saved handle");
            }
        }
    }

    fn dispatcher(&self) -> anyhow::Result<MetricsDispatcher> {
        let metrics = &self.config.metrics;
        let sink: Arc<dyn MetricsSink> = match &metrics.url {
            Some(url) => {
                let mut sink = HttpMetricsSink::new(
                    url,
                    std::time::Duration::from_secs(metrics.timeout_secs),
                )?;
                if let Some(token) = metrics.bearer_token() {
                    sink = sink.with_bearer_token(token);
                }
                Arc::new(sink)
            }
            None => Arc::new(LogMetricsSink),
        };
        Ok(MetricsDispatcher::new(sink, &metrics.namespace).with_dimension_name(&metrics.dimension))
    }

    fn runner(&self) -> anyhow::Result<Arc<TrainingRunner>> {
        Ok(Arc::new(TrainingRunner::new(
            self.artifacts.clone(),
            Arc::new(self.dispatcher()?),
        )))
    }

    fn default_model_data(&self) -> String {
        self.artifacts.final_uri(&self.config.training.job_name)
    }

    /// A saved handle, or one rebuilt from the live endpoint.
    async fn handle_for(&self, name: &str) -> anyhow::Result<EndpointHandle> {
        if let Some(mut handle) = self.load_handle(name)? {
            handle.status = self.reconciler.observe(name).await?;
            return Ok(handle);
        }
        Ok(self
            .reconciler
            .attach(
                name,
                &self.config.deployment.model_name,
                self.config.deployment.codec(),
            )
            .await?)
    }
}

async fn handle_status(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let status = ctx.reconciler.observe(name).await?;
    println!("{name}: {status}");
    Ok(())
}

async fn handle_ensure_absent(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let report = ctx.reconciler.ensure_absent(name).await;
    match report.found {
        Some(EndpointStatus::Absent) => println!("{name}: nothing deployed"),
        Some(status) => println!("{name}: removed endpoint found in {status}"),
        None => println!("{name}: status unknown, attempted cleanup"),
    }
    print_steps(&report.steps);
    ctx.forget_handle(name);
    if !report.is_clean() {
        bail!("cleanup of '{name}' did not complete; see warnings above");
    }
    Ok(())
}

async fn handle_deploy(ctx: &Context) -> anyhow::Result<()> {
    let request = ctx.config.deployment.request(&ctx.default_model_data());

    let handle = ctx.reconciler.deploy(&request).await?;
    ctx.save_handle(&handle)?;
    println!("{}", serde_json::to_string_pretty(&handle)?);
    if !handle.is_in_service() {
        bail!(
            "endpoint '{}' did not reach in_service (status: {})",
            handle.endpoint_name,
            handle.status
        );
    }
    Ok(())
}

async fn handle_predict(ctx: &Context, name: &str, payload: &str) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("--payload must be valid JSON")?;
    let handle = ctx.handle_for(name).await?;
    let prediction = ctx.reconciler.predict(&handle, &payload).await?;
    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}

async fn handle_teardown(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let handle = match ctx.load_handle(name)? {
        Some(handle) => handle,
        None => {
            let mut request = ctx.config.deployment.request(&ctx.default_model_data());
            request.endpoint_name = name.to_string();
            request.handle(EndpointStatus::Absent)
        }
    };
    let report = ctx.reconciler.teardown(&handle).await;
    print_steps(&report.steps);
    ctx.forget_handle(name);
    if !report.is_clean() {
        bail!("teardown of '{name}' left resources behind; see warnings above");
    }
    Ok(())
}

async fn handle_train(ctx: &Context) -> anyhow::Result<()> {
    let job = ctx.config.training.job(&ctx.workspace);
    let outcome = ctx.runner()?.run(&job).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn handle_run(
    ctx: &Context,
    payload: Option<&str>,
    skip_training: bool,
) -> anyhow::Result<()> {
    let payload = match payload {
        Some(raw) => serde_json::from_str(raw).context("--payload must be valid JSON")?,
        None => ctx
            .config
            .deployment
            .sample_payload()?
            .context("no --payload given and deployment.sample_payload is not set")?,
    };

    let request = ctx.config.deployment.request(&ctx.default_model_data());
    let mut pipeline = TrainAndDeploy::new(ctx.reconciler.clone(), request, payload);
    if !skip_training {
        if ctx.config.training.command.is_empty() {
            bail!("training.command is empty; configure it or pass --skip-training");
        }
        pipeline = pipeline.with_training(ctx.runner()?, ctx.config.training.job(&ctx.workspace));
    }

    let report = pipeline.run().await;
    print_report(&report)?;
    if !report.succeeded() {
        bail!("run did not complete successfully");
    }
    Ok(())
}

fn print_report(report: &PipelineReport) -> anyhow::Result<()> {
    match &report.training {
        Some(Ok(outcome)) => {
            println!("training: ok ({:.1}s)", outcome.duration_secs);
            for (name, value) in &outcome.metrics {
                println!("  {name} = {value}");
            }
            println!("  artifact: {}", outcome.artifact.uri);
        }
        Some(Err(e)) => println!("training: failed: {e}"),
        None => println!("training: skipped"),
    }
    match &report.deployment {
        Some(Ok(handle)) => println!("deployment: {} ({})", handle.endpoint_name, handle.status),
        Some(Err(e)) => println!("deployment: failed: {e}"),
        None => println!("deployment: not attempted"),
    }
    match &report.prediction {
        Some(Ok(value)) => println!("prediction: {}", serde_json::to_string(value)?),
        Some(Err(e)) => println!("prediction: failed: {e}"),
        None => println!("prediction: not attempted"),
    }
    if let Some(teardown) = &report.teardown {
        println!("teardown:");
        print_steps(&teardown.steps);
    }
    Ok(())
}

fn print_steps(steps: &[StepOutcome]) {
    for outcome in steps {
        let result = match &outcome.result {
            StepResult::Done => "done".to_string(),
            StepResult::AlreadyGone => "already gone".to_string(),
            StepResult::Failed(failure) => format!("failed: {failure}"),
        };
        println!("  {:?}: {result}", outcome.step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> GlobalOptions {
        GlobalOptions::default()
    }

    fn write_fast_config(workspace: &Path, extra: &str) {
        std::fs::create_dir_all(workspace.join(WORKSPACE_DIR)).unwrap();
        std::fs::write(
            config::workspace_config_path(workspace),
            format!(
                r#"
[hosting]
poll_interval_secs = 0.005
poll_timeout_secs = 1.0
delete_poll_interval_secs = 0.005
delete_poll_timeout_secs = 1.0

[training]
job_name = "model1"
{extra}
"#
            ),
        )
        .unwrap();
    }

    async fn persist_model(workspace: &Path) {
        let config = config::load_config(Some(workspace), None, None).unwrap();
        let ctx = Context::new(workspace, config).unwrap();
        ctx.artifacts
            .persist("model1", br#"{"intercept": 0.0, "coefficients": {"x": 4.0}}"#)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, workspace, &options()).await.unwrap();

        let config_path = workspace.join(".fitdeploy").join("config.toml");
        assert!(config_path.exists());

        let content = std::fs::read_to_string(&config_path).unwrap();
        let parsed: FitDeployConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed, FitDeployConfig::default());
    }

    #[tokio::test]
    async fn test_config_init_idempotent() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, workspace, &options()).await.unwrap();
        let config_path = config::workspace_config_path(workspace);
        std::fs::write(&config_path, "[deployment]\nendpoint_name = \"kept\"\n").unwrap();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, workspace, &options()).await.unwrap();

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("kept"));
    }

    #[tokio::test]
    async fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Config {
            action: ConfigAction::Show,
        };
        assert!(handle_command(command, dir.path(), &options()).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_of_missing_endpoint() {
        let dir = TempDir::new().unwrap();
        write_fast_config(dir.path(), "");
        let command = Commands::Status {
            name: "e1".to_string(),
        };
        assert!(handle_command(command, dir.path(), &options()).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_with_persisted_artifact() {
        let dir = TempDir::new().unwrap();
        write_fast_config(dir.path(), "");
        persist_model(dir.path()).await;

        let command = Commands::Run {
            payload: Some(r#"{"x": 1}"#.to_string()),
            skip_training: true,
        };
        handle_command(command, dir.path(), &options()).await.unwrap();
    }

    #[tokio::test]
    async fn test_deploy_endpoint_flag_overrides_config() {
        let dir = TempDir::new().unwrap();
        write_fast_config(dir.path(), "");
        persist_model(dir.path()).await;

        let command = Commands::Deploy {
            endpoint: Some("custom-endpoint".to_string()),
        };
        handle_command(command, dir.path(), &options()).await.unwrap();

        let endpoints = dir.path().join(WORKSPACE_DIR).join("endpoints");
        let saved: EndpointHandle =
            load_json(&endpoints.join("custom-endpoint.json")).unwrap().unwrap();
        assert_eq!(saved.endpoint_name, "custom-endpoint");
        assert_eq!(saved.status, EndpointStatus::InService);
        assert!(!endpoints.join("model-endpoint.json").exists());
    }

    #[tokio::test]
    async fn test_run_without_payload_fails() {
        let dir = TempDir::new().unwrap();
        write_fast_config(dir.path(), "");
        let command = Commands::Run {
            payload: None,
            skip_training: true,
        };
        let err = handle_command(command, dir.path(), &options())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sample_payload"));
    }

    #[tokio::test]
    async fn test_run_without_training_command_fails() {
        let dir = TempDir::new().unwrap();
        write_fast_config(dir.path(), "");
        let command = Commands::Run {
            payload: Some("{}".to_string()),
            skip_training: false,
        };
        let err = handle_command(command, dir.path(), &options())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("training.command"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_trains_then_serves() {
        let dir = TempDir::new().unwrap();
        let channel = dir.path().join("data").join("train");
        std::fs::create_dir_all(&channel).unwrap();
        std::fs::write(channel.join("dataset_model1.csv"), "x,y\n1,4\n").unwrap();
        let script = r#"echo 'Metric: RMSE=0.1//'; printf '{"intercept": 1.0, "coefficients": {"x": 2.0}}' > "$FITDEPLOY_MODEL_DIR/model.pkl""#;
        write_fast_config(
            dir.path(),
            &format!("command = [\"sh\", \"-c\", {}]", toml::Value::String(script.into())),
        );

        let command = Commands::Run {
            payload: Some(r#"{"x": 3}"#.to_string()),
            skip_training: false,
        };
        handle_command(command, dir.path(), &options()).await.unwrap();

        let stored = dir
            .path()
            .join(".fitdeploy/objects/fitdeploy-artifacts/models/model1/final_model.pkl");
        assert!(stored.exists());
    }

    #[tokio::test]
    async fn test_teardown_without_saved_handle_is_clean() {
        let dir = TempDir::new().unwrap();
        write_fast_config(dir.path(), "");
        let command = Commands::Teardown {
            name: "never-deployed".to_string(),
        };
        handle_command(command, dir.path(), &options()).await.unwrap();
    }
}
