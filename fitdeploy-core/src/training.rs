//! Training entry-point runner.
//!
//! The model search itself happens in an external entry point (an AutoML
//! script, usually). The runner hands it a dataset channel and an output
//! directory through environment variables, bounds its run time, scrapes the
//! metrics it prints, then persists its single artifact and dispatches the
//! metrics.

use crate::error::TrainingError;
use crate::metrics::{MetricDefinition, MetricExtractor, MetricsDispatcher};
use crate::storage::{ArtifactLocation, ModelArtifactStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

/// Directory the entry point reads its dataset from.
pub const ENV_CHANNEL_TRAIN: &str = "FITDEPLOY_CHANNEL_TRAIN";
/// Directory the entry point writes its artifact to.
pub const ENV_MODEL_DIR: &str = "FITDEPLOY_MODEL_DIR";
pub const ENV_JOB_NAME: &str = "FITDEPLOY_JOB_NAME";

/// One training run.
#[derive(Debug, Clone)]
pub struct TrainingJob {
    pub job_name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub channel_dir: PathBuf,
    pub model_dir: PathBuf,
    /// File name of the artifact inside `model_dir`.
    pub artifact_name: String,
    pub metric_definitions: Vec<MetricDefinition>,
    pub timeout: Duration,
}

impl TrainingJob {
    pub fn artifact_path(&self) -> PathBuf {
        self.model_dir.join(&self.artifact_name)
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub job_name: String,
    pub metrics: BTreeMap<String, f64>,
    pub artifact: ArtifactLocation,
    pub duration_secs: f64,
}

/// Runs training entry points as subprocesses.
pub struct TrainingRunner {
    artifacts: Arc<ModelArtifactStore>,
    dispatcher: Arc<MetricsDispatcher>,
}

impl TrainingRunner {
    pub fn new(artifacts: Arc<ModelArtifactStore>, dispatcher: Arc<MetricsDispatcher>) -> Self {
        Self {
            artifacts,
            dispatcher,
        }
    }

    pub async fn run(&self, job: &TrainingJob) -> Result<TrainingOutcome, TrainingError> {
        let Some((program, args)) = job.command.split_first() else {
            return Err(TrainingError::Invalid {
                message: "training command is empty".into(),
            });
        };
        if job.artifact_name.trim().is_empty() {
            return Err(TrainingError::Invalid {
                message: "artifact name is empty".into(),
            });
        }
        let extractor =
            MetricExtractor::new(&job.metric_definitions).map_err(|e| TrainingError::Invalid {
                message: format!("bad metric definition: {e}"),
            })?;

        check_channel(&job.channel_dir)?;
        std::fs::create_dir_all(&job.model_dir)?;
        clear_previous_artifact(&job.artifact_path())?;

        info!(job = %job.job_name, %program, channel = %job.channel_dir.display(), "Starting training");
        let started = Instant::now();

        let child = Command::new(program)
            .args(args)
            .env(ENV_CHANNEL_TRAIN, &job.channel_dir)
            .env(ENV_MODEL_DIR, &job.model_dir)
            .env(ENV_JOB_NAME, &job.job_name)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(job.timeout, child).await {
            Ok(result) => result.map_err(|e| TrainingError::Spawn {
                command: program.clone(),
                message: e.to_string(),
            })?,
            Err(_) => {
                return Err(TrainingError::Timeout {
                    job: job.job_name.clone(),
                    timeout_secs: job.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(TrainingError::Failed {
                job: job.job_name.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            debug!(job = %job.job_name, "{line}");
        }
        let metrics = extractor.extract(&stdout);

        let artifact_path = job.artifact_path();
        let artifact = match tokio::fs::read(&artifact_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrainingError::MissingArtifact {
                    job: job.job_name.clone(),
                    path: artifact_path,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let location = self.artifacts.persist(&job.job_name, &artifact).await?;
        self.dispatcher.emit_all(&job.job_name, &metrics).await;

        let duration_secs = started.elapsed().as_secs_f64();
        info!(
            job = %job.job_name,
            metrics = metrics.len(),
            duration_secs,
            "Training finished"
        );

        Ok(TrainingOutcome {
            job_name: job.job_name.clone(),
            metrics,
            artifact: location,
            duration_secs,
        })
    }
}

/// The artifact must come from this run, never from an earlier one.
fn clear_previous_artifact(path: &Path) -> Result<(), TrainingError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed artifact left by a previous run");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn check_channel(dir: &Path) -> Result<(), TrainingError> {
    let unusable = |reason: &str| TrainingError::Channel {
        path: dir.to_path_buf(),
        reason: reason.to_string(),
    };
    if !dir.is_dir() {
        return Err(unusable("not a directory"));
    }
    let mut entries = std::fs::read_dir(dir)?;
    if entries.next().is_none() {
        return Err(unusable("directory is empty"));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::metrics::{RecordingMetricsSink, regression_definitions};
    use crate::storage::{InMemoryObjectStore, ObjectStore};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        channel: PathBuf,
        model_dir: PathBuf,
        store: Arc<InMemoryObjectStore>,
        sink: Arc<RecordingMetricsSink>,
        runner: TrainingRunner,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let channel = dir.path().join("train");
        std::fs::create_dir_all(&channel).unwrap();
        std::fs::write(channel.join("dataset_model2.csv"), "date,incomes\n2021-01-01,10\n")
            .unwrap();
        let model_dir = dir.path().join("model");

        let store = Arc::new(InMemoryObjectStore::new());
        let sink = Arc::new(RecordingMetricsSink::new());
        let artifacts = Arc::new(ModelArtifactStore::new(store.clone(), "bucket"));
        let dispatcher = Arc::new(MetricsDispatcher::new(sink.clone(), "Jobs"));
        Fixture {
            _dir: dir,
            channel,
            model_dir,
            store,
            sink,
            runner: TrainingRunner::new(artifacts, dispatcher),
        }
    }

    fn job(f: &Fixture, script: &str) -> TrainingJob {
        TrainingJob {
            job_name: "model2".into(),
            command: vec!["sh".into(), "-c".into(), script.into()],
            channel_dir: f.channel.clone(),
            model_dir: f.model_dir.clone(),
            artifact_name: "model2.pkl".into(),
            metric_definitions: regression_definitions(),
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_successful_run_persists_and_emits() {
        let f = fixture();
        let script = r#"
            test -f "$FITDEPLOY_CHANNEL_TRAIN/dataset_model2.csv" || exit 3
            echo "Metric: MAE=0.25//"
            echo "Metric: RMSE=0.5//"
            printf 'fitted' > "$FITDEPLOY_MODEL_DIR/model2.pkl"
            echo "saved model!"
        "#;
        let outcome = f.runner.run(&job(&f, script)).await.unwrap();

        assert_eq!(outcome.metrics.len(), 2);
        assert_eq!(outcome.metrics["MAE"], 0.25);
        assert_eq!(outcome.artifact.final_key, "models/model2/final_model.pkl");
        assert_eq!(
            f.store
                .get("bucket", "models/model2/final_model.pkl")
                .await
                .unwrap(),
            b"fitted"
        );
        assert_eq!(f.store.keys("bucket").await.len(), 2);
        assert_eq!(f.sink.data().await.len(), 2);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let f = fixture();
        let err = f
            .runner
            .run(&job(&f, "echo 'no target column' >&2; exit 2"))
            .await
            .unwrap_err();
        match err {
            TrainingError::Failed { stderr, .. } => assert_eq!(stderr, "no target column"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.sink.data().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let f = fixture();
        let err = f
            .runner
            .run(&job(&f, "echo 'Metric: MAE=0.1//'"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::MissingArtifact { .. }));
        assert!(f.store.keys("bucket").await.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_without_artifact_does_not_republish_previous() {
        let f = fixture();
        f.runner
            .run(&job(&f, r#"printf 'first' > "$FITDEPLOY_MODEL_DIR/model2.pkl""#))
            .await
            .unwrap();
        assert_eq!(f.store.keys("bucket").await.len(), 2);
        assert_eq!(f.sink.data().await.len(), 0);

        let err = f
            .runner
            .run(&job(&f, "echo 'Metric: MAE=0.1//'"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::MissingArtifact { .. }));
        assert_eq!(f.store.keys("bucket").await.len(), 2);
        assert!(f.sink.data().await.is_empty());
        assert!(!f.model_dir.join("model2.pkl").exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_entry_point() {
        let f = fixture();
        let mut job = job(&f, "sleep 5");
        job.timeout = Duration::from_millis(100);
        let err = f.runner.run(&job).await.unwrap_err();
        assert!(matches!(err, TrainingError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_empty_channel_rejected() {
        let f = fixture();
        std::fs::remove_file(f.channel.join("dataset_model2.csv")).unwrap();
        let err = f.runner.run(&job(&f, "true")).await.unwrap_err();
        assert!(matches!(err, TrainingError::Channel { .. }));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let f = fixture();
        let mut job = job(&f, "true");
        job.command.clear();
        let err = f.runner.run(&job).await.unwrap_err();
        assert!(matches!(err, TrainingError::Invalid { .. }));
    }
}
