use super::{MetricsSink, TensorStats, WatchMode};
use anyhow::Context;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_RUNS_DIR: &str = "runs";

pub struct RunTracker {
    run_dir: PathBuf,
    history: BufWriter<File>,
    step: usize,
    watch: Option<(WatchMode, usize)>,
}

impl RunTracker {
    /// Starts a run under `runs/`.
    pub fn init(project: &str, group: &str, config: &Value) -> anyhow::Result<Self> {
        Self::init_in(DEFAULT_RUNS_DIR, project, group, config)
    }

    pub fn init_in(
        root: impl AsRef<Path>,
        project: &str,
        group: &str,
        config: &Value,
    ) -> anyhow::Result<Self> {
        let project_dir = root.as_ref().join(project);
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");

        let mut run_dir = project_dir.join(format!("{}-{}", group, timestamp));
        let mut attempt = 1;
        while run_dir.exists() {
            run_dir = project_dir.join(format!("{}-{}-{}", group, timestamp, attempt));
            attempt += 1;
        }
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

        let config_path = run_dir.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(config)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        let history_path = run_dir.join("history.jsonl");
        let history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&history_path)
            .with_context(|| format!("Failed to open {}", history_path.display()))?;

        tracing::info!("Tracking run in {}", run_dir.display());

        Ok(Self {
            run_dir,
            history: BufWriter::new(history),
            step: 0,
            watch: None,
        })
    }

    /// Ask the trainer to report tensor statistics every `log_freq` updates.
    pub fn watch(&mut self, mode: WatchMode, log_freq: usize) {
        self.watch = Some((mode, log_freq.max(1)));
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Number of history records written so far
    pub fn step(&self) -> usize {
        self.step
    }

    fn append(&mut self, mut record: Map<String, Value>) -> anyhow::Result<()> {
        record.insert("_step".into(), Value::from(self.step));
        record.insert(
            "_timestamp".into(),
            Value::from(chrono::Utc::now().to_rfc3339()),
        );
        writeln!(self.history, "{}", Value::Object(record))?;
        self.history.flush()?;
        self.step += 1;
        Ok(())
    }
}

impl MetricsSink for RunTracker {
    fn log(&mut self, metrics: Value) -> anyhow::Result<()> {
        match metrics {
            Value::Object(map) => self.append(map),
            other => anyhow::bail!("Metrics must be a JSON object, got {}", other),
        }
    }

    fn log_tensor_stats(&mut self, group: &str, stats: &[TensorStats]) -> anyhow::Result<()> {
        let mut record = Map::new();
        for stat in stats {
            record.insert(
                format!("{}/{}", group, stat.name),
                serde_json::json!({"mean": stat.mean, "std": stat.std, "norm": stat.norm}),
            );
        }
        self.append(record)
    }

    fn watching(&self) -> Option<(WatchMode, usize)> {
        self.watch
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.history.flush()?;
        tracing::info!(
            "Run finished after {} logged steps: {}",
            self.step,
            self.run_dir.display()
        );
        Ok(())
    }
}

impl Drop for RunTracker {
    fn drop(&mut self) {
        let _ = self.history.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn history(tracker: &RunTracker) -> Vec<Value> {
        fs::read_to_string(tracker.run_dir().join("history.jsonl"))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_init_writes_config_under_project_and_group() {
        let root = TempDir::new().unwrap();
        let config = json!({"lr": 2e-4, "epoch": 100});
        let tracker = RunTracker::init_in(root.path(), "adl_final_project", "LoftQ-LLM-MC-train-valid", &config)
            .unwrap();

        let run_dir = tracker.run_dir();
        assert_eq!(run_dir.parent().unwrap(), root.path().join("adl_final_project"));
        let dir_name = run_dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(dir_name.starts_with("LoftQ-LLM-MC-train-valid-"));

        let written: Value =
            serde_json::from_str(&fs::read_to_string(run_dir.join("config.json")).unwrap()).unwrap();
        assert_eq!(written, config);
    }

    #[test]
    fn test_log_appends_steps() {
        let root = TempDir::new().unwrap();
        let mut tracker = RunTracker::init_in(root.path(), "p", "g", &json!({})).unwrap();
        tracker.log(json!({"train_loss": 1.5, "lr": 1e-4})).unwrap();
        tracker.log(json!({"valid_acc": 0.25})).unwrap();

        let records = history(&tracker);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["_step"], 0);
        assert_eq!(records[0]["train_loss"], 1.5);
        assert_eq!(records[1]["_step"], 1);
        assert!(records[1]["_timestamp"].is_string());
    }

    #[test]
    fn test_finish_leaves_complete_history() {
        let root = TempDir::new().unwrap();
        let mut tracker = RunTracker::init_in(root.path(), "p", "g", &json!({})).unwrap();
        tracker.log(json!({"epoch": 0, "valid_acc": 0.5})).unwrap();
        tracker.finish().unwrap();
        assert_eq!(tracker.step(), 1);
        assert_eq!(history(&tracker).len(), 1);
    }

    #[test]
    fn test_non_object_metrics_are_rejected() {
        let root = TempDir::new().unwrap();
        let mut tracker = RunTracker::init_in(root.path(), "p", "g", &json!({})).unwrap();
        assert!(tracker.log(json!(3.0)).is_err());
    }

    #[test]
    fn test_tensor_stats_are_grouped() {
        let root = TempDir::new().unwrap();
        let mut tracker = RunTracker::init_in(root.path(), "p", "g", &json!({})).unwrap();
        tracker.watch(WatchMode::All, 10);
        assert_eq!(tracker.watching(), Some((WatchMode::All, 10)));

        let stats = [TensorStats::from_values("score", &[1.0, 1.0])];
        tracker.log_tensor_stats("gradients", &stats).unwrap();
        let records = history(&tracker);
        assert_eq!(records[0]["gradients/score"]["mean"], 1.0);
    }

    #[test]
    fn test_two_runs_in_same_second_get_distinct_dirs() {
        let root = TempDir::new().unwrap();
        let a = RunTracker::init_in(root.path(), "p", "g", &json!({})).unwrap();
        let b = RunTracker::init_in(root.path(), "p", "g", &json!({})).unwrap();
        assert_ne!(a.run_dir(), b.run_dir());
    }
}
