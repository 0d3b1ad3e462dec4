//! File-backed implementations of the governor state repository and the
//! completed-plans log. Grounded on
//! `infrastructure/settings_persistence.rs`'s atomic write-temp-then-rename
//! pattern; the completed-plans log generalizes that pattern to an
//! append-only JSON-lines file rather than a single overwritten document.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::domain::errors::GovernanceError;
use crate::domain::plan::PlanMetrics;
use crate::domain::repositories::{CompletedPlansLog, GovernorState, GovernorStateRepository};

fn persistence_error(context: &str, err: impl std::fmt::Display) -> GovernanceError {
    GovernanceError::Persistence(anyhow::anyhow!("{context}: {err}"))
}

pub struct FileGovernorStateRepository {
    path: PathBuf,
}

impl FileGovernorStateRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileGovernorStateRepository { path: path.into() }
    }
}

#[async_trait]
impl GovernorStateRepository for FileGovernorStateRepository {
    /// A missing file is empty state (first run); a file that fails to
    /// parse is also treated as empty state rather than a hard error,
    /// following `application/governor/mod.rs`'s corrupt-state-is-empty-state
    /// recovery policy — the caller logs the corruption, this just reports it.
    async fn load(&self) -> Result<GovernorState, GovernanceError> {
        if !self.path.exists() {
            return Ok(GovernorState::default());
        }
        let content = fs::read_to_string(&self.path).await.map_err(|e| persistence_error("reading governor state", e))?;
        match serde_json::from_str::<GovernorState>(&content) {
            Ok(state) => Ok(state),
            Err(err) => {
                info!(error = %err, path = %self.path.display(), "governor state file is corrupt, starting clean");
                Ok(GovernorState::default())
            }
        }
    }

    async fn save(&self, state: &GovernorState) -> Result<(), GovernanceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| persistence_error("creating state directory", e))?;
        }
        let content = serde_json::to_string_pretty(state).map_err(|e| persistence_error("serializing governor state", e))?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, content).await.map_err(|e| persistence_error("writing temp governor state file", e))?;
        fs::rename(&temp_path, &self.path).await.map_err(|e| persistence_error("renaming governor state file", e))?;
        Ok(())
    }
}

pub struct FileCompletedPlansLog {
    path: PathBuf,
}

impl FileCompletedPlansLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCompletedPlansLog { path: path.into() }
    }
}

impl FileCompletedPlansLog {
    /// Reads every completed-plan record back from the log, in append
    /// order. Used by the `gov-metrics` status command; not part of the
    /// `CompletedPlansLog` trait since the scheduler itself never needs to
    /// read its own write-only log.
    pub async fn read_all(&self) -> Result<Vec<PlanMetrics>, GovernanceError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).await.map_err(|e| persistence_error("reading completed plans log", e))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<PlanMetrics>(line).map_err(|e| persistence_error("parsing completed plans log entry", e)))
            .collect()
    }
}

#[async_trait]
impl CompletedPlansLog for FileCompletedPlansLog {
    async fn append(&self, metrics: &PlanMetrics) -> Result<(), GovernanceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| persistence_error("creating completed plans directory", e))?;
        }
        let mut line = serde_json::to_string(metrics).map_err(|e| persistence_error("serializing plan metrics", e))?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| persistence_error("opening completed plans log", e))?;
        file.write_all(line.as_bytes()).await.map_err(|e| persistence_error("appending to completed plans log", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn governor_state_round_trips_through_a_temp_file() {
        let dir = std::env::temp_dir().join(format!("governor-state-test-{}", uuid::Uuid::new_v4()));
        let repo = FileGovernorStateRepository::new(dir.join("governor.json"));

        let loaded = repo.load().await.unwrap();
        assert!(loaded.active_plan.is_none());

        let state = GovernorState { active_plan: None, last_change_at: Some(chrono::Utc::now()), rebalance_schedule: None };
        repo.save(&state).await.unwrap();
        let reloaded = repo.load().await.unwrap();
        assert_eq!(reloaded.last_change_at, state.last_change_at);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn completed_plans_log_appends_one_line_per_call() {
        let path = std::env::temp_dir().join(format!("completed-plans-test-{}.jsonl", uuid::Uuid::new_v4()));
        let log = FileCompletedPlansLog::new(&path);
        let metrics = PlanMetrics::new("plan-1".to_string(), Decimal::from(1000));
        log.append(&metrics).await.unwrap();
        log.append(&metrics).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn read_all_round_trips_appended_records() {
        let path = std::env::temp_dir().join(format!("completed-plans-read-{}.jsonl", uuid::Uuid::new_v4()));
        let log = FileCompletedPlansLog::new(&path);
        assert!(log.read_all().await.unwrap().is_empty());

        log.append(&PlanMetrics::new("plan-1".to_string(), Decimal::from(1000))).await.unwrap();
        log.append(&PlanMetrics::new("plan-2".to_string(), Decimal::from(2000))).await.unwrap();
        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].plan_id, "plan-1");
        assert_eq!(records[1].plan_id, "plan-2");

        let _ = tokio::fs::remove_file(&path).await;
    }
}
