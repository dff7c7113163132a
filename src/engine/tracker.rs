// Progress & state tracker
//
// Resume is decided by registry index: the checkpoint names the last completed step, and every
// step at or before that step's position in the current registry is skipped. A checkpoint that
// names an unknown step is ignored (fresh start). The checkpoint only moves forward.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::ledger::ResultLedger;
use crate::models::outcome::StepStatus;
use crate::models::state::{Checkpoint, FailedStep};
use crate::models::step::Step;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint at {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint may not move backwards (at index {current}, asked for {requested})")]
    Regression { current: usize, requested: usize },
}

/// JSON checkpoint file, written atomically (temp file + rename).
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        let body = serde_json::to_vec_pretty(checkpoint).map_err(|source| {
            CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| self.io_err(e))?;
        f.write_all(&body).await.map_err(|e| self.io_err(e))?;
        f.sync_all().await.map_err(|e| self.io_err(e))?;
        drop(f);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))
    }

    pub async fn reset(&self) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

pub struct ProgressTracker {
    store: CheckpointStore,
    run_id: String,
    step_ids: Vec<String>,
    /// Registry index of the last step known complete (from the checkpoint, then this run).
    last_completed: Option<usize>,
    resume_point: Option<usize>,
    baseline: (u32, u32),
    carried_failures: HashMap<String, String>,
    discard_pending: bool,
    finished: usize,
    current: usize,
}

impl ProgressTracker {
    /// Load the checkpoint and position the tracker against `steps`. With `fresh` the checkpoint
    /// is ignored; it is only deleted by `discard_previous`, once the run is committed.
    pub async fn open(
        store: CheckpointStore,
        run_id: String,
        steps: &[Step],
        fresh: bool,
    ) -> Result<Self, CheckpointError> {
        let step_ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        let mut tracker = Self {
            store,
            run_id,
            step_ids,
            last_completed: None,
            resume_point: None,
            baseline: (0, 0),
            carried_failures: HashMap::new(),
            discard_pending: fresh,
            finished: 0,
            current: 0,
        };

        if fresh {
            info!(
                "[PHASE: init] [STEP: checkpoint] Fresh run requested; ignoring checkpoint (path={:?})",
                tracker.store.path()
            );
            return Ok(tracker);
        }

        let checkpoint = match tracker.store.load().await {
            Ok(cp) => cp,
            Err(CheckpointError::Corrupt { path, source }) => {
                warn!(
                    "[PHASE: init] [STEP: checkpoint] Ignoring corrupt checkpoint (path={:?}): {}",
                    path, source
                );
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(cp) = checkpoint {
            match tracker
                .step_ids
                .iter()
                .position(|id| *id == cp.last_completed_step_id)
            {
                Some(index) => {
                    info!(
                        "[PHASE: init] [STEP: checkpoint] Resuming after step {} (index={}, run_id={})",
                        cp.last_completed_step_id, index, cp.run_id
                    );
                    info!(
                        "[PHASE: init] [STEP: checkpoint] Carried over: {} succeeded, {} failed",
                        cp.success_count, cp.failure_count
                    );
                    tracker.run_id = cp.run_id;
                    tracker.last_completed = Some(index);
                    tracker.resume_point = Some(index);
                    tracker.baseline = (cp.success_count, cp.failure_count);
                    tracker.carried_failures = cp
                        .failed_steps
                        .into_iter()
                        .map(|f| (f.step_id, f.reason))
                        .collect();
                }
                None => {
                    warn!(
                        "[PHASE: init] [STEP: checkpoint] Checkpoint names unknown step '{}'; starting fresh",
                        cp.last_completed_step_id
                    );
                }
            }
        }

        Ok(tracker)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn total(&self) -> usize {
        self.step_ids.len()
    }

    /// Success/failure counts carried over from an interrupted run.
    pub fn baseline(&self) -> (u32, u32) {
        self.baseline
    }

    /// Reason recorded by the interrupted run when it failed the step `step_id`.
    pub fn carried_failure(&self, step_id: &str) -> Option<&str> {
        self.carried_failures.get(step_id).map(String::as_str)
    }

    /// Delete the checkpoint a fresh run ignored. No-op unless the tracker was opened `fresh`.
    pub async fn discard_previous(&mut self) -> Result<(), CheckpointError> {
        if !self.discard_pending {
            return Ok(());
        }
        self.store.reset().await?;
        self.discard_pending = false;
        info!(
            "[PHASE: preflight] [STEP: checkpoint] Previous checkpoint cleared (path={:?})",
            self.store.path()
        );
        Ok(())
    }

    pub fn is_resuming(&self) -> bool {
        self.resume_point.is_some()
    }

    /// True when the step at `index` was completed by the run this one resumes.
    pub fn is_completed(&self, index: usize) -> bool {
        self.resume_point.map(|r| index <= r).unwrap_or(false)
    }

    pub fn record_step_start(&mut self, index: usize) {
        self.current = index + 1;
        debug!(
            "[PHASE: install] [STEP: progress] Step started (current={}, total={})",
            self.current,
            self.total()
        );
    }

    /// Mark a step finished without touching the checkpoint (skipped on resume).
    pub fn record_step_skipped(&mut self, index: usize) {
        self.current = index + 1;
        self.finished += 1;
    }

    /// Mark a step finished and persist the checkpoint before returning.
    pub async fn record_step_outcome(
        &mut self,
        index: usize,
        ledger: &ResultLedger,
    ) -> Result<(), CheckpointError> {
        self.current = index + 1;
        self.finished += 1;
        self.persist_checkpoint(index, ledger).await
    }

    /// Write the checkpoint naming the step at `index`. Refuses to move backwards.
    pub async fn persist_checkpoint(
        &mut self,
        index: usize,
        ledger: &ResultLedger,
    ) -> Result<(), CheckpointError> {
        if let Some(last) = self.last_completed {
            if index < last {
                return Err(CheckpointError::Regression {
                    current: last,
                    requested: index,
                });
            }
        }
        let Some(step_id) = self.step_ids.get(index).cloned() else {
            return Err(CheckpointError::Regression {
                current: self.last_completed.unwrap_or(0),
                requested: index,
            });
        };

        let checkpoint = Checkpoint {
            run_id: self.run_id.clone(),
            last_completed_step_id: step_id,
            success_count: ledger.success_count(),
            failure_count: ledger.failure_count(),
            failed_steps: ledger
                .with_status(StepStatus::Failed)
                .map(|e| FailedStep {
                    step_id: e.step_id.clone(),
                    reason: e.reason.clone().unwrap_or_default(),
                })
                .collect(),
            timestamp: Utc::now(),
        };
        self.store.save(&checkpoint).await?;
        self.last_completed = Some(index);
        debug!(
            "[PHASE: install] [STEP: checkpoint] Checkpoint persisted (step={}, success={}, failure={})",
            checkpoint.last_completed_step_id, checkpoint.success_count, checkpoint.failure_count
        );
        Ok(())
    }

    pub async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        self.store.load().await
    }

    /// `(current_step, total_steps, percent)`; percent counts finished steps.
    pub fn current_progress(&self) -> (usize, usize, i32) {
        let total = self.total();
        let percent = if total == 0 {
            100
        } else {
            ((self.finished * 100) / total) as i32
        };
        (self.current, total, percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::outcome::{LedgerEntry, StepStatus};
    use crate::models::step::{BackendKind, BackendRef, Phase, Target};

    fn steps(ids: &[&str]) -> Vec<Step> {
        ids.iter()
            .map(|id| Step {
                id: id.to_string(),
                description: id.to_string(),
                phase: Phase::Install,
                backends: vec![BackendRef::new(
                    BackendKind::SystemPackage,
                    Target::RefreshIndex,
                )],
            })
            .collect()
    }

    fn success(id: &str) -> LedgerEntry {
        LedgerEntry {
            step_id: id.to_string(),
            description: id.to_string(),
            phase: Phase::Install,
            status: StepStatus::Success,
            reason: None,
            backend_used: Some(BackendKind::SystemPackage),
            attempts: 1,
            duration_ms: 0,
        }
    }

    fn checkpoint(last: &str, success: u32) -> Checkpoint {
        Checkpoint {
            run_id: "run-1".to_string(),
            last_completed_step_id: last.to_string(),
            success_count: success,
            failure_count: 0,
            failed_steps: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn store_round_trips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        assert!(store.load().await.expect("load").is_none());

        let cp = checkpoint("002-b", 2);
        store.save(&cp).await.expect("save");
        assert_eq!(store.load().await.expect("load"), Some(cp));
        assert!(!dir.path().join("checkpoint.json.tmp").exists());

        store.reset().await.expect("reset");
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn resume_uses_registry_index_not_string_order() {
        // ids deliberately not in lexical order
        let registry = steps(&["zeta", "alpha", "mid"]);
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        store.save(&checkpoint("alpha", 2)).await.expect("save");

        let tracker = ProgressTracker::open(store, "run-2".to_string(), &registry, false)
            .await
            .expect("open");
        assert!(
            tracker.is_completed(0),
            "zeta precedes alpha in the registry"
        );
        assert!(tracker.is_completed(1));
        assert!(
            !tracker.is_completed(2),
            "mid sorts before zeta but comes later"
        );
        assert_eq!(tracker.run_id(), "run-1", "resumed run keeps its id");
        assert_eq!(tracker.baseline(), (2, 0));
    }

    #[tokio::test]
    async fn unknown_checkpoint_step_means_fresh_start() {
        let registry = steps(&["001-a", "002-b"]);
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        store.save(&checkpoint("099-gone", 5)).await.expect("save");

        let tracker = ProgressTracker::open(store, "run-2".to_string(), &registry, false)
            .await
            .expect("open");
        assert!(!tracker.is_resuming());
        assert!(!tracker.is_completed(0));
        assert_eq!(tracker.baseline(), (0, 0));
        assert_eq!(tracker.run_id(), "run-2");
    }

    #[tokio::test]
    async fn corrupt_checkpoint_means_fresh_start() {
        let registry = steps(&["001-a"]);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "{ not json").expect("write");
        let store = CheckpointStore::new(path);
        let tracker = ProgressTracker::open(store, "r".to_string(), &registry, false)
            .await
            .expect("open");
        assert!(!tracker.is_resuming());
    }

    #[tokio::test]
    async fn fresh_flag_ignores_checkpoint_until_discarded() {
        let registry = steps(&["001-a", "002-b"]);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        let store = CheckpointStore::new(&path);
        store.save(&checkpoint("002-b", 2)).await.expect("save");

        let mut tracker = ProgressTracker::open(store, "run-2".to_string(), &registry, true)
            .await
            .expect("open");
        assert!(!tracker.is_completed(0));
        assert_eq!(tracker.baseline(), (0, 0));
        assert!(path.exists(), "nothing is deleted before the run commits");

        tracker.discard_previous().await.expect("discard");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn discard_is_a_no_op_for_resumed_runs() {
        let registry = steps(&["001-a", "002-b"]);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        let store = CheckpointStore::new(&path);
        store.save(&checkpoint("001-a", 1)).await.expect("save");

        let mut tracker = ProgressTracker::open(store, "run-2".to_string(), &registry, false)
            .await
            .expect("open");
        tracker.discard_previous().await.expect("discard");
        assert!(path.exists());
        assert!(tracker.is_completed(0));
    }

    #[tokio::test]
    async fn failure_reasons_survive_a_resume() {
        let registry = steps(&["001-a", "002-b", "003-c"]);
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let mut tracker = ProgressTracker::open(store.clone(), "r".to_string(), &registry, false)
            .await
            .expect("open");

        let mut ledger = ResultLedger::new();
        ledger
            .record_outcome(LedgerEntry {
                status: StepStatus::Failed,
                reason: Some("E: Unable to locate package a".to_string()),
                backend_used: None,
                ..success("001-a")
            })
            .expect("record");
        tracker.record_step_outcome(0, &ledger).await.expect("persist");
        ledger.record_outcome(success("002-b")).expect("record");
        tracker.record_step_outcome(1, &ledger).await.expect("persist");

        let resumed = ProgressTracker::open(store, "r2".to_string(), &registry, false)
            .await
            .expect("open");
        assert_eq!(resumed.baseline(), (1, 1));
        assert_eq!(
            resumed.carried_failure("001-a"),
            Some("E: Unable to locate package a")
        );
        assert_eq!(resumed.carried_failure("002-b"), None);
    }

    #[tokio::test]
    async fn checkpoint_only_moves_forward() {
        let registry = steps(&["001-a", "002-b", "003-c"]);
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let mut tracker = ProgressTracker::open(store.clone(), "r".to_string(), &registry, false)
            .await
            .expect("open");

        let mut ledger = ResultLedger::new();
        ledger.record_outcome(success("001-a")).expect("record");
        tracker.record_step_outcome(0, &ledger).await.expect("persist");
        ledger.record_outcome(success("002-b")).expect("record");
        tracker.record_step_outcome(1, &ledger).await.expect("persist");

        let err = tracker
            .persist_checkpoint(0, &ledger)
            .await
            .expect_err("regression");
        match err {
            CheckpointError::Regression { current, requested } => {
                assert_eq!((current, requested), (1, 0));
            }
            other => panic!("expected a regression error, got {:?}", other),
        }

        let cp = store.load().await.expect("load").expect("present");
        assert_eq!(cp.last_completed_step_id, "002-b");
        assert_eq!(cp.success_count, 2);
    }

    #[tokio::test]
    async fn progress_counts_finished_steps() {
        let registry = steps(&["001-a", "002-b", "003-c", "004-d"]);
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let mut tracker = ProgressTracker::open(store, "r".to_string(), &registry, false)
            .await
            .expect("open");
        assert_eq!(tracker.current_progress(), (0, 4, 0));

        tracker.record_step_skipped(0);
        tracker.record_step_start(1);
        assert_eq!(tracker.current_progress(), (2, 4, 25));

        let mut ledger = ResultLedger::new();
        ledger.record_outcome(success("002-b")).expect("record");
        tracker.record_step_outcome(1, &ledger).await.expect("persist");
        assert_eq!(tracker.current_progress(), (2, 4, 50));
    }
}
