// Result ledger
//
// Append-only, one entry per step per run. The ledger is the only owner of the success/failure
// counters; everything else (tracker, summary, run report) reads them from here.

use std::collections::HashSet;
use thiserror::Error;

use crate::models::outcome::{LedgerEntry, StepStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("step '{0}' already has a ledger entry for this run")]
    Duplicate(String),
}

#[derive(Debug, Default)]
pub struct ResultLedger {
    entries: Vec<LedgerEntry>,
    seen: HashSet<String>,
    carried_over: HashSet<String>,
    baseline_success: u32,
    baseline_failure: u32,
    run_success: u32,
    run_failure: u32,
    run_skipped: u32,
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger for a resumed run, carrying the counts recorded by the interrupted one.
    pub fn with_baseline(success: u32, failure: u32) -> Self {
        Self {
            baseline_success: success,
            baseline_failure: failure,
            ..Self::default()
        }
    }

    /// The single mutation point for outcomes and counters.
    pub fn record_outcome(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        if !self.seen.insert(entry.step_id.clone()) {
            return Err(LedgerError::Duplicate(entry.step_id));
        }
        match entry.status {
            StepStatus::Success => self.run_success += 1,
            StepStatus::Failed => self.run_failure += 1,
            StepStatus::Skipped => self.run_skipped += 1,
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Re-record a failure from the interrupted run this one resumes. Its count is already part
    /// of the baseline, so only the entry (and its reason) is added.
    pub fn record_carried_failure(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        if !self.seen.insert(entry.step_id.clone()) {
            return Err(LedgerError::Duplicate(entry.step_id));
        }
        self.carried_over.insert(entry.step_id.clone());
        self.entries.push(LedgerEntry {
            status: StepStatus::Failed,
            ..entry
        });
        Ok(())
    }

    pub fn is_carried_over(&self, step_id: &str) -> bool {
        self.carried_over.contains(step_id)
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.seen.contains(step_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Successes including those carried over from an interrupted run.
    pub fn success_count(&self) -> u32 {
        self.baseline_success + self.run_success
    }

    /// Failures including those carried over from an interrupted run.
    pub fn failure_count(&self) -> u32 {
        self.baseline_failure + self.run_failure
    }

    pub fn skipped_count(&self) -> u32 {
        self.run_skipped
    }

    /// Steps actually attempted in this run.
    pub fn attempted_count(&self) -> u32 {
        self.run_success + self.run_failure
    }

    pub fn with_status(&self, status: StepStatus) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter().filter(move |e| e.status == status)
    }
}
