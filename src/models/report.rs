//! Per-phase statistics and the end-of-run report.

use crate::models::bucket::BucketMetadata;
use serde::Serialize;
use std::{fmt, path::PathBuf};

/// Ordered steps of a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preflight,
    ActiveBucketCheck,
    Backup,
    Emptying,
    Restore,
    Availability,
    Enumerate,
    Download,
    Disposition,
    Summary,
}

impl Phase {
    pub fn number(self) -> u8 {
        self as u8 + 1
    }

    /// Phases whose counters count objects rather than a single call.
    pub fn is_per_object(self) -> bool {
        matches!(self, Phase::Backup | Phase::Emptying | Phase::Download)
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::ActiveBucketCheck => "active-bucket check",
            Phase::Backup => "active-bucket backup",
            Phase::Emptying => "active-bucket emptying",
            Phase::Restore => "restore",
            Phase::Availability => "availability check",
            Phase::Enumerate => "enumerate restored contents",
            Phase::Download => "download",
            Phase::Disposition => "restored-bucket disposition",
            Phase::Summary => "summary",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {} ({})", self.number(), self.label())
    }
}

/// A single object that failed inside a per-object phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectFailure {
    pub object: String,
    pub message: String,
}

/// Counters for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    pub phase: Phase,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<ObjectFailure>,
}

impl PhaseStats {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    /// Count a failure. Per-object phases pass the object name so it shows up
    /// in the report; structural steps pass `None`.
    pub fn record_failure(&mut self, object: Option<&str>, message: impl Into<String>) {
        self.attempted += 1;
        self.failed += 1;
        if let Some(object) = object {
            self.failures.push(ObjectFailure {
                object: object.to_string(),
                message: message.into(),
            });
        }
    }
}

/// The temporary bucket holding a copy of the pre-existing active bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub bucket: String,
    pub objects_listed: usize,
    pub objects_copied: usize,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase ran; per-object failures may still be non-zero.
    Completed,
    /// A fatal failure stopped the run.
    Aborted {
        phase: Phase,
        reason: String,
        http_status: Option<u16>,
    },
}

/// Everything an operator needs to reconcile after a run.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub target_bucket: String,
    pub generation: String,
    pub output_dir: PathBuf,
    pub keep_restored: bool,
    pub active_bucket_found: bool,
    pub backup: Option<BackupInfo>,
    pub active_bucket_deleted: bool,
    pub restored: Option<BucketMetadata>,
    pub phases: Vec<PhaseStats>,
    pub bytes_downloaded: u64,
    pub outcome: RunOutcome,
    /// Follow-up actions left to the operator.
    pub guidance: Vec<String>,
}

impl RecoveryReport {
    pub fn new(target_bucket: &str, generation: &str, output_dir: PathBuf, keep_restored: bool) -> Self {
        Self {
            target_bucket: target_bucket.to_string(),
            generation: generation.to_string(),
            output_dir,
            keep_restored,
            active_bucket_found: false,
            backup: None,
            active_bucket_deleted: false,
            restored: None,
            phases: Vec::new(),
            bytes_downloaded: 0,
            outcome: RunOutcome::Completed,
            guidance: Vec::new(),
        }
    }

    pub fn stats(&self, phase: Phase) -> Option<&PhaseStats> {
        self.phases.iter().find(|stats| stats.phase == phase)
    }

    /// Stats for `phase`, created on first use.
    pub fn stats_mut(&mut self, phase: Phase) -> &mut PhaseStats {
        let idx = match self.phases.iter().position(|stats| stats.phase == phase) {
            Some(idx) => idx,
            None => {
                self.phases.push(PhaseStats::new(phase));
                self.phases.len() - 1
            }
        };
        &mut self.phases[idx]
    }

    pub fn ran(&self, phase: Phase) -> bool {
        self.stats(phase).is_some()
    }

    /// Per-object failures across all phases.
    pub fn object_failures(&self) -> usize {
        self.phases.iter().map(|stats| stats.failures.len()).sum()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }

    /// Process exit code: completed runs succeed even with per-object failures.
    pub fn exit_code(&self) -> i32 {
        if self.is_completed() { 0 } else { 1 }
    }
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==================== recovery summary ====================")?;
        writeln!(
            f,
            "bucket: {}  generation: {}",
            self.target_bucket, self.generation
        )?;
        writeln!(f, "output: {}", self.output_dir.display())?;
        match &self.outcome {
            RunOutcome::Completed if self.object_failures() == 0 => {
                writeln!(f, "status: COMPLETED")?
            }
            RunOutcome::Completed => writeln!(
                f,
                "status: COMPLETED WITH {} FAILED OBJECT(S)",
                self.object_failures()
            )?,
            RunOutcome::Aborted {
                phase,
                reason,
                http_status,
            } => {
                write!(f, "status: ABORTED in {phase}")?;
                if let Some(status) = http_status {
                    write!(f, " (HTTP {status})")?;
                }
                writeln!(f)?;
                writeln!(f, "reason: {reason}")?;
            }
        }

        writeln!(f)?;
        for stats in &self.phases {
            writeln!(
                f,
                "{:<45} attempted {:>5}  ok {:>5}  failed {:>5}",
                stats.phase.to_string(),
                stats.attempted,
                stats.succeeded,
                stats.failed
            )?;
            for failure in &stats.failures {
                writeln!(f, "    ❌ {}: {}", failure.object, failure.message)?;
            }
        }

        writeln!(f)?;
        match &self.backup {
            Some(backup) => writeln!(
                f,
                "backup bucket: {} ({} of {} object(s) copied)",
                backup.bucket, backup.objects_copied, backup.objects_listed
            )?,
            None if self.active_bucket_found => {
                writeln!(f, "backup bucket: none (active bucket was empty)")?
            }
            None => writeln!(f, "backup bucket: none (no active bucket)")?,
        }
        if let Some(restored) = &self.restored {
            write!(f, "restored bucket: {}", restored.name)?;
            if let Some(location) = &restored.location {
                write!(f, " in {location}")?;
            }
            if let Some(created) = &restored.time_created {
                write!(f, ", created {}", created.to_rfc3339())?;
            }
            writeln!(f)?;
        }
        let downloaded = self
            .stats(Phase::Download)
            .map(|stats| stats.succeeded)
            .unwrap_or(0);
        writeln!(
            f,
            "downloaded: {} object(s), {} byte(s)",
            downloaded, self.bytes_downloaded
        )?;

        if !self.guidance.is_empty() {
            writeln!(f)?;
            writeln!(f, "operator follow-up:")?;
            for line in &self.guidance {
                writeln!(f, "  - {line}")?;
            }
        }
        write!(f, "==========================================================")
    }
}
