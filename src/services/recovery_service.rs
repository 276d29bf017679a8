//! src/services/recovery_service.rs
//!
//! RecoveryService: restores a soft-deleted bucket generation onto its name
//! and downloads the restored contents, backing up any live bucket of the
//! same name first.
//!
//! Phases run strictly in order, one storage call at a time:
//!
//! 1. preflight: resolve the token, create the output directory
//! 2. active-bucket check
//! 3. back up the active bucket into a fresh temporary bucket
//! 4. empty and delete the active bucket
//! 5. restore the requested generation
//! 6. wait once, then confirm the restored bucket is visible
//! 7. list the restored bucket
//! 8. download every object under the output directory
//! 9. restored-bucket disposition (guidance only, never deletes)
//! 10. summary
//!
//! Phases 3 and 4 only run when phase 2 finds a live bucket. Per-object
//! failures in 3, 4 and 8 are counted and the loop moves on. Bucket-level
//! failures and failed listings abort the run.

use crate::{
    errors::RecoveryError,
    models::{
        bucket::CreateOutcome,
        object::ObjectDescriptor,
        report::{BackupInfo, Phase, RecoveryReport, RunOutcome},
    },
    services::{
        credentials::{AccessToken, TokenSource},
        storage_client::StorageApi,
    },
};
use chrono::{DateTime, Utc};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const BUCKET_NAME_MAX_LEN: usize = 63;

/// Inputs of one recovery run.
#[derive(Clone, Debug)]
pub struct RecoveryOptions {
    /// Bucket name to restore onto.
    pub bucket: String,
    /// Generation of the soft-deleted bucket to restore.
    pub generation: String,
    /// Local directory the restored objects are written under.
    pub output_dir: PathBuf,
    /// Operator intends to keep the restored bucket; only changes guidance.
    pub keep_restored: bool,
    /// Location for the temporary backup bucket.
    pub backup_location: String,
    /// Wait between the restore call and the visibility check.
    pub grace_period: Duration,
}

/// Drives a recovery run against any [`StorageApi`].
pub struct RecoveryService<S> {
    storage: S,
    opts: RecoveryOptions,
}

impl<S: StorageApi> RecoveryService<S> {
    pub fn new(storage: S, opts: RecoveryOptions) -> Self {
        Self { storage, opts }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Run every phase and return the report. Never panics on storage
    /// failures: an aborted run still yields a report describing what was
    /// done and what is left to the operator.
    pub async fn run(&self, tokens: &dyn TokenSource) -> RecoveryReport {
        let mut report = RecoveryReport::new(
            &self.opts.bucket,
            &self.opts.generation,
            self.opts.output_dir.clone(),
            self.opts.keep_restored,
        );

        match self.run_phases(tokens, &mut report).await {
            Ok(()) => report.outcome = RunOutcome::Completed,
            Err(err) => {
                error!("recovery aborted in {}: {}", err.phase(), err);
                if !err.phase().is_per_object() {
                    report.stats_mut(err.phase()).record_failure(None, err.to_string());
                }
                report.outcome = RunOutcome::Aborted {
                    phase: err.phase(),
                    reason: err.to_string(),
                    http_status: err.http_status(),
                };
            }
        }

        self.summarize(&mut report);
        report
    }

    async fn run_phases(
        &self,
        tokens: &dyn TokenSource,
        report: &mut RecoveryReport,
    ) -> Result<(), RecoveryError> {
        let bucket = self.opts.bucket.as_str();

        // --- 1. Preflight ---
        info!("{}: resolving credentials", Phase::Preflight);
        let token = tokens.token()?;
        if !self.opts.output_dir.exists() {
            fs::create_dir_all(&self.opts.output_dir)
                .await
                .map_err(|source| RecoveryError::Io {
                    phase: Phase::Preflight,
                    source,
                })?;
            info!("created output directory {}", self.opts.output_dir.display());
        }
        report.stats_mut(Phase::Preflight).record_success();

        // --- 2. Active-bucket check ---
        info!("{}: does `{}` exist?", Phase::ActiveBucketCheck, bucket);
        let active = self.storage.bucket_exists(&token, bucket).await;
        report.active_bucket_found = active;
        report.stats_mut(Phase::ActiveBucketCheck).record_success();

        if active {
            info!("active bucket `{}` found; it will be backed up and removed first", bucket);
            // --- 3. Backup ---
            let (objects, failed_copies) = self.backup_active_bucket(&token, report).await?;
            // --- 4. Emptying and removal ---
            self.empty_active_bucket(&token, &objects, &failed_copies, report)
                .await?;
        } else {
            info!(
                "no active bucket `{}`; skipping {} and {}",
                bucket,
                Phase::Backup,
                Phase::Emptying
            );
        }

        // --- 5. Restore ---
        info!(
            "{}: restoring `{}` from generation {}",
            Phase::Restore,
            bucket,
            self.opts.generation
        );
        let restored = self
            .storage
            .restore_bucket(&token, bucket, &self.opts.generation)
            .await
            .map_err(|source| RecoveryError::Structural {
                phase: Phase::Restore,
                source,
            })?;
        info!(
            "✅ restored `{}` (location: {}, created: {})",
            restored.name,
            restored.location.as_deref().unwrap_or("unknown"),
            restored
                .time_created
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".into())
        );
        report.restored = Some(restored);
        report.stats_mut(Phase::Restore).record_success();

        // --- 6. Availability ---
        info!(
            "{}: waiting {:?} before checking `{}`",
            Phase::Availability,
            self.opts.grace_period,
            bucket
        );
        tokio::time::sleep(self.opts.grace_period).await;
        if !self.storage.bucket_exists(&token, bucket).await {
            return Err(RecoveryError::Availability {
                phase: Phase::Availability,
                bucket: bucket.to_string(),
            });
        }
        report.stats_mut(Phase::Availability).record_success();

        // --- 7. Enumerate ---
        info!("{}: listing `{}`", Phase::Enumerate, bucket);
        let objects = match self.storage.list_all_objects(&token, bucket).await {
            Ok(objects) => objects,
            Err(err) if err.is_not_found() => {
                warn!("restored bucket `{}` lists as not found; treating it as empty", bucket);
                Vec::new()
            }
            Err(source) => {
                return Err(RecoveryError::Listing {
                    phase: Phase::Enumerate,
                    source,
                });
            }
        };
        info!("restored bucket holds {} object(s)", objects.len());
        report.stats_mut(Phase::Enumerate).record_success();

        // --- 8. Download ---
        self.download_all(&token, &objects, report).await;

        // --- 9. Disposition ---
        if self.opts.keep_restored {
            info!("{}: keeping restored bucket `{}`", Phase::Disposition, bucket);
        } else {
            info!(
                "{}: restored bucket `{}` left in place; deleting it is up to the operator",
                Phase::Disposition,
                bucket
            );
        }

        Ok(())
    }

    /// Phase 3. Returns the active bucket's listing (reused by phase 4) and
    /// the names whose copy failed.
    async fn backup_active_bucket(
        &self,
        token: &AccessToken,
        report: &mut RecoveryReport,
    ) -> Result<(Vec<ObjectDescriptor>, HashSet<String>), RecoveryError> {
        let bucket = self.opts.bucket.as_str();
        info!("{}: listing active bucket `{}`", Phase::Backup, bucket);
        let objects = self
            .storage
            .list_all_objects(token, bucket)
            .await
            .map_err(|source| RecoveryError::Listing {
                phase: Phase::Backup,
                source,
            })?;
        report.stats_mut(Phase::Backup);

        if objects.is_empty() {
            info!("active bucket `{}` is empty; nothing to back up", bucket);
            return Ok((objects, HashSet::new()));
        }

        let backup_bucket = backup_bucket_name(bucket, Utc::now());
        info!(
            "creating backup bucket `{}` in {} for {} object(s)",
            backup_bucket,
            self.opts.backup_location,
            objects.len()
        );
        match self
            .storage
            .create_bucket(token, &backup_bucket, &self.opts.backup_location)
            .await
        {
            Ok(CreateOutcome::Created) => info!("✅ created backup bucket `{}`", backup_bucket),
            Ok(CreateOutcome::AlreadyExists) => {
                warn!("backup bucket `{}` already exists; copying into it", backup_bucket)
            }
            Err(source) => {
                return Err(RecoveryError::Structural {
                    phase: Phase::Backup,
                    source,
                });
            }
        }
        report.backup = Some(BackupInfo {
            bucket: backup_bucket.clone(),
            objects_listed: objects.len(),
            objects_copied: 0,
        });

        let total = objects.len();
        let mut failed = HashSet::new();
        for (idx, obj) in objects.iter().enumerate() {
            info!("[{}/{}] copy {} -> {} ...", idx + 1, total, obj.name, backup_bucket);
            match self
                .storage
                .copy_object(token, bucket, &backup_bucket, &obj.name)
                .await
            {
                Ok(()) => {
                    info!("[{}/{}] {} ✅", idx + 1, total, obj.name);
                    report.stats_mut(Phase::Backup).record_success();
                    if let Some(backup) = report.backup.as_mut() {
                        backup.objects_copied += 1;
                    }
                }
                Err(err) => {
                    warn!("[{}/{}] {} ❌ {}", idx + 1, total, obj.name, err);
                    report
                        .stats_mut(Phase::Backup)
                        .record_failure(Some(&obj.name), err.to_string());
                    failed.insert(obj.name.clone());
                }
            }
        }
        Ok((objects, failed))
    }

    /// Phase 4. Objects whose backup copy failed are left in place, which
    /// makes the bucket delete fail and stops the run before the restore.
    async fn empty_active_bucket(
        &self,
        token: &AccessToken,
        objects: &[ObjectDescriptor],
        failed_copies: &HashSet<String>,
        report: &mut RecoveryReport,
    ) -> Result<(), RecoveryError> {
        let bucket = self.opts.bucket.as_str();
        let total = objects.len();
        report.stats_mut(Phase::Emptying);
        info!("{}: deleting {} object(s) from `{}`", Phase::Emptying, total, bucket);

        for (idx, obj) in objects.iter().enumerate() {
            if failed_copies.contains(&obj.name) {
                warn!(
                    "[{}/{}] {} ❌ kept: no backup copy exists",
                    idx + 1,
                    total,
                    obj.name
                );
                report
                    .stats_mut(Phase::Emptying)
                    .record_failure(Some(&obj.name), "not deleted: backup copy failed");
                continue;
            }
            info!("[{}/{}] delete {}/{} ...", idx + 1, total, bucket, obj.name);
            match self.storage.delete_object(token, bucket, &obj.name).await {
                Ok(()) => {
                    info!("[{}/{}] {} ✅", idx + 1, total, obj.name);
                    report.stats_mut(Phase::Emptying).record_success();
                }
                Err(err) => {
                    warn!("[{}/{}] {} ❌ {}", idx + 1, total, obj.name, err);
                    report
                        .stats_mut(Phase::Emptying)
                        .record_failure(Some(&obj.name), err.to_string());
                }
            }
        }

        info!("deleting active bucket `{}`", bucket);
        self.storage
            .delete_bucket(token, bucket)
            .await
            .map_err(|source| RecoveryError::Structural {
                phase: Phase::Emptying,
                source,
            })?;
        info!("✅ deleted active bucket `{}`", bucket);
        report.active_bucket_deleted = true;
        Ok(())
    }

    /// Phase 8. Every failure is recorded; the loop always reaches the end.
    async fn download_all(
        &self,
        token: &AccessToken,
        objects: &[ObjectDescriptor],
        report: &mut RecoveryReport,
    ) {
        let bucket = self.opts.bucket.as_str();
        let total = objects.len();
        report.stats_mut(Phase::Download);
        info!(
            "{}: {} object(s) into {}",
            Phase::Download,
            total,
            self.opts.output_dir.display()
        );

        for (idx, obj) in objects.iter().enumerate() {
            let dest = match local_path(&self.opts.output_dir, &obj.name) {
                Ok(dest) => dest,
                Err(reason) => {
                    warn!("[{}/{}] {} ❌ {}", idx + 1, total, obj.name, reason);
                    report
                        .stats_mut(Phase::Download)
                        .record_failure(Some(&obj.name), reason);
                    continue;
                }
            };

            // Folder placeholder objects become directories.
            if obj.name.ends_with('/') {
                if obj.size > 0 {
                    let reason = format!(
                        "folder placeholder carries {} byte(s) that cannot be written as a directory",
                        obj.size
                    );
                    warn!("[{}/{}] {} ❌ {}", idx + 1, total, obj.name, reason);
                    report
                        .stats_mut(Phase::Download)
                        .record_failure(Some(&obj.name), reason);
                    continue;
                }
                match fs::create_dir_all(&dest).await {
                    Ok(()) => {
                        info!("[{}/{}] {} ✅ (directory)", idx + 1, total, obj.name);
                        report.stats_mut(Phase::Download).record_success();
                    }
                    Err(err) => {
                        warn!("[{}/{}] {} ❌ {}", idx + 1, total, obj.name, err);
                        report
                            .stats_mut(Phase::Download)
                            .record_failure(Some(&obj.name), err.to_string());
                    }
                }
                continue;
            }

            if let Some(parent) = dest.parent() {
                if let Err(err) = fs::create_dir_all(parent).await {
                    warn!("[{}/{}] {} ❌ {}", idx + 1, total, obj.name, err);
                    report.stats_mut(Phase::Download).record_failure(
                        Some(&obj.name),
                        format!("creating {}: {}", parent.display(), err),
                    );
                    continue;
                }
            }

            info!("[{}/{}] download {} ...", idx + 1, total, obj.name);
            let outcome = match self
                .storage
                .download_object(token, bucket, &obj.name, &dest)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!("[{}/{}] {} ❌ {}", idx + 1, total, obj.name, err);
                    report
                        .stats_mut(Phase::Download)
                        .record_failure(Some(&obj.name), err.to_string());
                    continue;
                }
            };

            // The service decompresses gzip-encoded objects on the fly while
            // the listed digest covers the stored (compressed) bytes.
            let expected = obj.md5_hash.as_deref().filter(|_| !obj.is_gzip_encoded());
            if obj.is_gzip_encoded() {
                debug!("{} is gzip-encoded; skipping the md5 comparison", obj.name);
            }
            if let Some(expected) = expected {
                if expected != outcome.md5_base64 {
                    let _ = fs::remove_file(&dest).await;
                    let reason = format!(
                        "checksum mismatch: expected md5 {}, got {}",
                        expected, outcome.md5_base64
                    );
                    warn!("[{}/{}] {} ❌ {}", idx + 1, total, obj.name, reason);
                    report
                        .stats_mut(Phase::Download)
                        .record_failure(Some(&obj.name), reason);
                    continue;
                }
            }

            info!(
                "[{}/{}] {} ✅ ({} bytes)",
                idx + 1,
                total,
                obj.name,
                outcome.size
            );
            report.bytes_downloaded += outcome.size;
            report.stats_mut(Phase::Download).record_success();
        }
    }

    /// Phase 10. Collect what the operator still has to do.
    fn summarize(&self, report: &mut RecoveryReport) {
        let bucket = self.opts.bucket.as_str();

        if let Some(backup) = &report.backup {
            report.guidance.push(format!(
                "backup bucket `{}` holds {} of {} object(s) from the previous `{}`; reconcile it, then delete it yourself",
                backup.bucket, backup.objects_copied, backup.objects_listed, bucket
            ));
        }

        match &report.outcome {
            RunOutcome::Completed => {
                let failures = report.object_failures();
                if failures > 0 {
                    report.guidance.push(format!(
                        "{} object operation(s) failed; see the failures listed above",
                        failures
                    ));
                }
                if !self.opts.keep_restored {
                    report.guidance.push(format!(
                        "restored bucket `{}` was left in place; delete it yourself once the download in {} is verified",
                        bucket,
                        self.opts.output_dir.display()
                    ));
                }
            }
            RunOutcome::Aborted { phase, .. } => {
                if report.active_bucket_deleted && report.restored.is_none() {
                    report.guidance.push(format!(
                        "the previous `{}` was deleted before the run stopped; its data is only in the backup bucket",
                        bucket
                    ));
                }
                if *phase == Phase::Emptying && !report.active_bucket_deleted {
                    report.guidance.push(format!(
                        "`{}` is still active and may be partially emptied; nothing was restored",
                        bucket
                    ));
                }
                if report.restored.is_some() {
                    report.guidance.push(format!(
                        "generation {} was restored onto `{}`; once it is visible, list and download it again",
                        self.opts.generation, bucket
                    ));
                }
            }
        }

        info!(
            "{}: {} object failure(s), {} byte(s) downloaded",
            Phase::Summary,
            report.object_failures(),
            report.bytes_downloaded
        );
    }
}

/// Collision-resistant name for the temporary backup bucket:
/// `<target>-backup-<utc timestamp>-<random>`, cut to the 63-char limit.
pub fn backup_bucket_name(target: &str, now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    let suffix = format!("-backup-{}-{}", now.format("%Y%m%d%H%M%S"), &random[..6]);
    let room = BUCKET_NAME_MAX_LEN.saturating_sub(suffix.len());
    let mut prefix: String = target.chars().take(room).collect();
    while prefix.ends_with(['-', '.', '_']) {
        prefix.pop();
    }
    format!("{}{}", prefix, suffix)
}

/// Map an object name onto a path under `root`, keeping its `/`-separated
/// structure. Names that could escape `root`, or that would share a local
/// path with another name (`a//b` and `a/b`), are rejected. Only a folder
/// placeholder's trailing `/` is allowed to be empty.
pub fn local_path(root: &Path, object: &str) -> Result<PathBuf, String> {
    if object.is_empty() {
        return Err("empty object name".into());
    }
    if object.starts_with('/') {
        return Err("absolute object name cannot be written locally".into());
    }
    if object
        .chars()
        .any(|c| c.is_control() || c == '\\')
    {
        return Err("object name contains control characters or backslashes".into());
    }

    let relative = object.strip_suffix('/').unwrap_or(object);
    let mut path = root.to_path_buf();
    for segment in relative.split('/') {
        if segment.is_empty() {
            return Err("object name contains empty path segments".into());
        }
        if segment == "." || segment == ".." {
            return Err("object name contains `.` or `..` segments".into());
        }
        path.push(segment);
    }
    Ok(path)
}
