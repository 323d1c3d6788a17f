//! Workspace and branch teardown: explicit cleanup, all-or-nothing rollback
//! and the periodic orphan sweep.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use git2::Oid;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::ExecutionContextManager;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::git::{self, RefLocks, RefRepo};
use crate::models::*;
use crate::stream::StreamHandler;

#[derive(Debug, Clone, Copy)]
pub struct CleanupOptions {
    /// Clean up even while the execution is starting or running.
    pub force: bool,
    pub keep_branches: bool,
    pub keep_workspace: bool,
    /// Record branch state and the cleanup record.
    pub update_database: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            force: false,
            keep_branches: true,
            keep_workspace: false,
            update_database: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupOutcome {
    pub execution_id: String,
    pub workspace_removed: bool,
    pub worktrees_removed: u32,
    pub branches_removed: u32,
    pub errors: Vec<String>,
}

impl CleanupOutcome {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackResult {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: u32,
    pub workspaces_removed: u32,
    pub skipped: u32,
    pub errors: u32,
}

pub struct CleanupManager {
    db: DbHandle,
    locks: RefLocks,
    context: Arc<ExecutionContextManager>,
    stream: Arc<StreamHandler>,
}

impl CleanupManager {
    pub fn new(
        db: DbHandle,
        locks: RefLocks,
        context: Arc<ExecutionContextManager>,
        stream: Arc<StreamHandler>,
    ) -> Self {
        Self {
            db,
            locks,
            context,
            stream,
        }
    }

    pub async fn cleanup_execution(
        &self,
        execution_id: &str,
        options: CleanupOptions,
    ) -> EngineResult<CleanupOutcome> {
        self.cleanup_with_action(execution_id, options, CleanupAction::Cleanup)
            .await
    }

    async fn cleanup_with_action(
        &self,
        execution_id: &str,
        options: CleanupOptions,
        action: CleanupAction,
    ) -> EngineResult<CleanupOutcome> {
        validate_id("execution_id", execution_id)?;
        let execution = self.require_execution(execution_id).await?;
        if execution.status.is_active() {
            if !options.force {
                return Err(EngineError::ExecutionActive {
                    id: execution.id,
                    status: execution.status.to_string(),
                });
            }
            if self.stream.clear_buffer(execution_id) {
                debug!(execution_id, "discarded buffered output");
            }
            warn!(execution_id, status = %execution.status, "forcing cleanup of active execution");
        }

        let mut outcome = CleanupOutcome {
            execution_id: execution_id.to_string(),
            ..Default::default()
        };

        if !options.keep_workspace {
            let workspace = self.context.execution_workspace(execution_id);
            let existed = workspace.exists();
            let summary = self.context.cleanup_execution_workspace(execution_id).await?;
            outcome.worktrees_removed = summary.worktrees_removed;
            outcome.workspace_removed = existed && !workspace.exists();
            outcome.errors.extend(summary.errors);
        }

        if !options.keep_branches
            && let Some(manifest) = self.context.manifest(execution_id).await?
        {
            for entry in manifest.entries {
                if entry.branch_state == BranchState::Discarded {
                    continue;
                }
                match self.delete_branch(&entry).await {
                    Ok(Some(_)) => outcome.branches_removed += 1,
                    Ok(None) => {}
                    Err(e) => outcome
                        .errors
                        .push(format!("{}: {:#}", entry.ref_id, e)),
                }
            }
        }

        if options.update_database {
            let record = CleanupRecord {
                execution_id: execution_id.to_string(),
                action,
                success: outcome.success(),
                workspace_removed: outcome.workspace_removed,
                branches_removed: outcome.branches_removed,
                error: (!outcome.success()).then(|| outcome.errors.join("; ")),
                created_at: now_timestamp(),
            };
            let id = execution_id.to_string();
            let discard = !options.keep_branches && outcome.success();
            let workspace_gone = outcome.workspace_removed;
            self.db
                .call(move |db| {
                    if discard {
                        db.set_branch_state(&id, BranchState::Discarded)?;
                    }
                    if workspace_gone {
                        db.set_workspace_preserved(&id, false)?;
                    }
                    db.insert_cleanup_record(&record)
                })
                .await
                .map_err(EngineError::Database)?;
        }

        info!(
            execution_id,
            action = action.as_str(),
            workspace_removed = outcome.workspace_removed,
            branches_removed = outcome.branches_removed,
            errors = outcome.errors.len(),
            "cleanup finished"
        );
        Ok(outcome)
    }

    /// Delete the entry's execution branch, returning its tip if it existed.
    async fn delete_branch(&self, entry: &ManifestEntry) -> anyhow::Result<Option<Oid>> {
        let repo_path = self.context.ref_path(&entry.ref_id);
        let branch = entry.branch_name.clone();
        self.locks
            .run(&entry.ref_id, move || {
                if !repo_path.join(".git").exists() {
                    return Ok(None);
                }
                let repo = RefRepo::open(&repo_path)?;
                let Some(tip) = repo.branch_tip(&branch)? else {
                    return Ok(None);
                };
                repo.delete_branch(&branch)?;
                Ok(Some(tip))
            })
            .await
    }

    /// Discard everything the execution produced. Either every execution
    /// branch is deleted or none is: on a failed deletion the branches
    /// already deleted are recreated at their previous tips and the
    /// worktrees are left untouched. The workspace is removed only after the
    /// branches are gone and the discard is recorded.
    pub async fn rollback_execution(&self, execution_id: &str, reason: &str) -> EngineResult<RollbackResult> {
        validate_id("execution_id", execution_id)?;
        let execution = self.require_execution(execution_id).await?;
        if execution.status.is_active() {
            return Err(EngineError::ExecutionActive {
                id: execution.id,
                status: execution.status.to_string(),
            });
        }
        warn!(execution_id, reason, "rolling back execution");

        let mut entries = self
            .context
            .manifest(execution_id)
            .await?
            .map(|m| m.entries)
            .unwrap_or_default();
        entries.sort_by(|a, b| a.ref_id.cmp(&b.ref_id));

        // Worktrees keep their files but stop holding the branches
        let mut detached: Vec<&ManifestEntry> = Vec::new();
        let mut deleted: Vec<(&ManifestEntry, Oid)> = Vec::new();
        let mut failure = None;
        for entry in &entries {
            match self.detach_worktree(entry).await {
                Ok(true) => detached.push(entry),
                Ok(false) => {}
                Err(e) => {
                    failure = Some(format!("{}: {:#}", entry.ref_id, e));
                    break;
                }
            }
        }
        if failure.is_none() {
            for entry in &entries {
                match self.delete_branch(entry).await {
                    Ok(Some(tip)) => deleted.push((entry, tip)),
                    Ok(None) => {}
                    Err(e) => {
                        failure = Some(format!("{}: {:#}", entry.ref_id, e));
                        break;
                    }
                }
            }
        }

        let (result, workspace_removed) = if let Some(error) = failure {
            self.restore(execution_id, &deleted, &detached).await;
            warn!(execution_id, error = %error, "rollback failed; branches restored");
            (
                RollbackResult {
                    success: false,
                    error: Some(error),
                },
                false,
            )
        } else {
            let id = execution_id.to_string();
            self.db
                .call(move |db| db.set_branch_state(&id, BranchState::Discarded))
                .await
                .map_err(EngineError::Database)?;
            let workspace = self.context.cleanup_execution_workspace(execution_id).await?;
            if !workspace.is_clean() {
                warn!(execution_id, errors = ?workspace.errors, "rollback left workspace files behind");
            }
            info!(execution_id, branches = deleted.len(), "rollback complete");
            (
                RollbackResult {
                    success: true,
                    error: None,
                },
                workspace.is_clean(),
            )
        };

        let record = CleanupRecord {
            execution_id: execution_id.to_string(),
            action: CleanupAction::Rollback,
            success: result.success,
            workspace_removed,
            branches_removed: if result.success { deleted.len() as u32 } else { 0 },
            error: result.error.clone(),
            created_at: now_timestamp(),
        };
        self.db
            .call(move |db| db.insert_cleanup_record(&record))
            .await
            .map_err(EngineError::Database)?;
        Ok(result)
    }

    /// Detach the entry's worktree from its execution branch. Returns false
    /// when there is no worktree on that branch.
    async fn detach_worktree(&self, entry: &ManifestEntry) -> anyhow::Result<bool> {
        let worktree = entry.working_dir.clone();
        let branch = entry.branch_name.clone();
        self.locks
            .run(&entry.ref_id, move || {
                if !worktree.exists() {
                    return Ok(false);
                }
                git::detach_head(&worktree, &branch)
            })
            .await
    }

    /// Undo a partial rollback: recreate deleted branches, then put the
    /// worktrees back on them.
    async fn restore(&self, execution_id: &str, deleted: &[(&ManifestEntry, Oid)], detached: &[&ManifestEntry]) {
        for (entry, tip) in deleted.iter().rev() {
            let repo_path = self.context.ref_path(&entry.ref_id);
            let branch = entry.branch_name.clone();
            let tip = *tip;
            let restored = self
                .locks
                .run(&entry.ref_id, move || {
                    RefRepo::open(&repo_path)?.create_branch(&branch, tip)
                })
                .await;
            if let Err(e) = restored {
                warn!(execution_id, ref_id = %entry.ref_id, error = %format!("{:#}", e), "failed to restore branch after rollback failure");
            }
        }
        for entry in detached {
            let worktree = entry.working_dir.clone();
            let branch = entry.branch_name.clone();
            let attached = self
                .locks
                .run(&entry.ref_id, move || git::attach_head(&worktree, &branch))
                .await;
            if let Err(e) = attached {
                warn!(execution_id, ref_id = %entry.ref_id, error = %format!("{:#}", e), "failed to reattach worktree after rollback failure");
            }
        }
    }

    pub async fn get_cleanup_status(&self, execution_id: &str) -> EngineResult<Option<CleanupRecord>> {
        validate_id("execution_id", execution_id)?;
        let id = execution_id.to_string();
        self.db
            .call(move |db| db.latest_cleanup_record(&id))
            .await
            .map_err(EngineError::Database)
    }

    /// Remove workspaces of finished executions idle for longer than
    /// `older_than_hours`. Branches are kept. Executions with a live preview
    /// are left alone.
    pub async fn cleanup_orphaned_executions(&self, older_than_hours: u64) -> EngineResult<SweepReport> {
        let cutoff = i64::try_from(older_than_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                EngineError::validation(
                    "older_than_hours",
                    format!("{} hours is out of range", older_than_hours),
                )
            })?;
        let cutoff = format_timestamp(cutoff);
        let candidates = self
            .db
            .call(|db| db.list_executions(&[ExecutionStatus::Completed, ExecutionStatus::Failed]))
            .await
            .map_err(EngineError::Database)?;

        let mut report = SweepReport::default();
        for execution in candidates {
            report.examined += 1;
            if execution.last_activity() >= cutoff.as_str() {
                report.skipped += 1;
                continue;
            }
            if !self.context.execution_workspace(&execution.id).exists() {
                report.skipped += 1;
                continue;
            }
            let id = execution.id.clone();
            let live_previews = match self
                .db
                .call(move |db| db.count_live_previews_for_execution(&id))
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %format!("{:#}", e), "sweep could not check previews");
                    report.errors += 1;
                    continue;
                }
            };
            if live_previews > 0 {
                debug!(execution_id = %execution.id, live_previews, "sweep skipped execution with live preview");
                report.skipped += 1;
                continue;
            }

            match self
                .cleanup_with_action(&execution.id, CleanupOptions::default(), CleanupAction::Sweep)
                .await
            {
                Ok(outcome) if outcome.success() => {
                    if outcome.workspace_removed {
                        report.workspaces_removed += 1;
                    }
                }
                Ok(outcome) => {
                    warn!(execution_id = %execution.id, errors = ?outcome.errors, "sweep cleanup incomplete");
                    report.errors += 1;
                }
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "sweep cleanup failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            removed = report.workspaces_removed,
            skipped = report.skipped,
            errors = report.errors,
            "orphan sweep finished"
        );
        Ok(report)
    }

    async fn require_execution(&self, execution_id: &str) -> EngineResult<Execution> {
        let id = execution_id.to_string();
        self.db
            .call(move |db| db.get_execution(&id))
            .await
            .map_err(EngineError::Database)?
            .ok_or_else(|| EngineError::ExecutionNotFound {
                id: execution_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::git::test_support::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: DbHandle,
        context: Arc<ExecutionContextManager>,
        stream: Arc<StreamHandler>,
        cleanup: CleanupManager,
        refs: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let refs = dir.path().join("refs");
        let db = DbHandle::in_memory().unwrap();
        let locks = RefLocks::new();
        let context = Arc::new(ExecutionContextManager::new(
            db.clone(),
            locks.clone(),
            refs.clone(),
            dir.path().join("workspaces"),
            "main".into(),
        ));
        let stream = Arc::new(StreamHandler::new(db.clone(), EventBus::new(16), 1024, 1000));
        let cleanup = CleanupManager::new(db.clone(), locks, context.clone(), stream.clone());
        Fixture {
            _dir: dir,
            db,
            context,
            stream,
            cleanup,
            refs,
        }
    }

    fn execution(db: &DbHandle, id: &str, status: ExecutionStatus) {
        let db = db.lock_sync().unwrap();
        db.create_execution(id, "claude", None).unwrap();
        match status {
            ExecutionStatus::Starting => {}
            ExecutionStatus::Failed => {
                db.transition_execution(id, ExecutionStatus::Failed, None).unwrap();
            }
            other => {
                db.transition_execution(id, ExecutionStatus::Running, None).unwrap();
                if other != ExecutionStatus::Running {
                    db.transition_execution(id, other, None).unwrap();
                }
            }
        }
    }

    fn branch_exists(refs: &std::path::Path, ref_id: &str, branch: &str) -> bool {
        RefRepo::open(&refs.join(ref_id))
            .unwrap()
            .branch_tip(branch)
            .unwrap()
            .is_some()
    }

    #[tokio::test]
    async fn test_cleanup_refuses_active_without_force() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        execution(&f.db, "E1", ExecutionStatus::Running);
        f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();

        let err = f
            .cleanup
            .cleanup_execution("E1", CleanupOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExecutionActive { .. }));
        assert!(f.context.execution_workspace("E1").exists());

        f.stream.handle_output("E1", LogStream::Stdout, b"partial").await;
        let outcome = f
            .cleanup
            .cleanup_execution(
                "E1",
                CleanupOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.workspace_removed);
        assert_eq!(f.stream.buffered_bytes("E1").await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_defaults_keep_branches() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        execution(&f.db, "E1", ExecutionStatus::Completed);
        f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();

        let outcome = f
            .cleanup
            .cleanup_execution("E1", CleanupOptions::default())
            .await
            .unwrap();
        assert!(outcome.success());
        assert!(outcome.workspace_removed);
        assert_eq!(outcome.branches_removed, 0);
        assert!(branch_exists(&f.refs, "R1", "exec-E1"));

        let record = f.cleanup.get_cleanup_status("E1").await.unwrap().unwrap();
        assert_eq!(record.action, CleanupAction::Cleanup);
        assert!(record.success);
        assert!(record.workspace_removed);
    }

    #[tokio::test]
    async fn test_cleanup_removes_branches_when_asked() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        execution(&f.db, "E1", ExecutionStatus::Completed);
        f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();

        let outcome = f
            .cleanup
            .cleanup_execution(
                "E1",
                CleanupOptions {
                    keep_branches: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.branches_removed, 1);
        assert!(!branch_exists(&f.refs, "R1", "exec-E1"));
        let manifest = f.context.manifest("E1").await.unwrap().unwrap();
        assert_eq!(manifest.entries[0].branch_state, BranchState::Discarded);
    }

    #[tokio::test]
    async fn test_rollback_deletes_all_branches() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        init_ref(&f.refs, "R2");
        execution(&f.db, "E1", ExecutionStatus::Running);
        f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        f.context.touch_ref("E1", "R2", RefPermission::Write).await.unwrap();
        f.db.lock_sync()
            .unwrap()
            .transition_execution("E1", ExecutionStatus::Completed, None)
            .unwrap();

        let result = f.cleanup.rollback_execution("E1", "operator abort").await.unwrap();
        assert_eq!(
            result,
            RollbackResult {
                success: true,
                error: None
            }
        );
        assert!(!branch_exists(&f.refs, "R1", "exec-E1"));
        assert!(!branch_exists(&f.refs, "R2", "exec-E1"));
        assert!(!f.context.execution_workspace("E1").exists());

        let manifest = f.context.manifest("E1").await.unwrap().unwrap();
        assert!(manifest.entries.iter().all(|e| e.branch_state == BranchState::Discarded));
        let record = f.cleanup.get_cleanup_status("E1").await.unwrap().unwrap();
        assert!(record.success);
        assert!(record.workspace_removed);
        assert_eq!(record.branches_removed, 2);
    }

    #[tokio::test]
    async fn test_rollback_refuses_active_execution() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        execution(&f.db, "E1", ExecutionStatus::Running);
        f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();

        assert!(matches!(
            f.cleanup.rollback_execution("E1", "abort").await,
            Err(EngineError::ExecutionActive { .. })
        ));
        assert!(branch_exists(&f.refs, "R1", "exec-E1"));
        assert!(f.context.worktree_path("E1", "R1").exists());
        assert!(f.cleanup.get_cleanup_status("E1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_failure_restores_branches_and_keeps_work() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        init_ref(&f.refs, "R2");
        execution(&f.db, "E1", ExecutionStatus::Failed);
        let r1 = f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        let r2 = f.context.touch_ref("E1", "R2", RefPermission::Write).await.unwrap();
        std::fs::write(r1.working_dir.join("wip.txt"), "unsaved\n").unwrap();
        let r1_tip = RefRepo::open(&f.refs.join("R1"))
            .unwrap()
            .require_branch_tip("exec-E1")
            .unwrap();

        // A checked-out branch cannot be deleted
        std::fs::write(f.refs.join("R2/.git/HEAD"), "ref: refs/heads/exec-E1\n").unwrap();

        let result = f.cleanup.rollback_execution("E1", "abort").await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("R2"));

        let restored = RefRepo::open(&f.refs.join("R1"))
            .unwrap()
            .require_branch_tip("exec-E1")
            .unwrap();
        assert_eq!(restored, r1_tip);
        assert!(branch_exists(&f.refs, "R2", "exec-E1"));

        // Worktrees are untouched and back on their branches
        assert_eq!(
            std::fs::read_to_string(r1.working_dir.join("wip.txt")).unwrap(),
            "unsaved\n"
        );
        assert!(r2.working_dir.join("README.md").exists());
        assert!(git::detach_head(&r1.working_dir, "exec-E1").unwrap());

        let manifest = f.context.manifest("E1").await.unwrap().unwrap();
        assert!(manifest.entries.iter().all(|e| e.branch_state == BranchState::Active));
        let execution = f.db.lock_sync().unwrap().get_execution("E1").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let record = f.cleanup.get_cleanup_status("E1").await.unwrap().unwrap();
        assert_eq!(record.action, CleanupAction::Rollback);
        assert!(!record.success);
        assert!(!record.workspace_removed);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_finished_workspaces() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        for id in ["old", "recent", "active", "previewed"] {
            let status = if id == "active" {
                ExecutionStatus::Running
            } else {
                ExecutionStatus::Completed
            };
            execution(&f.db, id, status);
            f.context.touch_ref(id, "R1", RefPermission::Read).await.unwrap();
        }
        let long_ago = format_timestamp(Utc::now() - chrono::Duration::hours(25));
        let just_now = format_timestamp(Utc::now() - chrono::Duration::hours(1));
        {
            let db = f.db.lock_sync().unwrap();
            db.set_completed_at("old", &long_ago).unwrap();
            db.set_completed_at("recent", &just_now).unwrap();
            db.set_completed_at("previewed", &long_ago).unwrap();
            db.create_preview("p1", "R1", Some("previewed")).unwrap();
        }

        let report = f.cleanup.cleanup_orphaned_executions(24).await.unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.workspaces_removed, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.errors, 0);

        assert!(!f.context.execution_workspace("old").exists());
        assert!(f.context.execution_workspace("recent").exists());
        assert!(f.context.execution_workspace("active").exists());
        assert!(f.context.execution_workspace("previewed").exists());
        assert!(branch_exists(&f.refs, "R1", "exec-old"));
        let record = f.cleanup.get_cleanup_status("old").await.unwrap().unwrap();
        assert_eq!(record.action, CleanupAction::Sweep);
    }

    #[tokio::test]
    async fn test_sweep_rejects_out_of_range_age() {
        let f = fixture();
        assert!(matches!(
            f.cleanup.cleanup_orphaned_executions(10_000_000_000).await,
            Err(EngineError::Validation { .. })
        ));
        assert!(matches!(
            f.cleanup.cleanup_orphaned_executions(u64::MAX).await,
            Err(EngineError::Validation { .. })
        ));
        let report = f.cleanup.cleanup_orphaned_executions(1_000_000).await.unwrap();
        assert_eq!(report.examined, 0);
    }
}
