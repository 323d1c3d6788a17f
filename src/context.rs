//! Per-execution isolation: one `exec-<id>` branch and one worktree per
//! touched ref, recorded in the execution manifest.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::db::{DbHandle, Transition};
use crate::errors::{EngineError, EngineResult};
use crate::git::{RefLocks, RefRepo};
use crate::models::*;

/// Result of tearing down an execution's worktrees.
#[derive(Debug, Default, Clone)]
pub struct WorkspaceCleanup {
    pub worktrees_removed: u32,
    pub errors: Vec<String>,
}

impl WorkspaceCleanup {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct ExecutionContextManager {
    db: DbHandle,
    locks: RefLocks,
    refs_root: PathBuf,
    workspaces_root: PathBuf,
    mainline: String,
}

impl ExecutionContextManager {
    pub fn new(
        db: DbHandle,
        locks: RefLocks,
        refs_root: PathBuf,
        workspaces_root: PathBuf,
        mainline: String,
    ) -> Self {
        Self {
            db,
            locks,
            refs_root,
            workspaces_root,
            mainline,
        }
    }

    pub fn ref_path(&self, ref_id: &str) -> PathBuf {
        self.refs_root.join(ref_id)
    }

    pub fn execution_workspace(&self, execution_id: &str) -> PathBuf {
        self.workspaces_root.join(execution_id)
    }

    pub fn worktree_path(&self, execution_id: &str, ref_id: &str) -> PathBuf {
        self.execution_workspace(execution_id).join(ref_id)
    }

    pub fn ref_exists(&self, ref_id: &str) -> bool {
        self.ref_path(ref_id).join(".git").exists()
    }

    pub fn mainline(&self) -> &str {
        &self.mainline
    }

    /// Give the execution an isolated branch and worktree on `ref_id`. The
    /// first touch creates them; later touches reuse the manifest row and
    /// upgrade read to write.
    pub async fn touch_ref(
        &self,
        execution_id: &str,
        ref_id: &str,
        permission: RefPermission,
    ) -> EngineResult<ManifestEntry> {
        validate_id("execution_id", execution_id)?;
        validate_id("ref_id", ref_id)?;
        self.require_execution(execution_id).await?;
        if !self.ref_exists(ref_id) {
            return Err(EngineError::RefNotFound {
                id: ref_id.to_string(),
            });
        }

        let _guard = self.locks.lock(ref_id).await;
        let result = self
            .touch_locked(execution_id, ref_id, permission, false)
            .await;
        if let Err(e) = &result {
            self.fail_setup(execution_id, ref_id, e).await;
        }
        result
    }

    /// Initialise a brand new ref and touch it for writing.
    pub async fn create_ref(&self, execution_id: &str, ref_id: &str) -> EngineResult<ManifestEntry> {
        validate_id("execution_id", execution_id)?;
        validate_id("ref_id", ref_id)?;
        self.require_execution(execution_id).await?;

        let _guard = self.locks.lock(ref_id).await;
        let path = self.ref_path(ref_id);
        if path.exists() {
            return Err(EngineError::validation(
                "ref_id",
                format!("ref '{}' already exists", ref_id),
            ));
        }

        let mainline = self.mainline.clone();
        let init_path = path.clone();
        let init = tokio::task::spawn_blocking(move || RefRepo::init(&init_path, &mainline).map(|_| ()))
            .await
            .map_err(|e| EngineError::git(ref_id, e))
            .and_then(|r| r.map_err(|e| EngineError::git(ref_id, e)));

        let result = match init {
            Ok(()) => {
                info!(execution_id, ref_id, "ref created");
                self.touch_locked(execution_id, ref_id, RefPermission::Write, true)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            if path.exists()
                && let Err(rm) = tokio::fs::remove_dir_all(&path).await
            {
                warn!(ref_id, error = %rm, "failed to remove partially created ref");
            }
            self.fail_setup(execution_id, ref_id, e).await;
        }
        result
    }

    async fn touch_locked(
        &self,
        execution_id: &str,
        ref_id: &str,
        permission: RefPermission,
        created_ref: bool,
    ) -> EngineResult<ManifestEntry> {
        let (exec_id, r_id) = (execution_id.to_string(), ref_id.to_string());
        let existing = self
            .db
            .call(move |db| {
                Ok(db
                    .get_manifest_entries(&exec_id)?
                    .into_iter()
                    .find(|e| e.ref_id == r_id))
            })
            .await
            .map_err(EngineError::Database)?;

        if let Some(mut entry) = existing {
            if permission == RefPermission::Write && entry.permission == RefPermission::Read {
                let (exec_id, r_id) = (execution_id.to_string(), ref_id.to_string());
                self.db
                    .call(move |db| {
                        db.update_manifest_permission(&exec_id, &r_id, RefPermission::Write)
                    })
                    .await
                    .map_err(EngineError::Database)?;
                entry.permission = RefPermission::Write;
            }
            return Ok(entry);
        }

        let workspace = self.execution_workspace(execution_id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|source| EngineError::Filesystem {
                path: workspace.clone(),
                source,
            })?;

        let branch_name = execution_branch_name(execution_id);
        let worktree = self.worktree_path(execution_id, ref_id);
        self.materialize(ref_id, &branch_name, &worktree).await?;

        let entry = ManifestEntry {
            ref_id: ref_id.to_string(),
            permission,
            branch_name: branch_name.clone(),
            working_dir: worktree.clone(),
            created_ref,
            branch_state: BranchState::Active,
        };

        let (exec_id, row, workspace_str) = (
            execution_id.to_string(),
            entry.clone(),
            workspace.to_string_lossy().into_owned(),
        );
        let recorded = self
            .db
            .call(move |db| {
                db.insert_manifest_entry(&exec_id, &row)?;
                db.set_working_dir(&exec_id, &workspace_str)
            })
            .await;
        if let Err(e) = recorded {
            self.unmaterialize(ref_id, &branch_name, &worktree).await;
            return Err(EngineError::Database(e));
        }

        info!(execution_id, ref_id, branch = %branch_name, "execution context ready");
        Ok(entry)
    }

    /// Branch at mainline tip plus worktree. Rolls back its own branch when
    /// the worktree cannot be added.
    async fn materialize(&self, ref_id: &str, branch_name: &str, worktree: &Path) -> EngineResult<()> {
        let repo_path = self.ref_path(ref_id);
        let mainline = self.mainline.clone();
        let branch = branch_name.to_string();
        let worktree = worktree.to_path_buf();
        let undo_ref = ref_id.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let repo = RefRepo::open(&repo_path)?;
            if repo.branch_tip(&branch)?.is_some() {
                anyhow::bail!("branch {} already exists", branch);
            }
            let tip = repo.require_branch_tip(&mainline)?;
            repo.create_branch(&branch, tip)?;
            if let Err(e) = repo.add_worktree(&branch, &worktree, &branch) {
                if let Err(undo) = repo.remove_worktree(&branch, &worktree) {
                    warn!(ref_id = %undo_ref, error = %format!("{:#}", undo), "failed to remove partial worktree");
                }
                if let Err(undo) = repo.delete_branch(&branch) {
                    warn!(ref_id = %undo_ref, error = %format!("{:#}", undo), "failed to delete partial branch");
                }
                return Err(e);
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::git(ref_id, e))?
        .map_err(|e| EngineError::git(ref_id, e))
    }

    async fn unmaterialize(&self, ref_id: &str, branch_name: &str, worktree: &Path) {
        let repo_path = self.ref_path(ref_id);
        let branch = branch_name.to_string();
        let worktree = worktree.to_path_buf();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let repo = RefRepo::open(&repo_path)?;
            repo.remove_worktree(&branch, &worktree)?;
            repo.delete_branch(&branch)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(ref_id, error = %format!("{:#}", e), "failed to undo context setup"),
            Err(e) => warn!(ref_id, error = %e, "context undo task panicked"),
        }
    }

    async fn fail_setup(&self, execution_id: &str, ref_id: &str, error: &EngineError) {
        if error.is_caller_error() {
            return;
        }
        let message = error.to_string();
        let details = ConflictDetails::SetupFailed {
            ref_id: ref_id.to_string(),
            error: message.clone(),
        };
        let exec_id = execution_id.to_string();
        let result = self
            .db
            .call(move |db| {
                if let Transition::Applied(_) =
                    db.transition_execution(&exec_id, ExecutionStatus::Failed, Some(&message))?
                {
                    db.set_conflict_details(&exec_id, Some(&details))?;
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(execution_id, error = %format!("{:#}", e), "failed to record setup failure");
        }
        warn!(execution_id, ref_id, error = %error, "execution context setup failed");
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

    /// `None` means the execution touched nothing.
    pub async fn manifest(&self, execution_id: &str) -> EngineResult<Option<ExecutionManifest>> {
        let id = execution_id.to_string();
        let entries = self
            .db
            .call(move |db| db.get_manifest_entries(&id))
            .await
            .map_err(EngineError::Database)?;
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(ExecutionManifest {
            execution_id: execution_id.to_string(),
            entries,
        }))
    }

    /// Remove every worktree of the execution and prune its metadata.
    /// Branches are left alone. Per-ref failures are collected, not raised.
    pub async fn cleanup_execution_workspace(&self, execution_id: &str) -> EngineResult<WorkspaceCleanup> {
        let mut summary = WorkspaceCleanup::default();
        if let Some(manifest) = self.manifest(execution_id).await? {
            for entry in manifest.entries {
                let repo_path = self.ref_path(&entry.ref_id);
                let branch = entry.branch_name.clone();
                let worktree = entry.working_dir.clone();
                let removed = self
                    .locks
                    .run(&entry.ref_id, move || {
                        if repo_path.join(".git").exists() {
                            RefRepo::open(&repo_path)?.remove_worktree(&branch, &worktree)
                        } else if worktree.exists() {
                            std::fs::remove_dir_all(&worktree)?;
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    })
                    .await;
                match removed {
                    Ok(true) => summary.worktrees_removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(execution_id, ref_id = %entry.ref_id, error = %format!("{:#}", e), "failed to remove worktree");
                        summary.errors.push(format!("{}: {:#}", entry.ref_id, e));
                    }
                }
            }
        }

        let workspace = self.execution_workspace(execution_id);
        if summary.is_clean() && workspace.exists() {
            tokio::fs::remove_dir_all(&workspace)
                .await
                .map_err(|source| EngineError::Filesystem {
                    path: workspace.clone(),
                    source,
                })?;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: DbHandle,
        ctx: ExecutionContextManager,
        refs: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let refs = dir.path().join("refs");
        let db = DbHandle::in_memory().unwrap();
        let ctx = ExecutionContextManager::new(
            db.clone(),
            RefLocks::new(),
            refs.clone(),
            dir.path().join("workspaces"),
            "main".into(),
        );
        Fixture {
            _dir: dir,
            db,
            ctx,
            refs,
        }
    }

    fn create_execution(db: &DbHandle, id: &str) {
        db.lock_sync()
            .unwrap()
            .create_execution(id, "claude", None)
            .unwrap();
    }

    #[tokio::test]
    async fn test_touch_creates_branch_and_worktree_once() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        create_execution(&f.db, "E1");

        let entry = f.ctx.touch_ref("E1", "R1", RefPermission::Read).await.unwrap();
        assert_eq!(entry.branch_name, "exec-E1");
        assert!(entry.working_dir.join("README.md").exists());
        let repo = RefRepo::open(&f.refs.join("R1")).unwrap();
        assert!(repo.branch_tip("exec-E1").unwrap().is_some());

        // Second touch reuses the row and upgrades the permission
        let again = f.ctx.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        assert_eq!(again.permission, RefPermission::Write);
        assert_eq!(again.working_dir, entry.working_dir);
        let manifest = f.ctx.manifest("E1").await.unwrap().unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].permission, RefPermission::Write);

        let execution = f.db.lock_sync().unwrap().get_execution("E1").unwrap().unwrap();
        assert!(execution.working_dir.unwrap().ends_with("E1"));
    }

    #[tokio::test]
    async fn test_touch_validates_inputs() {
        let f = fixture();
        create_execution(&f.db, "E1");
        assert!(matches!(
            f.ctx.touch_ref("E1", "../x", RefPermission::Read).await,
            Err(EngineError::Validation { .. })
        ));
        assert!(matches!(
            f.ctx.touch_ref("missing", "R1", RefPermission::Read).await,
            Err(EngineError::ExecutionNotFound { .. })
        ));
        assert!(matches!(
            f.ctx.touch_ref("E1", "nope", RefPermission::Read).await,
            Err(EngineError::RefNotFound { .. })
        ));
        // Caller errors leave the execution alone
        let execution = f.db.lock_sync().unwrap().get_execution("E1").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Starting);
    }

    #[tokio::test]
    async fn test_setup_failure_marks_execution_failed() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        create_execution(&f.db, "E1");
        // A stray branch with the execution's name blocks setup
        let repo = RefRepo::open(&f.refs.join("R1")).unwrap();
        repo.create_branch("exec-E1", repo.require_branch_tip("main").unwrap())
            .unwrap();

        let err = f.ctx.touch_ref("E1", "R1", RefPermission::Write).await.unwrap_err();
        assert!(matches!(err, EngineError::Git { .. }));
        let execution = f.db.lock_sync().unwrap().get_execution("E1").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(matches!(
            execution.conflict_details,
            Some(ConflictDetails::SetupFailed { .. })
        ));
        assert!(f.ctx.manifest("E1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worktree_failure_removes_new_branch() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        create_execution(&f.db, "E1");
        // A file where the worktree should go; the undo cannot remove it
        // as a directory but still deletes the branch
        let worktree = f.ctx.worktree_path("E1", "R1");
        std::fs::create_dir_all(worktree.parent().unwrap()).unwrap();
        std::fs::write(&worktree, "not a directory").unwrap();

        let err = f.ctx.touch_ref("E1", "R1", RefPermission::Write).await.unwrap_err();
        assert!(matches!(err, EngineError::Git { .. }));
        let repo = RefRepo::open(&f.refs.join("R1")).unwrap();
        assert!(repo.branch_tip("exec-E1").unwrap().is_none());
        let execution = f.db.lock_sync().unwrap().get_execution("E1").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_create_ref() {
        let f = fixture();
        create_execution(&f.db, "E1");
        let entry = f.ctx.create_ref("E1", "fresh").await.unwrap();
        assert!(entry.created_ref);
        assert_eq!(entry.permission, RefPermission::Write);
        assert!(f.ctx.ref_exists("fresh"));

        assert!(matches!(
            f.ctx.create_ref("E1", "fresh").await,
            Err(EngineError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_manifest_none_when_untouched() {
        let f = fixture();
        create_execution(&f.db, "E1");
        assert!(f.ctx.manifest("E1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_workspace_keeps_branches() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        init_ref(&f.refs, "R2");
        create_execution(&f.db, "E1");
        let a = f.ctx.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        let b = f.ctx.touch_ref("E1", "R2", RefPermission::Read).await.unwrap();

        let summary = f.ctx.cleanup_execution_workspace("E1").await.unwrap();
        assert!(summary.is_clean());
        assert_eq!(summary.worktrees_removed, 2);
        assert!(!a.working_dir.exists());
        assert!(!b.working_dir.exists());
        assert!(!f.ctx.execution_workspace("E1").exists());

        let repo = RefRepo::open(&f.refs.join("R1")).unwrap();
        assert!(repo.branch_tip("exec-E1").unwrap().is_some());
        assert!(!repo.has_worktree("exec-E1"));

        // Idempotent
        let again = f.ctx.cleanup_execution_workspace("E1").await.unwrap();
        assert_eq!(again.worktrees_removed, 0);
    }
}
