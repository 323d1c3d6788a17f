//! Folds execution results back into each ref's mainline.
//!
//! For every write ref: commit pending worktree changes on the execution
//! branch, then sync that branch into mainline. Outcomes are appended as
//! change records in one transaction. A failed sync flags the execution for
//! review and preserves its workspace.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::context::ExecutionContextManager;
use crate::db::{DbHandle, Transition};
use crate::errors::{EngineError, EngineResult};
use crate::git::{self, RefLocks, RefRepo, SyncResult};
use crate::models::*;

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Defaults to `refsmith: changes from execution <id>`.
    pub commit_message: Option<String>,
    pub merge: bool,
    pub merge_strategy: MergeStrategy,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            commit_message: None,
            merge: true,
            merge_strategy: MergeStrategy::Sync,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitOutcome {
    pub committed: bool,
    pub hash: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub synced: bool,
    pub exec_branch_hash: Option<String>,
    pub mainline_hash: Option<String>,
    pub error: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateOutcome {
    pub hash: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrationReport {
    pub execution_id: String,
    pub commits: BTreeMap<String, CommitOutcome>,
    pub merges: BTreeMap<String, SyncOutcome>,
    pub creates: BTreeMap<String, CreateOutcome>,
    pub needs_review: bool,
}

/// Git work for one ref, produced on the blocking pool.
struct RefWork {
    commit: CommitOutcome,
    sync: Option<SyncOutcome>,
    sync_status: Option<&'static str>,
    create: Option<CreateOutcome>,
}

pub struct IntegrationManager {
    db: DbHandle,
    locks: RefLocks,
    context: Arc<ExecutionContextManager>,
}

impl IntegrationManager {
    pub fn new(db: DbHandle, locks: RefLocks, context: Arc<ExecutionContextManager>) -> Self {
        Self { db, locks, context }
    }

    pub async fn process_execution_changes(
        &self,
        execution_id: &str,
        options: ProcessOptions,
    ) -> EngineResult<IntegrationReport> {
        validate_id("execution_id", execution_id)?;
        let id = execution_id.to_string();
        let execution = self
            .db
            .call(move |db| db.get_execution(&id))
            .await
            .map_err(EngineError::Database)?
            .ok_or_else(|| EngineError::ExecutionNotFound {
                id: execution_id.to_string(),
            })?;
        ensure_integrable(&execution)?;

        let mut report = IntegrationReport {
            execution_id: execution_id.to_string(),
            ..Default::default()
        };
        let Some(manifest) = self.context.manifest(execution_id).await? else {
            info!(execution_id, "nothing to integrate");
            return Ok(report);
        };

        let id = execution_id.to_string();
        let prior = self
            .db
            .call(move |db| db.list_change_records(&id))
            .await
            .map_err(EngineError::Database)?;

        let message = options
            .commit_message
            .clone()
            .unwrap_or_else(|| format!("refsmith: changes from execution {}", execution.id));

        let mut records = Vec::new();
        let mut failures = Vec::new();

        for entry in manifest.write_entries() {
            let record_create = entry.created_ref
                && !prior
                    .iter()
                    .any(|r| r.ref_id == entry.ref_id && r.change_type == ChangeType::Create);
            let work = self
                .integrate_ref(entry, &message, &options, record_create)
                .await;

            let base = NewChangeRecord {
                execution_id: execution_id.to_string(),
                ref_id: entry.ref_id.clone(),
                change_type: ChangeType::Commit,
                branch_name: entry.branch_name.clone(),
                commit_hash: None,
                merge_status: None,
                message: String::new(),
            };

            if let Some(create) = &work.create {
                records.push(NewChangeRecord {
                    change_type: ChangeType::Create,
                    commit_hash: Some(create.hash.clone()),
                    message: format!("created ref {}", entry.ref_id),
                    ..base.clone()
                });
                report.creates.insert(entry.ref_id.clone(), create.clone());
            }

            if work.commit.committed {
                records.push(NewChangeRecord {
                    commit_hash: work.commit.hash.clone(),
                    message: work.commit.message.clone(),
                    ..base.clone()
                });
            }

            if let Some(sync) = &work.sync {
                // An already-integrated branch leaves no new record
                if work.sync_status != Some("up_to_date") {
                    records.push(NewChangeRecord {
                        change_type: ChangeType::Merge,
                        commit_hash: sync.mainline_hash.clone().or(sync.exec_branch_hash.clone()),
                        merge_status: work.sync_status.map(str::to_string),
                        message: sync.message.clone(),
                        ..base.clone()
                    });
                }
                if !sync.synced {
                    failures.push(SyncFailure {
                        ref_id: entry.ref_id.clone(),
                        branch_name: entry.branch_name.clone(),
                        error: sync.error.clone().unwrap_or_default(),
                        message: sync.message.clone(),
                    });
                }
                report.merges.insert(entry.ref_id.clone(), sync.clone());
            }
            report.commits.insert(entry.ref_id.clone(), work.commit);
        }

        self.save_change_records(records).await?;

        if !failures.is_empty() {
            report.needs_review = true;
            self.flag_for_review(execution_id, failures).await?;
        }

        info!(
            execution_id,
            commits = report.commits.values().filter(|c| c.committed).count(),
            merges = report.merges.values().filter(|m| m.synced).count(),
            needs_review = report.needs_review,
            "integration finished"
        );
        Ok(report)
    }

    async fn integrate_ref(
        &self,
        entry: &ManifestEntry,
        message: &str,
        options: &ProcessOptions,
        record_create: bool,
    ) -> RefWork {
        let repo_path = self.context.ref_path(&entry.ref_id);
        let worktree = entry.working_dir.clone();
        let branch = entry.branch_name.clone();
        let mainline = self.context.mainline().to_string();
        let message = message.to_string();
        let merge = options.merge;
        let strategy = options.merge_strategy;

        let result = self
            .locks
            .run(&entry.ref_id, move || {
                Ok(integrate_blocking(
                    &repo_path,
                    &worktree,
                    &branch,
                    &mainline,
                    &message,
                    merge,
                    strategy,
                    record_create,
                ))
            })
            .await;

        match result {
            Ok(work) => work,
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(ref_id = %entry.ref_id, error = %error, "integration task failed");
                RefWork {
                    commit: CommitOutcome {
                        committed: false,
                        hash: None,
                        message: error.clone(),
                    },
                    sync: Some(SyncOutcome {
                        synced: false,
                        exec_branch_hash: None,
                        mainline_hash: None,
                        error: Some(error.clone()),
                        message: "integration did not run".to_string(),
                    }),
                    sync_status: Some("error"),
                    create: None,
                }
            }
        }
    }

    async fn flag_for_review(&self, execution_id: &str, failures: Vec<SyncFailure>) -> EngineResult<()> {
        let reason = format!(
            "{} ref(s) could not be synced: {}",
            failures.len(),
            failures
                .iter()
                .map(|f| f.ref_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        warn!(execution_id, reason = %reason, "execution needs review");
        let details = ConflictDetails::SyncFailures {
            reason: reason.clone(),
            failures,
        };
        let id = execution_id.to_string();
        self.db
            .call(move |db| {
                match db.transition_execution(&id, ExecutionStatus::NeedsReview, Some(&reason))? {
                    Transition::Applied(_) | Transition::NotFound => {}
                    Transition::Rejected { from } => {
                        tracing::debug!(execution_id = %id, from = %from, "status kept while flagging for review");
                    }
                }
                db.set_conflict_details(&id, Some(&details))?;
                db.set_workspace_preserved(&id, true)
            })
            .await
            .map_err(EngineError::Database)
    }

    /// Append change records atomically.
    pub async fn save_change_records(&self, records: Vec<NewChangeRecord>) -> EngineResult<Vec<i64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.db
            .call(move |db| db.insert_change_records(&records))
            .await
            .map_err(EngineError::Database)
    }

    /// Per-ref manifest rows and change history from persisted state.
    pub async fn get_integration_status(&self, execution_id: &str) -> EngineResult<IntegrationStatus> {
        validate_id("execution_id", execution_id)?;
        let id = execution_id.to_string();
        let (execution, entries, changes) = self
            .db
            .call(move |db| {
                Ok((
                    db.get_execution(&id)?,
                    db.get_manifest_entries(&id)?,
                    db.list_change_records(&id)?,
                ))
            })
            .await
            .map_err(EngineError::Database)?;
        let execution = execution.ok_or_else(|| EngineError::ExecutionNotFound {
            id: execution_id.to_string(),
        })?;

        let refs = entries
            .into_iter()
            .map(|entry| RefHistory {
                changes: changes
                    .iter()
                    .filter(|c| c.ref_id == entry.ref_id)
                    .cloned()
                    .collect(),
                ref_id: entry.ref_id,
                permission: entry.permission,
                branch_name: entry.branch_name,
                branch_state: entry.branch_state,
            })
            .collect();

        Ok(IntegrationStatus {
            execution_id: execution.id,
            status: execution.status,
            refs,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn integrate_blocking(
    repo_path: &Path,
    worktree: &Path,
    branch: &str,
    mainline: &str,
    message: &str,
    merge: bool,
    strategy: MergeStrategy,
    record_create: bool,
) -> RefWork {
    let commit = if worktree.exists() {
        match git::has_uncommitted_changes(worktree) {
            Ok(true) => match git::commit_all(worktree, message) {
                Ok(Some(oid)) => CommitOutcome {
                    committed: true,
                    hash: Some(oid.to_string()),
                    message: message.to_string(),
                },
                Ok(None) => unchanged(worktree),
                Err(e) => {
                    return failed_commit(format!("{:#}", e));
                }
            },
            Ok(false) => unchanged(worktree),
            Err(e) => return failed_commit(format!("{:#}", e)),
        }
    } else {
        CommitOutcome {
            committed: false,
            hash: None,
            message: "workspace not present".to_string(),
        }
    };

    let repo = match RefRepo::open(repo_path) {
        Ok(repo) => repo,
        Err(e) => {
            return RefWork {
                commit,
                sync: Some(sync_error(None, format!("{:#}", e))),
                sync_status: Some("error"),
                create: None,
            };
        }
    };

    let create = if record_create {
        repo.root_commit(branch).ok().map(|oid| CreateOutcome {
            hash: oid.to_string(),
        })
    } else {
        None
    };

    if !merge {
        return RefWork {
            commit,
            sync: None,
            sync_status: None,
            create,
        };
    }

    let exec_hash = repo.branch_tip(branch).ok().flatten().map(|o| o.to_string());
    let (sync, status) = match repo.sync_branch(branch, mainline, strategy) {
        Ok(result) => {
            let status = match &result {
                SyncResult::UpToDate { .. } => "up_to_date",
                SyncResult::FastForwarded { .. } => "fast_forward",
                SyncResult::Merged { .. } => "merged",
                SyncResult::Conflict { .. } => "conflict",
                SyncResult::Diverged => "diverged",
                SyncResult::DirtyWorktree => "dirty_worktree",
            };
            let (error, text) = match &result {
                SyncResult::UpToDate { .. } => (None, format!("{} already contains {}", mainline, branch)),
                SyncResult::FastForwarded { .. } => (None, format!("fast-forwarded {} to {}", mainline, branch)),
                SyncResult::Merged { .. } => (None, format!("merged {} into {}", branch, mainline)),
                SyncResult::Conflict { paths } => (
                    Some("merge conflict".to_string()),
                    format!("conflicting paths: {}", paths.join(", ")),
                ),
                SyncResult::Diverged => (
                    Some("mainline diverged".to_string()),
                    format!("{} cannot be fast-forwarded to {}", mainline, branch),
                ),
                SyncResult::DirtyWorktree => (
                    Some("canonical checkout has uncommitted changes".to_string()),
                    format!("{} checkout is dirty", mainline),
                ),
            };
            (
                SyncOutcome {
                    synced: result.is_synced(),
                    exec_branch_hash: exec_hash,
                    mainline_hash: result.mainline().map(|o| o.to_string()),
                    error,
                    message: text,
                },
                status,
            )
        }
        Err(e) => (sync_error(exec_hash, format!("{:#}", e)), "error"),
    };

    RefWork {
        commit,
        sync: Some(sync),
        sync_status: Some(status),
        create,
    }
}

/// Only executions whose agent ran (or is running) to a usable state may be
/// folded into mainline. A starting or failed execution's worktree holds
/// partial state.
fn ensure_integrable(execution: &Execution) -> EngineResult<()> {
    if let Some(ConflictDetails::SetupFailed { ref_id, .. }) = &execution.conflict_details {
        return Err(EngineError::validation(
            "execution_id",
            format!(
                "execution {} failed to set up ref {} and cannot be integrated",
                execution.id, ref_id
            ),
        ));
    }
    match execution.status {
        ExecutionStatus::Running | ExecutionStatus::Completed | ExecutionStatus::NeedsReview => {
            Ok(())
        }
        status => Err(EngineError::validation(
            "execution_id",
            format!("execution {} is {} and cannot be integrated", execution.id, status),
        )),
    }
}

fn unchanged(worktree: &Path) -> CommitOutcome {
    CommitOutcome {
        committed: false,
        hash: git::head_oid(worktree).ok().map(|o| o.to_string()),
        message: "no changes to commit".to_string(),
    }
}

fn failed_commit(error: String) -> RefWork {
    RefWork {
        commit: CommitOutcome {
            committed: false,
            hash: None,
            message: error.clone(),
        },
        sync: Some(sync_error(None, error)),
        sync_status: Some("error"),
        create: None,
    }
}

fn sync_error(exec_branch_hash: Option<String>, error: String) -> SyncOutcome {
    SyncOutcome {
        synced: false,
        exec_branch_hash,
        mainline_hash: None,
        message: format!("sync failed: {}", error),
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: DbHandle,
        context: Arc<ExecutionContextManager>,
        integration: IntegrationManager,
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
        let integration = IntegrationManager::new(db.clone(), locks, context.clone());
        Fixture {
            _dir: dir,
            db,
            context,
            integration,
            refs,
        }
    }

    fn running_execution(db: &DbHandle, id: &str) {
        let db = db.lock_sync().unwrap();
        db.create_execution(id, "claude", None).unwrap();
        db.transition_execution(id, ExecutionStatus::Running, None)
            .unwrap();
    }

    fn main_file(refs: &Path, ref_id: &str, name: &str) -> Option<String> {
        fs::read_to_string(refs.join(ref_id).join(name)).ok()
    }

    #[tokio::test]
    async fn test_commit_and_fast_forward() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        running_execution(&f.db, "E1");
        let entry = f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        fs::write(entry.working_dir.join("feature.txt"), "new\n").unwrap();

        let report = f
            .integration
            .process_execution_changes("E1", ProcessOptions::default())
            .await
            .unwrap();
        let commit = &report.commits["R1"];
        assert!(commit.committed);
        assert_eq!(commit.message, "refsmith: changes from execution E1");
        let sync = &report.merges["R1"];
        assert!(sync.synced);
        assert_eq!(sync.mainline_hash, commit.hash);
        assert!(!report.needs_review);
        assert_eq!(main_file(&f.refs, "R1", "feature.txt").as_deref(), Some("new\n"));

        let status = f.integration.get_integration_status("E1").await.unwrap();
        let kinds: Vec<ChangeType> = status.refs[0].changes.iter().map(|c| c.change_type).collect();
        assert_eq!(kinds, vec![ChangeType::Commit, ChangeType::Merge]);
        assert_eq!(
            status.refs[0].changes[1].merge_status.as_deref(),
            Some("fast_forward")
        );
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        running_execution(&f.db, "E1");
        let entry = f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        fs::write(entry.working_dir.join("a.txt"), "a\n").unwrap();
        f.integration
            .process_execution_changes("E1", ProcessOptions::default())
            .await
            .unwrap();

        let again = f
            .integration
            .process_execution_changes("E1", ProcessOptions::default())
            .await
            .unwrap();
        assert!(!again.commits["R1"].committed);
        assert!(again.merges["R1"].synced);
        let status = f.integration.get_integration_status("E1").await.unwrap();
        assert_eq!(status.refs[0].changes.len(), 2);
    }

    #[tokio::test]
    async fn test_read_refs_are_not_integrated() {
        let f = fixture();
        init_ref(&f.refs, "docs");
        running_execution(&f.db, "E1");
        let entry = f.context.touch_ref("E1", "docs", RefPermission::Read).await.unwrap();
        fs::write(entry.working_dir.join("scratch.txt"), "x").unwrap();
        let report = f
            .integration
            .process_execution_changes("E1", ProcessOptions::default())
            .await
            .unwrap();
        assert!(report.commits.is_empty());
        assert!(main_file(&f.refs, "docs", "scratch.txt").is_none());
    }

    #[tokio::test]
    async fn test_conflict_flags_execution_for_review() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        running_execution(&f.db, "E1");
        let entry = f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        fs::write(entry.working_dir.join("README.md"), "exec\n").unwrap();
        commit_file(&f.refs.join("R1"), "README.md", "main\n", "main moved");

        let report = f
            .integration
            .process_execution_changes("E1", ProcessOptions::default())
            .await
            .unwrap();
        assert!(report.commits["R1"].committed);
        let sync = &report.merges["R1"];
        assert!(!sync.synced);
        assert_eq!(sync.error.as_deref(), Some("merge conflict"));
        assert!(report.needs_review);

        let execution = f.db.lock_sync().unwrap().get_execution("E1").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::NeedsReview);
        assert!(execution.workspace_preserved);
        match execution.conflict_details {
            Some(ConflictDetails::SyncFailures { failures, .. }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].ref_id, "R1");
                assert_eq!(failures[0].branch_name, "exec-E1");
            }
            other => panic!("Expected sync failures, got {:?}", other),
        }
        // Mainline untouched, execution branch keeps its commit
        assert_eq!(main_file(&f.refs, "R1", "README.md").as_deref(), Some("main\n"));
        assert!(entry.working_dir.exists());
    }

    #[tokio::test]
    async fn test_created_ref_records_create_once() {
        let f = fixture();
        running_execution(&f.db, "E1");
        let entry = f.context.create_ref("E1", "fresh").await.unwrap();
        fs::write(entry.working_dir.join("hello.txt"), "hi\n").unwrap();

        let report = f
            .integration
            .process_execution_changes("E1", ProcessOptions::default())
            .await
            .unwrap();
        let root = RefRepo::open(&f.refs.join("fresh"))
            .unwrap()
            .root_commit("main")
            .unwrap();
        assert_eq!(report.creates["fresh"].hash, root.to_string());

        let again = f
            .integration
            .process_execution_changes("E1", ProcessOptions::default())
            .await
            .unwrap();
        assert!(again.creates.is_empty());
    }

    #[tokio::test]
    async fn test_no_merge_only_commits() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        running_execution(&f.db, "E1");
        let entry = f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        fs::write(entry.working_dir.join("x.txt"), "x\n").unwrap();
        let report = f
            .integration
            .process_execution_changes(
                "E1",
                ProcessOptions {
                    commit_message: Some("custom".into()),
                    merge: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.commits["R1"].message, "custom");
        assert!(report.merges.is_empty());
        assert!(main_file(&f.refs, "R1", "x.txt").is_none());
    }

    #[tokio::test]
    async fn test_failed_execution_is_not_integrated() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        running_execution(&f.db, "E1");
        let entry = f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        fs::write(entry.working_dir.join("half.txt"), "partial\n").unwrap();
        f.db.lock_sync()
            .unwrap()
            .transition_execution("E1", ExecutionStatus::Failed, Some("exit 2"))
            .unwrap();

        let result = f
            .integration
            .process_execution_changes("E1", ProcessOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::Validation { .. })));
        assert!(main_file(&f.refs, "R1", "half.txt").is_none());
        let status = f.integration.get_integration_status("E1").await.unwrap();
        assert!(status.refs[0].changes.is_empty());
        // Left as found for review
        assert!(git::has_uncommitted_changes(&entry.working_dir).unwrap());
    }

    #[tokio::test]
    async fn test_starting_and_setup_failed_executions_are_rejected() {
        let f = fixture();
        init_ref(&f.refs, "R1");
        f.db.lock_sync().unwrap().create_execution("E1", "claude", None).unwrap();
        f.context.touch_ref("E1", "R1", RefPermission::Write).await.unwrap();
        assert!(matches!(
            f.integration
                .process_execution_changes("E1", ProcessOptions::default())
                .await,
            Err(EngineError::Validation { .. })
        ));

        running_execution(&f.db, "E2");
        f.db.lock_sync()
            .unwrap()
            .set_conflict_details(
                "E2",
                Some(&ConflictDetails::SetupFailed {
                    ref_id: "R1".into(),
                    error: "worktree add failed".into(),
                }),
            )
            .unwrap();
        assert!(matches!(
            f.integration
                .process_execution_changes("E2", ProcessOptions::default())
                .await,
            Err(EngineError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_nothing_to_integrate() {
        let f = fixture();
        running_execution(&f.db, "E1");
        let report = f
            .integration
            .process_execution_changes("E1", ProcessOptions::default())
            .await
            .unwrap();
        assert!(report.commits.is_empty());
        assert!(matches!(
            f.integration
                .process_execution_changes("ghost", ProcessOptions::default())
                .await,
            Err(EngineError::ExecutionNotFound { .. })
        ));
    }
}
