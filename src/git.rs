//! git2-backed operations on ref repositories and their worktrees.
//!
//! `RefRepo` wraps the canonical checkout of one ref. Worktree-local
//! operations (status, commit) are free functions taking the worktree path.
//! Everything here is blocking; async callers go through `RefLocks::run`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Oid, Repository, RepositoryInitOptions, Signature, Sort, StatusOptions,
    WorktreeAddOptions, WorktreePruneOptions,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::MergeStrategy;

const SIGNATURE_NAME: &str = "refsmith";
const SIGNATURE_EMAIL: &str = "refsmith@localhost";

/// Outcome of folding a branch into mainline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    /// Mainline already contains the branch.
    UpToDate { mainline: Oid },
    FastForwarded { mainline: Oid },
    Merged { mainline: Oid },
    /// Three-way merge would conflict in these paths.
    Conflict { paths: Vec<String> },
    /// Mainline moved on and only fast-forward was allowed.
    Diverged,
    /// The canonical checkout has uncommitted tracked changes.
    DirtyWorktree,
}

impl SyncResult {
    pub fn is_synced(&self) -> bool {
        matches!(
            self,
            Self::UpToDate { .. } | Self::FastForwarded { .. } | Self::Merged { .. }
        )
    }

    pub fn mainline(&self) -> Option<Oid> {
        match self {
            Self::UpToDate { mainline }
            | Self::FastForwarded { mainline }
            | Self::Merged { mainline } => Some(*mainline),
            _ => None,
        }
    }
}

pub struct RefRepo {
    repo: Repository,
    path: PathBuf,
}

impl RefRepo {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)
            .with_context(|| format!("Failed to open git repository at {}", path.display()))?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    /// Initialise a new repository whose `mainline` starts with an empty
    /// initial commit.
    pub fn init(path: &Path, mainline: &str) -> Result<(Self, Oid)> {
        if path.join(".git").exists() {
            anyhow::bail!("Repository already exists at {}", path.display());
        }
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(mainline);
        let repo = Repository::init_opts(path, &opts)
            .with_context(|| format!("Failed to init repository at {}", path.display()))?;
        let oid = {
            let sig = signature(&repo)?;
            let tree_id = repo.index()?.write_tree()?;
            let tree = repo.find_tree(tree_id)?;
            repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
                .context("Failed to create initial commit")?
        };
        Ok((
            Self {
                repo,
                path: path.to_path_buf(),
            },
            oid,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch_tip(&self, name: &str) -> Result<Option<Oid>> {
        match self.repo.find_branch(name, BranchType::Local) {
            Ok(branch) => Ok(branch.get().target()),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to look up branch {}", name)),
        }
    }

    pub fn require_branch_tip(&self, name: &str) -> Result<Oid> {
        self.branch_tip(name)?
            .with_context(|| format!("Branch {} not found in {}", name, self.path.display()))
    }

    /// First commit reachable from `branch`.
    pub fn root_commit(&self, branch: &str) -> Result<Oid> {
        let tip = self.require_branch_tip(branch)?;
        let mut walk = self.repo.revwalk()?;
        walk.push(tip)?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        let oid = walk.next().context("Branch has no history")??;
        Ok(oid)
    }

    /// Create `name` at `target`. Fails if the branch already exists.
    pub fn create_branch(&self, name: &str, target: Oid) -> Result<()> {
        let commit = self.repo.find_commit(target)?;
        self.repo
            .branch(name, &commit, false)
            .with_context(|| format!("Failed to create branch {}", name))?;
        Ok(())
    }

    /// Delete a local branch. Fails while it is checked out anywhere.
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        let mut branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .with_context(|| format!("Branch {} not found", name))?;
        branch
            .delete()
            .with_context(|| format!("Failed to delete branch {}", name))?;
        Ok(())
    }

    /// Add a worktree at `path` checked out on `branch`.
    pub fn add_worktree(&self, name: &str, path: &Path, branch: &str) -> Result<()> {
        // Metadata left behind by a crashed run would block the name
        if let Ok(stale) = self.repo.find_worktree(name)
            && stale.validate().is_err()
        {
            stale.prune(None).context("Failed to prune stale worktree")?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let reference = self
            .repo
            .find_reference(&format!("refs/heads/{}", branch))
            .with_context(|| format!("Branch {} not found", branch))?;
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        self.repo
            .worktree(name, path, Some(&opts))
            .with_context(|| format!("Failed to add worktree at {}", path.display()))?;
        Ok(())
    }

    /// Delete the worktree directory and prune its metadata. Returns whether a
    /// directory was removed.
    pub fn remove_worktree(&self, name: &str, path: &Path) -> Result<bool> {
        let existed = path.exists();
        if existed {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        if let Ok(worktree) = self.repo.find_worktree(name) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(true).working_tree(true);
            worktree
                .prune(Some(&mut opts))
                .with_context(|| format!("Failed to prune worktree {}", name))?;
        }
        Ok(existed)
    }

    pub fn has_worktree(&self, name: &str) -> bool {
        self.repo.find_worktree(name).is_ok()
    }

    /// Fold `branch` into `mainline` without touching `branch`.
    pub fn sync_branch(
        &self,
        branch: &str,
        mainline: &str,
        strategy: MergeStrategy,
    ) -> Result<SyncResult> {
        let branch_oid = self.require_branch_tip(branch)?;
        let main_oid = self.require_branch_tip(mainline)?;

        if branch_oid == main_oid || self.repo.graph_descendant_of(main_oid, branch_oid)? {
            return Ok(SyncResult::UpToDate { mainline: main_oid });
        }

        let mainline_checked_out = self.is_checked_out(mainline)?;
        if mainline_checked_out && is_dirty(&self.repo, false)? {
            return Ok(SyncResult::DirtyWorktree);
        }

        let (target, result) = if self.repo.graph_descendant_of(branch_oid, main_oid)? {
            (branch_oid, SyncResult::FastForwarded { mainline: branch_oid })
        } else if strategy == MergeStrategy::FastForwardOnly {
            return Ok(SyncResult::Diverged);
        } else {
            let ours = self.repo.find_commit(main_oid)?;
            let theirs = self.repo.find_commit(branch_oid)?;
            let mut index = self
                .repo
                .merge_commits(&ours, &theirs, None)
                .context("Failed to compute merge")?;
            if index.has_conflicts() {
                return Ok(SyncResult::Conflict {
                    paths: conflict_paths(&index)?,
                });
            }
            let tree_id = index
                .write_tree_to(&self.repo)
                .context("Failed to write merge tree")?;
            let tree = self.repo.find_tree(tree_id)?;
            let sig = signature(&self.repo)?;
            let message = format!("Merge branch '{}' into {}", branch, mainline);
            let merge_oid = self
                .repo
                .commit(None, &sig, &sig, &message, &tree, &[&ours, &theirs])
                .context("Failed to create merge commit")?;
            (merge_oid, SyncResult::Merged { mainline: merge_oid })
        };

        if mainline_checked_out {
            let commit = self.repo.find_commit(target)?;
            let mut checkout = CheckoutBuilder::new();
            checkout.safe();
            self.repo
                .checkout_tree(commit.as_object(), Some(&mut checkout))
                .context("Failed to update canonical checkout")?;
        }
        self.repo
            .find_reference(&format!("refs/heads/{}", mainline))?
            .set_target(target, &format!("refsmith: sync {}", branch))
            .with_context(|| format!("Failed to move {}", mainline))?;

        Ok(result)
    }

    fn is_checked_out(&self, branch: &str) -> Result<bool> {
        if self.repo.is_bare() || self.repo.head_detached().unwrap_or(false) {
            return Ok(false);
        }
        match self.repo.head() {
            Ok(head) => Ok(head.shorthand() == Some(branch)),
            // Unborn HEAD still points at the branch name
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(false),
            Err(e) => Err(e).context("Failed to read HEAD"),
        }
    }
}

/// Whether the checkout at `workdir` has uncommitted changes, untracked
/// files included.
pub fn has_uncommitted_changes(workdir: &Path) -> Result<bool> {
    let repo = Repository::open(workdir)
        .with_context(|| format!("Failed to open worktree {}", workdir.display()))?;
    is_dirty(&repo, true)
}

/// Stage everything (including deletions) and commit on the current branch.
/// Returns `None` when the staged tree matches HEAD.
pub fn commit_all(workdir: &Path, message: &str) -> Result<Option<Oid>> {
    let repo = Repository::open(workdir)
        .with_context(|| format!("Failed to open worktree {}", workdir.display()))?;
    let mut index = repo.index()?;
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .context("Failed to stage changes")?;
    index
        .update_all(["*"].iter(), None)
        .context("Failed to stage deletions")?;
    index.write()?;
    let tree_id = index.write_tree()?;

    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    if let Some(parent) = &parent
        && parent.tree_id() == tree_id
    {
        return Ok(None);
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = signature(&repo)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .context("Failed to commit changes")?;
    Ok(Some(oid))
}

/// Current HEAD commit of a checkout.
pub fn head_oid(workdir: &Path) -> Result<Oid> {
    let repo = Repository::open(workdir)
        .with_context(|| format!("Failed to open {}", workdir.display()))?;
    let head = repo.head().context("Failed to read HEAD")?;
    head.target().context("HEAD has no target")
}

/// Detach the checkout's HEAD from `branch` at the same commit. Files and
/// index are left as they are. Returns false when HEAD was not on `branch`.
pub fn detach_head(workdir: &Path, branch: &str) -> Result<bool> {
    let repo = Repository::open(workdir)
        .with_context(|| format!("Failed to open {}", workdir.display()))?;
    let head = repo.head().context("Failed to read HEAD")?;
    if !head.is_branch() || head.shorthand() != Some(branch) {
        return Ok(false);
    }
    let oid = head.target().context("HEAD has no target")?;
    repo.set_head_detached(oid)
        .with_context(|| format!("Failed to detach HEAD in {}", workdir.display()))?;
    Ok(true)
}

/// Point the checkout's HEAD back at `branch`. Files and index are left as
/// they are.
pub fn attach_head(workdir: &Path, branch: &str) -> Result<()> {
    let repo = Repository::open(workdir)
        .with_context(|| format!("Failed to open {}", workdir.display()))?;
    repo.set_head(&format!("refs/heads/{}", branch))
        .with_context(|| format!("Failed to attach HEAD to {} in {}", branch, workdir.display()))
}

fn is_dirty(repo: &Repository, include_untracked: bool) -> Result<bool> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(include_untracked)
        .recurse_untracked_dirs(include_untracked)
        .include_ignored(false);
    let statuses = repo
        .statuses(Some(&mut opts))
        .context("Failed to read status")?;
    Ok(!statuses.is_empty())
}

fn conflict_paths(index: &git2::Index) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict
            .our
            .or(conflict.their)
            .or(conflict.ancestor);
        if let Some(entry) = entry {
            paths.push(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Signature::now(SIGNATURE_NAME, SIGNATURE_EMAIL).context("Failed to build signature"),
    }
}

/// Serializes git mutation per ref. Different refs proceed in parallel.
#[derive(Clone, Default)]
pub struct RefLocks {
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RefLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, ref_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(ref_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Run blocking git work for `ref_id` on the blocking pool while holding
    /// the ref's lock.
    pub async fn run<F, R>(&self, ref_id: &str, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.lock(ref_id).await;
        tokio::task::spawn_blocking(f)
            .await
            .context("Git task panicked")?
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_mainline_with_initial_commit() {
        let dir = tempdir().unwrap();
        let (repo, oid) = RefRepo::init(&dir.path().join("r1"), "main").unwrap();
        assert_eq!(repo.branch_tip("main").unwrap(), Some(oid));
        assert_eq!(repo.root_commit("main").unwrap(), oid);
        assert!(RefRepo::init(&dir.path().join("r1"), "main").is_err());
    }

    #[test]
    fn test_commit_all_skips_clean_tree() {
        let dir = tempdir().unwrap();
        let path = init_ref(dir.path(), "r1");
        assert!(!has_uncommitted_changes(&path).unwrap());
        assert!(commit_all(&path, "nothing").unwrap().is_none());

        fs::write(path.join("new.txt"), "x").unwrap();
        assert!(has_uncommitted_changes(&path).unwrap());
        assert!(commit_all(&path, "add new").unwrap().is_some());
        assert!(!has_uncommitted_changes(&path).unwrap());
    }

    #[test]
    fn test_commit_all_stages_deletions() {
        let dir = tempdir().unwrap();
        let path = init_ref(dir.path(), "r1");
        fs::remove_file(path.join("README.md")).unwrap();
        assert!(commit_all(&path, "remove readme").unwrap().is_some());
        let repo = Repository::open(&path).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("README.md").is_none());
    }

    #[test]
    fn test_worktree_add_and_remove() {
        let dir = tempdir().unwrap();
        let path = init_ref(dir.path(), "r1");
        let repo = RefRepo::open(&path).unwrap();
        let tip = repo.require_branch_tip("main").unwrap();
        repo.create_branch("exec-e1", tip).unwrap();
        assert!(repo.create_branch("exec-e1", tip).is_err());

        let wt = dir.path().join("ws/e1/r1");
        repo.add_worktree("exec-e1", &wt, "exec-e1").unwrap();
        assert!(wt.join("README.md").exists());
        assert!(repo.has_worktree("exec-e1"));

        // Checked-out branches cannot be deleted
        assert!(repo.delete_branch("exec-e1").is_err());

        assert!(repo.remove_worktree("exec-e1", &wt).unwrap());
        assert!(!wt.exists());
        assert!(!repo.has_worktree("exec-e1"));
        repo.delete_branch("exec-e1").unwrap();
        assert!(repo.branch_tip("exec-e1").unwrap().is_none());
        // Second removal is a no-op
        assert!(!repo.remove_worktree("exec-e1", &wt).unwrap());
    }

    #[test]
    fn test_detached_worktree_keeps_files_and_frees_branch() {
        let dir = tempdir().unwrap();
        let path = init_ref(dir.path(), "r1");
        let repo = RefRepo::open(&path).unwrap();
        let tip = repo.require_branch_tip("main").unwrap();
        repo.create_branch("exec-e1", tip).unwrap();
        let wt = dir.path().join("ws/e1/r1");
        repo.add_worktree("exec-e1", &wt, "exec-e1").unwrap();
        std::fs::write(wt.join("wip.txt"), "unsaved\n").unwrap();

        assert!(!detach_head(&wt, "other").unwrap());
        assert!(detach_head(&wt, "exec-e1").unwrap());
        assert_eq!(head_oid(&wt).unwrap(), tip);
        repo.delete_branch("exec-e1").unwrap();

        repo.create_branch("exec-e1", tip).unwrap();
        attach_head(&wt, "exec-e1").unwrap();
        assert!(repo.delete_branch("exec-e1").is_err());
        assert_eq!(std::fs::read_to_string(wt.join("wip.txt")).unwrap(), "unsaved\n");
        assert!(has_uncommitted_changes(&wt).unwrap());
    }

    #[test]
    fn test_sync_fast_forward_updates_checkout() {
        let dir = tempdir().unwrap();
        let path = init_ref(dir.path(), "r1");
        let repo = RefRepo::open(&path).unwrap();
        repo.create_branch("exec-e1", repo.require_branch_tip("main").unwrap())
            .unwrap();
        let wt = dir.path().join("ws/e1/r1");
        repo.add_worktree("exec-e1", &wt, "exec-e1").unwrap();
        let exec_tip = commit_file(&wt, "feature.txt", "feature\n", "Add feature");

        let result = repo.sync_branch("exec-e1", "main", MergeStrategy::Sync).unwrap();
        assert_eq!(result, SyncResult::FastForwarded { mainline: exec_tip });
        assert_eq!(repo.branch_tip("main").unwrap(), Some(exec_tip));
        assert!(path.join("feature.txt").exists());
        assert!(!has_uncommitted_changes(&path).unwrap());

        // Syncing again is a no-op
        assert!(matches!(
            repo.sync_branch("exec-e1", "main", MergeStrategy::Sync).unwrap(),
            SyncResult::UpToDate { .. }
        ));
    }

    #[test]
    fn test_sync_merges_diverged_without_conflict() {
        let dir = tempdir().unwrap();
        let path = init_ref(dir.path(), "r1");
        let repo = RefRepo::open(&path).unwrap();
        repo.create_branch("exec-e1", repo.require_branch_tip("main").unwrap())
            .unwrap();
        let wt = dir.path().join("ws/e1/r1");
        repo.add_worktree("exec-e1", &wt, "exec-e1").unwrap();
        let exec_tip = commit_file(&wt, "a.txt", "from exec\n", "exec change");
        commit_file(&path, "b.txt", "from main\n", "main change");

        assert_eq!(
            repo.sync_branch("exec-e1", "main", MergeStrategy::FastForwardOnly)
                .unwrap(),
            SyncResult::Diverged
        );

        let result = repo.sync_branch("exec-e1", "main", MergeStrategy::Sync).unwrap();
        let SyncResult::Merged { mainline } = result else {
            panic!("Expected merge, got {:?}", result);
        };
        let git = Repository::open(&path).unwrap();
        assert_eq!(git.find_commit(mainline).unwrap().parent_count(), 2);
        assert!(path.join("a.txt").exists());
        assert!(path.join("b.txt").exists());
        // Execution branch untouched
        assert_eq!(repo.branch_tip("exec-e1").unwrap(), Some(exec_tip));
    }

    #[test]
    fn test_sync_reports_conflicts_and_leaves_mainline() {
        let dir = tempdir().unwrap();
        let path = init_ref(dir.path(), "r1");
        let repo = RefRepo::open(&path).unwrap();
        repo.create_branch("exec-e1", repo.require_branch_tip("main").unwrap())
            .unwrap();
        let wt = dir.path().join("ws/e1/r1");
        repo.add_worktree("exec-e1", &wt, "exec-e1").unwrap();
        commit_file(&wt, "README.md", "exec version\n", "exec edit");
        let main_tip = commit_file(&path, "README.md", "main version\n", "main edit");

        let result = repo.sync_branch("exec-e1", "main", MergeStrategy::Sync).unwrap();
        assert_eq!(
            result,
            SyncResult::Conflict {
                paths: vec!["README.md".to_string()]
            }
        );
        assert!(!result.is_synced());
        assert_eq!(repo.branch_tip("main").unwrap(), Some(main_tip));
        assert_eq!(
            fs::read_to_string(path.join("README.md")).unwrap(),
            "main version\n"
        );
    }

    #[test]
    fn test_sync_refuses_dirty_canonical_checkout() {
        let dir = tempdir().unwrap();
        let path = init_ref(dir.path(), "r1");
        let repo = RefRepo::open(&path).unwrap();
        repo.create_branch("exec-e1", repo.require_branch_tip("main").unwrap())
            .unwrap();
        let wt = dir.path().join("ws/e1/r1");
        repo.add_worktree("exec-e1", &wt, "exec-e1").unwrap();
        commit_file(&wt, "feature.txt", "x\n", "feature");
        fs::write(path.join("README.md"), "local edit\n").unwrap();

        assert_eq!(
            repo.sync_branch("exec-e1", "main", MergeStrategy::Sync).unwrap(),
            SyncResult::DirtyWorktree
        );
    }

    #[tokio::test]
    async fn test_ref_locks_serialize_same_ref() {
        let locks = RefLocks::new();
        let guard = locks.lock("r1").await;
        // Another ref is independent
        let other = locks.lock("r2").await;
        drop(other);

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move { locks2.run("r1", || Ok(7)).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert_eq!(waiter.await.unwrap().unwrap(), 7);
    }
}
