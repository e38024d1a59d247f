//! Per-slice git worktrees.
//!
//! Layout under the workspace directory:
//!
//! ```text
//! project_<id>/repo                    shared clone of the project repository
//! project_<id>/worktrees/slice_<id>    one worktree per slice, on the slice branch
//! project_<id>/.gitops.lock            serialises git operations on the shared clone
//! locks/slice_<id>.lock                 serialises work on one slice across processes
//! ```
//!
//! Branches are never deleted by the engine.

use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde_json::json;
use tokio::process::Command;

use super::acl::PathAcl;
use super::locks::KeyedLocks;
use super::models::{Project, Role, Slice};
use crate::audit::{Actor, AuditLog, NewAuditEntry};
use crate::errors::SliceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeHandle {
    pub slice_id: i64,
    pub project_id: i64,
    pub path: PathBuf,
    pub branch: String,
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub sha: String,
    pub files: Vec<String>,
    /// Changed paths outside the role's prefixes, left unstaged.
    pub skipped: Vec<String>,
}

async fn git(dir: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Run git and fail with its stderr on a non-zero exit.
async fn git_ok(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git(dir, args).await?;
    if !output.status.success() {
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr_of(&output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Paths from `git status --porcelain -z`. Rename sources are skipped.
pub fn parse_porcelain_z(raw: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut entries = raw.split('\0').filter(|e| !e.is_empty());
    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let status = &entry[..2];
        paths.push(entry[3..].to_string());
        if status.starts_with('R') || status.starts_with('C') {
            entries.next();
        }
    }
    paths
}

/// Classify a rejected push by its stderr.
pub fn classify_push_error(branch: &str, stderr: &str) -> SliceError {
    let lower = stderr.to_lowercase();
    let auth = [
        "authentication failed",
        "permission denied",
        "could not read username",
        "403",
        "invalid credentials",
        "access denied",
    ];
    if auth.iter().any(|needle| lower.contains(needle)) {
        SliceError::PushAuthError {
            branch: branch.to_string(),
            reason: stderr.to_string(),
        }
    } else {
        SliceError::PushRejected {
            branch: branch.to_string(),
            reason: stderr.to_string(),
        }
    }
}

/// Exclusive hold on one slice, in process and across processes.
/// Released on drop.
pub struct SliceLock {
    _guard: tokio::sync::OwnedMutexGuard<()>,
    _file: std::fs::File,
}

async fn lock_file(lock_path: PathBuf) -> Result<std::fs::File> {
    tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        Ok(file)
    })
    .await
    .context("Lock task panicked")?
}

pub struct WorktreeManager {
    workspace_dir: PathBuf,
    audit: AuditLog,
    project_locks: KeyedLocks<i64>,
    slice_locks: KeyedLocks<i64>,
}

impl WorktreeManager {
    pub fn new(workspace_dir: PathBuf, audit: AuditLog) -> Self {
        Self {
            workspace_dir,
            audit,
            project_locks: KeyedLocks::new(),
            slice_locks: KeyedLocks::new(),
        }
    }

    pub fn project_dir(&self, project_id: i64) -> PathBuf {
        self.workspace_dir.join(format!("project_{}", project_id))
    }

    pub fn repo_dir(&self, project_id: i64) -> PathBuf {
        self.project_dir(project_id).join("repo")
    }

    pub fn worktree_path(&self, project_id: i64, slice_id: i64) -> PathBuf {
        self.project_dir(project_id)
            .join("worktrees")
            .join(format!("slice_{}", slice_id))
    }

    /// Take the in-process project lock and the cross-process lock file.
    async fn lock_project(
        &self,
        project_id: i64,
    ) -> Result<(tokio::sync::OwnedMutexGuard<()>, std::fs::File)> {
        let guard = self.project_locks.lock(&project_id).await;
        let dir = self.project_dir(project_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let file = lock_file(dir.join(".gitops.lock")).await?;
        Ok((guard, file))
    }

    /// Hold `slice_id` from worktree acquisition until commit, push or
    /// release is done.
    pub async fn lock_slice(&self, slice_id: i64) -> Result<SliceLock> {
        let guard = self.slice_locks.lock(&slice_id).await;
        let dir = self.workspace_dir.join("locks");
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let file = lock_file(dir.join(format!("slice_{}.lock", slice_id))).await?;
        Ok(SliceLock {
            _guard: guard,
            _file: file,
        })
    }

    async fn ensure_clone(&self, project: &Project) -> Result<PathBuf> {
        let repo = self.repo_dir(project.id);
        if repo.join(".git").exists() {
            return Ok(repo);
        }
        let parent = self.project_dir(project.id);
        let repo_str = repo.to_str().context("Repository path contains invalid UTF-8")?;
        git_ok(&parent, &["clone", &project.repo_url, repo_str])
            .await
            .with_context(|| format!("Failed to clone {}", project.repo_url))?;
        tracing::info!(project_id = project.id, url = %project.repo_url, "cloned project repository");
        Ok(repo)
    }

    /// Clone the project repository on first use, fetch it afterwards.
    pub async fn sync_repo(&self, project: &Project) -> Result<PathBuf> {
        let (_guard, _file) = self.lock_project(project.id).await?;
        let fresh = !self.repo_dir(project.id).join(".git").exists();
        let repo = self.ensure_clone(project).await?;
        if !fresh {
            git_ok(&repo, &["fetch", "--prune", "origin"])
                .await
                .with_context(|| format!("Failed to fetch {}", project.repo_url))?;
            tracing::debug!(project_id = project.id, "fetched project repository");
        }
        Ok(repo)
    }

    /// A worktree is reusable when it opens as a repository with HEAD on the
    /// slice branch.
    fn is_healthy(path: &Path, branch: &str) -> bool {
        let Ok(repo) = git2::Repository::open(path) else {
            return false;
        };
        repo.head()
            .ok()
            .and_then(|head| head.shorthand().map(|s| s == branch))
            .unwrap_or(false)
    }

    async fn branch_exists(repo: &Path, reference: &str) -> Result<bool> {
        let output = git(repo, &["show-ref", "--verify", "--quiet", reference]).await?;
        Ok(output.status.success())
    }

    /// Create the slice branch from the project's default branch if missing.
    async fn ensure_branch(repo: &Path, project: &Project, branch: &str) -> Result<()> {
        if Self::branch_exists(repo, &format!("refs/heads/{}", branch)).await? {
            return Ok(());
        }
        let remote_base = format!("origin/{}", project.default_branch);
        let base = if Self::branch_exists(repo, &format!("refs/remotes/{}", remote_base)).await? {
            remote_base
        } else {
            project.default_branch.clone()
        };
        git_ok(repo, &["branch", branch, &base]).await?;
        Ok(())
    }

    async fn remove_stale(repo: &Path, path: &Path) {
        if let Some(path_str) = path.to_str() {
            let _ = git(repo, &["worktree", "remove", "--force", path_str]).await;
        }
        if path.exists() {
            let _ = tokio::fs::remove_dir_all(path).await;
        }
        let _ = git(repo, &["worktree", "prune"]).await;
    }

    /// Idempotent: a healthy existing worktree for the slice is returned as is.
    pub async fn acquire(&self, project: &Project, slice: &Slice) -> Result<WorktreeHandle> {
        let path = self.worktree_path(project.id, slice.id);
        let handle = WorktreeHandle {
            slice_id: slice.id,
            project_id: project.id,
            path: path.clone(),
            branch: slice.branch_name.clone(),
        };

        let (_guard, _file) = self.lock_project(project.id).await?;

        if path.exists() && Self::is_healthy(&path, &slice.branch_name) {
            tracing::debug!(slice_id = slice.id, path = %path.display(), "reusing worktree");
            return Ok(handle);
        }

        let created: Result<()> = async {
            let repo = self.ensure_clone(project).await?;
            if path.exists() {
                tracing::warn!(slice_id = slice.id, path = %path.display(), "removing stale worktree");
                Self::remove_stale(&repo, &path).await;
            } else {
                let _ = git(&repo, &["worktree", "prune"]).await;
            }
            Self::ensure_branch(&repo, project, &slice.branch_name).await?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let path_str = path.to_str().context("Worktree path contains invalid UTF-8")?;
            git_ok(&repo, &["worktree", "add", path_str, &slice.branch_name]).await?;
            Ok(())
        }
        .await;

        if let Err(e) = created {
            return Err(SliceError::WorktreeCreationError {
                slice_id: slice.id,
                reason: format!("{:#}", e),
            }
            .into());
        }

        self.audit
            .record_best_effort(
                NewAuditEntry::slice(Actor::system(), "worktree.acquired", slice.id).with_payload(
                    json!({"path": path.display().to_string(), "branch": slice.branch_name}),
                ),
            )
            .await;
        tracing::info!(slice_id = slice.id, branch = %slice.branch_name, "worktree acquired");
        Ok(handle)
    }

    /// Remove the worktree. Failures are audited and swallowed; the branch is kept.
    pub async fn release(&self, handle: &WorktreeHandle) {
        let lock = self.lock_project(handle.project_id).await;
        let repo = self.repo_dir(handle.project_id);

        let removed = match handle.path.to_str() {
            Some(path_str) => git_ok(&repo, &["worktree", "remove", "--force", path_str])
                .await
                .map(|_| ()),
            None => Err(anyhow::anyhow!("Worktree path contains invalid UTF-8")),
        };

        if let Err(e) = removed {
            tracing::warn!(slice_id = handle.slice_id, error = %e, "worktree remove failed, falling back");
            self.audit
                .record_best_effort(
                    NewAuditEntry::slice(Actor::system(), "worktree.release_failed", handle.slice_id)
                        .with_payload(json!({"error": format!("{:#}", e)})),
                )
                .await;
            if handle.path.exists()
                && let Err(e) = tokio::fs::remove_dir_all(&handle.path).await
            {
                tracing::error!(slice_id = handle.slice_id, error = %e, "failed to delete worktree directory");
            }
            let _ = git(&repo, &["worktree", "prune"]).await;
        }
        drop(lock);

        self.audit
            .record_best_effort(NewAuditEntry::slice(
                Actor::system(),
                "worktree.released",
                handle.slice_id,
            ))
            .await;
    }

    /// Stage the role's permitted changes and commit them.
    ///
    /// Changed paths outside the role's prefixes stay unstaged. Returns
    /// `NothingToCommit` when no permitted change remains.
    pub async fn commit(
        &self,
        handle: &WorktreeHandle,
        role: Role,
        acl: &PathAcl,
        message: &str,
    ) -> Result<CommitOutcome> {
        let commit_err = |reason: String| SliceError::CommitError {
            slice_id: handle.slice_id,
            reason,
        };

        let status = git(
            &handle.path,
            &["status", "--porcelain", "-z", "--untracked-files=all"],
        )
        .await?;
        if !status.status.success() {
            return Err(commit_err(stderr_of(&status)).into());
        }
        let changed = parse_porcelain_z(&String::from_utf8_lossy(&status.stdout));

        let (files, skipped): (Vec<String>, Vec<String>) = changed
            .into_iter()
            .partition(|path| acl.is_allowed(role, path));
        for path in &skipped {
            tracing::warn!(slice_id = handle.slice_id, %role, path = %path, "leaving unpermitted change unstaged");
        }
        if files.is_empty() {
            return Err(SliceError::NothingToCommit {
                slice_id: handle.slice_id,
            }
            .into());
        }

        let mut add_args = vec!["add", "-A", "--"];
        add_args.extend(files.iter().map(String::as_str));
        let added = git(&handle.path, &add_args).await?;
        if !added.status.success() {
            return Err(commit_err(stderr_of(&added)).into());
        }

        let name = format!("user.name=sliceforge-{}", role);
        let email = format!("user.email={}@sliceforge.local", role);
        let committed = git(
            &handle.path,
            &["-c", &name, "-c", &email, "commit", "-m", message],
        )
        .await?;
        if !committed.status.success() {
            let stdout = String::from_utf8_lossy(&committed.stdout);
            if stdout.contains("nothing to commit") {
                return Err(SliceError::NothingToCommit {
                    slice_id: handle.slice_id,
                }
                .into());
            }
            return Err(commit_err(stderr_of(&committed)).into());
        }

        let sha = git_ok(&handle.path, &["rev-parse", "HEAD"])
            .await
            .map_err(|e| commit_err(format!("{:#}", e)))?;
        tracing::info!(slice_id = handle.slice_id, %role, sha = %sha, files = files.len(), "committed");
        Ok(CommitOutcome {
            sha,
            files,
            skipped,
        })
    }

    /// Push the slice branch to `origin`.
    pub async fn push(&self, handle: &WorktreeHandle) -> Result<()> {
        let output = git(&handle.path, &["push", "-u", "origin", &handle.branch]).await?;
        if !output.status.success() {
            return Err(classify_push_error(&handle.branch, &stderr_of(&output)).into());
        }
        tracing::info!(slice_id = handle.slice_id, branch = %handle.branch, "pushed branch");
        Ok(())
    }

    pub async fn head_sha(&self, handle: &WorktreeHandle) -> Result<String> {
        git_ok(&handle.path, &["rev-parse", "HEAD"]).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::db::{DbHandle, SliceDb};
    use crate::engine::models::{NewSlice, RiskLevel};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// A local "origin" repository on `main` with one commit.
    pub(crate) fn origin_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = git2::Repository::init_opts(dir.path(), &opts).unwrap();
        std::fs::write(dir.path().join("README.md"), "# Demo\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        dir
    }

    pub(crate) struct Fixture {
        pub origin: TempDir,
        pub workspace: TempDir,
        pub db: DbHandle,
        pub manager: WorktreeManager,
        pub project: Project,
        pub slice: Slice,
    }

    pub(crate) fn fixture() -> Fixture {
        let origin = origin_repo();
        let workspace = TempDir::new().unwrap();
        let db = DbHandle::new(SliceDb::new_in_memory().unwrap());
        let (project, slice) = {
            let guard = db.lock_sync().unwrap();
            let project = guard
                .create_project(
                    "demo",
                    origin.path().to_str().unwrap(),
                    "main",
                    Some("acme/shop"),
                )
                .unwrap();
            let slice = guard
                .create_slice(&NewSlice {
                    project_id: project.id,
                    title: "Add login".into(),
                    scope: "login".into(),
                    out_of_scope: String::new(),
                    risk_level: RiskLevel::Low,
                    acceptance: vec![],
                })
                .unwrap();
            (project, slice)
        };
        let manager =
            WorktreeManager::new(workspace.path().to_path_buf(), AuditLog::new(db.clone()));
        Fixture {
            origin,
            workspace,
            db,
            manager,
            project,
            slice,
        }
    }

    fn dev_acl() -> PathAcl {
        PathAcl::new(HashMap::from([(
            Role::Dev,
            vec!["src/".to_string(), "reports/".to_string()],
        )]))
    }

    #[test]
    fn porcelain_parsing_handles_renames() {
        let raw = "?? src/new.rs\0R  src/b.rs\0src/a.rs\0 M docs/x.md\0";
        assert_eq!(
            parse_porcelain_z(raw),
            vec!["src/new.rs", "src/b.rs", "docs/x.md"]
        );
    }

    #[test]
    fn push_errors_are_classified() {
        assert!(matches!(
            classify_push_error("b", "fatal: Authentication failed for 'https://x'"),
            SliceError::PushAuthError { .. }
        ));
        assert!(matches!(
            classify_push_error("b", "! [rejected] b -> b (non-fast-forward)"),
            SliceError::PushRejected { .. }
        ));
    }

    #[tokio::test]
    async fn acquire_is_idempotent_and_on_slice_branch() {
        let f = fixture();
        let first = f.manager.acquire(&f.project, &f.slice).await.unwrap();
        assert!(first.path.join("README.md").exists());
        assert!(WorktreeManager::is_healthy(&first.path, &f.slice.branch_name));

        std::fs::write(first.path.join("scratch.txt"), "keep").unwrap();
        let second = f.manager.acquire(&f.project, &f.slice).await.unwrap();
        assert_eq!(first, second);
        assert!(second.path.join("scratch.txt").exists());
    }

    #[tokio::test]
    async fn concurrent_acquires_yield_one_worktree() {
        let f = fixture();
        // Two managers on one workspace stand in for two processes.
        let managers: Vec<Arc<WorktreeManager>> = (0..2)
            .map(|_| {
                Arc::new(WorktreeManager::new(
                    f.workspace.path().to_path_buf(),
                    AuditLog::new(f.db.clone()),
                ))
            })
            .collect();

        let mut set = tokio::task::JoinSet::new();
        for i in 0..8 {
            let manager = Arc::clone(&managers[i % 2]);
            let (project, slice) = (f.project.clone(), f.slice.clone());
            set.spawn(async move { manager.acquire(&project, &slice).await });
        }
        let mut handles = Vec::new();
        while let Some(joined) = set.join_next().await {
            handles.push(joined.unwrap().unwrap());
        }
        assert_eq!(handles.len(), 8);
        assert!(handles.iter().all(|h| *h == handles[0]));

        let listing = git_ok(
            &f.manager.repo_dir(f.project.id),
            &["worktree", "list", "--porcelain"],
        )
        .await
        .unwrap();
        let suffix = format!("slice_{}", f.slice.id);
        let worktrees: Vec<&str> = listing
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .collect();
        assert_eq!(worktrees.iter().filter(|w| w.ends_with(&suffix)).count(), 1);
        assert_eq!(worktrees.len(), 2, "{}", listing);
    }

    #[tokio::test]
    async fn slice_lock_excludes_other_managers() {
        let f = fixture();
        let other = WorktreeManager::new(
            f.workspace.path().to_path_buf(),
            AuditLog::new(f.db.clone()),
        );
        let held = f.manager.lock_slice(f.slice.id).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(200), other.lock_slice(f.slice.id)).await;
        assert!(blocked.is_err());
        assert!(other.lock_slice(f.slice.id + 1).await.is_ok());

        drop(held);
        other.lock_slice(f.slice.id).await.unwrap();
    }

    #[tokio::test]
    async fn stale_worktree_directory_is_replaced() {
        let f = fixture();
        let path = f.manager.worktree_path(f.project.id, f.slice.id);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("junk"), "x").unwrap();

        let handle = f.manager.acquire(&f.project, &f.slice).await.unwrap();
        assert!(!handle.path.join("junk").exists());
        assert!(WorktreeManager::is_healthy(&handle.path, &f.slice.branch_name));
    }

    #[tokio::test]
    async fn commit_stages_only_permitted_paths() {
        let f = fixture();
        let handle = f.manager.acquire(&f.project, &f.slice).await.unwrap();
        std::fs::create_dir_all(handle.path.join("src")).unwrap();
        std::fs::create_dir_all(handle.path.join("docs")).unwrap();
        std::fs::write(handle.path.join("src/app.py"), "print('hi')\n").unwrap();
        std::fs::write(handle.path.join("docs/x.md"), "nope\n").unwrap();

        let outcome = f
            .manager
            .commit(&handle, Role::Dev, &dev_acl(), "[dev] slice 1: app")
            .await
            .unwrap();
        assert_eq!(outcome.files, vec!["src/app.py"]);
        assert_eq!(outcome.skipped, vec!["docs/x.md"]);
        assert_eq!(outcome.sha.len(), 40);
        assert_eq!(f.manager.head_sha(&handle).await.unwrap(), outcome.sha);

        // The unpermitted file is still there, untracked.
        let again = f
            .manager
            .commit(&handle, Role::Dev, &dev_acl(), "[dev] again")
            .await
            .unwrap_err();
        assert!(matches!(
            crate::errors::as_slice_error(&again),
            Some(SliceError::NothingToCommit { .. })
        ));
    }

    #[tokio::test]
    async fn release_removes_worktree_and_keeps_branch() {
        let f = fixture();
        let handle = f.manager.acquire(&f.project, &f.slice).await.unwrap();
        f.manager.release(&handle).await;
        assert!(!handle.path.exists());

        let repo = git2::Repository::open(f.manager.repo_dir(f.project.id)).unwrap();
        assert!(
            repo.find_branch(&f.slice.branch_name, git2::BranchType::Local)
                .is_ok()
        );

        // Reacquire after release works.
        let again = f.manager.acquire(&f.project, &f.slice).await.unwrap();
        assert!(again.path.exists());
    }

    #[tokio::test]
    async fn push_to_local_origin() {
        let f = fixture();
        let handle = f.manager.acquire(&f.project, &f.slice).await.unwrap();
        std::fs::create_dir_all(handle.path.join("src")).unwrap();
        std::fs::write(handle.path.join("src/a.rs"), "fn main() {}\n").unwrap();
        f.manager
            .commit(&handle, Role::Dev, &dev_acl(), "[dev] a")
            .await
            .unwrap();
        f.manager.push(&handle).await.unwrap();

        let origin = git2::Repository::open(f.origin.path()).unwrap();
        assert!(
            origin
                .find_branch(&f.slice.branch_name, git2::BranchType::Local)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn sync_fetches_after_first_clone() {
        let f = fixture();
        let repo = f.manager.sync_repo(&f.project).await.unwrap();
        assert!(repo.join("README.md").exists());
        let again = f.manager.sync_repo(&f.project).await.unwrap();
        assert_eq!(repo, again);
    }
}
