//! Per-instance working-tree manager.
//!
//! Each process owns `BASE/instance_<id>/`, a clone of the configured
//! remote branch. The instance id comes from `INSTANCE_ID` when the
//! deployment provides one, otherwise from pid + start time + a random
//! suffix; an exclusive lock file next to the directory guards against
//! id collisions on the same host.
//!
//! The tree is disposable: any sync failure discards it and re-clones.
//! Local commits that never reached origin are recreated from the
//! queue on the next batch, so losing them is safe.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use rand::Rng;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notevault_security::{validate_filename, validate_path};

use crate::GitError;
use crate::auth::AuthProvider;

const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);
const COMMIT_TIMEOUT: Duration = Duration::from_secs(30);
const PUSH_TIMEOUT: Duration = Duration::from_secs(180);
const PUSH_RETRIES: u32 = 3;

const BOT_NAME: &str = "notevault-bot";
const BOT_EMAIL: &str = "bot@notevault.local";

#[derive(Debug, Clone)]
pub struct GitWorkspace {
    pub base_dir: PathBuf,
    pub remote_url: String,
    pub branch: String,
    /// Sibling instance directories kept by garbage collection.
    pub instance_retention: usize,
    /// Fixed instance id; `None` resolves from the environment.
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommitFile {
    /// Path relative to the working root, e.g. `notes/a.md`.
    pub path: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub commit_id: String,
    pub files: usize,
    /// False when the staged content was already in HEAD (a retry of
    /// a batch whose commit survived a crash) and only the push ran.
    pub created_commit: bool,
}

pub struct GitOperator {
    workspace: GitWorkspace,
    auth: Arc<dyn AuthProvider>,
    work_dir: PathBuf,
    instance_id: String,
    /// Held for the operator's lifetime; released on drop.
    _lock: std::fs::File,
}

impl std::fmt::Debug for GitOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitOperator")
            .field("work_dir", &self.work_dir)
            .field("instance_id", &self.instance_id)
            .field("branch", &self.workspace.branch)
            .finish()
    }
}

impl GitOperator {
    /// Claim the instance directory, bring the working tree up to
    /// date (cloning if needed), and garbage-collect stale siblings.
    pub async fn prepare(
        workspace: GitWorkspace,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, GitError> {
        let instance_id = workspace
            .instance_id
            .clone()
            .or_else(instance_id_from_env)
            .unwrap_or_else(generated_instance_id);

        std::fs::create_dir_all(&workspace.base_dir)?;
        let work_dir = workspace.base_dir.join(format!("instance_{instance_id}"));
        let lock_path = workspace.base_dir.join(format!("instance_{instance_id}.lock"));
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.try_lock_exclusive().map_err(|_| {
            GitError::Permanent(format!(
                "instance directory instance_{instance_id} is owned by another process"
            ))
        })?;

        let operator = Self {
            workspace,
            auth,
            work_dir,
            instance_id,
            _lock: lock,
        };
        operator.sync_working_tree().await?;
        operator.gc_siblings();
        Ok(operator)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Ensure the working tree exists and matches origin. A corrupt
    /// or diverged tree is discarded and re-cloned, never repaired in
    /// place.
    pub async fn sync_working_tree(&self) -> Result<(), GitError> {
        if !self.work_dir.join(".git").exists() {
            info!(dir = %self.work_dir.display(), "working tree missing, cloning");
            return self.fresh_clone().await;
        }
        match self.fetch_fast_forward().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                warn!(error = %err, "fast-forward failed, discarding working tree");
                self.fresh_clone().await
            }
        }
    }

    async fn fresh_clone(&self) -> Result<(), GitError> {
        if self.work_dir.exists() {
            std::fs::remove_dir_all(&self.work_dir)?;
        }
        let url = self.authenticated_url().await?;
        let target = self.work_dir.display().to_string();
        let cloned = self
            .run_git_in(
                &self.workspace.base_dir.clone(),
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--branch",
                    &self.workspace.branch,
                    "--single-branch",
                    &url,
                    &target,
                ],
                CLONE_TIMEOUT,
            )
            .await;

        match cloned {
            Ok(_) => {}
            Err(GitError::Permanent(message))
                if message.contains("not found in upstream") || message.contains("remote branch") =>
            {
                // Empty remote: clone what exists and create the branch.
                debug!("remote branch absent, cloning empty repository");
                self.run_git_in(
                    &self.workspace.base_dir.clone(),
                    &["clone", "--depth", "1", &url, &target],
                    CLONE_TIMEOUT,
                )
                .await?;
                self.run_git(&["checkout", "-B", &self.workspace.branch], COMMIT_TIMEOUT)
                    .await?;
            }
            Err(err) => return Err(err),
        }

        // The clone recorded the credentialed URL; replace it so no
        // secret persists on disk. Network commands re-embed it per
        // invocation.
        self.run_git(
            &["remote", "set-url", "origin", &self.workspace.remote_url],
            COMMIT_TIMEOUT,
        )
        .await?;
        info!(dir = %self.work_dir.display(), branch = %self.workspace.branch, "working tree cloned");
        Ok(())
    }

    async fn fetch_fast_forward(&self) -> Result<(), GitError> {
        let url = self.authenticated_url().await?;
        self.run_git(&["fetch", "--depth", "1", &url, &self.workspace.branch], FETCH_TIMEOUT)
            .await?;
        self.run_git(&["merge", "--ff-only", "FETCH_HEAD"], COMMIT_TIMEOUT)
            .await
            .map_err(|err| match err {
                // Divergence is not retryable in place; the caller
                // responds by re-cloning.
                GitError::Transient(message) => GitError::Permanent(message),
                other => other,
            })?;
        Ok(())
    }

    /// Commit a batch of file creations and push.
    ///
    /// Paths are validated against the working root, files are written
    /// atomically (temp file + rename), exactly the written paths are
    /// staged, and one commit carries the whole batch. A rejected push
    /// triggers fetch + rebase and retries up to [`PUSH_RETRIES`]
    /// times; persistent rejection fails the batch.
    pub async fn commit_batch(
        &self,
        files: &[CommitFile],
        batch_id: &str,
    ) -> Result<CommitOutcome, GitError> {
        if files.is_empty() {
            return Err(GitError::Permanent("empty batch".to_string()));
        }

        let mut rel_paths = Vec::with_capacity(files.len());
        for file in files {
            let absolute = validate_path(&self.work_dir, &file.path)?;
            if let Some(name) = absolute.file_name().and_then(|n| n.to_str()) {
                validate_filename(name)?;
            }
            write_atomic(&absolute, file.body.as_bytes()).await?;
            rel_paths.push(file.path.clone());
        }

        let mut add_args: Vec<&str> = vec!["add", "--"];
        add_args.extend(rel_paths.iter().map(String::as_str));
        self.run_git(&add_args, COMMIT_TIMEOUT).await?;

        // `diff --cached --quiet` exits 1 when something is staged. A
        // clean index here means a previous run already committed this
        // batch and died before the push.
        let staged = !self
            .run_git_status(&["diff", "--cached", "--quiet"], COMMIT_TIMEOUT)
            .await?;
        let created_commit = if staged {
            let message = format!("vault sync: {} file(s) [batch {batch_id}]", files.len());
            self.run_git(&["commit", "-m", &message, "--no-verify"], COMMIT_TIMEOUT)
                .await?;
            true
        } else {
            debug!(batch_id, "nothing staged, pushing existing commit");
            false
        };

        self.push_with_retry().await?;
        let commit_id = self.head_commit().await?;
        info!(
            batch_id,
            commit = %commit_id,
            files = files.len(),
            created_commit,
            "batch committed and pushed"
        );
        Ok(CommitOutcome {
            commit_id,
            files: files.len(),
            created_commit,
        })
    }

    async fn push_with_retry(&self) -> Result<(), GitError> {
        let url = self.authenticated_url().await?;
        let refspec = format!("HEAD:{}", self.workspace.branch);
        let mut last_error = None;

        for attempt in 1..=PUSH_RETRIES {
            match self.run_git(&["push", &url, &refspec], PUSH_TIMEOUT).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let rejected = matches!(&err, GitError::Transient(m)
                        if m.contains("non-fast-forward")
                            || m.contains("fetch first")
                            || m.contains("rejected"));
                    if rejected && attempt < PUSH_RETRIES {
                        debug!(attempt, "push rejected, rebasing onto remote");
                        self.run_git(&["fetch", &url, &self.workspace.branch], FETCH_TIMEOUT)
                            .await?;
                        if let Err(rebase_err) =
                            self.run_git(&["rebase", "FETCH_HEAD"], COMMIT_TIMEOUT).await
                        {
                            let _ = self.run_git(&["rebase", "--abort"], COMMIT_TIMEOUT).await;
                            return Err(GitError::Transient(format!(
                                "rebase after rejected push failed: {rebase_err}"
                            )));
                        }
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| GitError::Transient("push retries exhausted".to_string())))
    }

    pub async fn head_commit(&self) -> Result<String, GitError> {
        let out = self.run_git(&["rev-parse", "HEAD"], COMMIT_TIMEOUT).await?;
        Ok(out.trim().to_string())
    }

    /// Remove sibling instance directories beyond the retention count,
    /// newest first, skipping any still held by a live process.
    fn gc_siblings(&self) {
        let retention = self.workspace.instance_retention;
        let mut siblings: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.workspace.base_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !path.is_dir() || !name.starts_with("instance_") || path == self.work_dir {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            siblings.push((modified, path));
        }
        siblings.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, path) in siblings.into_iter().skip(retention) {
            let lock_path = PathBuf::from(format!("{}.lock", path.display()));
            if let Ok(lock) = std::fs::OpenOptions::new().write(true).open(&lock_path) {
                if lock.try_lock_exclusive().is_err() {
                    debug!(dir = %path.display(), "sibling instance still locked, keeping");
                    continue;
                }
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    let _ = std::fs::remove_file(&lock_path);
                    info!(dir = %path.display(), "stale instance directory removed");
                }
                Err(err) => warn!(dir = %path.display(), error = %err, "instance gc failed"),
            }
        }
    }

    // ── Subprocess plumbing ───────────────────────────────────────────────────

    async fn authenticated_url(&self) -> Result<String, GitError> {
        let remote = &self.workspace.remote_url;
        if !remote.starts_with("https://") && !remote.starts_with("http://") {
            return Ok(remote.clone());
        }
        let credential = self.auth.get_credential().await?;
        let (scheme, rest) = remote.split_once("://").expect("checked prefix");
        Ok(format!(
            "{scheme}://x-access-token:{}@{rest}",
            credential.reveal()
        ))
    }

    async fn run_git(&self, args: &[&str], timeout: Duration) -> Result<String, GitError> {
        let dir = self.work_dir.clone();
        self.run_git_in(&dir, args, timeout).await
    }

    /// Run git with an argument array. Output lands in memory; any
    /// embedded credential is scrubbed before an error is built so
    /// secrets cannot reach logs.
    async fn run_git_in(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, GitError> {
        let output = tokio::time::timeout(
            timeout,
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", BOT_NAME)
                .env("GIT_AUTHOR_EMAIL", BOT_EMAIL)
                .env("GIT_COMMITTER_NAME", BOT_NAME)
                .env("GIT_COMMITTER_EMAIL", BOT_EMAIL)
                .env("GIT_TERMINAL_PROMPT", "0")
                .output(),
        )
        .await
        .map_err(|_| GitError::Timeout(timeout))??;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(self.classify(&stderr).await)
    }

    /// Like [`run_git_in`] but treats a non-zero exit as data, not an
    /// error. Returns true when the command exited 0.
    async fn run_git_status(&self, args: &[&str], timeout: Duration) -> Result<bool, GitError> {
        let status = tokio::time::timeout(
            timeout,
            Command::new("git")
                .args(args)
                .current_dir(&self.work_dir)
                .status(),
        )
        .await
        .map_err(|_| GitError::Timeout(timeout))??;
        Ok(status.success())
    }

    async fn classify(&self, stderr: &str) -> GitError {
        let mut message = stderr.trim().to_string();
        if let Ok(credential) = self.auth.get_credential().await {
            if !credential.is_empty() {
                message = message.replace(credential.reveal(), "***");
            }
        }
        let lowered = message.to_lowercase();
        let permanent = [
            "authentication failed",
            "could not read username",
            "permission denied",
            "403",
            "401",
            "repository not found",
            "not found in upstream",
            "couldn't find remote ref",
            "invalid refspec",
            "pathspec",
        ];
        if permanent.iter().any(|needle| lowered.contains(needle)) {
            GitError::Permanent(message)
        } else {
            GitError::Transient(message)
        }
    }
}

/// Write-tempfile-then-rename so a crash never leaves a half-written
/// note in the tree.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GitError> {
    let parent = path
        .parent()
        .ok_or_else(|| GitError::Permanent(format!("path {} has no parent", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let result: Result<(), std::io::Error> = async {
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result.map_err(GitError::from)
}

fn instance_id_from_env() -> Option<String> {
    let raw = std::env::var("INSTANCE_ID").ok()?;
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

fn generated_instance_id() -> String {
    format!(
        "{}-{}-{:04x}",
        std::process::id(),
        chrono::Utc::now().timestamp(),
        rand::thread_rng().r#gen::<u16>()
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use std::process::Command as StdCommand;

    fn sh(dir: &Path, program: &str, args: &[&str]) {
        let status = StdCommand::new(program)
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "seed")
            .env("GIT_AUTHOR_EMAIL", "seed@test")
            .env("GIT_COMMITTER_NAME", "seed")
            .env("GIT_COMMITTER_EMAIL", "seed@test")
            .status()
            .expect("spawn");
        assert!(status.success(), "{program} {args:?} failed in {dir:?}");
    }

    /// Bare `main` remote with one seed commit; returns its path-URL.
    fn seeded_remote(root: &Path) -> String {
        let remote = root.join("remote.git");
        std::fs::create_dir_all(&remote).unwrap();
        sh(&remote, "git", &["init", "--bare", "--initial-branch=main", "."]);

        let seed = root.join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        sh(&seed, "git", &["init", "--initial-branch=main", "."]);
        std::fs::write(seed.join("README.md"), "# vault\n").unwrap();
        sh(&seed, "git", &["add", "README.md"]);
        sh(&seed, "git", &["commit", "-m", "seed"]);
        sh(&seed, "git", &["push", remote.to_str().unwrap(), "main"]);
        remote.display().to_string()
    }

    fn remote_commit_count(remote: &str) -> usize {
        let out = StdCommand::new("git")
            .args(["rev-list", "--count", "main"])
            .current_dir(remote)
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().parse().unwrap()
    }

    fn workspace(root: &Path, remote: String, id: &str) -> GitWorkspace {
        GitWorkspace {
            base_dir: root.join("git"),
            remote_url: remote,
            branch: "main".to_string(),
            instance_retention: 3,
            instance_id: Some(id.to_string()),
        }
    }

    fn auth() -> Arc<dyn AuthProvider> {
        Arc::new(StaticTokenProvider::new("test-token"))
    }

    #[tokio::test]
    async fn prepare_clones_and_batch_lands_as_one_commit() {
        let root = tempfile::tempdir().unwrap();
        let remote = seeded_remote(root.path());
        let before = remote_commit_count(&remote);

        let operator = GitOperator::prepare(workspace(root.path(), remote.clone(), "t1"), auth())
            .await
            .unwrap();

        let files = vec![
            CommitFile { path: "notes/a.md".to_string(), body: "#hello\n".to_string() },
            CommitFile { path: "notes/b.md".to_string(), body: "[[a]]".to_string() },
            CommitFile { path: "notes/c.md".to_string(), body: String::new() },
        ];
        let outcome = operator.commit_batch(&files, "batch-1").await.unwrap();
        assert!(outcome.created_commit);
        assert_eq!(outcome.files, 3);
        assert_eq!(remote_commit_count(&remote), before + 1);
    }

    #[tokio::test]
    async fn rerunning_a_committed_batch_does_not_duplicate_the_commit() {
        let root = tempfile::tempdir().unwrap();
        let remote = seeded_remote(root.path());
        let operator = GitOperator::prepare(workspace(root.path(), remote.clone(), "t2"), auth())
            .await
            .unwrap();

        let files = vec![CommitFile {
            path: "notes/a.md".to_string(),
            body: "same content".to_string(),
        }];
        let first = operator.commit_batch(&files, "batch-1").await.unwrap();
        assert!(first.created_commit);
        let count_after_first = remote_commit_count(&remote);

        // Identical re-run: stages nothing, pushes the existing HEAD.
        let second = operator.commit_batch(&files, "batch-1").await.unwrap();
        assert!(!second.created_commit);
        assert_eq!(second.commit_id, first.commit_id);
        assert_eq!(remote_commit_count(&remote), count_after_first);
    }

    #[tokio::test]
    async fn corrupt_working_tree_recovers_by_recloning() {
        let root = tempfile::tempdir().unwrap();
        let remote = seeded_remote(root.path());
        let ws = workspace(root.path(), remote.clone(), "t3");
        {
            let operator = GitOperator::prepare(ws.clone(), auth()).await.unwrap();
            std::fs::remove_dir_all(operator.work_dir().join(".git")).unwrap();
        }
        let operator = GitOperator::prepare(ws, auth()).await.unwrap();
        let outcome = operator
            .commit_batch(
                &[CommitFile { path: "notes/after.md".to_string(), body: "ok".to_string() }],
                "batch-r",
            )
            .await
            .unwrap();
        assert!(outcome.created_commit);
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected_before_any_write() {
        let root = tempfile::tempdir().unwrap();
        let remote = seeded_remote(root.path());
        let operator = GitOperator::prepare(workspace(root.path(), remote, "t4"), auth())
            .await
            .unwrap();
        let err = operator
            .commit_batch(
                &[CommitFile { path: "../escape.md".to_string(), body: "x".to_string() }],
                "batch-e",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_remote_gets_its_branch_created() {
        let root = tempfile::tempdir().unwrap();
        let remote = root.path().join("empty.git");
        std::fs::create_dir_all(&remote).unwrap();
        sh(&remote, "git", &["init", "--bare", "--initial-branch=main", "."]);

        let operator = GitOperator::prepare(
            workspace(root.path(), remote.display().to_string(), "t5"),
            auth(),
        )
        .await
        .unwrap();
        operator
            .commit_batch(
                &[CommitFile { path: "notes/first.md".to_string(), body: "x".to_string() }],
                "batch-0",
            )
            .await
            .unwrap();
        assert_eq!(remote_commit_count(&remote.display().to_string()), 1);
    }

    #[tokio::test]
    async fn divergent_remote_triggers_rebase_and_push_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let remote = seeded_remote(root.path());
        let operator = GitOperator::prepare(workspace(root.path(), remote.clone(), "t6"), auth())
            .await
            .unwrap();

        // Advance the remote behind the operator's back.
        let other = root.path().join("other");
        std::fs::create_dir_all(&other).unwrap();
        sh(root.path(), "git", &["clone", &remote, "other"]);
        std::fs::write(other.join("intruder.md"), "elsewhere\n").unwrap();
        sh(&other, "git", &["add", "intruder.md"]);
        sh(&other, "git", &["commit", "-m", "concurrent"]);
        sh(&other, "git", &["push", "origin", "main"]);
        let before = remote_commit_count(&remote);

        let outcome = operator
            .commit_batch(
                &[CommitFile { path: "notes/mine.md".to_string(), body: "mine".to_string() }],
                "batch-d",
            )
            .await
            .unwrap();
        assert!(outcome.created_commit);
        assert_eq!(remote_commit_count(&remote), before + 1);
    }

    #[tokio::test]
    async fn second_operator_on_same_instance_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let remote = seeded_remote(root.path());
        let ws = workspace(root.path(), remote, "t7");
        let _first = GitOperator::prepare(ws.clone(), auth()).await.unwrap();
        let err = GitOperator::prepare(ws, auth()).await.unwrap_err();
        assert!(matches!(err, GitError::Permanent(_)));
    }

    #[tokio::test]
    async fn stale_siblings_are_garbage_collected() {
        let root = tempfile::tempdir().unwrap();
        let remote = seeded_remote(root.path());
        let base = root.path().join("git");
        std::fs::create_dir_all(base.join("instance_old1")).unwrap();
        std::fs::create_dir_all(base.join("instance_old2")).unwrap();

        let mut ws = workspace(root.path(), remote, "t8");
        ws.instance_retention = 0;
        let operator = GitOperator::prepare(ws, auth()).await.unwrap();

        assert!(operator.work_dir().exists(), "current instance must survive gc");
        assert!(!base.join("instance_old1").exists());
        assert!(!base.join("instance_old2").exists());
    }

    #[test]
    fn generated_instance_ids_are_distinct() {
        assert_ne!(generated_instance_id(), generated_instance_id());
    }
}
