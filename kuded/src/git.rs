//! Version-control adapter.
//!
//! The mirror reconciler only needs a handful of narrow operations, expressed
//! by [`Vcs`]. [`GitCli`] implements them by shelling out to the `git`
//! executable; it never prompts for credentials and every invocation is
//! bounded by a timeout.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub const ORIGIN: &str = "origin";

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {operation} timed out after {}", format_timeout(.timeout))]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("git {operation} failed (exit {}): {stderr}", exit_label(.code))]
    Failed {
        operation: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{path} is not a repository root")]
    NotARepository { path: PathBuf },

    #[error("unexpected output from git {operation}: '{output}'")]
    InvalidOutput {
        operation: &'static str,
        output: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

fn format_timeout(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

/// Result of a fetch that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Updated,
    AlreadyUpToDate,
}

/// A ref as written in `TrackedRepository.spec.ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    Branch(String),
    Tag(String),
}

impl GitRef {
    /// Accepts `main`, `refs/heads/main` and `refs/tags/v1`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(tag) = raw.strip_prefix("refs/tags/") {
            Self::Tag(tag.to_string())
        } else if let Some(branch) = raw.strip_prefix("refs/heads/") {
            Self::Branch(branch.to_string())
        } else {
            Self::Branch(raw.to_string())
        }
    }

    pub fn short_name(&self) -> &str {
        match self {
            Self::Branch(name) | Self::Tag(name) => name,
        }
    }
}

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clones `url` at `git_ref` into `dest`, which must not exist.
    async fn clone_repo(&self, url: &str, git_ref: &GitRef, dest: &Path) -> Result<(), VcsError>;

    /// Verifies that `path` is the root of a repository.
    async fn open(&self, path: &Path) -> Result<(), VcsError>;

    async fn remote_urls(&self, path: &Path, remote: &str) -> Result<Vec<String>, VcsError>;

    async fn fetch(&self, path: &Path) -> Result<FetchOutcome, VcsError>;

    /// Force-checks out the ref, discarding local modifications.
    async fn checkout(&self, path: &Path, git_ref: &GitRef) -> Result<(), VcsError>;

    /// Fast-forwards the checked-out branch. A no-op for tags.
    async fn pull(&self, path: &Path, git_ref: &GitRef) -> Result<(), VcsError>;

    async fn head(&self, path: &Path) -> Result<String, VcsError>;
}

pub struct GitCli {
    binary: String,
    timeout: Duration,
}

impl GitCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(
        &self,
        operation: &'static str,
        dir: Option<&Path>,
        args: &[&str],
    ) -> Result<std::process::Output, VcsError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        debug!(operation, ?dir, ?args, "running git");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| VcsError::Timeout {
                operation,
                timeout: self.timeout,
            })?
            .map_err(|source| VcsError::Spawn {
                program: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(VcsError::Failed {
                operation,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[async_trait]
impl Vcs for GitCli {
    async fn clone_repo(&self, url: &str, git_ref: &GitRef, dest: &Path) -> Result<(), VcsError> {
        let dest = dest.to_string_lossy();
        self.run(
            "clone",
            None,
            &[
                "clone",
                "--origin",
                ORIGIN,
                "--branch",
                git_ref.short_name(),
                "--",
                url,
                &dest,
            ],
        )
        .await?;
        Ok(())
    }

    async fn open(&self, path: &Path) -> Result<(), VcsError> {
        let output = self
            .run("open", Some(path), &["rev-parse", "--show-toplevel"])
            .await?;
        let toplevel = PathBuf::from(stdout_of(&output));
        let expected = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        let actual = tokio::fs::canonicalize(&toplevel).await.unwrap_or(toplevel);
        if actual != expected {
            return Err(VcsError::NotARepository {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    async fn remote_urls(&self, path: &Path, remote: &str) -> Result<Vec<String>, VcsError> {
        let output = self
            .run("remote", Some(path), &["remote", "get-url", "--all", remote])
            .await?;
        Ok(stdout_of(&output)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn fetch(&self, path: &Path) -> Result<FetchOutcome, VcsError> {
        let output = self
            .run("fetch", Some(path), &["fetch", "--tags", "--prune", ORIGIN])
            .await?;
        // git reports ref updates on stderr; silence means nothing changed.
        if String::from_utf8_lossy(&output.stderr).trim().is_empty() {
            Ok(FetchOutcome::AlreadyUpToDate)
        } else {
            Ok(FetchOutcome::Updated)
        }
    }

    async fn checkout(&self, path: &Path, git_ref: &GitRef) -> Result<(), VcsError> {
        let target = match git_ref {
            GitRef::Branch(name) => name.clone(),
            GitRef::Tag(name) => format!("refs/tags/{name}"),
        };
        self.run("checkout", Some(path), &["checkout", "--force", &target])
            .await?;
        Ok(())
    }

    async fn pull(&self, path: &Path, git_ref: &GitRef) -> Result<(), VcsError> {
        let GitRef::Branch(branch) = git_ref else {
            return Ok(());
        };
        self.run(
            "pull",
            Some(path),
            &["pull", "--ff-only", "--no-rebase", ORIGIN, branch],
        )
        .await?;
        Ok(())
    }

    async fn head(&self, path: &Path) -> Result<String, VcsError> {
        let output = self.run("head", Some(path), &["rev-parse", "HEAD"]).await?;
        let sha = stdout_of(&output);
        if sha.is_empty() || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(VcsError::InvalidOutput {
                operation: "head",
                output: sha,
            });
        }
        Ok(sha)
    }
}


#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command;

    pub fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args([
                "-c",
                "user.name=kude",
                "-c",
                "user.email=kude@example.com",
                "-c",
                "commit.gpgsign=false",
                "-c",
                "init.defaultBranch=main",
            ])
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Creates an upstream repository on `main` with one committed manifest.
    pub fn init_upstream(dir: &Path) -> String {
        git(dir, &["init", "--initial-branch=main"]);
        std::fs::write(dir.join("app.yaml"), "kind: ConfigMap\n").expect("write manifest");
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "initial"]);
        git(dir, &["rev-parse", "HEAD"])
    }

    pub fn commit_change(dir: &Path, file: &str, contents: &str) -> String {
        std::fs::write(dir.join(file), contents).expect("write file");
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", &format!("update {file}")]);
        git(dir, &["rev-parse", "HEAD"])
    }
}
