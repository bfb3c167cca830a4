//! Git collaborator over the git CLI: shallow clone, branch, commit, push.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use url::Url;

use crate::error::CollaboratorError;
use crate::pipeline::artifacts::PushResult;
use crate::pipeline::collaborators::{CollabResult, GitOperations};

const DEFAULT_REMOTE: &str = "origin";
const FALLBACK_USER_NAME: &str = "forgeline";
const FALLBACK_USER_EMAIL: &str = "forgeline@localhost";

/// Shells out to `git`. Tokens are injected into HTTPS clone URLs and never
/// logged; error text is scrubbed before it leaves this module.
#[derive(Debug, Clone)]
pub struct CliGit {
    remote: String,
}

impl Default for CliGit {
    fn default() -> Self {
        Self {
            remote: DEFAULT_REMOTE.to_string(),
        }
    }
}

impl CliGit {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GitOperations for CliGit {
    async fn clone_repo(
        &self,
        repo_url: &str,
        token: Option<&str>,
        branch: Option<&str>,
        dest: &Path,
    ) -> CollabResult<PathBuf> {
        let url = repo_url.to_string();
        let token = token.map(str::to_string);
        let branch = branch.map(str::to_string);
        let dest = dest.to_path_buf();
        let secret = token.clone();

        tracing::info!(url = %repo_url, dest = %dest.display(), "Cloning repository");
        tokio::task::spawn_blocking(move || {
            clone_blocking(&url, token.as_deref(), branch.as_deref(), &dest)
        })
        .await
        .map_err(|e| CollaboratorError::Unavailable(format!("clone task failed: {}", e)))?
        .map_err(|e| unavailable(e, secret.as_deref()))
    }

    async fn commit_and_push(
        &self,
        repo_path: &Path,
        branch: &str,
        message: &str,
    ) -> CollabResult<PushResult> {
        let repo = repo_path.to_path_buf();
        let branch = branch.to_string();
        let message = message.to_string();
        let remote = self.remote.clone();

        tokio::task::spawn_blocking(move || commit_and_push_blocking(&repo, &remote, &branch, &message))
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("push task failed: {}", e)))?
            .map_err(|e| unavailable(e, None))
    }
}

fn unavailable(err: anyhow::Error, secret: Option<&str>) -> CollaboratorError {
    CollaboratorError::Unavailable(redact(&format!("{:#}", err), secret))
}

fn clone_blocking(
    url: &str,
    token: Option<&str>,
    branch: Option<&str>,
    dest: &Path,
) -> Result<PathBuf> {
    if dest.exists() && dest.read_dir().map(|mut d| d.next().is_some()).unwrap_or(true) {
        bail!("clone destination {} is not empty", dest.display());
    }
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("clone destination has no parent: {}", dest.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let clone_url = match token {
        Some(token) if !token.is_empty() => authenticated_url(url, token)?,
        _ => url.to_string(),
    };
    let dest_str = dest.to_string_lossy().to_string();

    let mut args = vec!["clone", "--depth", "1"];
    if let Some(branch) = branch.map(str::trim).filter(|b| !b.is_empty()) {
        args.extend(["--branch", branch]);
    }
    args.push(&clone_url);
    args.push(&dest_str);

    run_git(&args, parent).map_err(|e| anyhow!(redact(&format!("{:#}", e), token)))?;
    Ok(dest.to_path_buf())
}

fn commit_and_push_blocking(
    repo: &Path,
    remote: &str,
    branch: &str,
    message: &str,
) -> Result<PushResult> {
    let repo_root = resolve_repo_root(repo)?
        .ok_or_else(|| anyhow!("Path is not inside a git repository: {}", repo.display()))?;
    if !is_valid_branch_name(branch) {
        bail!("invalid branch name '{}'", branch);
    }

    run_git(&["checkout", "-B", branch], &repo_root)?;
    run_git(&["add", "-A"], &repo_root)?;

    let status = run_git(&["status", "--porcelain"], &repo_root)?;
    if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
        bail!("nothing to commit in {}", repo_root.display());
    }

    let mut commit_args: Vec<String> = Vec::new();
    if !has_identity(&repo_root) {
        commit_args.extend([
            "-c".to_string(),
            format!("user.name={}", FALLBACK_USER_NAME),
            "-c".to_string(),
            format!("user.email={}", FALLBACK_USER_EMAIL),
        ]);
    }
    commit_args.extend(["commit".to_string(), "-m".to_string(), message.to_string()]);
    let commit_refs: Vec<&str> = commit_args.iter().map(String::as_str).collect();
    run_git(&commit_refs, &repo_root)?;

    let head = run_git(&["rev-parse", "HEAD"], &repo_root)?;
    let commit = short_sha(String::from_utf8_lossy(&head.stdout).trim());

    tracing::info!(repo = %repo_root.display(), branch, commit = %commit, "Pushing branch");
    run_git(&["push", "-u", remote, branch], &repo_root)?;

    Ok(PushResult {
        branch: branch.to_string(),
        commit,
        remote: remote.to_string(),
    })
}

fn has_identity(repo_root: &Path) -> bool {
    run_git(&["config", "user.email"], repo_root)
        .map(|o| !o.stdout.is_empty())
        .unwrap_or(false)
}

/// Resolve the current worktree root for a path, or `None` if path is not inside a git repo.
pub fn resolve_repo_root(path: &Path) -> Result<Option<PathBuf>> {
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(path)
        .output()
        .with_context(|| format!("Failed to run git in {}", path.display()))?;

    if output.status.success() {
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root.is_empty() {
            return Ok(None);
        }
        return Ok(Some(PathBuf::from(root)));
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
    if stderr.contains("not a git repository") {
        return Ok(None);
    }

    let detail = command_error_detail(&output.stdout, &output.stderr);
    Err(anyhow!("git rev-parse failed: {}", detail))
}

/// HTTPS URL carrying `token` as `x-access-token` basic auth.
pub fn authenticated_url(url: &str, token: &str) -> Result<String> {
    let mut parsed = Url::parse(url).with_context(|| format!("Invalid repository URL: {}", url))?;
    if !matches!(parsed.scheme(), "https" | "http") {
        bail!("token authentication requires an http(s) URL, got {}", parsed.scheme());
    }
    parsed
        .set_username("x-access-token")
        .map_err(|_| anyhow!("cannot set credentials on {}", url))?;
    parsed
        .set_password(Some(token))
        .map_err(|_| anyhow!("cannot set credentials on {}", url))?;
    Ok(parsed.to_string())
}

/// Replace every occurrence of `secret` with `***`.
pub fn redact(text: &str, secret: Option<&str>) -> String {
    match secret {
        Some(secret) if !secret.is_empty() => text.replace(secret, "***"),
        _ => text.to_string(),
    }
}

/// Conservative subset of `git check-ref-format --branch`.
pub fn is_valid_branch_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 200
        && !name.starts_with(['-', '/', '.'])
        && !name.ends_with(['/', '.'])
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name.contains("//")
        && !name.contains("@{")
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
}

fn run_git(args: &[&str], cwd: &Path) -> Result<std::process::Output> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .with_context(|| {
            format!(
                "Failed to execute git {} in {}",
                args.first().copied().unwrap_or_default(),
                cwd.display()
            )
        })?;

    if output.status.success() {
        Ok(output)
    } else {
        let detail = command_error_detail(&output.stdout, &output.stderr);
        Err(anyhow!("git {} failed: {}", args.join(" "), detail))
    }
}

fn command_error_detail(stdout: &[u8], stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    "unknown git error".to_string()
}

fn short_sha(sha: &str) -> String {
    sha.chars().take(12).collect()
}
