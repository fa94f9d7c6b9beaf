//! Git branch detection for session working directories

use std::path::Path;
use tokio::process::Command;

/// Current branch of the repository containing `dir`
///
/// Returns `None` when `dir` is not inside a git work tree or git is unavailable.
pub async fn current_branch(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        tracing::debug!(dir = %dir.display(), "Not a git work tree");
        return None;
    }

    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if branch.is_empty() {
        None
    } else {
        Some(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> bool {
        std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_plain_directory_has_no_branch() {
        let dir = TempDir::new().unwrap();
        assert_eq!(current_branch(dir.path()).await, None);
    }

    #[tokio::test]
    async fn test_missing_directory_has_no_branch() {
        let dir = TempDir::new().unwrap();
        assert_eq!(current_branch(&dir.path().join("gone")).await, None);
    }

    #[tokio::test]
    async fn test_detects_branch() {
        let dir = TempDir::new().unwrap();
        // Skip where git is not installed
        if !git(dir.path(), &["init", "-q", "-b", "feature-x"]) {
            return;
        }
        git(dir.path(), &["config", "user.email", "dev@example.com"]);
        git(dir.path(), &["config", "user.name", "dev"]);
        if !git(
            dir.path(),
            &["commit", "-q", "--allow-empty", "-m", "init"],
        ) {
            return;
        }
        assert_eq!(
            current_branch(dir.path()).await.as_deref(),
            Some("feature-x")
        );
    }
}
