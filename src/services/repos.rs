use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Definition repositories cloned into the modpack root, in sync order.
pub const DEFINITION_REPOS: [(&str, &str); 2] = [
    (
        "Stalker_GAMMA",
        "https://github.com/Grokitach/Stalker_GAMMA.git",
    ),
    (
        "gamma_large_files_v2",
        "https://github.com/Grokitach/gamma_large_files_v2.git",
    ),
];

/// Directory of the repository that carries the modpack manifests.
pub const DEFINITIONS_REPO_DIR: &str = "Stalker_GAMMA";

/// Directory of the repository that carries pre-fetched large archives.
pub const LARGE_FILES_REPO_DIR: &str = "gamma_large_files_v2";

#[derive(Error, Debug)]
pub enum RepoSyncError {
    #[error("git is not installed or not on PATH")]
    GitMissing,
    #[error("git {operation} failed for {repo}: {stderr}")]
    CommandFailed {
        repo: String,
        operation: String,
        stderr: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn git_available() -> bool {
    which::which("git").is_ok()
}

async fn run_git(args: &[&str], repo: &str, operation: &str) -> Result<(), RepoSyncError> {
    let output = Command::new("git").args(args).output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(RepoSyncError::CommandFailed {
            repo: repo.to_string(),
            operation: operation.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Clones or updates one definition repository under `root`.
///
/// An existing checkout is left untouched unless `force_refetch` is set;
/// a completed install can therefore be re-run without network traffic.
pub async fn sync_repo(
    root: &Path,
    name: &str,
    url: &str,
    force_refetch: bool,
) -> Result<(), RepoSyncError> {
    let repo_path = root.join(name);
    let checkout_valid = repo_path.join(".git").is_dir();

    if checkout_valid && !force_refetch {
        log::info!("Using existing checkout of {}", name);
        return Ok(());
    }

    if checkout_valid {
        log::info!("Updating {}", name);
        let path = repo_path.to_string_lossy().to_string();
        run_git(&["-C", &path, "pull", "--ff-only"], name, "pull").await
    } else {
        if repo_path.exists() {
            // Leftovers from an interrupted clone confuse git; start clean.
            std::fs::remove_dir_all(&repo_path)?;
        }
        log::info!("Cloning {} from {}", name, url);
        let path = repo_path.to_string_lossy().to_string();
        run_git(&["clone", "--depth", "1", url, &path], name, "clone").await
    }
}

/// Resolves the checked-out tag (or commit) of a repository, for the
/// version stamp. Falls back to `None` when git cannot answer.
pub async fn describe_tag(repo_path: &Path) -> Option<String> {
    let path = repo_path.to_string_lossy().to_string();
    let output = Command::new("git")
        .args(["-C", &path, "describe", "--tags", "--always"])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    let tag = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_checkout_is_reused_without_git() {
        let root = tempfile::tempdir().unwrap();
        let repo = root.path().join("Stalker_GAMMA");
        std::fs::create_dir_all(repo.join(".git")).unwrap();

        // No pull is attempted, so this succeeds even against a fake remote.
        sync_repo(
            root.path(),
            "Stalker_GAMMA",
            "https://invalid.example/repo.git",
            false,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn describe_tag_outside_a_repo_is_none() {
        let dir = tempfile::tempdir().unwrap();
        if git_available() {
            assert!(describe_tag(dir.path()).await.is_none());
        }
    }
}
