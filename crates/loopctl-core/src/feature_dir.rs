//! Resolves the active feature directory, keyed by the current git
//! branch: exactly one active feature per working tree at a time.

use std::path::{Path, PathBuf};

use git2::Repository;

/// Read the current branch name from the repository rooted at
/// `repo_root` (or any of its ancestors, per `git2::Repository::open`'s
/// own discovery). Detached-HEAD states fall back to the short commit
/// hash so a feature directory can still be resolved deterministically.
pub fn resolve_current_branch(repo_root: &Path) -> anyhow::Result<String> {
    let repo = Repository::open(repo_root)?;
    let head = repo.head()?;
    if let Some(name) = head.shorthand() {
        return Ok(name.to_string());
    }
    let oid = head
        .target()
        .ok_or_else(|| anyhow::anyhow!("HEAD has no target"))?;
    Ok(oid.to_string()[..12.min(oid.to_string().len())].to_string())
}

/// Lowercase, replace any run of characters outside `[a-z0-9-]` with a
/// single `-`, trim leading/trailing `-`.
pub fn sanitize_branch_name(branch: &str) -> String {
    let mut sanitized = String::with_capacity(branch.len());
    let mut last_was_dash = false;
    for c in branch.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            sanitized.push('-');
            last_was_dash = true;
        }
    }
    sanitized.trim_matches('-').to_string()
}

/// The on-disk feature directory for `branch`, under `core_dir`
/// (typically `<project_root>/.loopctl`).
pub fn feature_dir_for_branch(core_dir: &Path, branch: &str) -> PathBuf {
    core_dir.join(sanitize_branch_name(branch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_slashes_and_lowercases() {
        assert_eq!(sanitize_branch_name("feature/Add-Login"), "feature-add-login");
    }

    #[test]
    fn sanitize_collapses_runs_and_trims() {
        assert_eq!(sanitize_branch_name("  weird///branch!! "), "weird-branch");
    }

    #[test]
    fn feature_dir_joins_sanitized_key() {
        let dir = feature_dir_for_branch(Path::new("/repo/.loopctl"), "feature/login");
        assert_eq!(dir, PathBuf::from("/repo/.loopctl/feature-login"));
    }
}
