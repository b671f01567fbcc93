//! Shared atomic-write primitive: every persisted file in the core (backlog,
//! progress log, rate-limiter/circuit-breaker state, status record,
//! lockfiles) goes through this helper rather than a bare `fs::write`.

use std::path::Path;

use tokio::io::AsyncWriteExt;

/// Write `contents` to `path` via a sibling temp file plus rename, so a
/// reader never observes a partially written file. The temp file is
/// created in the same directory as `path` to keep the rename on one
/// filesystem.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let contents = contents.to_vec();
    let parent = parent.to_path_buf();
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&contents)?;
        tmp.flush()?;
        tmp.persist(&target)?;
        Ok(())
    })
    .await??;
    Ok(())
}

pub async fn write_atomic_str(path: &Path, contents: &str) -> anyhow::Result<()> {
    write_atomic(path, contents.as_bytes()).await
}

/// Append `line` (a single already-terminated line, including its own
/// trailing newline) to `path` in one buffered write, creating the file
/// and its parent directory if needed. Safe for a single writer; callers
/// wanting cross-task safety should additionally serialize with a mutex
/// (see `loopctl_observability::CommandLogger`).
pub async fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Read `path` to a string, returning `None` if it does not exist.
pub async fn read_to_string_opt(path: &Path) -> anyhow::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_atomic_creates_parent_and_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.txt");
        write_atomic_str(&path, "hello").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn write_atomic_overwrites_existing_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.txt");
        write_atomic_str(&path, "first").await.unwrap();
        write_atomic_str(&path, "second").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn append_line_accumulates_across_calls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_line(&path, "one\n").await.unwrap();
        append_line(&path, "two\n").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }

    #[tokio::test]
    async fn read_to_string_opt_returns_none_for_missing_file() {
        let dir = tempdir().unwrap();
        let result = read_to_string_opt(&dir.path().join("missing.txt"))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
