//! Small filesystem helpers shared by the state-persisting components.

use std::path::{Path, PathBuf};

/// Temp-file sibling used for atomic replacement of `path`.
pub fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_owned());
    name.push_str(".tmp");
    path.with_file_name(name)
}

/// Write `content` to `path` via temp file + rename. Creates parent
/// directories. Readers never observe a partial file.
pub async fn replace_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_sibling(path);
    tokio::fs::write(&tmp, content.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Append a line-terminated chunk to a file, creating it (and parents)
/// when absent.
pub async fn append_to_file(path: &Path, chunk: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(chunk.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tmp_sibling_keeps_directory() {
        let p = Path::new("/a/b/state.json");
        assert_eq!(tmp_sibling(p), PathBuf::from("/a/b/state.json.tmp"));
    }

    #[tokio::test]
    async fn test_replace_file_creates_parents() {
        let tmp = TempDir::new().expect("tmpdir");
        let path = tmp.path().join("nested/dir/state.json");
        replace_file(&path, "{}").await.expect("write");
        assert_eq!(tokio::fs::read_to_string(&path).await.expect("read"), "{}");
        assert!(!tmp_sibling(&path).exists());
    }

    #[tokio::test]
    async fn test_append_to_file() {
        let tmp = TempDir::new().expect("tmpdir");
        let path = tmp.path().join("log/lines.log");
        append_to_file(&path, "one\n").await.expect("append");
        append_to_file(&path, "two\n").await.expect("append");
        let content = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(content, "one\ntwo\n");
    }
}
