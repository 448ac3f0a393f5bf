//! Directory-backed task store.
//!
//! A task is a UTF-8 markdown file with a leading `---`-delimited header
//! of `key: value` lines followed by a free-form body. The store parses
//! and rewrites headers, appends named sections, and relocates files
//! across stage directories. All writes go through write-to-temp + rename
//! so readers never observe a half-written header.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use thiserror::Error;

use crate::types::{TaskPriority, TaskStatus};

/// Timestamp format used in human-facing header fields and sections.
pub const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Render a timestamp in the store's human-facing format.
pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FMT).to_string()
}

// ── Errors ──────────────────────────────────────────────────────

/// Task store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error reading or writing a task file.
    #[error("task io error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File does not start with a recognizable header region.
    #[error("malformed task header: {0}")]
    MalformedHeader(PathBuf),
    /// Header parsed but a required field is absent.
    #[error("task {path} missing required header field '{field}'")]
    MissingField {
        /// File involved.
        path: PathBuf,
        /// Name of the absent field.
        field: String,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ── Header ──────────────────────────────────────────────────────

/// Ordered task header. Unknown keys are preserved verbatim on rewrite
/// and ignored by pipeline logic; only the documented set is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: IndexMap<String, String>,
}

impl Header {
    /// Empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Insert or replace a field, preserving position for existing keys.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_owned(), value.into());
    }

    /// Remove a field if present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.fields.shift_remove(key)
    }

    /// True if the field exists.
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Iterate fields in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parsed `status` field.
    pub fn status(&self) -> Option<TaskStatus> {
        self.get("status").and_then(|s| s.parse().ok())
    }

    /// Parsed `priority` field, defaulting to standard.
    pub fn priority(&self) -> TaskPriority {
        self.get("priority")
            .map(TaskPriority::parse_or_standard)
            .unwrap_or(TaskPriority::Standard)
    }

    /// `title` field, or a fallback derived from the file stem.
    pub fn title_or_stem(&self, path: &Path) -> String {
        if let Some(title) = self.get("title") {
            return title.to_owned();
        }
        path.file_stem()
            .map(|s| s.to_string_lossy().replace('_', " "))
            .unwrap_or_else(|| "untitled".to_owned())
    }

    /// True if the header records a granted approval.
    pub fn is_approved(&self) -> bool {
        self.get("approved")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

// ── Document ────────────────────────────────────────────────────

/// Parsed task file: header fields plus markdown body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDocument {
    /// Ordered header fields.
    pub header: Header,
    /// Markdown body following the closing delimiter.
    pub body: String,
}

impl TaskDocument {
    /// New document with the given status and empty body.
    pub fn new(status: TaskStatus) -> Self {
        let mut header = Header::new();
        header.set("status", status.as_str());
        Self {
            header,
            body: String::new(),
        }
    }

    /// Serialize back to file form: `---`, key/value lines, `---`, body.
    pub fn render(&self) -> String {
        let mut out = String::from("---\n");
        for (key, value) in self.header.iter() {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push_str("---\n");
        out.push_str(&self.body);
        out
    }

    /// True if the body already contains the named `##` section.
    pub fn has_section(&self, name: &str) -> bool {
        body_has_section(&self.body, name)
    }
}

/// True if `body` contains a `## <name>` heading.
pub fn body_has_section(body: &str, name: &str) -> bool {
    let needle = format!("## {name}");
    body.lines().any(|line| line.trim_end() == needle)
}

/// Extract the text of a named `##` section, up to the next `##` heading.
pub fn extract_section<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("## {name}");
    let mut lines = body.split_inclusive('\n');
    let mut offset = 0usize;
    for line in lines.by_ref() {
        if line.trim_end() == needle {
            break;
        }
        offset += line.len();
    }
    if offset >= body.len() {
        return None;
    }
    let start = offset + body[offset..].find('\n').map(|i| i + 1)?;
    let rest = &body[start..];
    let end = rest
        .split_inclusive('\n')
        .scan(0usize, |pos, line| {
            let here = *pos;
            *pos += line.len();
            Some((here, line))
        })
        .find(|(_, line)| line.starts_with("## "))
        .map(|(pos, _)| pos)
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Parse a task file. The header is recognized when the content starts
/// with a `---` line; `status` is mandatory.
pub fn parse_document(path: &Path, content: &str) -> Result<TaskDocument, StoreError> {
    let mut lines = content.split_inclusive('\n');
    let first = lines.next().unwrap_or("");
    if first.trim_end() != "---" {
        return Err(StoreError::MalformedHeader(path.to_path_buf()));
    }

    let mut header = Header::new();
    let mut consumed = first.len();
    let mut closed = false;
    for line in lines {
        consumed += line.len();
        let trimmed = line.trim_end();
        if trimmed == "---" {
            closed = true;
            break;
        }
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.split_once(':') {
            Some((key, value)) => header.set(key.trim(), value.trim()),
            None => return Err(StoreError::MalformedHeader(path.to_path_buf())),
        }
    }
    if !closed {
        return Err(StoreError::MalformedHeader(path.to_path_buf()));
    }
    if !header.contains("status") {
        return Err(StoreError::MissingField {
            path: path.to_path_buf(),
            field: "status".to_owned(),
        });
    }

    Ok(TaskDocument {
        header,
        body: content[consumed..].to_owned(),
    })
}

// ── Store ───────────────────────────────────────────────────────

/// Filesystem task store. Cheap to clone; holds no open handles.
#[derive(Debug, Clone, Default)]
pub struct TaskStore;

impl TaskStore {
    /// List task files in a stage directory, excluding companion
    /// artifacts (`approval_*` files). Sorted by name for determinism.
    pub async fn list_pending(&self, dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(StoreError::io(dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(dir, e))?
        {
            let path = entry.path();
            let is_md = path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("md"))
                .unwrap_or(false);
            let is_artifact = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with("approval_"))
                .unwrap_or(false);
            if path.is_file() && is_md && !is_artifact {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Read and parse a task file.
    pub async fn read(&self, path: &Path) -> Result<TaskDocument, StoreError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        parse_document(path, &content)
    }

    /// Write a document atomically (temp file + rename).
    pub async fn write(&self, path: &Path, doc: &TaskDocument) -> Result<(), StoreError> {
        write_atomic(path, &doc.render()).await
    }

    /// Set one header field, preserving all other fields and the body.
    /// Writing an identical value is a no-op at the content level.
    pub async fn set_header_field(
        &self,
        path: &Path,
        key: &str,
        value: &str,
    ) -> Result<TaskDocument, StoreError> {
        let mut doc = self.read(path).await?;
        doc.header.set(key, value);
        self.write(path, &doc).await?;
        Ok(doc)
    }

    /// Update the `status` field.
    pub async fn set_status(
        &self,
        path: &Path,
        status: TaskStatus,
    ) -> Result<TaskDocument, StoreError> {
        self.set_header_field(path, "status", status.as_str()).await
    }

    /// Append a named markdown section to the body atomically. The
    /// caller is responsible for duplicate checks via
    /// [`TaskDocument::has_section`].
    pub async fn append_section(
        &self,
        path: &Path,
        name: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut doc = self.read(path).await?;
        if !doc.body.ends_with('\n') && !doc.body.is_empty() {
            doc.body.push('\n');
        }
        doc.body.push_str("\n---\n\n## ");
        doc.body.push_str(name);
        doc.body.push_str("\n\n");
        doc.body.push_str(content);
        if !content.ends_with('\n') {
            doc.body.push('\n');
        }
        self.write(path, &doc).await
    }

    /// Atomically relocate a task file into another stage directory,
    /// creating it if needed. Returns the new path.
    pub async fn move_task(&self, path: &Path, dest_dir: &Path) -> Result<PathBuf, StoreError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| StoreError::io(dest_dir, e))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| StoreError::MalformedHeader(path.to_path_buf()))?;
        let dest = dest_dir.join(file_name);
        tokio::fs::rename(path, &dest)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(dest)
    }

    /// Quarantine an unreadable or malformed task: append an error
    /// section (rebuilding a minimal header if none parses), mark it
    /// failed, and move it to the terminal directory.
    pub async fn quarantine(
        &self,
        path: &Path,
        done_dir: &Path,
        error: &str,
    ) -> Result<PathBuf, StoreError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        let mut doc = match parse_document(path, &raw) {
            Ok(doc) => doc,
            Err(_) => {
                // Preserve the original content as the body of a
                // reconstructed document.
                let mut doc = TaskDocument::new(TaskStatus::Failed);
                doc.body = raw;
                doc
            }
        };
        doc.header.set("status", TaskStatus::Failed.as_str());
        let stamp = format_timestamp(Local::now());
        doc.body.push_str(&format!(
            "\n---\n\n## Error\n\n**Time:** {stamp}\n**Error:** {error}\n\n**Status:** FAILED\n"
        ));
        self.write(path, &doc).await?;
        self.move_task(path, done_dir).await
    }
}

/// Write content to `path` via a temporary sibling and rename, so a
/// partial write never leaves a file with a half-header.
pub async fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    crate::fsutil::replace_file(path, content)
        .await
        .map_err(|e| StoreError::io(path, e))
}
