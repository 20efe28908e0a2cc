//! Review context from unified diff files on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use review_coordination::{CallError, ContextProvider, DiffFile, ReviewContext, ReviewKey};
use tracing::debug;

/// Split a unified diff (`git diff` or plain `diff -u`) into per-file patches.
///
/// The patch text of each file starts at its first hunk header. Deleted files
/// are reported under their old path. Hunk bodies are consumed by the line
/// counts in their `@@` header, so content lines such as `--- x` never start
/// a new file.
pub fn parse_unified_diff(text: &str) -> Vec<DiffFile> {
    let mut files = Vec::new();
    let mut current: Option<PendingFile> = None;

    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        if let Some(file) = current.as_mut().filter(|f| f.in_hunk_body()) {
            file.push_body_line(line);
            continue;
        }
        if line.starts_with("diff --git ") {
            files.extend(current.take().map(PendingFile::finish));
            current = Some(PendingFile::new(git_header_path(line)));
            continue;
        }
        if line.starts_with("--- ") && lines.peek().is_some_and(|next| next.starts_with("+++ ")) {
            let old = strip_prefix_path(&line[4..]);
            let new = lines.next().map(|l| strip_prefix_path(&l[4..])).unwrap_or_default();
            let path = if new == "/dev/null" { old } else { new };
            match current.as_mut() {
                Some(file) if !file.in_hunks => file.path = path,
                _ => {
                    files.extend(current.take().map(PendingFile::finish));
                    current = Some(PendingFile::new(path));
                }
            }
            continue;
        }
        let Some(file) = current.as_mut() else {
            continue;
        };
        if line.starts_with("@@") {
            file.in_hunks = true;
            let (old, new) = hunk_line_counts(line).unwrap_or((0, 0));
            file.old_left = old;
            file.new_left = new;
        }
        if !file.in_hunks {
            continue;
        }
        if line.starts_with('+') {
            file.additions += 1;
        } else if line.starts_with('-') {
            file.deletions += 1;
        }
        file.patch.push_str(line);
        file.patch.push('\n');
    }
    files.extend(current.map(PendingFile::finish));
    files
}

struct PendingFile {
    path: String,
    patch: String,
    additions: u32,
    deletions: u32,
    in_hunks: bool,
    /// Lines still expected in the current hunk, old and new side.
    old_left: u32,
    new_left: u32,
}

impl PendingFile {
    fn new(path: String) -> Self {
        Self {
            path,
            patch: String::new(),
            additions: 0,
            deletions: 0,
            in_hunks: false,
            old_left: 0,
            new_left: 0,
        }
    }

    fn in_hunk_body(&self) -> bool {
        self.old_left > 0 || self.new_left > 0
    }

    fn push_body_line(&mut self, line: &str) {
        match line.as_bytes().first() {
            Some(b'+') => {
                self.additions += 1;
                self.new_left = self.new_left.saturating_sub(1);
            }
            Some(b'-') => {
                self.deletions += 1;
                self.old_left = self.old_left.saturating_sub(1);
            }
            // "\ No newline at end of file"
            Some(b'\\') => {}
            // Context; some tools strip the leading space of blank lines.
            _ => {
                self.old_left = self.old_left.saturating_sub(1);
                self.new_left = self.new_left.saturating_sub(1);
            }
        }
        self.patch.push_str(line);
        self.patch.push('\n');
    }

    fn finish(self) -> DiffFile {
        DiffFile {
            path: self.path,
            patch: self.patch.trim_end().to_string(),
            additions: self.additions,
            deletions: self.deletions,
        }
    }
}

/// `@@ -a,b +c,d @@` → `(b, d)`; an omitted count means one line.
fn hunk_line_counts(line: &str) -> Option<(u32, u32)> {
    let mut ranges = line.strip_prefix("@@ ")?.split_whitespace();
    let old = ranges.next()?.strip_prefix('-')?;
    let new = ranges.next()?.strip_prefix('+')?;
    let count = |range: &str| match range.split_once(',') {
        Some((_, n)) => n.parse().ok(),
        None => Some(1),
    };
    Some((count(old)?, count(new)?))
}

/// `diff --git a/x b/y` → `y`.
fn git_header_path(line: &str) -> String {
    line.rsplit_once(" b/")
        .map(|(_, p)| p.to_string())
        .unwrap_or_else(|| line.trim_start_matches("diff --git ").to_string())
}

/// Drop the `a/`/`b/` prefix and any trailing timestamp.
fn strip_prefix_path(raw: &str) -> String {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}

/// Reads `<dir>/<external_id>.diff`, or a single fixed file.
#[derive(Debug, Clone)]
pub struct DiffContextProvider {
    source: DiffSource,
    title: Option<String>,
}

#[derive(Debug, Clone)]
enum DiffSource {
    File(PathBuf),
    Directory(PathBuf),
}

impl DiffContextProvider {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: DiffSource::File(path.into()),
            title: None,
        }
    }

    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: DiffSource::Directory(dir.into()),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    fn path_for(&self, key: &ReviewKey) -> PathBuf {
        match &self.source {
            DiffSource::File(path) => path.clone(),
            DiffSource::Directory(dir) => dir.join(format!("{}.diff", key.external_id)),
        }
    }
}

async fn read_diff(path: &Path) -> Result<String, CallError> {
    tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            CallError::Provider(format!("diff not found: {}", path.display()))
        }
        _ => CallError::network("EIO", format!("{}: {e}", path.display())),
    })
}

#[async_trait]
impl ContextProvider for DiffContextProvider {
    async fn fetch(&self, key: &ReviewKey) -> Result<ReviewContext, CallError> {
        let path = self.path_for(key);
        let text = read_diff(&path).await?;
        let files = parse_unified_diff(&text);
        if files.is_empty() {
            return Err(CallError::Provider(format!(
                "{} contains no file changes",
                path.display()
            )));
        }
        debug!(review = %key, path = %path.display(), files = files.len(), "Diff loaded");
        let context = ReviewContext::from_files(files);
        Ok(match &self.title {
            Some(title) => context.with_title(title.clone()),
            None => context,
        })
    }
}
