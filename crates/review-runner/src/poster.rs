//! Review posters for local runs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use review_coordination::{CallError, ReviewKey, ReviewOutput, ReviewPoster};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Posted review as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostedReview {
    pub key: ReviewKey,
    pub written_at: DateTime<Utc>,
    pub output: ReviewOutput,
}

/// Writes `<dir>/<storage_id>.json` and the summary alongside as `.md`.
/// Posting the same review again overwrites both.
#[derive(Debug, Clone)]
pub struct FilePoster {
    dir: PathBuf,
}

impl FilePoster {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn json_path(&self, key: &ReviewKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.storage_id()))
    }

    pub fn summary_path(&self, key: &ReviewKey) -> PathBuf {
        self.dir.join(format!("{}.md", key.storage_id()))
    }
}

fn io_error(e: std::io::Error) -> CallError {
    CallError::network("EIO", e.to_string())
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CallError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await.map_err(io_error)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error)
}

#[async_trait]
impl ReviewPoster for FilePoster {
    async fn post(&self, key: &ReviewKey, output: &ReviewOutput) -> Result<(), CallError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_error)?;
        let posted = PostedReview {
            key: key.clone(),
            written_at: Utc::now(),
            output: output.clone(),
        };
        let json = serde_json::to_vec_pretty(&posted)
            .map_err(|e| CallError::Provider(format!("serialize review: {e}")))?;
        write_atomic(&self.json_path(key), &json).await?;
        write_atomic(&self.summary_path(key), output.summary.as_bytes()).await?;
        info!(review = %key, path = %self.json_path(key).display(), "Review written");
        Ok(())
    }
}

/// Prints the summary and inline comments to stdout.
#[derive(Debug, Clone, Default)]
pub struct StdoutPoster;

#[async_trait]
impl ReviewPoster for StdoutPoster {
    async fn post(&self, key: &ReviewKey, output: &ReviewOutput) -> Result<(), CallError> {
        let mut text = format!("# {key}\n\n{}\n", output.summary);
        for comment in &output.comments {
            let location = match comment.line {
                Some(line) => format!("{}:{line}", comment.file),
                None => comment.file.clone(),
            };
            text.push_str(&format!("\n{location}\n{}\n", comment.message));
        }
        let mut stdout = tokio::io::stdout();
        stdout.write_all(text.as_bytes()).await.map_err(io_error)?;
        stdout.flush().await.map_err(io_error)
    }
}
