//! On-disk store for completed downloads.
//!
//! Files land at `<dir>/<agentId>_<unixMillis>_<basename>`. Both the agent id
//! and the basename are reduced to a safe character set so a remote path can
//! never steer the write outside `dir`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tether_types::TetherResult;
use tracing::info;

/// Where a completed download was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedDownload {
    pub file_name: String,
    pub file_path: String,
    pub size: u64,
}

/// One entry in the downloads listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub file_name: String,
    pub file_path: String,
    pub size: u64,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DownloadStore {
    dir: PathBuf,
}

impl DownloadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a reassembled file. Creates the directory on first use.
    pub async fn save(
        &self,
        agent_id: &str,
        original_path: &str,
        bytes: &[u8],
    ) -> TetherResult<SavedDownload> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file_name = format!(
            "{}_{}_{}",
            sanitize(agent_id),
            Utc::now().timestamp_millis(),
            sanitize(basename(original_path))
        );
        let path = self.dir.join(&file_name);
        tokio::fs::write(&path, bytes).await?;
        info!(file = %path.display(), size = bytes.len(), "Saved download");

        Ok(SavedDownload {
            file_name,
            file_path: path.to_string_lossy().into_owned(),
            size: bytes.len() as u64,
        })
    }

    /// Every regular file in the store, newest first. A store that was never
    /// written to lists as empty.
    pub async fn list(&self) -> TetherResult<Vec<StoredFile>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            // Not every filesystem records creation time.
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(StoredFile {
                file_name: entry.file_name().to_string_lossy().into_owned(),
                file_path: entry.path().to_string_lossy().into_owned(),
                size: metadata.len(),
                created,
            });
        }
        files.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.file_name.cmp(&b.file_name)));
        Ok(files)
    }
}

/// Last path segment of a path from either a Unix or a Windows agent.
fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())
        .unwrap_or("download")
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}
