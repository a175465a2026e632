//! Temp directory arena for capture and device-buffer files
//!
//! Every job gets `<temp_dir>/<n>.png` for its screenshot and
//! `<temp_dir>/<n>.png.bin` for its device buffer, where `n` is a fresh
//! random integer. Nothing in the pipeline deletes these files; the reaper
//! removes the ones older than the configured age.

use metrics::counter;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const MAX_ARTIFACT_ID: u64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct ArtifactArena {
    dir: PathBuf,
    max_age: Duration,
}

impl ArtifactArena {
    /// Open the arena, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>, max_age: Duration) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, max_age })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh capture path for a new job
    pub fn allocate(&self) -> PathBuf {
        self.dir.join(format!("{}.png", random_artifact_id()))
    }

    /// Delete artifacts older than the arena's max age
    pub async fn reap(&self) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_artifact_name(name) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < self.max_age {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!("Reaped artifact {}", name);
                    removed += 1;
                }
                Err(e) => warn!("Failed to reap artifact {}: {}", name, e),
            }
        }

        if removed > 0 {
            counter!("print_artifacts_reaped_total", removed as u64);
            info!("Reaped {} artifacts from {}", removed, self.dir.display());
        }
        Ok(removed)
    }

    pub fn start_reaper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if let Err(e) = self.reap().await {
                    warn!("Artifact reaper failed: {}", e);
                }
            }
        })
    }
}

/// Random integer in `1..=1_000_000_000`
pub fn random_artifact_id() -> u64 {
    rand::thread_rng().gen_range(1..=MAX_ARTIFACT_ID)
}

/// `<digits>.png` or `<digits>.png.bin`
pub fn is_artifact_name(name: &str) -> bool {
    let stem = name
        .strip_suffix(".png.bin")
        .or_else(|| name.strip_suffix(".png"));
    matches!(stem, Some(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
}
