//! On-disk image archive, partitioned by date (`YYYYMMDD/...`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use lmarena_bridge_error::BridgeError;
use tokio::sync::Mutex;

const SEEN_URL_LIMIT: usize = 5_000;

pub struct ImageArchive {
    root: PathBuf,
    fallback_extension: String,
    seen_urls: Mutex<HashSet<String>>,
    counter: AtomicU64,
}

impl ImageArchive {
    pub fn new(root: impl Into<PathBuf>, fallback_extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            fallback_extension: fallback_extension.into(),
            seen_urls: Mutex::new(HashSet::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Persist image bytes under today's partition. Returns `None` when the
    /// url was already archived.
    pub async fn save(
        &self,
        bytes: &[u8],
        url: &str,
        request_id: &str,
    ) -> Result<Option<PathBuf>, BridgeError> {
        {
            let mut seen = self.seen_urls.lock().await;
            if seen.len() >= SEEN_URL_LIMIT {
                seen.clear();
            }
            if !seen.insert(url.to_string()) {
                tracing::debug!(url, "image already archived, skipping");
                return Ok(None);
            }
        }

        let now = Utc::now();
        let partition = self.root.join(now.format("%Y%m%d").to_string());
        tokio::fs::create_dir_all(&partition)
            .await
            .map_err(|err| BridgeError::internal(format!("archive mkdir failed: {err}")))?;

        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let short_id: String = request_id.chars().take(8).collect();
        let file_name = format!(
            "{}_{}_{}.{}",
            now.format("%H%M%S"),
            short_id,
            sequence,
            extension_for(url, &self.fallback_extension)
        );
        let path = partition.join(file_name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| BridgeError::internal(format!("archive write failed: {err}")))?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "image archived");
        Ok(Some(path))
    }
}

fn extension_for(url: &str, fallback: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| fallback.to_string())
}
