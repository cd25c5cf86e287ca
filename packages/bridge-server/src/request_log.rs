//! Persisted request/error logs (JSONL, date-stamped) and a rolling stats
//! snapshot.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub request_id: String,
    pub model: String,
    pub stream: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    #[serde(default)]
    pub last_updated: String,
}

pub struct RequestLog {
    dir: PathBuf,
    stats: Mutex<StatsSnapshot>,
}

impl RequestLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let stats = std::fs::read_to_string(dir.join("stats.json"))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            dir,
            stats: Mutex::new(stats),
        }
    }

    pub async fn record(&self, record: CompletionRecord) {
        let file = if record.success {
            format!("requests-{}.jsonl", Utc::now().format("%Y%m%d"))
        } else {
            format!("errors-{}.jsonl", Utc::now().format("%Y%m%d"))
        };
        if let Err(err) = self.append_line(&file, &record).await {
            tracing::warn!(error = %err, "failed to append request log");
        }

        let snapshot = {
            let mut stats = self.stats.lock().await;
            stats.total += 1;
            if record.success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            stats.last_updated = Utc::now().to_rfc3339();
            stats.clone()
        };
        if let Err(err) = self.write_stats(&snapshot).await {
            tracing::warn!(error = %err, "failed to write stats snapshot");
        }
    }

    pub async fn stats(&self) -> StatsSnapshot {
        self.stats.lock().await.clone()
    }

    async fn append_line(
        &self,
        file: &str,
        record: &CompletionRecord,
    ) -> Result<(), std::io::Error> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(record).unwrap_or_default();
        line.push(b'\n');
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        handle.write_all(&line).await?;
        Ok(())
    }

    async fn write_stats(&self, snapshot: &StatsSnapshot) -> Result<(), std::io::Error> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_vec_pretty(snapshot).unwrap_or_default();
        tokio::fs::write(self.dir.join("stats.json"), raw).await
    }
}
