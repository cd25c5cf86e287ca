//! File-bed uploads: pushes base64 attachments to a configured image host so
//! the upstream UI receives a plain URL instead of a multi-megabyte data URI.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lmarena_bridge_error::BridgeError;
use rand::seq::SliceRandom;
use reqwest::multipart;
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::{BridgeConfig, FileBedEndpoint, FileBedStrategy};
use crate::downloads::TtlCache;

const ENDPOINT_RECOVERY: Duration = Duration::from_secs(300);
const UPLOAD_CACHE_TTL: Duration = Duration::from_secs(300);
const UPLOAD_CACHE_MAX: usize = 500;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

pub struct FileBed {
    endpoints: Vec<FileBedEndpoint>,
    strategy: FileBedStrategy,
    cursor: AtomicUsize,
    disabled: Mutex<HashMap<String, Instant>>,
    upload_cache: Mutex<TtlCache>,
    client: Client,
}

impl FileBed {
    pub fn new(config: &BridgeConfig) -> Self {
        let client = Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "falling back to a default upload client");
                Client::new()
            });
        Self {
            endpoints: config.file_bed_endpoints.clone(),
            strategy: config.file_bed_selection_strategy,
            cursor: AtomicUsize::new(0),
            disabled: Mutex::new(HashMap::new()),
            upload_cache: Mutex::new(TtlCache::new(UPLOAD_CACHE_TTL, UPLOAD_CACHE_MAX)),
            client,
        }
    }

    /// Upload base64 data (with or without a data-URI prefix), deduplicating
    /// by content hash.
    pub async fn upload(&self, file_name: &str, base64_data: &str) -> Result<String, BridgeError> {
        let payload = base64_data
            .split_once(',')
            .map(|(_, rest)| rest)
            .unwrap_or(base64_data);
        let digest = content_hash(payload);

        if let Some(url) = self.upload_cache.lock().await.get(&digest) {
            tracing::debug!(file_name, "file-bed upload served from hash cache");
            return Ok(url);
        }

        let bytes = BASE64
            .decode(payload)
            .map_err(|err| BridgeError::TranslatorFailed {
                message: format!("attachment is not valid base64: {err}"),
            })?;

        let candidates = self.pick_candidates().await?;
        let mut last_error = String::new();
        for endpoint in candidates {
            match self.upload_to(&endpoint, file_name, bytes.clone()).await {
                Ok(url) => {
                    self.upload_cache.lock().await.insert(digest, url.clone());
                    tracing::info!(file_name, endpoint = %endpoint.name, url, "file-bed upload complete");
                    return Ok(url);
                }
                Err(err) => {
                    tracing::warn!(endpoint = %endpoint.name, error = %err, "file-bed endpoint failed, disabling temporarily");
                    self.disabled
                        .lock()
                        .await
                        .insert(endpoint.name.clone(), Instant::now());
                    last_error = err.to_string();
                }
            }
        }
        Err(BridgeError::DownloadFailed {
            message: format!("all file-bed endpoints failed: {last_error}"),
        })
    }

    /// The ordered endpoint list to try: one endpoint for random/round-robin,
    /// every active endpoint for failover.
    async fn pick_candidates(&self) -> Result<Vec<FileBedEndpoint>, BridgeError> {
        let mut disabled = self.disabled.lock().await;
        disabled.retain(|name, since| {
            let keep = since.elapsed() < ENDPOINT_RECOVERY;
            if !keep {
                tracing::info!(endpoint = %name, "file-bed endpoint recovered");
            }
            keep
        });
        let active: Vec<FileBedEndpoint> = self
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.enabled && !disabled.contains_key(&endpoint.name))
            .cloned()
            .collect();
        drop(disabled);

        if active.is_empty() {
            return Err(BridgeError::DownloadFailed {
                message: "no active file-bed endpoint".to_string(),
            });
        }
        Ok(match self.strategy {
            FileBedStrategy::Random => {
                let choice = active
                    .choose(&mut rand::thread_rng())
                    .expect("active endpoints are non-empty")
                    .clone();
                vec![choice]
            }
            FileBedStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % active.len();
                vec![active[index].clone()]
            }
            FileBedStrategy::Failover => active,
        })
    }

    async fn upload_to(
        &self,
        endpoint: &FileBedEndpoint,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BridgeError> {
        let mut form = multipart::Form::new().part(
            endpoint.form_file_field.clone(),
            multipart::Part::bytes(bytes).file_name(file_name.to_string()),
        );
        for (key, value) in &endpoint.form_data_fields {
            form = form.text(key.clone(), value.clone());
        }
        if let Some(api_key) = &endpoint.api_key {
            form = form.text(endpoint.api_key_field.clone(), api_key.clone());
        }

        let response = self
            .client
            .post(&endpoint.url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| BridgeError::DownloadFailed {
                message: format!("upload request failed: {err}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::DownloadFailed {
                message: format!("upload returned HTTP {status}"),
            });
        }

        // Some hosts answer with a redirect target instead of a body.
        if let Some(location) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
        {
            if location.starts_with("http") {
                return Ok(location.to_string());
            }
        }

        let text = response.text().await.map_err(|err| BridgeError::DownloadFailed {
            message: format!("upload response unreadable: {err}"),
        })?;

        let url = if endpoint.response_type == "text" {
            extract_text_url(&text)
        } else {
            match serde_json::from_str::<Value>(&text) {
                Ok(json) => value_at_path(&json, &endpoint.json_url_key),
                Err(_) => extract_text_url(&text),
            }
        };

        url.ok_or_else(|| BridgeError::DownloadFailed {
            message: format!("upload response had no URL: {}", truncate(&text, 200)),
        })
    }
}

pub fn content_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Walk a dot-separated path through a JSON value, allowing array indexes.
fn value_at_path(json: &Value, path: &str) -> Option<String> {
    let mut current = json;
    for key in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Pull a URL out of a plain-text upload response, tolerating hosts that
/// answer with a `wget <url>` hint.
fn extract_text_url(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with("http") {
        return Some(trimmed.to_string());
    }
    trimmed
        .split_whitespace()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(|token| token.to_string())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_paths_support_nesting_and_indexes() {
        let json = serde_json::json!({"data": {"files": [{"url": "https://x/y.png"}]}});
        assert_eq!(
            value_at_path(&json, "data.files.0.url").as_deref(),
            Some("https://x/y.png")
        );
        assert!(value_at_path(&json, "data.missing").is_none());
    }

    #[test]
    fn text_responses_are_parsed() {
        assert_eq!(
            extract_text_url("https://host/f.png\n").as_deref(),
            Some("https://host/f.png")
        );
        assert_eq!(
            extract_text_url("wget https://host/f.png").as_deref(),
            Some("https://host/f.png")
        );
        assert!(extract_text_url("no url here").is_none());
    }

    #[test]
    fn content_hash_ignores_the_data_uri_prefix_split() {
        let with_prefix = "data:image/png;base64,AAAA";
        let payload = with_prefix.split_once(',').unwrap().1;
        assert_eq!(content_hash(payload), content_hash("AAAA"));
        assert_ne!(content_hash("AAAA"), content_hash("BBBB"));
    }
}
