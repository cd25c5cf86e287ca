//! Bounded-concurrency image downloader with a TTL-bounded base64 cache.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lmarena_bridge_error::BridgeError;
use reqwest::Client;
use tokio::sync::{Mutex, Semaphore};

use crate::config::BridgeConfig;

const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const REFERER: &str = "https://lmarena.ai/";

/// A string cache with TTL expiry and a hard size cap. Entries are indexed by
/// insertion time so the sweeper never scans the whole map.
pub struct TtlCache {
    map: HashMap<String, Slot>,
    order: VecDeque<(Instant, String)>,
    ttl: Duration,
    max_entries: usize,
}

struct Slot {
    value: String,
    inserted_at: Instant,
}

impl TtlCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            max_entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let slot = self.map.get(key)?;
        (slot.inserted_at.elapsed() < self.ttl).then(|| slot.value.clone())
    }

    pub fn insert(&mut self, key: String, value: String) {
        let now = Instant::now();
        self.order.push_back((now, key.clone()));
        self.map.insert(
            key,
            Slot {
                value,
                inserted_at: now,
            },
        );
        while self.map.len() > self.max_entries {
            if !self.evict_front() {
                break;
            }
        }
    }

    /// Remove expired entries; returns how many were evicted.
    pub fn sweep(&mut self) -> usize {
        let mut evicted = 0;
        while let Some((inserted_at, _)) = self.order.front() {
            if inserted_at.elapsed() < self.ttl {
                break;
            }
            if self.evict_front() {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict_front(&mut self) -> bool {
        let Some((inserted_at, key)) = self.order.pop_front() else {
            return false;
        };
        // The index may hold stale rows for keys that were overwritten later;
        // only drop the map entry when the timestamps agree.
        match self.map.get(&key) {
            Some(slot) if slot.inserted_at == inserted_at => {
                self.map.remove(&key);
                true
            }
            _ => false,
        }
    }
}

pub struct DownloadPool {
    semaphore: Arc<Semaphore>,
    client: Client,
    max_retries: u32,
    image_cache: Mutex<TtlCache>,
}

impl DownloadPool {
    pub fn new(config: &BridgeConfig) -> Self {
        let timeouts = &config.download_timeout;
        let pool = &config.connection_pool;
        let client = Client::builder()
            .timeout(Duration::from_secs(timeouts.total))
            .connect_timeout(Duration::from_secs(timeouts.connect))
            .read_timeout(Duration::from_secs(timeouts.sock_read))
            .pool_max_idle_per_host(pool.per_host_limit)
            .pool_idle_timeout(Duration::from_secs(pool.keepalive_timeout))
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "falling back to a default download client");
                Client::new()
            });
        let memory = &config.memory_management;
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            client,
            max_retries: timeouts.max_retries.max(1),
            image_cache: Mutex::new(TtlCache::new(
                Duration::from_secs(memory.image_cache_ttl_seconds),
                memory.image_cache_max_size,
            )),
        }
    }

    /// GET the url under the concurrency gate, retrying a fixed small number
    /// of times with fixed backoff.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, BridgeError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| BridgeError::internal("download pool closed"))?;

        let mut last_error = String::new();
        for attempt in 0..self.max_retries {
            let started = Instant::now();
            let result = self
                .client
                .get(url)
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .header(reqwest::header::ACCEPT, "image/webp,image/apng,image/*,*/*;q=0.8")
                .header(reqwest::header::REFERER, REFERER)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    match response.bytes().await {
                        Ok(bytes) => {
                            tracing::debug!(
                                url,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                bytes = bytes.len(),
                                "download complete"
                            );
                            return Ok(bytes.to_vec());
                        }
                        Err(err) => last_error = format!("read body: {err}"),
                    }
                }
                Ok(response) => last_error = format!("HTTP {}", response.status()),
                Err(err) if err.is_timeout() => {
                    last_error = format!("timed out on attempt {}", attempt + 1)
                }
                Err(err) => last_error = err.to_string(),
            }
            tracing::warn!(url, attempt = attempt + 1, error = %last_error, "download attempt failed");
            if attempt + 1 < self.max_retries {
                let delay = RETRY_DELAYS[(attempt as usize).min(RETRY_DELAYS.len() - 1)];
                tokio::time::sleep(delay).await;
            }
        }
        Err(BridgeError::DownloadFailed {
            message: last_error,
        })
    }

    /// Fetch a url as a `data:` URL, consulting the base64 cache first.
    pub async fn fetch_as_data_url(&self, url: &str) -> Result<String, BridgeError> {
        if let Some(hit) = self.image_cache.lock().await.get(url) {
            tracing::debug!(url, "image served from base64 cache");
            return Ok(hit);
        }
        let bytes = self.fetch(url).await?;
        let content_type = mime_guess::from_path(url)
            .first_raw()
            .unwrap_or("image/png");
        let data_url = format!("data:{content_type};base64,{}", BASE64.encode(&bytes));
        self.image_cache
            .lock()
            .await
            .insert(url.to_string(), data_url.clone());
        Ok(data_url)
    }

    pub async fn cache_len(&self) -> usize {
        self.image_cache.lock().await.len()
    }
}

/// Background eviction of expired cache entries.
pub fn spawn_cache_sweeper(pool: Arc<DownloadPool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = pool.image_cache.lock().await.sweep();
            if evicted > 0 {
                tracing::info!(evicted, "evicted expired image cache entries");
            }
        }
    });
}
