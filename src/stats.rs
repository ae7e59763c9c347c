//! Query statistics: global counters, per-upstream error rates and bounded
//! top-N trackers for client addresses and queried domains.
//!
//! A JSON snapshot is persisted under `data/cache/stats.json` so counters
//! survive restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

const MAX_TRACKED_CLIENTS: usize = 100;
const MAX_TRACKED_DOMAINS: usize = 200;
const TOP_N: usize = 20;

pub struct Stats {
    start_time: DateTime<Utc>,
    stats_start_time: Mutex<DateTime<Utc>>,

    total_queries: AtomicU64,
    doh_queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failed_queries: AtomicU64,

    upstreams: Mutex<HashMap<String, UpstreamCounters>>,
    top_clients: Mutex<TopTracker>,
    top_domains: Mutex<TopTracker>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct UpstreamCounters {
    total_queries: u64,
    errors: u64,
    last_used: Option<DateTime<Utc>>,
}

impl Stats {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            start_time: now,
            stats_start_time: Mutex::new(now),
            total_queries: AtomicU64::new(0),
            doh_queries: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            upstreams: Mutex::new(HashMap::new()),
            top_clients: Mutex::new(TopTracker::new(MAX_TRACKED_CLIENTS)),
            top_domains: Mutex::new(TopTracker::new(MAX_TRACKED_DOMAINS)),
        }
    }

    pub fn record_query(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_doh_query(&self) {
        self.doh_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_query(&self, address: &str, is_error: bool) {
        let mut upstreams = self.upstreams.lock().unwrap();
        let entry = upstreams.entry(address.to_string()).or_default();
        entry.total_queries += 1;
        if is_error {
            entry.errors += 1;
        }
        entry.last_used = Some(Utc::now());
    }

    pub fn record_client_query(&self, client: &str, domain: &str) {
        if !client.is_empty() {
            self.top_clients.lock().unwrap().record(client, "");
        }
        if !domain.is_empty() {
            self.top_domains.lock().unwrap().record(domain, client);
        }
    }

    pub fn reset(&self) {
        *self.stats_start_time.lock().unwrap() = Utc::now();
        self.total_queries.store(0, Ordering::Relaxed);
        self.doh_queries.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.failed_queries.store(0, Ordering::Relaxed);
        self.upstreams.lock().unwrap().clear();
        *self.top_clients.lock().unwrap() = TopTracker::new(MAX_TRACKED_CLIENTS);
        *self.top_domains.lock().unwrap() = TopTracker::new(MAX_TRACKED_DOMAINS);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Utc::now();
        let uptime = (now - self.start_time).num_seconds().max(0);
        let stats_start = *self.stats_start_time.lock().unwrap();
        let window = (now - stats_start).num_seconds().max(0);

        let total = self.total_queries.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let mut upstreams: Vec<UpstreamSnapshot> = self
            .upstreams
            .lock()
            .unwrap()
            .iter()
            .map(|(address, c)| UpstreamSnapshot {
                address: address.clone(),
                total_queries: c.total_queries,
                errors: c.errors,
                error_rate: if c.total_queries > 0 {
                    c.errors as f64 / c.total_queries as f64 * 100.0
                } else {
                    0.0
                },
                last_used: c
                    .last_used
                    .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "Never".to_string()),
            })
            .collect();
        upstreams.sort_by(|a, b| a.address.cmp(&b.address));

        StatsSnapshot {
            runtime: RuntimeSnapshot {
                uptime,
                uptime_str: format_duration(uptime),
                stats_duration: window,
                stats_duration_str: format_duration(window),
            },
            queries: QuerySnapshot {
                total,
                doh: self.doh_queries.load(Ordering::Relaxed),
                cache_hits: hits,
                cache_misses: self.cache_misses.load(Ordering::Relaxed),
                failed: self.failed_queries.load(Ordering::Relaxed),
                hit_rate,
            },
            upstreams,
            top_clients: self.top_clients.lock().unwrap().top_n(TOP_N),
            top_domains: self.top_domains.lock().unwrap().top_n(TOP_N),
        }
    }

    /// Persist the raw counters as JSON. Directories are created as needed.
    pub fn save(&self, data_path: &Path) -> anyhow::Result<()> {
        let persistent = PersistentStats {
            stats_start_time: *self.stats_start_time.lock().unwrap(),
            total_queries: self.total_queries.load(Ordering::Relaxed),
            doh_queries: self.doh_queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            upstreams: self.upstreams.lock().unwrap().clone(),
            top_clients: self.top_clients.lock().unwrap().items.clone(),
            top_domains: self.top_domains.lock().unwrap().items.clone(),
        };
        let file = stats_file(data_path);
        std::fs::create_dir_all(file.parent().unwrap())?;
        std::fs::write(&file, serde_json::to_vec_pretty(&persistent)?)?;
        Ok(())
    }

    /// Restore counters from a previous run. A missing file is not an error.
    pub fn load(&self, data_path: &Path) -> anyhow::Result<()> {
        let file = stats_file(data_path);
        let body = match std::fs::read(&file) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let persistent: PersistentStats = serde_json::from_slice(&body)?;

        *self.stats_start_time.lock().unwrap() = persistent.stats_start_time;
        self.total_queries.store(persistent.total_queries, Ordering::Relaxed);
        self.doh_queries.store(persistent.doh_queries, Ordering::Relaxed);
        self.cache_hits.store(persistent.cache_hits, Ordering::Relaxed);
        self.cache_misses.store(persistent.cache_misses, Ordering::Relaxed);
        self.failed_queries.store(persistent.failed_queries, Ordering::Relaxed);
        *self.upstreams.lock().unwrap() = persistent.upstreams;
        self.top_clients.lock().unwrap().items = persistent.top_clients;
        self.top_domains.lock().unwrap().items = persistent.top_domains;
        Ok(())
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

fn stats_file(data_path: &Path) -> PathBuf {
    data_path.join("cache").join("stats.json")
}

fn format_duration(secs: i64) -> String {
    let days = secs / 86_400;
    let hours = secs % 86_400 / 3_600;
    let minutes = secs % 3_600 / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{days}d{hours}h{minutes}m")
    } else if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Bounded counter map: when full, the lowest-count key is evicted to make
/// room, keeping memory use flat no matter how many distinct keys pass by.
struct TopTracker {
    items: HashMap<String, TopItem>,
    max_items: usize,
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct TopItem {
    count: u64,
    #[serde(default)]
    top_client: String,
    #[serde(default)]
    clients: HashMap<String, u64>,
}

impl TopTracker {
    fn new(max_items: usize) -> Self {
        Self {
            items: HashMap::new(),
            max_items,
        }
    }

    fn record(&mut self, key: &str, associated_client: &str) {
        if !self.items.contains_key(key) {
            if self.items.len() >= self.max_items {
                self.evict_lowest();
            }
            self.items.insert(key.to_string(), TopItem::default());
        }
        let item = self.items.get_mut(key).unwrap();
        item.count += 1;
        if !associated_client.is_empty() {
            let n = item.clients.entry(associated_client.to_string()).or_insert(0);
            *n += 1;
            let n = *n;
            if n > item.clients.get(&item.top_client).copied().unwrap_or(0) {
                item.top_client = associated_client.to_string();
            }
        }
    }

    fn evict_lowest(&mut self) {
        if let Some(key) = self
            .items
            .iter()
            .min_by_key(|(_, item)| item.count)
            .map(|(k, _)| k.clone())
        {
            self.items.remove(&key);
        }
    }

    fn top_n(&self, n: usize) -> Vec<TopEntry> {
        let mut entries: Vec<TopEntry> = self
            .items
            .iter()
            .map(|(key, item)| TopEntry {
                key: key.clone(),
                count: item.count,
                top_client: if item.top_client.is_empty() {
                    None
                } else {
                    Some(item.top_client.clone())
                },
            })
            .collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        entries.truncate(n);
        entries
    }
}

#[derive(Serialize)]
pub struct StatsSnapshot {
    pub runtime: RuntimeSnapshot,
    pub queries: QuerySnapshot,
    pub upstreams: Vec<UpstreamSnapshot>,
    pub top_clients: Vec<TopEntry>,
    pub top_domains: Vec<TopEntry>,
}

#[derive(Serialize)]
pub struct RuntimeSnapshot {
    pub uptime: i64,
    pub uptime_str: String,
    pub stats_duration: i64,
    pub stats_duration_str: String,
}

#[derive(Serialize)]
pub struct QuerySnapshot {
    pub total: u64,
    pub doh: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failed: u64,
    pub hit_rate: f64,
}

#[derive(Serialize)]
pub struct UpstreamSnapshot {
    pub address: String,
    pub total_queries: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub last_used: String,
}

#[derive(Serialize)]
pub struct TopEntry {
    pub key: String,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_client: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct PersistentStats {
    stats_start_time: DateTime<Utc>,
    total_queries: u64,
    doh_queries: u64,
    cache_hits: u64,
    cache_misses: u64,
    failed_queries: u64,
    upstreams: HashMap<String, UpstreamCounters>,
    top_clients: HashMap<String, TopItem>,
    top_domains: HashMap<String, TopItem>,
}

/// Spawn the periodic persistence loop. Saves every `interval_minutes` until
/// the process exits; a final save happens in the shutdown path.
pub fn spawn_save_loop(
    stats: std::sync::Arc<Stats>,
    data_path: PathBuf,
    interval_minutes: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(interval_minutes.max(1) * 60);
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = stats.save(&data_path) {
                warn!("failed to persist stats: {e:#}");
            }
        }
    })
}
