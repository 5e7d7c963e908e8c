//! change feed configuration, express in toml.
//!
//! Basic configuration file example:
//! ```toml
//! [src]
//! url = "mongodb://localhost:27017/?replicaSet=rs0"
//!
//! [feed]
//! max_read_retries = 3
//! idle_timeout_secs = 600
//!
//! [pre_images]
//! expire_after_secs = 3600
//!
//! [consistency]
//! threads = 4
//! ```
//!
//! Every section and every key is optional.
use std::time::Duration;

use serde::Deserialize;

use crate::Result;

/// Global change feed configuration.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct FeedConfig {
    #[serde(default)]
    src: Option<Src>,
    #[serde(default)]
    feed: FeedConf,
    #[serde(default)]
    pre_images: PreImageConf,
    #[serde(default)]
    consistency: ConsistencyConf,
}

impl FeedConfig {
    /// Parse a toml document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// get source mongodb url.
    pub fn get_src_url(&self) -> Option<&str> {
        self.src.as_ref().map(|src| src.url.as_str())
    }

    /// how many times a failed oplog read is retried before surfacing an error.
    pub fn get_max_read_retries(&self) -> u32 {
        self.feed.max_read_retries
    }

    /// pause between two attempts of a failed oplog read.
    pub fn get_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.feed.retry_backoff_ms)
    }

    /// cursors unused for this long are reaped.
    pub fn get_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.feed.idle_timeout_secs)
    }

    /// longest time an empty pull waits for new entries.
    pub fn get_max_await(&self) -> Duration {
        Duration::from_millis(self.feed.max_await_ms)
    }

    /// batch size used when the request gives none.
    pub fn get_default_batch_size(&self) -> usize {
        self.feed.default_batch_size
    }

    /// oplog entries fetched by one store read.
    pub fn get_read_chunk(&self) -> usize {
        self.feed.read_chunk.max(1)
    }

    /// pre-images older than this are reclaimed once no cursor needs them.
    pub fn get_pre_image_expiry(&self) -> Duration {
        Duration::from_secs(self.pre_images.expire_after_secs)
    }

    /// period of the background reclamation.
    pub fn get_reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.pre_images.reclaim_interval_secs)
    }

    /// size of the thread pool of the cross-node pre-image check.
    pub fn get_consistency_threads(&self) -> usize {
        self.consistency.threads.max(1)
    }

    /// Override the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.feed.idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Override the bounded wait of an empty pull.
    pub fn with_max_await(mut self, max_await: Duration) -> Self {
        self.feed.max_await_ms = max_await.as_millis() as u64;
        self
    }

    /// Override the number of internal retries.
    pub fn with_max_read_retries(mut self, retries: u32) -> Self {
        self.feed.max_read_retries = retries;
        self
    }
}

/// Source database configuration.
#[derive(Deserialize, Debug, Clone)]
pub struct Src {
    /// Source database url, it needs to be replica set, begins with 'mongodb://'
    url: String,
}

/// Cursor tuning knobs.
#[derive(Deserialize, Debug, Clone)]
pub struct FeedConf {
    #[serde(default = "default_max_read_retries")]
    max_read_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    retry_backoff_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    idle_timeout_secs: u64,
    #[serde(default = "default_max_await_ms")]
    max_await_ms: u64,
    #[serde(default = "default_batch_size")]
    default_batch_size: usize,
    #[serde(default = "default_read_chunk")]
    read_chunk: usize,
}

impl Default for FeedConf {
    fn default() -> Self {
        FeedConf {
            max_read_retries: default_max_read_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_await_ms: default_max_await_ms(),
            default_batch_size: default_batch_size(),
            read_chunk: default_read_chunk(),
        }
    }
}

/// Pre-image retention.
#[derive(Deserialize, Debug, Clone)]
pub struct PreImageConf {
    #[serde(default = "default_expire_after_secs")]
    expire_after_secs: u64,
    #[serde(default = "default_reclaim_interval_secs")]
    reclaim_interval_secs: u64,
}

impl Default for PreImageConf {
    fn default() -> Self {
        PreImageConf {
            expire_after_secs: default_expire_after_secs(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
        }
    }
}

/// Cross-node check settings.
#[derive(Deserialize, Debug, Clone)]
pub struct ConsistencyConf {
    #[serde(default = "num_cpus::get")]
    threads: usize,
}

impl Default for ConsistencyConf {
    fn default() -> Self {
        ConsistencyConf {
            threads: num_cpus::get(),
        }
    }
}

fn default_max_read_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_max_await_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    101
}

fn default_read_chunk() -> usize {
    256
}

fn default_expire_after_secs() -> u64 {
    3600
}

fn default_reclaim_interval_secs() -> u64 {
    60
}
