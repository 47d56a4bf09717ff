//! Command-line and environment configuration.

use clap::builder::TypedValueParser;
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::lookup::cache::{CacheStore, FileCache, MemoryCache};
use crate::lookup::client::{ClientConfig, DEFAULT_API_URL, DEFAULT_BATCH_SIZE, DEFAULT_USER_AGENT};
use crate::lookup::fields::parse_request;
use crate::lookup::{FieldSet, ResponseOptions};

/// Field selection defaults.
#[derive(Debug, Clone, Args)]
pub struct FieldArgs {
    /// Comma-separated fields used when a request names none.
    #[arg(long, env = "COLLECTED_FIELDS")]
    pub collected_fields: Option<String>,
}

impl FieldArgs {
    /// Resolve a request's field list against the collected defaults.
    pub fn select(&self, requested: Option<&str>) -> (FieldSet, ResponseOptions) {
        parse_request(requested, self.collected_fields.as_deref())
    }
}

/// Remote lookup service settings.
#[derive(Debug, Clone, Args)]
pub struct UpstreamArgs {
    /// Base URL of the ip-api compatible service.
    #[arg(long, env = "IPAPI_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Maximum number of hosts per batch request.
    #[arg(long, env = "IPAPI_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE,
          value_parser = clap::value_parser!(u16).range(1..).map(usize::from))]
    pub batch_size: usize,

    /// User-Agent header sent upstream.
    #[arg(long, env = "USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Socket timeout per upstream request, in seconds.
    #[arg(long, env = "IPAPI_TIMEOUT", default_value_t = 10)]
    pub request_timeout: u64,

    /// Give up a lookup whose rate-limit waits would exceed this many
    /// seconds. 0 waits as long as upstream asks.
    #[arg(long, env = "LOOKUP_DEADLINE", default_value_t = 120)]
    pub deadline: u64,
}

impl UpstreamArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            api_url: self.api_url.clone(),
            batch_size: self.batch_size,
            user_agent: self.user_agent.clone(),
            request_timeout: Duration::from_secs(self.request_timeout),
            deadline: (self.deadline > 0).then(|| Duration::from_secs(self.deadline)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackend {
    /// No caching: every query goes upstream.
    None,
    /// Process-local cache, lost on restart.
    Memory,
    /// JSON file cache.
    File,
}

/// Local cache settings.
#[derive(Debug, Clone, Args)]
pub struct CacheArgs {
    /// Cache backend.
    #[arg(long = "cache", env = "CACHE_BACKEND", value_enum, default_value_t = CacheBackend::Memory)]
    pub backend: CacheBackend,

    /// Cache file for the `file` backend. Defaults to ~/.iptracker/cache.json.
    #[arg(long, env = "CACHE_FILE")]
    pub cache_file: Option<PathBuf>,

    /// Seconds before a cached record expires.
    #[arg(long, env = "CACHE_EXPIRATION_TIME", default_value_t = 2_592_000)]
    pub cache_expiration: u64,
}

impl CacheArgs {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_expiration)
    }

    /// Build the configured store, or `None` when caching is disabled.
    pub fn build(&self) -> Option<Arc<dyn CacheStore>> {
        match self.backend {
            CacheBackend::None => {
                warn!("Cache disabled. Queries will not be cached locally.");
                None
            }
            CacheBackend::Memory => Some(Arc::new(MemoryCache::new(self.ttl()))),
            CacheBackend::File => {
                let cache = match &self.cache_file {
                    Some(path) => FileCache::load_from(path.clone(), self.ttl()),
                    None => FileCache::load(self.ttl()),
                };
                Some(Arc::new(cache))
            }
        }
    }
}
