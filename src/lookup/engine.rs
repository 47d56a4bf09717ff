//! Resolution engine: cache-aside orchestration.
//!
//! Single flow: validate → cache (complete hit) → remote → cache write.
//! Batch flow: partition into local outcomes and a remote queue, resolve the
//! queue in one remote call, write successes back, return local then remote.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::cache::CacheStore;
use super::client::RemoteLookup;
use super::fields::FieldSet;
use super::types::{HostRecord, LookupError, QueryOutcome};
use super::validate::validate;
use crate::metrics::{MetricsSink, NoopMetrics};

pub struct ResolutionEngine {
    remote: Arc<dyn RemoteLookup>,
    cache: Option<Arc<dyn CacheStore>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ResolutionEngine {
    pub fn new(
        remote: Arc<dyn RemoteLookup>,
        cache: Option<Arc<dyn CacheStore>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        if let Some(cache) = &cache {
            metrics.set_cache_size(cache.len());
        }
        Self { remote, cache, metrics }
    }

    /// Engine without cache or metrics: every call goes to the remote client.
    pub fn pass_through(remote: Arc<dyn RemoteLookup>) -> Self {
        Self::new(remote, None, Arc::new(NoopMetrics))
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Resolve one host.
    #[instrument(skip(self, fields), level = "debug")]
    pub fn resolve(&self, host: &str, fields: &FieldSet, skip_cache: bool) -> Result<QueryOutcome, LookupError> {
        let outcome = self.resolve_inner(host, fields, skip_cache)?;
        self.metrics.record_resolution(&outcome);
        Ok(outcome)
    }

    fn resolve_inner(&self, host: &str, fields: &FieldSet, skip_cache: bool) -> Result<QueryOutcome, LookupError> {
        if let Some(cache) = self.active_cache(skip_cache) {
            if let Err(e) = validate(host) {
                return Ok(QueryOutcome::fail(host, e.to_string()));
            }
            if let Some(hit) = complete_hit(cache, host, fields) {
                return Ok(hit);
            }
        }

        let outcome = self.remote.resolve_one(host, fields)?;
        if let Some(record) = outcome.record() {
            self.store(record);
        }
        Ok(outcome)
    }

    /// Resolve many hosts. Locally answered outcomes come first, in the order
    /// they were found, followed by the remote outcomes. Input order is not
    /// preserved across that split.
    #[instrument(skip_all, fields(hosts = hosts.len()), level = "debug")]
    pub fn resolve_many(
        &self,
        hosts: &[String],
        fields: &FieldSet,
        skip_cache: bool,
    ) -> Result<Vec<QueryOutcome>, LookupError> {
        debug!("Querying {} hosts", hosts.len());

        let mut results = Vec::with_capacity(hosts.len());
        let queue: Vec<String> = match self.active_cache(skip_cache) {
            Some(cache) => {
                let mut queue = Vec::new();
                for host in hosts {
                    if let Err(e) = validate(host) {
                        results.push(QueryOutcome::fail(host.as_str(), e.to_string()));
                        continue;
                    }
                    match complete_hit(cache, host, fields) {
                        Some(hit) => results.push(hit),
                        None => queue.push(host.clone()),
                    }
                }
                queue
            }
            None => hosts.to_vec(),
        };

        debug!("Resolved {} queries locally", results.len());

        let remote = if queue.is_empty() {
            Vec::new()
        } else {
            self.remote.resolve_many(&queue, fields)?
        };
        for record in remote.iter().filter_map(QueryOutcome::record) {
            self.store(record);
        }
        results.extend(remote);

        for outcome in &results {
            self.metrics.record_resolution(outcome);
        }
        Ok(results)
    }

    fn active_cache(&self, skip_cache: bool) -> Option<&dyn CacheStore> {
        if skip_cache {
            return None;
        }
        self.cache.as_deref()
    }

    /// Best-effort cache write. Failures are logged, never returned.
    fn store(&self, record: &HostRecord) {
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.put(record) {
            Ok(()) => self.metrics.set_cache_size(cache.len()),
            Err(e) => warn!("Failed to push host {} to local cache: {}", record.host(), e),
        }
    }
}

/// A cached record holding every requested field, projected to exactly those.
fn complete_hit(cache: &dyn CacheStore, host: &str, fields: &FieldSet) -> Option<QueryOutcome> {
    let record = cache.get(host)?;
    if !record.has_all_fields(fields) {
        return None;
    }
    Some(QueryOutcome::Success(record.project(fields)))
}
