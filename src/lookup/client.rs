//! Remote lookup client for the ip-api.com JSON endpoints.
//!
//! Single hosts go to `GET {api}/json/{host}`, collections to
//! `POST {api}/batch` in chunks of at most `batch_size`. Rate limiting is
//! signalled by HTTP 429 or by `X-Rl: 0` together with `X-Ttl: <seconds>`;
//! the client then sleeps `X-Ttl + 1` seconds and repeats the request.

use chrono::Utc;
use serde_json::Value;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::fields::{is_system_field, FieldSet};
use super::types::{FieldValue, Fields, HostRecord, LookupError, QueryOutcome, RecordSource};
use super::validate::{same_host, validate};

pub const DEFAULT_API_URL: &str = "http://ip-api.com";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_USER_AGENT: &str = concat!("iptracker/", env!("CARGO_PKG_VERSION"));

/// Wait used when a 429 arrives without an `X-Ttl` header.
const DEFAULT_RESET_SECS: u64 = 60;

/// Remote lookup client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub batch_size: usize,
    pub user_agent: String,
    /// Per-request socket timeout.
    pub request_timeout: Duration,
    /// Upper bound on a whole call including rate-limit waits. `None` waits forever.
    pub deadline: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(10),
            deadline: Some(Duration::from_secs(120)),
        }
    }
}

/// The remote half of a resolution. Implemented by [`IpApiClient`].
pub trait RemoteLookup: Send + Sync {
    fn resolve_one(&self, host: &str, fields: &FieldSet) -> Result<QueryOutcome, LookupError>;

    fn resolve_many(&self, hosts: &[String], fields: &FieldSet) -> Result<Vec<QueryOutcome>, LookupError>;
}

// ─── Transport ──────────────────────────────────────────────────

/// Raw upstream reply, reduced to what the client looks at.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    /// `X-Rl`: requests remaining in the current window.
    pub remaining: Option<u64>,
    /// `X-Ttl`: seconds until the window resets.
    pub reset_secs: Option<u64>,
    pub body: String,
}

impl UpstreamResponse {
    /// How long to wait before repeating the request, if this reply is a
    /// rate-limit signal.
    pub fn rate_limit_wait(&self) -> Option<Duration> {
        let limited = self.status == 429 || (self.remaining == Some(0) && self.reset_secs.is_some());
        if !limited {
            return None;
        }
        let reset = self.reset_secs.unwrap_or(DEFAULT_RESET_SECS);
        Some(Duration::from_secs(reset + 1))
    }
}

/// HTTP exchange with the upstream service.
pub trait Upstream: Send + Sync {
    fn get(&self, url: &str, fields: &str) -> Result<UpstreamResponse, LookupError>;

    fn post_json(&self, url: &str, fields: &str, body: &str) -> Result<UpstreamResponse, LookupError>;
}

/// Blocking transport backed by a shared `ureq` agent.
pub struct UreqUpstream {
    agent: ureq::Agent,
}

impl UreqUpstream {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .user_agent(user_agent)
            .timeout(timeout)
            .build();
        Self { agent }
    }

    fn send(request: ureq::Request, body: Option<&str>) -> Result<UpstreamResponse, LookupError> {
        let result = match body {
            Some(body) => request.send_string(body),
            None => request.call(),
        };

        // Non-2xx replies still carry the rate-limit headers we need.
        let response = match result {
            Ok(r) => r,
            Err(ureq::Error::Status(_, r)) => r,
            Err(e) => return Err(LookupError::Transport(e.to_string())),
        };

        let status = response.status();
        let remaining = header_u64(&response, "X-Rl");
        let reset_secs = header_u64(&response, "X-Ttl");
        let body = response
            .into_string()
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        Ok(UpstreamResponse {
            status,
            remaining,
            reset_secs,
            body,
        })
    }
}

fn header_u64(response: &ureq::Response, name: &str) -> Option<u64> {
    response.header(name).and_then(|v| v.trim().parse().ok())
}

impl Upstream for UreqUpstream {
    fn get(&self, url: &str, fields: &str) -> Result<UpstreamResponse, LookupError> {
        Self::send(self.agent.get(url).query("fields", fields), None)
    }

    fn post_json(&self, url: &str, fields: &str, body: &str) -> Result<UpstreamResponse, LookupError> {
        let request = self
            .agent
            .post(url)
            .query("fields", fields)
            .set("Content-Type", "application/json");
        Self::send(request, Some(body))
    }
}

// ─── Client ─────────────────────────────────────────────────────

/// Client for the ip-api.com geolocation service.
pub struct IpApiClient<U = UreqUpstream> {
    upstream: U,
    api_url: String,
    batch_size: usize,
    deadline: Option<Duration>,
}

impl IpApiClient<UreqUpstream> {
    pub fn new(config: ClientConfig) -> Self {
        let upstream = UreqUpstream::new(&config.user_agent, config.request_timeout);
        Self::with_upstream(config, upstream)
    }
}

impl<U: Upstream> IpApiClient<U> {
    /// Create a client over a specific transport (for testing).
    pub fn with_upstream(config: ClientConfig, upstream: U) -> Self {
        Self {
            upstream,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            batch_size: config.batch_size.max(1),
            deadline: config.deadline,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    fn query_one(&self, host: &str, fields: &FieldSet) -> Result<QueryOutcome, LookupError> {
        info!("Resolving host {}", host);
        let url = format!("{}/json/{}", self.api_url, host);
        let param = fields.upstream_param();
        let response = self.exchange(|| self.upstream.get(&url, &param))?;

        let payload: Value = serde_json::from_str(&response.body)
            .map_err(|e| LookupError::MalformedPayload(e.to_string()))?;
        parse_item(&payload, host)
    }

    fn query_batch(&self, hosts: &[String], fields: &FieldSet) -> Result<Vec<QueryOutcome>, LookupError> {
        if hosts.len() > self.batch_size {
            return Err(LookupError::BatchTooLarge {
                size: hosts.len(),
                max: self.batch_size,
            });
        }

        info!("Resolving {} hosts", hosts.len());
        let url = format!("{}/batch", self.api_url);
        let param = fields.upstream_param();
        let body = serde_json::to_string(hosts).map_err(|e| LookupError::MalformedPayload(e.to_string()))?;
        let response = self.exchange(|| self.upstream.post_json(&url, &param, &body))?;

        let payload: Value = serde_json::from_str(&response.body)
            .map_err(|e| LookupError::MalformedPayload(e.to_string()))?;
        let items = payload
            .as_array()
            .ok_or_else(|| LookupError::MalformedPayload("batch reply is not an array".into()))?;

        let outcomes = items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_item(item, hosts.get(i).map(String::as_str).unwrap_or("")))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(match_to_requests(hosts, outcomes))
    }

    /// Run `send` until the reply is not a rate-limit signal, sleeping for the
    /// mandated reset window in between.
    fn exchange<F>(&self, mut send: F) -> Result<UpstreamResponse, LookupError>
    where
        F: FnMut() -> Result<UpstreamResponse, LookupError>,
    {
        let started = Instant::now();
        loop {
            let response = send()?;

            if let Some(wait) = response.rate_limit_wait() {
                let waited = started.elapsed();
                if let Some(deadline) = self.deadline {
                    if waited + wait > deadline {
                        warn!("Rate limit wait of {}s exceeds the lookup deadline", wait.as_secs());
                        return Err(LookupError::Timeout { waited });
                    }
                }
                info!("Rate limit reached, waiting for {} seconds", wait.as_secs());
                thread::sleep(wait);
                continue;
            }

            if response.status != 200 {
                error!("IPAPI remote error: {}, {}", response.status, response.body);
                return Err(LookupError::Remote {
                    status: response.status,
                    body: response.body,
                });
            }

            return Ok(response);
        }
    }
}

impl<U: Upstream> RemoteLookup for IpApiClient<U> {
    fn resolve_one(&self, host: &str, fields: &FieldSet) -> Result<QueryOutcome, LookupError> {
        if let Err(e) = validate(host) {
            return Ok(QueryOutcome::fail(host, e.to_string()));
        }
        self.query_one(host, fields)
    }

    fn resolve_many(&self, hosts: &[String], fields: &FieldSet) -> Result<Vec<QueryOutcome>, LookupError> {
        let mut results = Vec::with_capacity(hosts.len());
        let mut valid = Vec::with_capacity(hosts.len());

        for host in hosts {
            match validate(host) {
                Ok(_) => valid.push(host.clone()),
                Err(e) => results.push(QueryOutcome::fail(host.as_str(), e.to_string())),
            }
        }

        for batch in valid.chunks(self.batch_size) {
            results.extend(self.query_batch(batch, fields)?);
        }

        Ok(results)
    }
}

/// Turn one upstream JSON object into an outcome. `fallback_host` is used when
/// the reply does not echo `query`.
fn parse_item(payload: &Value, fallback_host: &str) -> Result<QueryOutcome, LookupError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| LookupError::MalformedPayload(format!("expected object, got {}", payload)))?;

    let host = obj
        .get("query")
        .and_then(Value::as_str)
        .unwrap_or(fallback_host)
        .to_string();

    match obj.get("status").and_then(Value::as_str) {
        Some("success") => {
            let mut fields = Fields::new();
            for (name, value) in obj {
                if is_system_field(name) {
                    continue;
                }
                let value = FieldValue::from_json(value)
                    .map_err(|e| LookupError::MalformedPayload(format!("field '{}': {}", name, e)))?;
                if let Some(value) = value {
                    fields.insert(name.clone(), value);
                }
            }
            Ok(QueryOutcome::Success(HostRecord::new(
                host,
                Utc::now(),
                RecordSource::Remote,
                fields,
            )))
        }
        Some("fail") => {
            let message = obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Ok(QueryOutcome::fail(host, message))
        }
        other => Err(LookupError::InvalidUpstreamStatus(
            other.map(str::to_string).unwrap_or_else(|| "<missing>".into()),
        )),
    }
}

/// Put batch outcomes in request order using the echoed host. Outcomes that
/// match no request are kept after the matched ones, in upstream order.
fn match_to_requests(requested: &[String], outcomes: Vec<QueryOutcome>) -> Vec<QueryOutcome> {
    let mut slots: Vec<Option<QueryOutcome>> = vec![None; requested.len()];
    let mut unmatched = Vec::new();

    for outcome in outcomes {
        let slot = requested
            .iter()
            .enumerate()
            .find(|(i, h)| slots[*i].is_none() && same_host(h, outcome.host()))
            .map(|(i, _)| i);
        match slot {
            Some(i) => slots[i] = Some(outcome),
            None => unmatched.push(outcome),
        }
    }

    if !unmatched.is_empty() {
        warn!("{} batch results did not match any requested host", unmatched.len());
    }

    slots.into_iter().flatten().chain(unmatched).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::testing::StubUpstream;
    use crate::lookup::types::{QueryStatus, ValidationError};
    use approx::assert_relative_eq;

    fn client(upstream: StubUpstream) -> IpApiClient<StubUpstream> {
        IpApiClient::with_upstream(ClientConfig::default(), upstream)
    }

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_one_success() {
        let client = client(StubUpstream::geo());
        let outcome = client.resolve_one("8.8.8.8", &FieldSet::parse("country,city,lat")).unwrap();

        let record = outcome.record().unwrap();
        assert_eq!(record.host(), "8.8.8.8");
        assert_eq!(record.source(), RecordSource::Remote);
        assert_eq!(record.get("country").and_then(|v| v.as_str()), Some("United States"));
        assert_relative_eq!(record.get("lat").and_then(|v| v.as_f64()).unwrap(), 37.4223, epsilon = 1e-6);
        assert!(record.get("status").is_none());
        assert!(record.get("query").is_none());

        let calls = client.upstream().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "http://ip-api.com/json/8.8.8.8");
        assert_eq!(calls[0].fields, "country,city,lat,status,message,query");
    }

    #[test]
    fn test_resolve_one_invalid_skips_network() {
        let client = client(StubUpstream::geo());
        let outcome = client.resolve_one("192.168.0.10", &FieldSet::default()).unwrap();
        assert_eq!(outcome.status(), QueryStatus::Fail);
        assert_eq!(outcome.error_message(), Some("private range"));

        let outcome = client.resolve_one("nope", &FieldSet::default()).unwrap();
        assert_eq!(outcome.error_message(), Some(ValidationError::InvalidAddress.to_string().as_str()));
        assert_eq!(client.upstream().call_count(), 0);
    }

    #[test]
    fn test_upstream_fail_status() {
        let client = client(StubUpstream::geo());
        // The stub answers unknown hosts the way ip-api answers reserved ranges.
        let outcome = client.resolve_one("9.9.9.9", &FieldSet::default()).unwrap();
        assert_eq!(outcome.host(), "9.9.9.9");
        assert_eq!(outcome.error_message(), Some("reserved range"));
    }

    #[test]
    fn test_invalid_upstream_status_is_fatal() {
        let client = client(StubUpstream::fixed(200, r#"{"status":"maybe","query":"8.8.8.8"}"#));
        let err = client.resolve_one("8.8.8.8", &FieldSet::default()).unwrap_err();
        assert!(matches!(err, LookupError::InvalidUpstreamStatus(ref s) if s == "maybe"));
    }

    #[test]
    fn test_remote_error_is_fatal() {
        let client = client(StubUpstream::fixed(503, "service unavailable"));
        let err = client.resolve_one("8.8.8.8", &FieldSet::default()).unwrap_err();
        match err {
            LookupError::Remote { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "service unavailable");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(client.upstream().call_count(), 1);
    }

    #[test]
    fn test_malformed_payload_is_fatal() {
        let client = client(StubUpstream::fixed(200, "<html>"));
        let err = client.resolve_one("8.8.8.8", &FieldSet::default()).unwrap_err();
        assert!(matches!(err, LookupError::MalformedPayload(_)));
    }

    #[test]
    fn test_rate_limit_waits_then_retries_once() {
        let client = client(StubUpstream::geo().rate_limited_first(2));
        let started = Instant::now();
        let outcome = client.resolve_one("1.1.1.1", &FieldSet::parse("country")).unwrap();
        let elapsed = started.elapsed();

        assert!(outcome.is_success());
        assert_eq!(outcome.host(), "1.1.1.1");
        assert!(elapsed >= Duration::from_secs(3), "waited {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "waited {:?}", elapsed);
        assert_eq!(client.upstream().call_count(), 2);
    }

    #[test]
    fn test_rate_limit_past_deadline_times_out() {
        let config = ClientConfig {
            deadline: Some(Duration::from_secs(5)),
            ..ClientConfig::default()
        };
        let client = IpApiClient::with_upstream(config, StubUpstream::geo().rate_limited_first(30));
        let started = Instant::now();
        let err = client.resolve_one("1.1.1.1", &FieldSet::default()).unwrap_err();
        assert!(matches!(err, LookupError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_rate_limit_wait_detection() {
        let base = UpstreamResponse {
            status: 200,
            remaining: Some(10),
            reset_secs: Some(30),
            body: String::new(),
        };
        assert_eq!(base.rate_limit_wait(), None);

        let exhausted = UpstreamResponse { remaining: Some(0), ..base.clone() };
        assert_eq!(exhausted.rate_limit_wait(), Some(Duration::from_secs(31)));

        let no_reset = UpstreamResponse { remaining: Some(0), reset_secs: None, ..base.clone() };
        assert_eq!(no_reset.rate_limit_wait(), None);

        let too_many = UpstreamResponse { status: 429, remaining: None, reset_secs: None, ..base };
        assert_eq!(too_many.rate_limit_wait(), Some(Duration::from_secs(61)));
    }

    #[test]
    fn test_resolve_many_splits_batches() {
        let config = ClientConfig {
            batch_size: 3,
            ..ClientConfig::default()
        };
        let client = IpApiClient::with_upstream(config, StubUpstream::geo());
        let list: Vec<String> = (1..=8).map(|i| format!("8.8.{}.{}", i, i)).collect();

        let outcomes = client.resolve_many(&list, &FieldSet::parse("country")).unwrap();
        assert_eq!(outcomes.len(), 8);

        let calls = client.upstream().calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.hosts.len() <= 3));
        assert_eq!(calls[0].url, "http://ip-api.com/batch");
        assert_eq!(calls[0].hosts, list[0..3].to_vec());
        assert_eq!(calls[2].hosts, list[6..8].to_vec());

        let order: Vec<&str> = outcomes.iter().map(|o| o.host()).collect();
        assert_eq!(order, list.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_resolve_many_invalid_first() {
        let client = client(StubUpstream::geo());
        let outcomes = client
            .resolve_many(&hosts(&["8.8.8.8", "10.0.0.1", "1.1.1.1", "bogus"]), &FieldSet::parse("country"))
            .unwrap();

        let order: Vec<&str> = outcomes.iter().map(|o| o.host()).collect();
        assert_eq!(order, vec!["10.0.0.1", "bogus", "8.8.8.8", "1.1.1.1"]);
        assert_eq!(outcomes[0].error_message(), Some("private range"));
        assert_eq!(outcomes[1].error_message(), Some("invalid query"));
        assert!(outcomes[2].is_success() && outcomes[3].is_success());
        assert_eq!(client.upstream().calls()[0].hosts, hosts(&["8.8.8.8", "1.1.1.1"]));
    }

    #[test]
    fn test_resolve_many_all_invalid_no_request() {
        let client = client(StubUpstream::geo());
        let outcomes = client.resolve_many(&hosts(&["127.0.0.1", "::1"]), &FieldSet::default()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(client.upstream().call_count(), 0);
    }

    #[test]
    fn test_batch_reply_matched_by_echoed_host() {
        let client = client(StubUpstream::geo().reversed_batches());
        let list = hosts(&["8.8.8.8", "1.1.1.1", "9.9.9.9"]);
        let outcomes = client.resolve_many(&list, &FieldSet::parse("country")).unwrap();
        let order: Vec<&str> = outcomes.iter().map(|o| o.host()).collect();
        assert_eq!(order, vec!["8.8.8.8", "1.1.1.1", "9.9.9.9"]);
    }

    #[test]
    fn test_batch_rate_limit_retries_whole_batch() {
        let client = client(StubUpstream::geo().rate_limited_first(0));
        let outcomes = client
            .resolve_many(&hosts(&["8.8.8.8", "1.1.1.1"]), &FieldSet::parse("country"))
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        let calls = client.upstream().calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].hosts, calls[1].hosts);
    }

    #[test]
    fn test_query_batch_too_large() {
        let config = ClientConfig {
            batch_size: 2,
            ..ClientConfig::default()
        };
        let client = IpApiClient::with_upstream(config, StubUpstream::geo());
        let err = client
            .query_batch(&hosts(&["8.8.8.8", "1.1.1.1", "8.8.4.4"]), &FieldSet::default())
            .unwrap_err();
        assert!(matches!(err, LookupError::BatchTooLarge { size: 3, max: 2 }));
        assert_eq!(client.upstream().call_count(), 0);
    }

    #[test]
    fn test_parse_item_drops_nulls_and_system_fields() {
        let payload = serde_json::json!({
            "status": "success",
            "query": "8.8.8.8",
            "message": "",
            "country": "United States",
            "zip": null,
            "mobile": false,
            "offset": -25200
        });
        let outcome = parse_item(&payload, "x").unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record.fields().len(), 3);
        assert_eq!(record.get("mobile"), Some(&FieldValue::Bool(false)));
        assert_eq!(record.get("offset"), Some(&FieldValue::Integer(-25200)));
    }

    #[test]
    fn test_parse_item_rejects_nested_values() {
        let payload = serde_json::json!({"status": "success", "query": "8.8.8.8", "as": {"n": 1}});
        assert!(matches!(parse_item(&payload, "8.8.8.8"), Err(LookupError::MalformedPayload(_))));
    }

    #[test]
    fn test_parse_item_fallback_host() {
        let payload = serde_json::json!({"status": "fail", "message": "invalid query"});
        let outcome = parse_item(&payload, "2.2.2.2").unwrap();
        assert_eq!(outcome.host(), "2.2.2.2");
    }
}
