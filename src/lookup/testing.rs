//! Scripted upstream used by the unit tests.

use serde_json::{json, Map, Value};
use std::sync::Mutex;

use super::client::{Upstream, UpstreamResponse};
use super::types::LookupError;

#[derive(Debug, Clone)]
pub struct StubCall {
    pub method: &'static str,
    pub url: String,
    pub fields: String,
    pub hosts: Vec<String>,
}

enum Mode {
    Geo,
    Fixed { status: u16, body: String },
}

/// Answers like ip-api.com for a small table of well-known addresses and with
/// `reserved range` for everything else.
pub struct StubUpstream {
    mode: Mode,
    rate_limit_reset: Option<u64>,
    reverse: bool,
    calls: Mutex<Vec<StubCall>>,
}

impl StubUpstream {
    pub fn geo() -> Self {
        Self {
            mode: Mode::Geo,
            rate_limit_reset: None,
            reverse: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fixed(status: u16, body: &str) -> Self {
        Self {
            mode: Mode::Fixed {
                status,
                body: body.to_string(),
            },
            ..Self::geo()
        }
    }

    /// The first request gets a 429 with `X-Ttl: reset`.
    pub fn rate_limited_first(mut self, reset: u64) -> Self {
        self.rate_limit_reset = Some(reset);
        self
    }

    /// Batch replies come back in reverse request order.
    pub fn reversed_batches(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn calls(&self) -> Vec<StubCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, call: StubCall) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(call);
        calls.len()
    }

    fn rate_limited(&self, call_number: usize) -> Option<UpstreamResponse> {
        match self.rate_limit_reset {
            Some(reset) if call_number == 1 => Some(UpstreamResponse {
                status: 429,
                remaining: Some(0),
                reset_secs: Some(reset),
                body: String::new(),
            }),
            _ => None,
        }
    }

    fn ok(body: Value) -> UpstreamResponse {
        UpstreamResponse {
            status: 200,
            remaining: Some(44),
            reset_secs: Some(60),
            body: body.to_string(),
        }
    }
}

fn geo_entry(host: &str) -> Option<Value> {
    match host {
        "8.8.8.8" | "8.8.4.4" => Some(json!({
            "country": "United States",
            "countryCode": "US",
            "region": "CA",
            "regionName": "California",
            "city": "Mountain View",
            "zip": "94043",
            "lat": 37.4223,
            "lon": -122.085,
            "timezone": "America/Los_Angeles",
            "isp": "Google LLC",
            "org": "Google Public DNS",
            "as": "AS15169 Google LLC",
            "mobile": false,
            "proxy": false,
            "hosting": true
        })),
        "1.1.1.1" => Some(json!({
            "country": "Australia",
            "countryCode": "AU",
            "region": "QLD",
            "regionName": "Queensland",
            "city": "South Brisbane",
            "zip": "4101",
            "lat": -27.4766,
            "lon": 153.0166,
            "timezone": "Australia/Brisbane",
            "isp": "Cloudflare, Inc",
            "org": "APNIC and Cloudflare DNS Resolver project",
            "as": "AS13335 Cloudflare, Inc.",
            "mobile": false,
            "proxy": false,
            "hosting": true
        })),
        _ => None,
    }
}

fn answer(host: &str, fields: &str) -> Value {
    let wanted: Vec<&str> = fields.split(',').collect();
    match geo_entry(host) {
        Some(Value::Object(entry)) => {
            let mut obj: Map<String, Value> = entry
                .into_iter()
                .filter(|(k, _)| wanted.contains(&k.as_str()))
                .collect();
            obj.insert("status".into(), json!("success"));
            obj.insert("query".into(), json!(host));
            Value::Object(obj)
        }
        _ => json!({"status": "fail", "message": "reserved range", "query": host}),
    }
}

impl Upstream for StubUpstream {
    fn get(&self, url: &str, fields: &str) -> Result<UpstreamResponse, LookupError> {
        let host = url.rsplit("/json/").next().unwrap_or_default().to_string();
        let n = self.record(StubCall {
            method: "GET",
            url: url.to_string(),
            fields: fields.to_string(),
            hosts: vec![host.clone()],
        });
        if let Some(limited) = self.rate_limited(n) {
            return Ok(limited);
        }
        match &self.mode {
            Mode::Fixed { status, body } => Ok(UpstreamResponse {
                status: *status,
                remaining: None,
                reset_secs: None,
                body: body.clone(),
            }),
            Mode::Geo => Ok(Self::ok(answer(&host, fields))),
        }
    }

    fn post_json(&self, url: &str, fields: &str, body: &str) -> Result<UpstreamResponse, LookupError> {
        let hosts: Vec<String> = serde_json::from_str(body).expect("batch body is a JSON array of strings");
        let n = self.record(StubCall {
            method: "POST",
            url: url.to_string(),
            fields: fields.to_string(),
            hosts: hosts.clone(),
        });
        if let Some(limited) = self.rate_limited(n) {
            return Ok(limited);
        }
        match &self.mode {
            Mode::Fixed { status, body } => Ok(UpstreamResponse {
                status: *status,
                remaining: None,
                reset_secs: None,
                body: body.clone(),
            }),
            Mode::Geo => {
                let mut items: Vec<Value> = hosts.iter().map(|h| answer(h, fields)).collect();
                if self.reverse {
                    items.reverse();
                }
                Ok(Self::ok(Value::Array(items)))
            }
        }
    }
}
