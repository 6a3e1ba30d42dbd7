//! The API's readiness document.
//!
//! Shape: `{"status": "ok", "dependencies": {"database": "ok", "cache": "down"}}`.
//! Some APIs name the map `checks` or `services`, or send several of them; a key
//! is looked up in `dependencies` first.
//! Dependency values may be strings, booleans or `{"status": ...}` objects.
//! While the API is still booting the document may be missing or garbled; that is
//! reported as "not ready yet", never as a hard error.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

const HEALTHY_WORDS: &[&str] = &["ok", "healthy", "up", "ready", "pass", "passing"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadinessDocument {
    #[serde(default)]
    pub status: Value,
    #[serde(default)]
    pub dependencies: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub checks: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub services: Option<BTreeMap<String, Value>>,
}

fn flag_word(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_lowercase()),
        Value::Bool(true) => Some("ok".to_string()),
        Value::Bool(false) => Some("down".to_string()),
        Value::Object(map) => map.get("status").and_then(flag_word),
        _ => None,
    }
}

pub fn flag_is_healthy(v: &Value) -> bool {
    flag_word(v)
        .map(|w| HEALTHY_WORDS.contains(&w.as_str()))
        .unwrap_or(false)
}

impl ReadinessDocument {
    /// The API is serving when it reports itself ok, or degraded by a dependency.
    pub fn api_serving(&self) -> Result<(), String> {
        match flag_word(&self.status) {
            Some(w) if HEALTHY_WORDS.contains(&w.as_str()) || w == "degraded" => Ok(()),
            Some(w) => Err(format!("api status={w}")),
            None => Err("readiness document has no status".to_string()),
        }
    }

    fn flag(&self, key: &str) -> Option<&Value> {
        [&self.dependencies, &self.checks, &self.services]
            .into_iter()
            .flatten()
            .find_map(|map| map.get(key))
    }

    pub fn dependency(&self, key: &str) -> Result<(), String> {
        match self.flag(key) {
            Some(v) if flag_is_healthy(v) => Ok(()),
            Some(v) => Err(format!(
                "{key}={}",
                flag_word(v).unwrap_or_else(|| v.to_string())
            )),
            None => Err(format!("readiness document does not report {key}")),
        }
    }
}

/// Fetch and parse the document. Every failure here means "not yet".
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<ReadinessDocument, String> {
    let resp = client.get(url).send().await.map_err(describe_request_error)?;
    let status = resp.status();
    // 503 usually still carries the per-dependency map
    if !status.is_success() && status != StatusCode::SERVICE_UNAVAILABLE {
        return Err(format!("HTTP {status}"));
    }
    let body = resp.text().await.map_err(describe_request_error)?;
    serde_json::from_str::<ReadinessDocument>(&body)
        .map_err(|e| format!("HTTP {status}, unreadable readiness document: {e}"))
}

pub fn describe_request_error(e: reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        "connection refused".to_string()
    } else {
        e.to_string()
    }
}
