//! Stratum JSON-RPC line protocol types
//!
//! One JSON object per line. Requests carry `{id, method, params}`;
//! responses `{id, result, error}` with the stratum error triple
//! `[code, message, data]`; server pushes use a JSON null id.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Error codes miners understand
pub mod error_code {
    pub const UNKNOWN: i64 = 20;
    pub const JOB_NOT_FOUND: i64 = 21;
    pub const DUPLICATE_SHARE: i64 = 22;
    pub const LOW_DIFFICULTY: i64 = 23;
    pub const UNAUTHORIZED: i64 = 24;
    pub const NOT_SUBSCRIBED: i64 = 25;
}

/// A client request or a server notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A server response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

impl StratumResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn err(id: Value, code: i64, message: &str) -> Self {
        Self {
            id,
            result: Value::Null,
            error: json!([code, message, Value::Null]),
        }
    }
}

/// Serialize a server-push notification line (`id` is JSON null)
pub fn notification(method: &str, params: Value) -> String {
    let message = StratumRequest {
        id: None,
        method: method.to_string(),
        params,
    };
    serde_json::to_string(&message).expect("static shape")
}

/// Serialize a response line
pub fn response_line(response: &StratumResponse) -> String {
    serde_json::to_string(response).expect("static shape")
}

/// Parsed miner username: `address[+diff][+s<rate>][.worker]`
#[derive(Debug, Clone, PartialEq)]
pub struct MinerLogin {
    pub address: String,
    pub worker: Option<String>,
    pub starting_difficulty: Option<f64>,
    pub share_rate_secs: Option<f64>,
}

impl MinerLogin {
    pub fn parse(username: &str) -> Self {
        let (base, worker) = match username.split_once('.') {
            Some((base, worker)) if !worker.is_empty() => (base, Some(worker.to_string())),
            _ => (username, None),
        };
        let mut segments = base.split('+');
        let address = segments.next().unwrap_or_default().to_string();
        let mut starting_difficulty = None;
        let mut share_rate_secs = None;
        for segment in segments {
            if let Some(rate) = segment.strip_prefix('s') {
                if let Ok(secs) = rate.parse::<f64>() {
                    if secs > 0.0 {
                        share_rate_secs = Some(secs);
                    }
                }
            } else if let Ok(diff) = segment.parse::<f64>() {
                if diff > 0.0 {
                    starting_difficulty = Some(diff);
                }
            }
        }
        Self {
            address,
            worker,
            starting_difficulty,
            share_rate_secs,
        }
    }

    /// Full worker identity for logs and reporting
    pub fn worker_name(&self) -> String {
        match &self.worker {
            Some(worker) => format!("{}.{}", self.address, worker),
            None => self.address.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_address() {
        let login = MinerLogin::parse("LaBcD123");
        assert_eq!(login.address, "LaBcD123");
        assert!(login.worker.is_none());
        assert!(login.starting_difficulty.is_none());
    }

    #[test]
    fn address_with_difficulty_and_rate_and_worker() {
        let login = MinerLogin::parse("LaBcD123+512+s5.rig1");
        assert_eq!(login.address, "LaBcD123");
        assert_eq!(login.starting_difficulty, Some(512.0));
        assert_eq!(login.share_rate_secs, Some(5.0));
        assert_eq!(login.worker.as_deref(), Some("rig1"));
        assert_eq!(login.worker_name(), "LaBcD123.rig1");
    }

    #[test]
    fn bad_suffixes_ignored() {
        let login = MinerLogin::parse("Addr+notanumber+s-3");
        assert_eq!(login.address, "Addr");
        assert!(login.starting_difficulty.is_none());
        assert!(login.share_rate_secs.is_none());
    }

    #[test]
    fn notification_has_null_id() {
        let line = notification("mining.set_difficulty", json!([8.0]));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert!(value["id"].is_null());
        assert_eq!(value["method"], "mining.set_difficulty");
    }

    #[test]
    fn error_triple_shape() {
        let response = StratumResponse::err(json!(5), error_code::JOB_NOT_FOUND, "stale");
        let line = response_line(&response);
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["error"][0], 21);
        assert_eq!(value["error"][1], "stale");
    }
}
