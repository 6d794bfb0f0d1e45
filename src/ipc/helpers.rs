use chrono::{DateTime, Utc};
use serde_json::json;

use crate::ipc::error::err;

pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "permission_denied",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn conflict(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        HandlerErr {
            code: "conflict",
            message: message.into(),
            details,
        }
    }

    pub fn db_query(e: impl std::fmt::Display) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }

    pub fn db_insert(e: impl std::fmt::Display, table: &str) -> Self {
        HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }

    pub fn db_update(e: impl std::fmt::Display, table: &str) -> Self {
        HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }

    pub fn db_tx(e: impl std::fmt::Display) -> Self {
        HandlerErr {
            code: "db_tx_failed",
            message: e.to_string(),
            details: None,
        }
    }

    pub fn db_commit(e: impl std::fmt::Display) -> Self {
        HandlerErr {
            code: "db_commit_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-empty string", key))),
    }
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn fmt_ts(t: DateTime<Utc>) -> String {
    t.format(TS_FORMAT).to_string()
}

/// Accepts RFC 3339 with any offset; everything is stored normalized to UTC.
pub fn parse_ts(raw: &str, key: &str) -> Result<DateTime<Utc>, HandlerErr> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| HandlerErr::bad_params(format!("{} must be an RFC 3339 timestamp", key)))
}

pub fn get_optional_ts(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    match get_optional_str(params, key)? {
        Some(raw) => parse_ts(&raw, key).map(Some),
        None => Ok(None),
    }
}
