//! Callback wire format
//!
//! The JSON body a publisher POSTs to a subscriber's callback URL, plus the
//! scope (`target`, optional `subtarget`) a change applies to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{SubcastError, SubcastResult};

/// The part of an actor's state a subscription (and a suspension) covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtarget: Option<String>,
}

impl Scope {
    pub fn new(target: impl Into<String>, subtarget: Option<&str>) -> Self {
        Self {
            target: target.into(),
            subtarget: subtarget.map(str::to_string),
        }
    }

    pub fn target(target: impl Into<String>) -> Self {
        Self { target: target.into(), subtarget: None }
    }

    /// Storage key; `/` cannot appear in a target so the key is unambiguous.
    pub fn storage_key(&self) -> String {
        match &self.subtarget {
            Some(sub) => format!("{}/{}", self.target, sub),
            None => self.target.clone(),
        }
    }

    /// URL the subscriber reads the current state of this scope from
    pub fn fetch_url(&self, actor_base_url: &str) -> String {
        format!("{}/{}", actor_base_url.trim_end_matches('/'), self.storage_key())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Whether a callback embeds the changed data or only a fetch-back URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    High,
    Low,
}

/// Ordinary diff or full-state resync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackType {
    Diff,
    Resync,
}

impl CallbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackType::Diff => "diff",
            CallbackType::Resync => "resync",
        }
    }
}

/// Callback body as sent over HTTP
///
/// Ordinary diffs carry no `type` field at all, so peers that never heard of
/// resync callbacks still parse every message a legacy peer would send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    /// Sending actor
    pub id: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtarget: Option<String>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub granularity: Granularity,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub callback_type: Option<CallbackType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "subscriptionid")]
    pub subscription_id: String,
}

impl CallbackEnvelope {
    /// High-granularity diff with embedded data
    pub fn diff(
        actor_id: &str,
        subscription_id: &str,
        scope: &Scope,
        sequence: u64,
        timestamp: DateTime<Utc>,
        data: Value,
    ) -> Self {
        Self {
            id: actor_id.to_string(),
            target: scope.target.clone(),
            subtarget: scope.subtarget.clone(),
            sequence,
            timestamp,
            granularity: Granularity::High,
            callback_type: None,
            data: Some(data),
            url: None,
            subscription_id: subscription_id.to_string(),
        }
    }

    /// Low-granularity diff: no data, the subscriber re-reads `url`
    pub fn fetch_back(
        actor_id: &str,
        subscription_id: &str,
        scope: &Scope,
        sequence: u64,
        timestamp: DateTime<Utc>,
        url: String,
    ) -> Self {
        Self {
            granularity: Granularity::Low,
            data: None,
            url: Some(url),
            ..Self::diff(actor_id, subscription_id, scope, sequence, timestamp, Value::Null)
        }
    }

    /// Resync callback pointing at the full state
    pub fn resync(
        actor_id: &str,
        subscription_id: &str,
        scope: &Scope,
        sequence: u64,
        timestamp: DateTime<Utc>,
        url: String,
    ) -> Self {
        Self {
            callback_type: Some(CallbackType::Resync),
            ..Self::fetch_back(actor_id, subscription_id, scope, sequence, timestamp, url)
        }
    }

    pub fn kind(&self) -> CallbackType {
        self.callback_type.unwrap_or(CallbackType::Diff)
    }

    pub fn scope(&self) -> Scope {
        Scope {
            target: self.target.clone(),
            subtarget: self.subtarget.clone(),
        }
    }

    /// Structural checks beyond what serde enforces
    pub fn validate(&self) -> SubcastResult<()> {
        if self.id.is_empty() || self.subscription_id.is_empty() || self.target.is_empty() {
            return Err(SubcastError::InvalidCallback(
                "id, target and subscriptionid are required".to_string(),
            ));
        }
        match self.granularity {
            // A resync may carry the full state inline instead of a URL
            Granularity::High if self.data.is_none() => Err(SubcastError::InvalidCallback(
                "high granularity callback without data".to_string(),
            )),
            Granularity::Low if self.url.is_none() => Err(SubcastError::InvalidCallback(
                "low granularity callback without url".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
