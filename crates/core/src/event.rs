//! Request events recorded by the event ledger.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Kind of request that produced an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Data query against a dataset version.
    Query,
    /// Dataset metadata request.
    Info,
    /// Static asset redirect.
    Asset,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Info => "info",
            Self::Asset => "asset",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fields describing one inbound request.
///
/// The fingerprint covers every field except `status`, `comment` and
/// `timing_ms`, which describe the outcome rather than the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFields {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub dataset_slug: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub query_string: String,
    #[serde(default)]
    pub referer: String,
    /// HTTP status of the outcome.
    pub status: u16,
    /// Error code or redirect target, when not a plain success.
    #[serde(default)]
    pub comment: String,
    #[serde(default, skip_serializing)]
    pub timing_ms: Option<f64>,
}

impl EventFields {
    /// Start a record for a request of `kind` against `slug`.
    pub fn new(kind: EventKind, slug: impl Into<String>) -> Self {
        Self {
            kind,
            asset: String::new(),
            dataset_slug: slug.into(),
            branch: String::new(),
            commit: String::new(),
            query_string: String::new(),
            referer: String::new(),
            status: 200,
            comment: String::new(),
            timing_ms: None,
        }
    }

    /// The request-identifying fields, in fingerprint order.
    pub fn identity(&self) -> [&str; 7] {
        [
            self.kind.as_str(),
            &self.asset,
            &self.dataset_slug,
            &self.branch,
            &self.commit,
            &self.query_string,
            &self.referer,
        ]
    }

    /// Whether the outcome was a success or a redirect.
    pub fn is_ok_outcome(&self) -> bool {
        matches!(self.status, 200 | 302)
    }
}

/// Deduplicated event with occurrence counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(flatten)]
    pub fields: EventFields,
    pub count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub earliest: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub latest: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_timing_ms: Option<f64>,
}

impl EventRecord {
    /// First occurrence.
    pub fn first(fields: EventFields, at: OffsetDateTime) -> Self {
        let average_timing_ms = fields.timing_ms;
        Self {
            fields,
            count: 1,
            earliest: at,
            latest: at,
            average_timing_ms,
        }
    }

    /// Fold a repeat occurrence into this record.
    pub fn repeat(&mut self, timing_ms: Option<f64>, at: OffsetDateTime) {
        if let Some(new) = timing_ms {
            // Earlier occurrences without a timing count as absent, not zero.
            self.average_timing_ms = Some(match self.average_timing_ms {
                Some(old) => (old * self.count as f64 + new) / (self.count + 1) as f64,
                None => new,
            });
        }
        self.count += 1;
        if at > self.latest {
            self.latest = at;
        }
    }

    /// Fold another record of the same request into this one. The outcome
    /// fields of `self` are kept.
    pub fn merge(&mut self, other: EventRecord) {
        self.average_timing_ms = match (self.average_timing_ms, other.average_timing_ms) {
            (Some(a), Some(b)) => Some(
                (a * self.count as f64 + b * other.count as f64)
                    / (self.count + other.count) as f64,
            ),
            (a, b) => a.or(b),
        };
        self.count += other.count;
        self.earliest = self.earliest.min(other.earliest);
        self.latest = self.latest.max(other.latest);
    }
}
