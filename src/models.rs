use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenStats {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
}

/// One proxied request as recorded by the usage collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDetail {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tokens: TokenStats,
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSnapshot {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub details: Vec<RequestDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSnapshot {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub models: HashMap<String, ModelSnapshot>,
}

/// Point-in-time copy of recorded usage, keyed by provider then model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsSnapshot {
    pub total_requests: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_tokens: i64,
    pub apis: HashMap<String, ApiSnapshot>,
}

impl StatisticsSnapshot {
    /// Adds a detail under `provider`/`model`, keeping the summary counters in step.
    pub fn push_detail(&mut self, provider: &str, model: &str, detail: RequestDetail) {
        let tokens = detail.tokens.total_tokens;

        self.total_requests += 1;
        self.total_tokens += tokens;
        if detail.failed {
            self.failure_count += 1;
        } else {
            self.success_count += 1;
        }

        let api = self.apis.entry(provider.to_string()).or_default();
        api.total_requests += 1;
        api.total_tokens += tokens;

        let model = api.models.entry(model.to_string()).or_default();
        model.total_requests += 1;
        model.total_tokens += tokens;
        model.details.push(detail);
    }

    pub fn detail_count(&self) -> usize {
        self.apis
            .values()
            .flat_map(|api| api.models.values())
            .map(|m| m.details.len())
            .sum()
    }
}

/// Wrapped form produced by the proxy's usage export endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotExport {
    #[serde(default = "default_export_version")]
    pub version: u32,
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
    pub usage: StatisticsSnapshot,
}

fn default_export_version() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SnapshotDocument {
    Export(SnapshotExport),
    Bare(StatisticsSnapshot),
}

impl SnapshotDocument {
    pub fn into_snapshot(self) -> StatisticsSnapshot {
        match self {
            SnapshotDocument::Export(export) => export.usage,
            SnapshotDocument::Bare(snapshot) => snapshot,
        }
    }
}

/// Raw query parameters as received from the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub model: Option<String>,
}

impl MetricsQuery {
    /// Builds a query from a URL query string such as `from=...&model=gpt-4o`.
    /// Unknown keys are ignored, the last occurrence of a key wins.
    pub fn from_query_string(raw: &str) -> Self {
        let raw = raw.strip_prefix('?').unwrap_or(raw);
        let mut query = Self::default();
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "from" => query.from = value,
                "to" => query.to = value,
                "model" => query.model = value,
                _ => {}
            }
        }
        query
    }

    pub fn from_param(&self) -> Option<&str> {
        non_empty(&self.from)
    }

    pub fn to_param(&self) -> Option<&str> {
        non_empty(&self.to)
    }

    pub fn model_filter(&self) -> Option<&str> {
        non_empty(&self.model)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub tokens: i64,
    pub requests: i64,
}

impl Totals {
    pub fn add(&mut self, tokens: i64) {
        self.tokens += tokens;
        self.requests += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetric {
    pub model: String,
    pub tokens: i64,
    pub requests: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeseriesBucket {
    pub bucket_start: String,
    pub tokens: i64,
    pub requests: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub totals: Totals,
    pub by_model: Vec<ModelMetric>,
    pub timeseries: Vec<TimeseriesBucket>,
}
