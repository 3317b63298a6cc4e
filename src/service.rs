use crate::aggregator::{MetricsAggregator, TimeWindow};
use crate::error::AppError;
use crate::models::{MetricsQuery, MetricsReport};
use crate::source::SnapshotSource;
use chrono::Utc;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsResponse {
    pub status: u16,
    pub body: Value,
}

impl MetricsResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

pub struct MetricsService<S> {
    source: S,
    aggregator: MetricsAggregator,
}

impl<S: SnapshotSource> MetricsService<S> {
    pub fn new(source: S, aggregator: MetricsAggregator) -> Self {
        Self { source, aggregator }
    }

    pub fn metrics(&self, query: &MetricsQuery) -> Result<MetricsReport, AppError> {
        // Reject bad bounds before paying for a snapshot.
        TimeWindow::resolve(query, Utc::now())?;
        let snapshot = self.source.snapshot()?;
        self.aggregator.aggregate(&snapshot, query)
    }

    pub fn respond(&self, query: &MetricsQuery) -> MetricsResponse {
        match self.metrics(query) {
            Ok(report) => match serde_json::to_value(&report) {
                Ok(body) => MetricsResponse { status: 200, body },
                Err(e) => error_response(&AppError::Json(e)),
            },
            Err(e) => {
                if e.status_code() >= 500 {
                    log::error!("metrics request failed: {e}");
                } else {
                    log::debug!("rejected metrics query {query:?}: {e}");
                }
                error_response(&e)
            }
        }
    }
}

fn error_response(err: &AppError) -> MetricsResponse {
    MetricsResponse {
        status: err.status_code(),
        body: json!({ "error": err.to_string() }),
    }
}
