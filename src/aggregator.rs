use crate::error::AppError;
use crate::models::{
    MetricsQuery, MetricsReport, ModelMetric, StatisticsSnapshot, TimeseriesBucket, Totals,
};
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Timelike, Utc};
use std::collections::HashMap;

pub const DEFAULT_WINDOW_HOURS: i64 = 24;

/// Receives every report right before it is returned to the caller.
pub trait ReportObserver: Send + Sync {
    fn observe(&self, report: &MetricsReport);
}

pub struct NoopObserver;

impl ReportObserver for NoopObserver {
    fn observe(&self, _report: &MetricsReport) {}
}

/// Writes the pretty JSON rendering of each report at debug level.
pub struct LogObserver;

impl ReportObserver for LogObserver {
    fn observe(&self, report: &MetricsReport) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        match serde_json::to_string_pretty(report) {
            Ok(json) => log::debug!("metrics report:\n{json}"),
            Err(e) => log::warn!("failed to render metrics report: {e}"),
        }
    }
}

/// Inclusive time bounds; `None` leaves that side open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn resolve(query: &MetricsQuery, now: DateTime<Utc>) -> Result<Self, AppError> {
        let from = query.from_param();
        let to = query.to_param();

        if from.is_none() && to.is_none() {
            return Ok(Self {
                from: Some(now - Duration::hours(DEFAULT_WINDOW_HOURS)),
                to: Some(now),
            });
        }

        Ok(Self {
            from: from.map(|raw| parse_bound(raw, "from")).transpose()?,
            to: to.map(|raw| parse_bound(raw, "to")).transpose()?,
        })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        if self.from.is_some_and(|from| ts < from) {
            return false;
        }
        if self.to.is_some_and(|to| ts > to) {
            return false;
        }
        true
    }
}

fn parse_bound(raw: &str, name: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| AppError::Validation(format!("invalid '{name}' timestamp format")))
}

/// Start of the calendar hour containing `ts`.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    let start: NaiveDateTime = ts
        .date_naive()
        .and_hms_opt(ts.hour(), 0, 0)
        .expect("hour of an existing timestamp should always be valid");
    start.and_utc()
}

pub fn format_bucket(bucket: DateTime<Utc>) -> String {
    bucket.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct MetricsAggregator {
    observer: Box<dyn ReportObserver>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::with_observer(Box::new(NoopObserver))
    }

    pub fn with_observer(observer: Box<dyn ReportObserver>) -> Self {
        Self { observer }
    }

    pub fn aggregate(
        &self,
        snapshot: &StatisticsSnapshot,
        query: &MetricsQuery,
    ) -> Result<MetricsReport, AppError> {
        self.aggregate_at(snapshot, query, Utc::now())
    }

    pub fn aggregate_at(
        &self,
        snapshot: &StatisticsSnapshot,
        query: &MetricsQuery,
        now: DateTime<Utc>,
    ) -> Result<MetricsReport, AppError> {
        let window = TimeWindow::resolve(query, now)?;
        let report = self.aggregate_window(snapshot, &window, query.model_filter());
        self.observer.observe(&report);
        Ok(report)
    }

    fn aggregate_window(
        &self,
        snapshot: &StatisticsSnapshot,
        window: &TimeWindow,
        model_filter: Option<&str>,
    ) -> MetricsReport {
        let mut totals = Totals::default();
        // Providers serving the same model name share one entry.
        let mut by_model: HashMap<&str, Totals> = HashMap::new();
        let mut by_bucket: HashMap<DateTime<Utc>, Totals> = HashMap::new();

        for api in snapshot.apis.values() {
            for (model_name, model) in &api.models {
                if model_filter.is_some_and(|wanted| wanted != model_name.as_str()) {
                    continue;
                }

                for detail in &model.details {
                    if !window.contains(detail.timestamp) {
                        continue;
                    }

                    let tokens = detail.tokens.total_tokens;
                    totals.add(tokens);
                    by_model.entry(model_name.as_str()).or_default().add(tokens);
                    by_bucket
                        .entry(hour_bucket(detail.timestamp))
                        .or_default()
                        .add(tokens);
                }
            }
        }

        let mut by_model: Vec<ModelMetric> = by_model
            .into_iter()
            .map(|(model, t)| ModelMetric {
                model: model.to_string(),
                tokens: t.tokens,
                requests: t.requests,
            })
            .collect();
        by_model.sort_by(|a, b| a.model.cmp(&b.model));

        let mut timeseries: Vec<TimeseriesBucket> = by_bucket
            .into_iter()
            .map(|(bucket, t)| TimeseriesBucket {
                bucket_start: format_bucket(bucket),
                tokens: t.tokens,
                requests: t.requests,
            })
            .collect();
        timeseries.sort_by(|a, b| a.bucket_start.cmp(&b.bucket_start));

        MetricsReport {
            totals,
            by_model,
            timeseries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RequestDetail, TokenStats};
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("valid test timestamp")
            .with_timezone(&Utc)
    }

    fn detail(raw_ts: &str, tokens: i64) -> RequestDetail {
        RequestDetail {
            timestamp: ts(raw_ts),
            source: String::new(),
            tokens: TokenStats {
                total_tokens: tokens,
                ..TokenStats::default()
            },
            failed: false,
        }
    }

    fn query(from: Option<&str>, to: Option<&str>, model: Option<&str>) -> MetricsQuery {
        MetricsQuery {
            from: from.map(str::to_string),
            to: to.map(str::to_string),
            model: model.map(str::to_string),
        }
    }

    fn scenario_snapshot() -> StatisticsSnapshot {
        let mut snap = StatisticsSnapshot::default();
        snap.push_detail("P1", "gpt", detail("2024-01-01T10:05:00Z", 100));
        snap.push_detail("P1", "gpt", detail("2024-01-01T10:50:00Z", 50));
        snap.push_detail("P1", "claude", detail("2024-01-01T11:10:00Z", 200));
        snap
    }

    fn assert_sums_match(report: &MetricsReport) {
        let model_tokens: i64 = report.by_model.iter().map(|m| m.tokens).sum();
        let model_requests: i64 = report.by_model.iter().map(|m| m.requests).sum();
        let bucket_tokens: i64 = report.timeseries.iter().map(|b| b.tokens).sum();
        let bucket_requests: i64 = report.timeseries.iter().map(|b| b.requests).sum();
        assert_eq!(model_tokens, report.totals.tokens);
        assert_eq!(model_requests, report.totals.requests);
        assert_eq!(bucket_tokens, report.totals.tokens);
        assert_eq!(bucket_requests, report.totals.requests);
    }

    #[test]
    fn full_day_window_produces_expected_report() {
        let report = MetricsAggregator::new()
            .aggregate(
                &scenario_snapshot(),
                &query(
                    Some("2024-01-01T00:00:00Z"),
                    Some("2024-01-01T23:59:59Z"),
                    None,
                ),
            )
            .expect("aggregate");

        assert_eq!(
            report.totals,
            Totals {
                tokens: 350,
                requests: 3
            }
        );
        assert_eq!(
            report.by_model,
            vec![
                ModelMetric {
                    model: "claude".into(),
                    tokens: 200,
                    requests: 1
                },
                ModelMetric {
                    model: "gpt".into(),
                    tokens: 150,
                    requests: 2
                },
            ]
        );
        assert_eq!(
            report.timeseries,
            vec![
                TimeseriesBucket {
                    bucket_start: "2024-01-01T10:00:00Z".into(),
                    tokens: 150,
                    requests: 2
                },
                TimeseriesBucket {
                    bucket_start: "2024-01-01T11:00:00Z".into(),
                    tokens: 200,
                    requests: 1
                },
            ]
        );
        assert_sums_match(&report);
    }

    #[test]
    fn bounds_are_inclusive() {
        let mut snap = StatisticsSnapshot::default();
        snap.push_detail("p", "m", detail("2024-01-01T09:59:59Z", 1));
        snap.push_detail("p", "m", detail("2024-01-01T10:00:00Z", 10));
        snap.push_detail("p", "m", detail("2024-01-01T12:00:00Z", 100));
        snap.push_detail("p", "m", detail("2024-01-01T12:00:01Z", 1000));

        let report = MetricsAggregator::new()
            .aggregate(
                &snap,
                &query(
                    Some("2024-01-01T10:00:00Z"),
                    Some("2024-01-01T12:00:00Z"),
                    None,
                ),
            )
            .expect("aggregate");

        assert_eq!(
            report.totals,
            Totals {
                tokens: 110,
                requests: 2
            }
        );
    }

    #[test]
    fn single_bound_leaves_other_side_open() {
        let mut snap = StatisticsSnapshot::default();
        snap.push_detail("p", "m", detail("2000-01-01T00:00:00Z", 1));
        snap.push_detail("p", "m", detail("2030-01-01T00:00:00Z", 2));

        let agg = MetricsAggregator::new();
        let only_from = agg
            .aggregate(&snap, &query(Some("2020-01-01T00:00:00Z"), None, None))
            .expect("aggregate from");
        assert_eq!(only_from.totals.tokens, 2);

        let only_to = agg
            .aggregate(&snap, &query(None, Some("2020-01-01T00:00:00Z"), None))
            .expect("aggregate to");
        assert_eq!(only_to.totals.tokens, 1);
    }

    #[test]
    fn default_window_is_trailing_day() {
        let now = Utc
            .with_ymd_and_hms(2024, 6, 1, 12, 30, 0)
            .single()
            .expect("valid now");
        let mut snap = StatisticsSnapshot::default();
        snap.push_detail("p", "m", detail("2024-05-31T12:30:00Z", 1));
        snap.push_detail("p", "m", detail("2024-05-31T12:29:59Z", 10));
        snap.push_detail("p", "m", detail("2024-06-01T12:30:00Z", 100));
        snap.push_detail("p", "m", detail("2024-06-01T12:30:01Z", 1000));

        let report = MetricsAggregator::new()
            .aggregate_at(&snap, &MetricsQuery::default(), now)
            .expect("aggregate");
        assert_eq!(report.totals.tokens, 101);

        let window = TimeWindow::resolve(&MetricsQuery::default(), now).expect("window");
        assert_eq!(window.from, Some(now - Duration::hours(24)));
        assert_eq!(window.to, Some(now));
    }

    #[test]
    fn default_window_uses_the_real_clock() {
        let mut snap = StatisticsSnapshot::default();
        let recent = Utc::now() - Duration::minutes(5);
        let stale = Utc::now() - Duration::hours(25);
        snap.push_detail(
            "p",
            "m",
            RequestDetail {
                timestamp: recent,
                ..detail("2024-01-01T00:00:00Z", 7)
            },
        );
        snap.push_detail(
            "p",
            "m",
            RequestDetail {
                timestamp: stale,
                ..detail("2024-01-01T00:00:00Z", 9)
            },
        );

        let report = MetricsAggregator::new()
            .aggregate(&snap, &MetricsQuery::default())
            .expect("aggregate");
        assert_eq!(
            report.totals,
            Totals {
                tokens: 7,
                requests: 1
            }
        );
    }

    #[test]
    fn unknown_model_yields_empty_report() {
        let report = MetricsAggregator::new()
            .aggregate(
                &scenario_snapshot(),
                &query(Some("2024-01-01T00:00:00Z"), None, Some("mistral")),
            )
            .expect("aggregate");
        assert_eq!(report, MetricsReport::default());
    }

    #[test]
    fn model_filter_is_exact_and_case_sensitive() {
        let agg = MetricsAggregator::new();
        let snap = scenario_snapshot();

        let gpt = agg
            .aggregate(&snap, &query(Some("2024-01-01T00:00:00Z"), None, Some("gpt")))
            .expect("aggregate");
        assert_eq!(gpt.by_model.len(), 1);
        assert_eq!(gpt.totals.tokens, 150);

        let upper = agg
            .aggregate(&snap, &query(Some("2024-01-01T00:00:00Z"), None, Some("GPT")))
            .expect("aggregate");
        assert_eq!(upper.totals.requests, 0);
    }

    #[test]
    fn same_model_from_different_providers_is_merged() {
        let mut snap = StatisticsSnapshot::default();
        snap.push_detail("openai", "gpt-4", detail("2024-01-01T10:00:00Z", 5));
        snap.push_detail("azure", "gpt-4", detail("2024-01-01T10:30:00Z", 6));

        let report = MetricsAggregator::new()
            .aggregate(&snap, &query(Some("2024-01-01T00:00:00Z"), None, None))
            .expect("aggregate");
        assert_eq!(
            report.by_model,
            vec![ModelMetric {
                model: "gpt-4".into(),
                tokens: 11,
                requests: 2
            }]
        );
        assert_eq!(report.timeseries.len(), 1);
    }

    #[test]
    fn details_within_an_hour_share_a_bucket() {
        assert_eq!(
            hour_bucket(ts("2024-01-01T10:15:00Z")),
            hour_bucket(ts("2024-01-01T10:45:30.250Z"))
        );
        assert_eq!(
            format_bucket(hour_bucket(ts("2024-01-01T10:45:30.250Z"))),
            "2024-01-01T10:00:00Z"
        );
        assert_eq!(
            format_bucket(hour_bucket(ts("2024-01-01T11:00:00Z"))),
            "2024-01-01T11:00:00Z"
        );
    }

    #[test]
    fn offset_bounds_compare_by_instant() {
        let mut snap = StatisticsSnapshot::default();
        snap.push_detail("p", "m", detail("2024-01-01T08:00:00Z", 3));

        let report = MetricsAggregator::new()
            .aggregate(
                &snap,
                &query(
                    Some("2024-01-01T10:00:00+02:00"),
                    Some("2024-01-01T10:00:00+02:00"),
                    None,
                ),
            )
            .expect("aggregate");
        assert_eq!(report.totals.requests, 1);
        assert_eq!(report.timeseries[0].bucket_start, "2024-01-01T08:00:00Z");
    }

    #[test]
    fn outputs_are_sorted_and_unique() {
        let mut snap = StatisticsSnapshot::default();
        for (provider, model, at) in [
            ("a", "zeta", "2024-01-03T05:00:00Z"),
            ("b", "alpha", "2024-01-01T23:10:00Z"),
            ("c", "Beta", "2024-01-02T00:10:00Z"),
            ("a", "alpha", "2024-01-01T23:50:00Z"),
            ("b", "mid", "2024-01-02T09:00:00Z"),
        ] {
            snap.push_detail(provider, model, detail(at, 1));
        }

        let report = MetricsAggregator::new()
            .aggregate(&snap, &query(Some("2024-01-01T00:00:00Z"), None, None))
            .expect("aggregate");

        let models: Vec<&str> = report.by_model.iter().map(|m| m.model.as_str()).collect();
        assert_eq!(models, vec!["Beta", "alpha", "mid", "zeta"]);
        assert!(report
            .timeseries
            .windows(2)
            .all(|w| w[0].bucket_start < w[1].bucket_start));
        assert_eq!(report.timeseries.len(), 4);
        assert_sums_match(&report);
    }

    #[test]
    fn malformed_bounds_are_rejected() {
        let agg = MetricsAggregator::new();
        let snap = scenario_snapshot();

        let err = agg
            .aggregate(&snap, &query(Some("not-a-date"), None, None))
            .expect_err("expected validation error");
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(err.to_string(), "invalid 'from' timestamp format");

        let err = agg
            .aggregate(
                &snap,
                &query(Some("2024-01-01T00:00:00Z"), Some("2024-01-01"), None),
            )
            .expect_err("expected validation error");
        assert_eq!(err.to_string(), "invalid 'to' timestamp format");
    }

    struct Capture(Arc<Mutex<Vec<MetricsReport>>>);

    impl ReportObserver for Capture {
        fn observe(&self, report: &MetricsReport) {
            self.0.lock().expect("capture lock").push(report.clone());
        }
    }

    #[test]
    fn observer_sees_the_returned_report_only_on_success() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let agg = MetricsAggregator::with_observer(Box::new(Capture(seen.clone())));

        let report = agg
            .aggregate(
                &scenario_snapshot(),
                &query(Some("2024-01-01T00:00:00Z"), None, None),
            )
            .expect("aggregate");
        let _ = agg.aggregate(&scenario_snapshot(), &query(Some("bad"), None, None));

        let seen = seen.lock().expect("capture lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], report);
    }
}
