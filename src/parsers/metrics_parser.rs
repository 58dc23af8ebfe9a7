use crate::error::IngestError;
use crate::events::{now, MetricDataPoint, MetricSummary, Timestamp};
use crate::parsers::fields::{
    json_kind, string_map, value_to_f64, FieldCandidates, RecordOutcome,
};
use crate::parsers::time::value_or_now;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const TIMESTAMP: FieldCandidates = FieldCandidates::new("timestamp", &["timestamp", "time"]);
const NAME: FieldCandidates = FieldCandidates::new("metric", &["metric", "name", "metric_name"]);
const SERIES_CONTAINER: FieldCandidates = FieldCandidates::new("metrics", &["metrics", "data"]);

/// Slack for z-scores that land on the threshold through float rounding
const Z_SCORE_EPSILON: f64 = 1e-9;

/// Recognized top-level layouts of a metrics blob
#[derive(Debug)]
enum MetricsShape<'a> {
    /// `[{"timestamp", "metric"|"name", "value", "unit"?, "tags"?}, ...]`
    PointList(&'a [Value]),
    /// `{"metrics": {"name": [{"timestamp", "value"}, ...] | scalar}}`
    NestedMap {
        series: &'a Map<String, Value>,
        default_timestamp: Option<&'a Value>,
        /// The series live at the top level next to a `timestamp` key
        inline: bool,
    },
}

impl<'a> MetricsShape<'a> {
    fn classify(data: &'a Value) -> Result<Self, IngestError> {
        match data {
            Value::Array(items) => Ok(MetricsShape::PointList(items)),
            Value::Object(object) => {
                let default_timestamp = TIMESTAMP.resolve(object);
                match SERIES_CONTAINER.resolve(object) {
                    Some(Value::Object(series)) => Ok(MetricsShape::NestedMap {
                        series,
                        default_timestamp,
                        inline: false,
                    }),
                    Some(other) => Err(IngestError::Parsing(format!(
                        "Unsupported metrics container: expected an object, found {}",
                        json_kind(other)
                    ))),
                    None => Ok(MetricsShape::NestedMap {
                        series: object,
                        default_timestamp,
                        inline: true,
                    }),
                }
            }
            other => Err(IngestError::Parsing(format!(
                "Unsupported metrics format: top-level {}",
                json_kind(other)
            ))),
        }
    }
}

/// Parser for time-series JSON with per-metric statistical summaries
///
/// A summary is flagged anomalous when either trigger fires:
/// - the latest value's z-score reaches `anomaly_threshold` standard deviations
///   and deviates from the mean by more than `min_relative_deviation` of its magnitude
/// - a supplied baseline differs from the latest value by more than
///   `change_threshold_percent`
#[derive(Debug, Clone)]
pub struct MetricsParser {
    anomaly_threshold: f64,
    change_threshold_percent: f64,
    min_relative_deviation: f64,
}

impl Default for MetricsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsParser {
    /// Create a parser with the default thresholds (2.0 sigma, 50% change, 10% noise floor)
    pub fn new() -> Self {
        Self::with_thresholds(2.0, 50.0, 0.1)
    }

    pub fn with_thresholds(
        anomaly_threshold: f64,
        change_threshold_percent: f64,
        min_relative_deviation: f64,
    ) -> Self {
        Self {
            anomaly_threshold,
            change_threshold_percent,
            min_relative_deviation,
        }
    }

    pub fn anomaly_threshold(&self) -> f64 {
        self.anomaly_threshold
    }

    /// Parse a metrics blob into data points
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Json` for invalid JSON and `IngestError::Parsing`
    /// for a top-level shape that is neither a point list nor a metrics map.
    pub fn parse(&self, content: &str) -> Result<Vec<MetricDataPoint>, IngestError> {
        let data: Value = serde_json::from_str(content)?;
        let shape = MetricsShape::classify(&data)?;
        debug!("Classified metrics blob as {}", shape_name(&shape));

        let points = match shape {
            MetricsShape::PointList(items) => Self::parse_point_list(items),
            MetricsShape::NestedMap {
                series,
                default_timestamp,
                inline,
            } => Self::parse_nested_map(series, default_timestamp, inline),
        };

        info!("Parsed {} metric data points", points.len());
        Ok(points)
    }

    fn parse_point_list(items: &[Value]) -> Vec<MetricDataPoint> {
        let mut points = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match Self::parse_point_item(item) {
                RecordOutcome::Parsed(point) => points.push(point),
                RecordOutcome::Skipped(reason) => {
                    warn!("Skipping metric item {}: {}", index, reason)
                }
            }
        }
        points
    }

    fn parse_point_item(item: &Value) -> RecordOutcome<MetricDataPoint> {
        let Value::Object(object) = item else {
            return RecordOutcome::skipped(format!("expected an object, found {}", json_kind(item)));
        };
        let Some(metric_name) = NAME.resolve_string(object) else {
            return RecordOutcome::skipped("missing metric name");
        };
        Self::point_from_object(metric_name, object, None)
    }

    fn point_from_object(
        metric_name: String,
        object: &Map<String, Value>,
        fallback_timestamp: Option<&Value>,
    ) -> RecordOutcome<MetricDataPoint> {
        let value = match object.get("value") {
            None | Some(Value::Null) => 0.0,
            Some(raw) => match value_to_f64(raw) {
                Some(v) => v,
                None => {
                    return RecordOutcome::skipped(format!(
                        "non-numeric value {} for {}",
                        raw, metric_name
                    ))
                }
            },
        };

        RecordOutcome::Parsed(MetricDataPoint {
            timestamp: value_or_now(TIMESTAMP.resolve(object).or(fallback_timestamp)),
            metric_name,
            value,
            unit: object.get("unit").and_then(Value::as_str).map(str::to_string),
            tags: string_map(object.get("tags")),
        })
    }

    fn parse_nested_map(
        series: &Map<String, Value>,
        default_timestamp: Option<&Value>,
        inline: bool,
    ) -> Vec<MetricDataPoint> {
        let mut points = Vec::new();

        for (metric_name, values) in series {
            if inline && TIMESTAMP.contains(metric_name) {
                continue;
            }

            let outcomes: Vec<RecordOutcome<MetricDataPoint>> = match values {
                Value::Array(items) => items
                    .iter()
                    .map(|item| Self::parse_series_item(metric_name, item))
                    .collect(),
                single => vec![Self::parse_single_value(metric_name, single, default_timestamp)],
            };

            for outcome in outcomes {
                match outcome {
                    RecordOutcome::Parsed(point) => points.push(point),
                    RecordOutcome::Skipped(reason) => {
                        warn!("Skipping value of metric {}: {}", metric_name, reason)
                    }
                }
            }
        }

        points
    }

    fn parse_series_item(metric_name: &str, item: &Value) -> RecordOutcome<MetricDataPoint> {
        match item {
            Value::Object(object) => Self::point_from_object(metric_name.to_string(), object, None),
            scalar => match value_to_f64(scalar) {
                Some(value) => RecordOutcome::Parsed(MetricDataPoint {
                    timestamp: now(),
                    metric_name: metric_name.to_string(),
                    value,
                    unit: None,
                    tags: BTreeMap::new(),
                }),
                None => RecordOutcome::skipped(format!("non-numeric value {}", scalar)),
            },
        }
    }

    fn parse_single_value(
        metric_name: &str,
        value: &Value,
        default_timestamp: Option<&Value>,
    ) -> RecordOutcome<MetricDataPoint> {
        match value {
            Value::Object(object) => {
                Self::point_from_object(metric_name.to_string(), object, default_timestamp)
            }
            scalar => match value_to_f64(scalar) {
                Some(v) => RecordOutcome::Parsed(MetricDataPoint {
                    timestamp: value_or_now(default_timestamp),
                    metric_name: metric_name.to_string(),
                    value: v,
                    unit: None,
                    tags: BTreeMap::new(),
                }),
                None => RecordOutcome::skipped(format!("non-numeric value {}", scalar)),
            },
        }
    }

    /// Group points by metric name and summarize each group
    ///
    /// # Arguments
    ///
    /// * `points` - Data points in any order
    /// * `previous_baseline` - Optional per-metric baseline for change detection
    pub fn create_summaries(
        &self,
        points: &[MetricDataPoint],
        previous_baseline: Option<&HashMap<String, f64>>,
    ) -> Vec<MetricSummary> {
        let mut grouped: BTreeMap<&str, Vec<&MetricDataPoint>> = BTreeMap::new();
        for point in points {
            grouped.entry(point.metric_name.as_str()).or_default().push(point);
        }

        grouped
            .into_iter()
            .filter_map(|(name, series)| {
                let baseline = previous_baseline.and_then(|b| b.get(name)).copied();
                self.summarize(name, &series, baseline)
            })
            .collect()
    }

    fn summarize(
        &self,
        metric_name: &str,
        series: &[&MetricDataPoint],
        baseline: Option<f64>,
    ) -> Option<MetricSummary> {
        let first = series.first()?;

        // Latest observation; later input wins on equal timestamps
        let latest = series
            .iter()
            .fold(*first, |best, p| if p.timestamp >= best.timestamp { *p } else { best });
        let current_value = latest.value;

        let start_time = series.iter().map(|p| p.timestamp).min()?;
        let end_time = series.iter().map(|p| p.timestamp).max()?;

        let count = series.len() as f64;
        let min_value = series.iter().map(|p| p.value).fold(f64::INFINITY, f64::min);
        let max_value = series.iter().map(|p| p.value).fold(f64::NEG_INFINITY, f64::max);
        let avg_value = series.iter().map(|p| p.value).sum::<f64>() / count;
        let variance = series
            .iter()
            .map(|p| (p.value - avg_value).powi(2))
            .sum::<f64>()
            / count;
        let std_dev = variance.sqrt();

        let mut anomaly_detected = self.z_score_anomaly(current_value, avg_value, std_dev);

        let change_percent = baseline
            .filter(|b| *b != 0.0)
            .map(|b| (current_value - b) / b.abs() * 100.0);
        if let Some(change) = change_percent {
            if change.abs() > self.change_threshold_percent {
                debug!(
                    "Metric {} changed {:.1}% against baseline",
                    metric_name, change
                );
                anomaly_detected = true;
            }
        }

        Some(MetricSummary {
            metric_name: metric_name.to_string(),
            start_time,
            end_time,
            min_value,
            max_value,
            avg_value,
            current_value,
            anomaly_detected,
            change_percent,
        })
    }

    /// Flat series (zero deviation) are never flagged by z-score
    fn z_score_anomaly(&self, current: f64, mean: f64, std_dev: f64) -> bool {
        if std_dev <= 0.0 || !std_dev.is_finite() {
            return false;
        }
        let deviation = (current - mean).abs();
        let z_score = deviation / std_dev;
        z_score + Z_SCORE_EPSILON >= self.anomaly_threshold
            && deviation > self.min_relative_deviation * mean.abs()
    }

    /// Points with `start <= timestamp <= end`
    pub fn filter_by_time_range(
        points: &[MetricDataPoint],
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<MetricDataPoint> {
        points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Distinct metric names, sorted
    pub fn metric_names(points: &[MetricDataPoint]) -> Vec<String> {
        points
            .iter()
            .map(|p| p.metric_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn shape_name(shape: &MetricsShape<'_>) -> &'static str {
    match shape {
        MetricsShape::PointList(_) => "point list",
        MetricsShape::NestedMap { .. } => "nested map",
    }
}
