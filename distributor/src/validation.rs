use std::collections::HashSet;

use data_types::{TimeSeries, WriteRequest};
use thiserror::Error;

use crate::Limits;

/// Exemplars may be at most this much older than the earliest sample in
/// their request.
pub const EXEMPLAR_MAX_AGE_MS: i64 = 5 * 60 * 1000;

/// Per-series validation failures.
///
/// Only the first failure of a request is reported back to the client;
/// the offending series are dropped while the valid remainder proceeds.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// The series has no `__name__` label (or no labels at all).
    #[error("received series with no metric name")]
    MissingMetricName,

    /// The series has more labels than allowed.
    #[error("received series with too many labels (actual: {count}, limit: {limit}) for series {series}")]
    MaxLabelNamesPerSeries {
        /// Observed label count.
        count: usize,
        /// Configured cap.
        limit: usize,
        /// Rendered series labels.
        series: String,
    },

    /// A label name exceeds the length cap.
    #[error("received a series whose label name is too long (limit: {limit}): {name}")]
    LabelNameTooLong {
        /// The offending name.
        name: String,
        /// Configured cap.
        limit: usize,
    },

    /// A label value exceeds the length cap.
    #[error("received a series whose label value is too long (limit: {limit}) for label {name}")]
    LabelValueTooLong {
        /// The label whose value is too long.
        name: String,
        /// Configured cap.
        limit: usize,
    },

    /// A sample timestamp is beyond the creation grace period.
    #[error("received a sample whose timestamp is too far in the future (timestamp: {timestamp}, metric: {metric})")]
    SampleTooFarInFuture {
        /// The offending timestamp, ms.
        timestamp: i64,
        /// The metric name.
        metric: String,
    },

    /// A sample timestamp is older than the backward bound.
    #[error("received a sample whose timestamp is too old (timestamp: {timestamp}, metric: {metric})")]
    SampleTooOld {
        /// The offending timestamp, ms.
        timestamp: i64,
        /// The metric name.
        metric: String,
    },

    /// An exemplar is too old relative to the request's earliest sample.
    #[error("received an exemplar more than {EXEMPLAR_MAX_AGE_MS}ms older than the request's earliest sample (timestamp: {timestamp})")]
    ExemplarTooOld {
        /// The offending timestamp, ms.
        timestamp: i64,
    },

    /// The tenant exceeded its distinct-HA-cluster budget.
    #[error("the write request exceeds the allowed number of HA clusters (limit: {limit})")]
    TooManyHaClusters {
        /// Configured cap.
        limit: usize,
    },
}

impl ValidationError {
    /// The short reason attribute used on discard counters.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingMetricName => "missing_metric_name",
            Self::MaxLabelNamesPerSeries { .. } => "max_label_names_per_series",
            Self::LabelNameTooLong { .. } => "label_name_too_long",
            Self::LabelValueTooLong { .. } => "label_value_too_long",
            Self::SampleTooFarInFuture { .. } => "sample_too_far_in_future",
            Self::SampleTooOld { .. } => "sample_too_old",
            Self::ExemplarTooOld { .. } => "exemplar_too_old",
            Self::TooManyHaClusters { .. } => "too_many_ha_clusters",
        }
    }
}

/// The outcome of validating a request: the surviving series plus drop
/// accounting.
#[derive(Debug)]
pub struct ValidatedWrite {
    /// The request with invalid series removed.
    pub request: WriteRequest,
    /// The first validation failure, preserved for the 202 response.
    pub first_error: Option<ValidationError>,
    /// Float samples dropped with their series.
    pub dropped_samples: usize,
    /// Histogram samples dropped, including float-timestamp conflicts.
    pub dropped_histograms: usize,
    /// Exemplars dropped.
    pub dropped_exemplars: usize,
}

/// Validate every series of `request` against `limits`.
///
/// Invalid series are dropped while valid ones pass through; the first
/// error is preserved. Histogram samples sharing a timestamp with a float
/// sample of the same series are dropped (the float wins).
pub fn validate_request(limits: &Limits, now_ms: i64, request: WriteRequest) -> ValidatedWrite {
    let min_sample_ts = request.min_sample_timestamp();

    let mut out = ValidatedWrite {
        request: WriteRequest {
            timeseries: Vec::with_capacity(request.timeseries.len()),
            metadata: request.metadata,
            source: request.source,
        },
        first_error: None,
        dropped_samples: 0,
        dropped_histograms: 0,
        dropped_exemplars: 0,
    };

    for series in request.timeseries {
        match validate_series(limits, now_ms, min_sample_ts, series) {
            Ok(ValidatedSeries {
                series,
                dropped_histograms,
                dropped_exemplars,
            }) => {
                out.dropped_histograms += dropped_histograms;
                out.dropped_exemplars += dropped_exemplars;
                if let Some(series) = series {
                    out.request.timeseries.push(series);
                }
            }
            Err((e, series)) => {
                out.dropped_samples += series.samples.len();
                out.dropped_histograms += series.histograms.len();
                out.dropped_exemplars += series.exemplars.len();
                if out.first_error.is_none() {
                    out.first_error = Some(e);
                }
            }
        }
    }

    out
}

struct ValidatedSeries {
    series: Option<TimeSeries>,
    dropped_histograms: usize,
    dropped_exemplars: usize,
}

fn validate_series(
    limits: &Limits,
    now_ms: i64,
    min_sample_ts: Option<i64>,
    mut series: TimeSeries,
) -> Result<ValidatedSeries, (ValidationError, TimeSeries)> {
    if let Err(e) = validate_labels(limits, &series) {
        return Err((e, series));
    }

    let metric = series
        .labels
        .metric_name()
        .unwrap_or_default()
        .to_owned();

    let timestamps: Vec<i64> = series
        .samples
        .iter()
        .map(|s| s.timestamp)
        .chain(series.histograms.iter().map(|h| h.timestamp))
        .collect();
    for timestamp in timestamps {
        if timestamp > now_ms + limits.creation_grace_period_ms {
            return Err((
                ValidationError::SampleTooFarInFuture {
                    timestamp,
                    metric: metric.clone(),
                },
                series,
            ));
        }
        if limits.max_sample_age_ms > 0 && timestamp < now_ms - limits.max_sample_age_ms {
            return Err((
                ValidationError::SampleTooOld {
                    timestamp,
                    metric: metric.clone(),
                },
                series,
            ));
        }
    }

    // Where a float and a histogram carry the same timestamp, the float
    // wins and the histogram is dropped.
    let float_timestamps: HashSet<i64> = series.samples.iter().map(|s| s.timestamp).collect();
    let before = series.histograms.len();
    series
        .histograms
        .retain(|h| !float_timestamps.contains(&h.timestamp));
    let dropped_histograms = before - series.histograms.len();

    let mut dropped_exemplars = 0;
    if let Some(min_ts) = min_sample_ts {
        let before = series.exemplars.len();
        series
            .exemplars
            .retain(|e| e.timestamp >= min_ts - EXEMPLAR_MAX_AGE_MS);
        dropped_exemplars = before - series.exemplars.len();
    }

    // A series left with nothing to write is omitted entirely.
    let series = if series.samples.is_empty()
        && series.histograms.is_empty()
        && series.exemplars.is_empty()
    {
        None
    } else {
        Some(series)
    };

    Ok(ValidatedSeries {
        series,
        dropped_histograms,
        dropped_exemplars,
    })
}

fn validate_labels(limits: &Limits, series: &TimeSeries) -> Result<(), ValidationError> {
    if series.labels.metric_name().is_none() {
        return Err(ValidationError::MissingMetricName);
    }
    if series.labels.len() > limits.max_label_names_per_series {
        return Err(ValidationError::MaxLabelNamesPerSeries {
            count: series.labels.len(),
            limit: limits.max_label_names_per_series,
            series: series.labels.to_string(),
        });
    }
    for label in series.labels.iter() {
        if label.name.len() > limits.max_label_name_length {
            return Err(ValidationError::LabelNameTooLong {
                name: label.name.clone(),
                limit: limits.max_label_name_length,
            });
        }
        if label.value.len() > limits.max_label_value_length {
            return Err(ValidationError::LabelValueTooLong {
                name: label.name.clone(),
                limit: limits.max_label_value_length,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::{
        Exemplar, HistogramSample, HistogramValue, Labels, Sample,
    };

    const NOW_MS: i64 = 1_700_000_000_000;

    fn histogram(timestamp: i64) -> HistogramSample {
        HistogramSample {
            timestamp,
            value: HistogramValue::Int {
                count: 1,
                sum: 1.,
                zero_count: 0,
                schema: 0,
                positive_deltas: vec![1],
                negative_deltas: vec![],
            },
        }
    }

    fn series(name: &str, sample_ts: &[i64]) -> TimeSeries {
        TimeSeries {
            labels: Labels::from_pairs([("__name__", name)]).unwrap(),
            samples: sample_ts
                .iter()
                .map(|ts| Sample {
                    timestamp: *ts,
                    value: 1.,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_metric_name_rejected() {
        let mut s = series("up", &[NOW_MS]);
        s.labels = Labels::from_pairs([("job", "api")]).unwrap();
        let request = WriteRequest {
            timeseries: vec![s, series("ok", &[NOW_MS])],
            ..Default::default()
        };

        let out = validate_request(&Limits::default(), NOW_MS, request);
        assert_matches!(out.first_error, Some(ValidationError::MissingMetricName));
        assert_eq!(out.request.timeseries.len(), 1);
        assert_eq!(out.dropped_samples, 1);
    }

    #[test]
    fn test_first_error_is_preserved() {
        let mut bad1 = series("a", &[NOW_MS]);
        bad1.labels = Labels::default();
        let bad2 = series("b", &[NOW_MS + 60 * 60 * 1000]);

        let out = validate_request(
            &Limits::default(),
            NOW_MS,
            WriteRequest {
                timeseries: vec![bad1, bad2],
                ..Default::default()
            },
        );
        assert_matches!(out.first_error, Some(ValidationError::MissingMetricName));
        assert!(out.request.timeseries.is_empty());
    }

    #[test]
    fn test_sample_time_bounds() {
        let limits = Limits {
            max_sample_age_ms: 60 * 60 * 1000,
            ..Default::default()
        };

        let too_new = series("a", &[NOW_MS + 11 * 60 * 1000]);
        let too_old = series("b", &[NOW_MS - 2 * 60 * 60 * 1000]);
        let fine = series("c", &[NOW_MS]);

        let out = validate_request(
            &limits,
            NOW_MS,
            WriteRequest {
                timeseries: vec![too_new, too_old, fine],
                ..Default::default()
            },
        );
        assert_matches!(
            out.first_error,
            Some(ValidationError::SampleTooFarInFuture { .. })
        );
        assert_eq!(out.request.timeseries.len(), 1);
    }

    #[test]
    fn test_histogram_loses_timestamp_conflict() {
        let t = NOW_MS - 60 * 60 * 1000;
        let limits = Limits::default();
        let step = 10 * 60 * 1000;

        let mut s = series("m", &[t, t + step, t + 2 * step]);
        s.histograms = vec![
            histogram(t + 2 * step),
            histogram(t + 3 * step),
            histogram(t + 4 * step),
            histogram(t + 5 * step),
        ];

        let out = validate_request(
            &limits,
            NOW_MS,
            WriteRequest {
                timeseries: vec![s],
                ..Default::default()
            },
        );
        assert_eq!(out.first_error, None);
        let got = &out.request.timeseries[0];
        assert_eq!(got.samples.len(), 3);
        // The t+2*step histogram collided with a float and was dropped;
        // every later histogram survived.
        assert_eq!(got.histograms.len(), 3);
        assert_eq!(out.dropped_histograms, 1);
        assert_eq!(got.histograms[0].timestamp, t + 3 * step);
    }

    #[test]
    fn test_exemplar_age() {
        let t = NOW_MS - 60 * 60 * 1000;
        let mut s = series("m", &[t]);
        s.exemplars = vec![
            Exemplar {
                labels: Labels::from_pairs([("trace_id", "abc")]).unwrap(),
                value: 1.,
                timestamp: t - EXEMPLAR_MAX_AGE_MS - 1,
            },
            Exemplar {
                labels: Labels::from_pairs([("trace_id", "def")]).unwrap(),
                value: 1.,
                timestamp: t,
            },
        ];

        let out = validate_request(
            &Limits::default(),
            NOW_MS,
            WriteRequest {
                timeseries: vec![s],
                ..Default::default()
            },
        );
        assert_eq!(out.dropped_exemplars, 1);
        assert_eq!(out.request.timeseries[0].exemplars.len(), 1);
    }

    #[test]
    fn test_label_limits() {
        let limits = Limits {
            max_label_names_per_series: 2,
            ..Default::default()
        };
        let mut s = series("m", &[NOW_MS]);
        s.labels = Labels::from_pairs([("__name__", "m"), ("a", "1"), ("b", "2")]).unwrap();

        let out = validate_request(
            &limits,
            NOW_MS,
            WriteRequest {
                timeseries: vec![s],
                ..Default::default()
            },
        );
        assert_matches!(
            out.first_error,
            Some(ValidationError::MaxLabelNamesPerSeries { count: 3, limit: 2, .. })
        );
    }
}
