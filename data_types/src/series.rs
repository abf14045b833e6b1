use serde::{Deserialize, Serialize};

use crate::Labels;

/// A float sample at a millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    /// The sampled value.
    pub value: f64,
}

/// The value of a histogram sample, in its integer (counter) or float
/// (gauge-style) variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HistogramValue {
    /// Integer bucket counts, delta-encoded.
    Int {
        /// Total number of observations.
        count: u64,
        /// Sum of all observed values.
        sum: f64,
        /// Number of observations in the zero bucket.
        zero_count: u64,
        /// Bucket schema (resolution exponent).
        schema: i32,
        /// Delta-encoded positive bucket counts.
        positive_deltas: Vec<i64>,
        /// Delta-encoded negative bucket counts.
        negative_deltas: Vec<i64>,
    },
    /// Absolute float bucket counts.
    Float {
        /// Total number of observations.
        count: f64,
        /// Sum of all observed values.
        sum: f64,
        /// Number of observations in the zero bucket.
        zero_count: f64,
        /// Bucket schema (resolution exponent).
        schema: i32,
        /// Absolute positive bucket counts.
        positive_counts: Vec<f64>,
        /// Absolute negative bucket counts.
        negative_counts: Vec<f64>,
    },
}

/// A histogram sample at a millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSample {
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    /// The histogram value.
    pub value: HistogramValue,
}

/// An exemplar attached to a series.
#[derive(Debug, Clone, PartialEq)]
pub struct Exemplar {
    /// Labels identifying the exemplar (e.g. trace id).
    pub labels: Labels,
    /// The exemplar value.
    pub value: f64,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
}

/// One time series in a write request: a label set plus ordered samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    /// The series labels, sorted by name.
    pub labels: Labels,
    /// Float samples, ordered by timestamp.
    pub samples: Vec<Sample>,
    /// Histogram samples, ordered by timestamp.
    pub histograms: Vec<HistogramSample>,
    /// Exemplars attached to this series.
    pub exemplars: Vec<Exemplar>,
}

/// The origin of a write request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteSource {
    /// Pushed through the external API.
    #[default]
    Api,
    /// Produced by the ruler evaluating recording rules.
    Rule,
}

/// The type of a metric, as carried in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Unknown,
}

/// Metadata describing a metric family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMetadata {
    /// The metric family name.
    pub metric_family_name: String,
    /// The metric type.
    pub metric_type: MetricType,
    /// Help text.
    pub help: String,
    /// Unit, if known.
    pub unit: String,
}

/// A validated push payload: series plus metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteRequest {
    /// The series to write.
    pub timeseries: Vec<TimeSeries>,
    /// Metric family metadata.
    pub metadata: Vec<MetricMetadata>,
    /// Where the request came from.
    pub source: WriteSource,
}

impl WriteRequest {
    /// Total number of float samples across all series.
    pub fn sample_count(&self) -> usize {
        self.timeseries.iter().map(|ts| ts.samples.len()).sum()
    }

    /// Total number of histogram samples across all series.
    pub fn histogram_count(&self) -> usize {
        self.timeseries.iter().map(|ts| ts.histograms.len()).sum()
    }

    /// Total number of exemplars across all series.
    pub fn exemplar_count(&self) -> usize {
        self.timeseries.iter().map(|ts| ts.exemplars.len()).sum()
    }

    /// Whether the request carries neither series nor metadata.
    pub fn is_empty(&self) -> bool {
        self.timeseries.is_empty() && self.metadata.is_empty()
    }

    /// A cheap estimate of the request's wire size, used for inflight
    /// byte accounting.
    pub fn approx_size(&self) -> usize {
        let series_bytes: usize = self
            .timeseries
            .iter()
            .map(|ts| {
                let labels: usize = ts
                    .labels
                    .iter()
                    .map(|l| l.name.len() + l.value.len() + 2)
                    .sum();
                let histograms: usize = ts
                    .histograms
                    .iter()
                    .map(|h| {
                        32 + match &h.value {
                            HistogramValue::Int {
                                positive_deltas,
                                negative_deltas,
                                ..
                            } => 8 * (positive_deltas.len() + negative_deltas.len()),
                            HistogramValue::Float {
                                positive_counts,
                                negative_counts,
                                ..
                            } => 8 * (positive_counts.len() + negative_counts.len()),
                        }
                    })
                    .sum::<usize>();
                let exemplars: usize = ts
                    .exemplars
                    .iter()
                    .map(|e| {
                        16 + e
                            .labels
                            .iter()
                            .map(|l| l.name.len() + l.value.len() + 2)
                            .sum::<usize>()
                    })
                    .sum();
                labels + 16 * ts.samples.len() + histograms + exemplars
            })
            .sum();
        let metadata_bytes: usize = self
            .metadata
            .iter()
            .map(|m| m.metric_family_name.len() + m.help.len() + m.unit.len() + 4)
            .sum();
        series_bytes + metadata_bytes
    }

    /// The earliest float sample timestamp in the request, if any.
    pub fn min_sample_timestamp(&self) -> Option<i64> {
        self.timeseries
            .iter()
            .flat_map(|ts| ts.samples.iter().map(|s| s.timestamp))
            .min()
    }
}
