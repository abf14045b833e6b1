//! The ingester write/query API consumed by the distributor, plus an
//! in-process mock used by tests.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use data_types::{Labels, MetricMetadata, TimeSeries, WriteRequest};
use ring::InstanceDesc;
use thiserror::Error;

/// How a matcher compares a label value.
///
/// Regex matchers belong to the query engine, which is an external
/// collaborator; the ingester interface only needs exact matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Label must equal the value.
    Equal,
    /// Label must not equal the value.
    NotEqual,
}

/// A single label matcher of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    /// The comparison to apply.
    pub match_type: MatchType,
    /// The label name.
    pub name: String,
    /// The value to compare against.
    pub value: String,
}

impl LabelMatcher {
    /// An equality matcher.
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Equal,
            name: name.into(),
            value: value.into(),
        }
    }

    /// An inequality matcher.
    pub fn neq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::NotEqual,
            name: name.into(),
            value: value.into(),
        }
    }

    /// Whether `labels` satisfies this matcher; an absent label is the
    /// empty value.
    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.name).unwrap_or_default();
        match self.match_type {
            MatchType::Equal => value == self.value,
            MatchType::NotEqual => value != self.value,
        }
    }
}

/// A range read of series samples.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStreamRequest {
    /// Range start, unix ms, inclusive.
    pub start: i64,
    /// Range end, unix ms, inclusive.
    pub end: i64,
    /// Matchers every returned series must satisfy.
    pub matchers: Vec<LabelMatcher>,
}

/// The series matching a [`QueryStreamRequest`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStreamResponse {
    /// Matching series with samples clamped to the range.
    pub timeseries: Vec<TimeSeries>,
}

/// Ingestion statistics of one tenant on one ingester.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UserStatsResponse {
    /// Smoothed samples/sec.
    pub ingestion_rate: f64,
    /// In-memory series held.
    pub num_series: u64,
    /// Samples/sec arriving through the API.
    pub api_ingestion_rate: f64,
    /// Samples/sec arriving from the ruler.
    pub rule_ingestion_rate: f64,
}

/// The values of one label name, as streamed by `label_names_and_values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelNameValues {
    /// The label name.
    pub name: String,
    /// Its observed values.
    pub values: Vec<String>,
}

/// One page of a streamed `label_names_and_values` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelNamesAndValuesPage {
    /// Names with their values.
    pub items: Vec<LabelNameValues>,
}

/// The series count of one (label name, label value) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelValueSeriesCount {
    /// The label name.
    pub label_name: String,
    /// The label value.
    pub label_value: String,
    /// Number of series carrying the pair on the responding ingester.
    pub series_count: u64,
}

/// One page of a streamed `label_values_cardinality` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelValuesCardinalityPage {
    /// Per-pair series counts.
    pub items: Vec<LabelValueSeriesCount>,
}

/// Errors talking to one ingester.
#[derive(Debug, Error)]
pub enum IngesterError {
    /// The RPC did not complete within the configured timeout.
    #[error("timeout writing to the ingester")]
    Timeout,

    /// The ingester rejected the request as malformed (e.g. out-of-order
    /// samples); retrying unchanged will not help.
    #[error("ingester rejected the request: {0}")]
    Client(String),

    /// The ingester could not serve the request; retriable.
    #[error("ingester unavailable: {0}")]
    Unavailable(String),
}

impl IngesterError {
    /// Whether the failure is the caller's fault (4xx-class).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Client(_))
    }
}

/// The per-ingester RPC surface used by the distributor.
#[async_trait]
pub trait IngesterClient: Debug + Send + Sync {
    /// Append the request to the ingester's head block.
    async fn push(&self, request: WriteRequest) -> Result<(), IngesterError>;

    /// Stream samples of matching series in a time range.
    async fn query_stream(
        &self,
        request: QueryStreamRequest,
    ) -> Result<QueryStreamResponse, IngesterError>;

    /// Distinct label names of matching series in a time range.
    async fn label_names(
        &self,
        start: i64,
        end: i64,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<String>, IngesterError>;

    /// Distinct values of `label_name` of matching series.
    async fn label_values(
        &self,
        label_name: String,
        start: i64,
        end: i64,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<String>, IngesterError>;

    /// The label sets of matching series.
    async fn metrics_for_label_matchers(
        &self,
        start: i64,
        end: i64,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<Labels>, IngesterError>;

    /// All metric metadata held by the ingester.
    async fn metrics_metadata(&self) -> Result<Vec<MetricMetadata>, IngesterError>;

    /// Ingestion statistics of the tenant.
    async fn user_stats(&self) -> Result<UserStatsResponse, IngesterError>;

    /// Streamed (label name → values) inventory of matching series.
    async fn label_names_and_values(
        &self,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<LabelNamesAndValuesPage>, IngesterError>;

    /// Streamed per-(name, value) series counts for `label_names`.
    async fn label_values_cardinality(
        &self,
        label_names: Vec<String>,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<LabelValuesCardinalityPage>, IngesterError>;
}

/// Resolves the client for a ring instance.
pub trait IngesterPool: Debug + Send + Sync {
    /// The client to reach `instance`.
    fn client(&self, instance: &InstanceDesc) -> Arc<dyn IngesterClient>;
}

pub mod mock {
    //! An in-process ingester good enough to exercise the full write and
    //! read paths in tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

    #[derive(Debug, Default)]
    struct MockState {
        series: BTreeMap<u64, TimeSeries>,
        metadata: Vec<MetricMetadata>,
        push_requests: Vec<WriteRequest>,
        query_stream_calls: usize,
        push_errors: VecDeque<IngesterError>,
    }

    /// A recording in-memory ingester.
    #[derive(Debug, Default)]
    pub struct MockIngester {
        state: Mutex<MockState>,
    }

    impl MockIngester {
        /// Create an empty mock.
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue errors returned by the next `push` calls.
        pub fn with_push_errors(self, errors: impl IntoIterator<Item = IngesterError>) -> Self {
            self.state.lock().push_errors = errors.into_iter().collect();
            self
        }

        /// All pushed requests, in arrival order.
        pub fn push_requests(&self) -> Vec<WriteRequest> {
            self.state.lock().push_requests.clone()
        }

        /// Number of `query_stream` calls served.
        pub fn query_stream_calls(&self) -> usize {
            self.state.lock().query_stream_calls
        }

        /// Number of distinct series held.
        pub fn series_count(&self) -> usize {
            self.state.lock().series.len()
        }

        fn matching_series(state: &MockState, matchers: &[LabelMatcher]) -> Vec<TimeSeries> {
            state
                .series
                .values()
                .filter(|s| matchers.iter().all(|m| m.matches(&s.labels)))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl IngesterClient for MockIngester {
        async fn push(&self, request: WriteRequest) -> Result<(), IngesterError> {
            let mut state = self.state.lock();
            if let Some(e) = state.push_errors.pop_front() {
                return Err(e);
            }
            state.push_requests.push(request.clone());

            for series in request.timeseries {
                let entry = state
                    .series
                    .entry(series.labels.fingerprint())
                    .or_insert_with(|| TimeSeries {
                        labels: series.labels.clone(),
                        ..Default::default()
                    });
                entry.samples.extend(series.samples);
                entry.samples.sort_by_key(|s| s.timestamp);
                entry.samples.dedup_by_key(|s| s.timestamp);
                entry.histograms.extend(series.histograms);
                entry.histograms.sort_by_key(|h| h.timestamp);
                entry.histograms.dedup_by_key(|h| h.timestamp);
                entry.exemplars.extend(series.exemplars);
            }
            state.metadata.extend(request.metadata);
            Ok(())
        }

        async fn query_stream(
            &self,
            request: QueryStreamRequest,
        ) -> Result<QueryStreamResponse, IngesterError> {
            let mut state = self.state.lock();
            state.query_stream_calls += 1;

            let timeseries = Self::matching_series(&state, &request.matchers)
                .into_iter()
                .filter_map(|mut s| {
                    s.samples
                        .retain(|x| x.timestamp >= request.start && x.timestamp <= request.end);
                    s.histograms
                        .retain(|x| x.timestamp >= request.start && x.timestamp <= request.end);
                    s.exemplars.clear();
                    if s.samples.is_empty() && s.histograms.is_empty() {
                        None
                    } else {
                        Some(s)
                    }
                })
                .collect();
            Ok(QueryStreamResponse { timeseries })
        }

        async fn label_names(
            &self,
            _start: i64,
            _end: i64,
            matchers: Vec<LabelMatcher>,
        ) -> Result<Vec<String>, IngesterError> {
            let state = self.state.lock();
            let names: BTreeSet<String> = Self::matching_series(&state, &matchers)
                .iter()
                .flat_map(|s| s.labels.iter().map(|l| l.name.clone()))
                .collect();
            Ok(names.into_iter().collect())
        }

        async fn label_values(
            &self,
            label_name: String,
            _start: i64,
            _end: i64,
            matchers: Vec<LabelMatcher>,
        ) -> Result<Vec<String>, IngesterError> {
            let state = self.state.lock();
            let values: BTreeSet<String> = Self::matching_series(&state, &matchers)
                .iter()
                .filter_map(|s| s.labels.get(&label_name).map(str::to_owned))
                .collect();
            Ok(values.into_iter().collect())
        }

        async fn metrics_for_label_matchers(
            &self,
            _start: i64,
            _end: i64,
            matchers: Vec<LabelMatcher>,
        ) -> Result<Vec<Labels>, IngesterError> {
            let state = self.state.lock();
            Ok(Self::matching_series(&state, &matchers)
                .into_iter()
                .map(|s| s.labels)
                .collect())
        }

        async fn metrics_metadata(&self) -> Result<Vec<MetricMetadata>, IngesterError> {
            Ok(self.state.lock().metadata.clone())
        }

        async fn user_stats(&self) -> Result<UserStatsResponse, IngesterError> {
            let state = self.state.lock();
            Ok(UserStatsResponse {
                num_series: state.series.len() as u64,
                ..Default::default()
            })
        }

        async fn label_names_and_values(
            &self,
            matchers: Vec<LabelMatcher>,
        ) -> Result<Vec<LabelNamesAndValuesPage>, IngesterError> {
            let state = self.state.lock();
            let mut by_name: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for series in Self::matching_series(&state, &matchers) {
                for label in series.labels.iter() {
                    by_name
                        .entry(label.name.clone())
                        .or_default()
                        .insert(label.value.clone());
                }
            }
            Ok(vec![LabelNamesAndValuesPage {
                items: by_name
                    .into_iter()
                    .map(|(name, values)| LabelNameValues {
                        name,
                        values: values.into_iter().collect(),
                    })
                    .collect(),
            }])
        }

        async fn label_values_cardinality(
            &self,
            label_names: Vec<String>,
            matchers: Vec<LabelMatcher>,
        ) -> Result<Vec<LabelValuesCardinalityPage>, IngesterError> {
            let state = self.state.lock();
            let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
            for series in Self::matching_series(&state, &matchers) {
                for name in &label_names {
                    if let Some(value) = series.labels.get(name) {
                        *counts
                            .entry((name.clone(), value.to_owned()))
                            .or_default() += 1;
                    }
                }
            }
            Ok(vec![LabelValuesCardinalityPage {
                items: counts
                    .into_iter()
                    .map(|((label_name, label_value), series_count)| LabelValueSeriesCount {
                        label_name,
                        label_value,
                        series_count,
                    })
                    .collect(),
            }])
        }
    }

    /// A pool handing out [`MockIngester`]s by instance id, creating them
    /// on first use.
    #[derive(Debug, Default)]
    pub struct MockIngesterPool {
        clients: Mutex<HashMap<String, Arc<MockIngester>>>,
    }

    impl MockIngesterPool {
        /// Create an empty pool.
        pub fn new() -> Self {
            Self::default()
        }

        /// Pre-register `client` for `instance_id`.
        pub fn insert(&self, instance_id: impl Into<String>, client: Arc<MockIngester>) {
            self.clients.lock().insert(instance_id.into(), client);
        }

        /// The mock serving `instance_id`, creating it if needed.
        pub fn get(&self, instance_id: &str) -> Arc<MockIngester> {
            Arc::clone(
                self.clients
                    .lock()
                    .entry(instance_id.to_owned())
                    .or_default(),
            )
        }
    }

    impl IngesterPool for MockIngesterPool {
        fn client(&self, instance: &InstanceDesc) -> Arc<dyn IngesterClient> {
            self.get(&instance.id) as _
        }
    }
}
