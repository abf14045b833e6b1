use super::{Attributes, MetricKind, Observation};

/// An object that sinks [`Observation`]s from instruments.
pub trait Reporter {
    /// Begin reporting a metric.
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    );

    /// Report one observation of the current metric.
    fn report_observation(&mut self, attributes: &Attributes, observation: Observation);

    /// Finish reporting the current metric.
    fn finish_metric(&mut self);
}

/// A [`Reporter`] that buffers observations in memory; useful for tests.
#[derive(Debug, Default)]
pub struct RawReporter {
    completed: Vec<ReportedMetric>,
    in_progress: Option<ReportedMetric>,
}

/// All observations of a single metric collected by [`RawReporter`].
#[derive(Debug, Clone)]
pub struct ReportedMetric {
    /// The metric name.
    pub metric_name: &'static str,
    /// The metric description.
    pub description: &'static str,
    /// The metric kind.
    pub kind: MetricKind,
    /// The reported observations, by attribute set.
    pub observations: Vec<(Attributes, Observation)>,
}

impl ReportedMetric {
    /// Returns the observation recorded for `attributes`, if any.
    pub fn observation(&self, attributes: &Attributes) -> Option<&Observation> {
        self.observations
            .iter()
            .find(|(a, _)| a == attributes)
            .map(|(_, o)| o)
    }
}

impl RawReporter {
    /// Returns the reported metric with `name`, if any.
    pub fn metric(&self, name: &str) -> Option<&ReportedMetric> {
        self.completed.iter().find(|m| m.metric_name == name)
    }

    /// All completed metrics, in report order.
    pub fn metrics(&self) -> &[ReportedMetric] {
        &self.completed
    }
}

impl Reporter for RawReporter {
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    ) {
        assert!(self.in_progress.is_none(), "metric already in progress");
        self.in_progress = Some(ReportedMetric {
            metric_name,
            description,
            kind,
            observations: vec![],
        })
    }

    fn report_observation(&mut self, attributes: &Attributes, observation: Observation) {
        self.in_progress
            .as_mut()
            .expect("no metric in progress")
            .observations
            .push((attributes.clone(), observation))
    }

    fn finish_metric(&mut self) {
        let metric = self.in_progress.take().expect("no metric in progress");
        self.completed.push(metric)
    }
}
