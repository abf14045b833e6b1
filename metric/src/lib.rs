//! Metric abstraction for the stratus workspace.
//!
//! # Design
//!
//! [`Registry`] stores named [`Instrument`]s. An `Instrument` knows how to
//! write its [`Observation`]s to a [`Reporter`] when asked;
//! [`Registry::report`] visits every instrument in alphabetical order of
//! name. Recording, by contrast, happens through the concrete observer
//! types ([`U64Counter`], [`U64Gauge`], [`U64Histogram`],
//! [`DurationHistogram`]) obtained from [`Metric::recorder`] for a given
//! set of [`Attributes`].
//!
//! Decoupling recording from reporting keeps individual metric updates as
//! cheap as an atomic operation and lets tests assert on recorded values
//! directly (via `fetch()` or [`RawReporter`]) without a text exposition
//! format in between.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

mod counter;
mod gauge;
mod histogram;
mod reporter;

pub use counter::*;
pub use gauge::*;
pub use histogram::*;
pub use reporter::*;

/// A registry of named [`Instrument`]s.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Instrument>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new metric with default options, or return the existing
    /// metric with the same name.
    ///
    /// # Panics
    ///
    /// Panics if a metric of the same name but a different type is already
    /// registered.
    pub fn register_metric<T>(&self, name: &'static str, description: &'static str) -> Metric<T>
    where
        T: MetricObserver,
        T::Options: Default,
    {
        self.register_metric_with_options(name, description, T::Options::default)
    }

    /// Register a new metric with the options returned by `options`, or
    /// return the existing metric with the same name.
    ///
    /// # Panics
    ///
    /// Panics if a metric of the same name but a different type is already
    /// registered.
    pub fn register_metric_with_options<T, F>(
        &self,
        name: &'static str,
        description: &'static str,
        options: F,
    ) -> Metric<T>
    where
        T: MetricObserver,
        F: FnOnce() -> T::Options,
    {
        let mut instruments = self.instruments.lock();
        match instruments.get(name) {
            Some(instrument) => instrument
                .as_any()
                .downcast_ref::<Metric<T>>()
                .unwrap_or_else(|| {
                    panic!("metric {name} registered with a different observer type")
                })
                .clone(),
            None => {
                let metric = Metric::new(name, description, options());
                instruments.insert(name, Box::new(metric.clone()));
                metric
            }
        }
    }

    /// Visit every registered instrument in alphabetical order of name.
    pub fn report(&self, reporter: &mut dyn Reporter) {
        let instruments = self.instruments.lock();
        for instrument in instruments.values() {
            instrument.report(reporter)
        }
    }
}

/// Something that can report its observations.
pub trait Instrument: Debug + Send + Sync {
    /// Report all observations to `reporter`.
    fn report(&self, reporter: &mut dyn Reporter);

    /// Downcast support for re-registration.
    fn as_any(&self) -> &dyn Any;
}

/// The kind of observations an instrument produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MetricKind {
    U64Counter,
    U64Gauge,
    U64Histogram,
    DurationHistogram,
}

/// A single recorded value.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Observation {
    U64Counter(u64),
    U64Gauge(u64),
    U64Histogram(HistogramObservation<u64>),
    DurationHistogram(HistogramObservation<std::time::Duration>),
}

/// An object that records a single statistic and can report it.
pub trait MetricObserver: Debug + Clone + Send + Sync + 'static {
    /// Options used to construct this observer.
    type Options: Debug + Send + Sync + 'static;

    /// Create a new observer.
    fn create(options: &Self::Options) -> Self;

    /// The kind of observation produced.
    fn kind() -> MetricKind;

    /// The current value.
    fn observe(&self) -> Observation;
}

/// A set of key-value attributes associated with an observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Insert or replace the value for `key`.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }

    /// Returns the value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_ref())
    }

    /// Iterate over the contained key-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &Cow<'static, str>)> {
        self.0.iter()
    }
}

impl<const N: usize> From<[(&'static str, &'static str); N]> for Attributes {
    fn from(iter: [(&'static str, &'static str); N]) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k, Cow::from(v))).collect())
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(iter: &[(&'static str, &'static str); N]) -> Self {
        Self(iter.iter().map(|(k, v)| (*k, Cow::from(*v))).collect())
    }
}

impl<const N: usize> From<[(&'static str, Cow<'static, str>); N]> for Attributes {
    fn from(iter: [(&'static str, Cow<'static, str>); N]) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&'static str, String); N]> for Attributes {
    fn from(iter: [(&'static str, String); N]) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k, Cow::from(v))).collect())
    }
}

/// A named instrument that maintains a separate observer per set of
/// [`Attributes`].
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    shared: Arc<MetricShared<T>>,
}

#[derive(Debug)]
struct MetricShared<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    options: T::Options,
    observers: Mutex<BTreeMap<Attributes, T>>,
}

impl<T: MetricObserver> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str, options: T::Options) -> Self {
        Self {
            shared: Arc::new(MetricShared {
                name,
                description,
                options,
                observers: Default::default(),
            }),
        }
    }

    /// Returns the observer for `attributes`, creating it on first use.
    ///
    /// Observers are cheap handles onto shared state; the returned value
    /// can be cached to avoid repeated attribute manipulation.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.shared
            .observers
            .lock()
            .entry(attributes.into())
            .or_insert_with(|| T::create(&self.shared.options))
            .clone()
    }

    /// Returns the observer for `attributes` if one has been created.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.shared.observers.lock().get(attributes).cloned()
    }
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn report(&self, reporter: &mut dyn Reporter) {
        reporter.start_metric(self.shared.name, self.shared.description, T::kind());
        for (attributes, observer) in self.shared.observers.lock().iter() {
            reporter.report_observation(attributes, observer.observe())
        }
        reporter.finish_metric();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
