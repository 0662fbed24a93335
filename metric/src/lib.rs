//! Lock-free-ish counter/gauge registry.
//!
//! Every metric lives behind a [`Metric<T>`] handle returned by
//! [`Registry::register_metric`]. Call [`Metric::recorder`] once per
//! distinct attribute set (e.g. once per partition) and hold onto the
//! returned instrument — incrementing it afterwards never touches a lock.
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A set of key/value labels identifying one time series within a metric.
pub type Attributes = BTreeMap<&'static str, String>;

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    value: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increment the counter by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Increment the counter by `delta`.
    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value.
    pub fn fetch(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up or down.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    value: Arc<AtomicI64>,
}

impl U64Gauge {
    /// Set the gauge to an absolute value.
    pub fn set(&self, value: u64) {
        self.value.store(value as i64, Ordering::Relaxed);
    }

    /// Set the gauge from a signed value (durations in milliseconds can
    /// transiently be computed as signed before being reported).
    pub fn set_i64(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value.
    pub fn fetch(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Instruments that a [`Metric`] can be parameterized over.
pub trait Instrument: Clone + Default + Debug + Send + Sync + 'static {
    /// Short label used when exporting this instrument's kind.
    fn kind() -> &'static str;
}

impl Instrument for U64Counter {
    fn kind() -> &'static str {
        "counter"
    }
}

impl Instrument for U64Gauge {
    fn kind() -> &'static str {
        "gauge"
    }
}

/// A handle to a named metric, sharded by [`Attributes`].
///
/// Cloning a [`Metric`] is cheap; all clones observe the same underlying
/// set of recorders.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    recorders: Arc<Mutex<Vec<(Attributes, T)>>>,
}

impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            recorders: Arc::clone(&self.recorders),
        }
    }
}

impl<T: Instrument> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            recorders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Return the instrument recording the series identified by
    /// `attributes`, creating it if this is the first time it's seen.
    pub fn recorder(&self, attributes: Attributes) -> T {
        let mut recorders = self.recorders.lock();
        if let Some((_, instrument)) = recorders.iter().find(|(a, _)| a == &attributes) {
            return instrument.clone();
        }
        let instrument = T::default();
        recorders.push((attributes, instrument.clone()));
        instrument
    }

    /// Convenience for metrics with no labels.
    pub fn recorder_default(&self) -> T {
        self.recorder(Attributes::default())
    }
}

/// One exported data point.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: &'static str,
    pub attributes: Attributes,
    pub value: f64,
}

trait Reportable: Debug + Send + Sync {
    fn snapshot(&self) -> Vec<Sample>;
}

impl Reportable for Metric<U64Counter> {
    fn snapshot(&self) -> Vec<Sample> {
        self.recorders
            .lock()
            .iter()
            .map(|(attrs, instrument)| Sample {
                name: self.name,
                description: self.description,
                kind: U64Counter::kind(),
                attributes: attrs.clone(),
                value: instrument.fetch() as f64,
            })
            .collect()
    }
}

impl Reportable for Metric<U64Gauge> {
    fn snapshot(&self) -> Vec<Sample> {
        self.recorders
            .lock()
            .iter()
            .map(|(attrs, instrument)| Sample {
                name: self.name,
                description: self.description,
                kind: U64Gauge::kind(),
                attributes: attrs.clone(),
                value: instrument.fetch() as f64,
            })
            .collect()
    }
}

/// The process-wide collection of metrics.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<Vec<Box<dyn Reportable>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-fetch) a named metric.
    ///
    /// Calling this twice with the same `name` and type returns independent
    /// handles that both report under that name; callers are expected to
    /// register each metric exactly once at startup and share the handle.
    pub fn register_metric<T: Instrument>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T>
    where
        Metric<T>: Reportable + Clone,
    {
        let metric = Metric::new(name, description);
        self.instruments.lock().push(Box::new(metric.clone()));
        metric
    }

    /// Snapshot every registered metric's current samples.
    pub fn report(&self) -> Vec<Sample> {
        self.instruments
            .lock()
            .iter()
            .flat_map(|m| m.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_round_trip() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> = registry.register_metric("attempts", "bulk attempts");

        let mut attrs = Attributes::new();
        attrs.insert("partition", "3".to_string());
        let recorder = metric.recorder(attrs.clone());
        recorder.inc();
        recorder.add(4);

        // a second lookup with the same attributes returns the same series
        let same = metric.recorder(attrs);
        assert_eq!(same.fetch(), 5);

        let samples = registry.report();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 5.0);
        assert_eq!(samples[0].kind, "counter");
    }

    #[test]
    fn gauge_reports_latest_value() {
        let registry = Registry::new();
        let metric: Metric<U64Gauge> = registry.register_metric("committed_seqno", "committed");
        let recorder = metric.recorder_default();
        recorder.set(42);
        recorder.set(7);

        let samples = registry.report();
        assert_eq!(samples[0].value, 7.0);
    }

    #[test]
    fn distinct_attributes_are_distinct_series() {
        let registry = Registry::new();
        let metric: Metric<U64Gauge> = registry.register_metric("observed_seqno", "observed");

        let mut p0 = Attributes::new();
        p0.insert("partition", "0".to_string());
        let mut p1 = Attributes::new();
        p1.insert("partition", "1".to_string());

        metric.recorder(p0).set(10);
        metric.recorder(p1).set(20);

        let samples = registry.report();
        assert_eq!(samples.len(), 2);
    }
}
