use std::time::Instant;

use opentelemetry::{Key, KeyValue, Value, metrics::Histogram};

/// Measures the time between its creation and [`Recorder::record`], in milliseconds.
///
/// ```rust,ignore
/// let mut recorder = Recorder::new(COUNTER_STORE_DURATION);
/// recorder.push_attribute("operation", "charge");
///
/// let result = store.charge(&keys).await;
///
/// recorder.push_attribute("status", if result.is_ok() { "ok" } else { "error" });
/// recorder.record();
/// ```
pub struct Recorder {
    start: Instant,
    histogram: Histogram<f64>,
    attributes: Vec<KeyValue>,
}

impl Recorder {
    /// Starts timing an operation recorded to the histogram called `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            histogram: super::meter().f64_histogram(name).build(),
            attributes: Vec::new(),
        }
    }

    /// Adds an attribute to be recorded with the measurement.
    pub fn push_attribute<K, V>(&mut self, key: K, value: V)
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        self.attributes.push(KeyValue::new(key, value));
    }

    /// Records the elapsed time to the histogram.
    pub fn record(self) {
        let duration = self.start.elapsed().as_secs_f64() * 1000.0;
        self.histogram.record(duration, &self.attributes);
    }
}
