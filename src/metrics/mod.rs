use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Mutex;

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str);
    fn timer(&self, name: &str, duration: Duration);
}

#[derive(Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment(&self, _name: &str) {}

    fn timer(&self, _name: &str, _duration: Duration) {}
}

// Test sink; retains every counter bump and timer sample so assertions can
// read them back. Never wired into a running server.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemorySink {
    counters: Mutex<HashMap<String, u64>>,
    timers: Mutex<Vec<(String, Duration)>>,
}

#[cfg(test)]
impl MemorySink {
    pub(crate) fn counter_value(&self, name: &str) -> u64 {
        *self
            .counters
            .lock()
            .expect("metrics counter lock poisoned")
            .get(name)
            .unwrap_or(&0)
    }

    pub(crate) fn timer_samples(&self, name: &str) -> Vec<Duration> {
        self.timers
            .lock()
            .expect("metrics timer lock poisoned")
            .iter()
            .filter(|(sample_name, _)| sample_name == name)
            .map(|(_, duration)| *duration)
            .collect()
    }
}

#[cfg(test)]
impl MetricsSink for MemorySink {
    fn increment(&self, name: &str) {
        let mut counters = self
            .counters
            .lock()
            .expect("metrics counter lock poisoned");
        *counters.entry(name.to_owned()).or_insert(0) += 1;
    }

    fn timer(&self, name: &str, duration: Duration) {
        self.timers
            .lock()
            .expect("metrics timer lock poisoned")
            .push((name.to_owned(), duration));
    }
}

pub struct Metrics {
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    pub fn increment(&self, name: &str) {
        self.sink.increment(name);
    }

    pub fn timer(&self, name: &str, duration: Duration) {
        self.sink.timer(name, duration);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(Arc::new(NoopSink))
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("sink", &"<dyn MetricsSink>")
            .finish()
    }
}
