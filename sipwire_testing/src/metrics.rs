//! Capture metrics emitted by a closure.

use metrics_util::debugging::{DebugValue, DebuggingRecorder};

/// A counter or gauge reading.
#[derive(Debug)]
pub struct Reading {
    /// Metric name.
    pub name: String,
    /// Labels as `(key, value)` pairs.
    pub labels: Vec<(String, String)>,
    /// Recorded value.
    pub value: DebugValue,
}

/// Run `f` with a local debugging recorder and return what it recorded.
pub fn capture(f: impl FnOnce()) -> Vec<Reading> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    metrics::with_local_recorder(&recorder, f);
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, value)| Reading {
            name: key.key().name().to_owned(),
            labels: key
                .key()
                .labels()
                .map(|label| (label.key().to_owned(), label.value().to_owned()))
                .collect(),
            value,
        })
        .collect()
}

/// Value of counter `name` carrying label `key=value`, or of the unlabelled
/// counter when `label` is `None`.
#[must_use]
pub fn counter(readings: &[Reading], name: &str, label: Option<(&str, &str)>) -> u64 {
    readings
        .iter()
        .filter(|r| r.name == name)
        .filter(|r| {
            label.is_none_or(|(k, v)| r.labels.iter().any(|(lk, lv)| lk == k && lv == v))
        })
        .map(|r| match &r.value {
            DebugValue::Counter(c) => *c,
            _ => 0,
        })
        .sum()
}
