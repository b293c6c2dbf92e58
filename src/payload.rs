//! Versioned result payload codec.
//!
//! Every structured diagnostic blob written to a record or run goes through
//! [`normalize`]. Version 1 is the only supported schema. Payloads written
//! before versioning existed carry no `version` key and are stamped on the
//! way in; each stamping increments `sync_payload_version_stamped_total` so
//! the compatibility path can be removed once the counter stays at zero.

use metrics::counter;
use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::error::{CoreError, CoreResult};

/// The only payload schema version currently written.
pub const CURRENT_VERSION: i64 = 1;

const VERSION_KEY: &str = "version";

/// Normalizes `payload` to the current versioned shape.
///
/// * `None` stays `None`.
/// * Non-object input is rejected.
/// * An integer `version` other than [`CURRENT_VERSION`] is rejected.
/// * A missing or non-integer `version` is stamped with [`CURRENT_VERSION`].
///
/// `source` names the writer and labels the stamping metric.
pub fn normalize(payload: Option<Value>, source: &str) -> CoreResult<Option<Value>> {
    let Some(payload) = payload else {
        return Ok(None);
    };

    let Value::Object(mut map) = payload else {
        return Err(CoreError::Validation(format!(
            "{source} payload must be a JSON object, got {}",
            json_type_name(&payload)
        )));
    };

    match declared_version(&map) {
        Some(version) if version.as_i64() == Some(CURRENT_VERSION) => Ok(Some(Value::Object(map))),
        Some(other) => Err(CoreError::Validation(format!(
            "{source} payload declares unsupported version {other}"
        ))),
        None => {
            let previous = map.insert(VERSION_KEY.to_string(), Value::from(CURRENT_VERSION));
            warn!(
                source,
                previous_version = ?previous,
                "stamped legacy payload without version"
            );
            counter!("sync_payload_version_stamped_total", "source" => source.to_string())
                .increment(1);
            Ok(Some(Value::Object(map)))
        }
    }
}

/// The declared `version` when it is an integer of any width.
fn declared_version(map: &Map<String, Value>) -> Option<Number> {
    match map.get(VERSION_KEY) {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Some(n.clone()),
        _ => None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{
        Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn none_stays_none() {
        assert_eq!(normalize(None, "test").unwrap(), None);
    }

    #[test]
    fn legacy_payload_is_stamped() {
        let out = normalize(Some(json!({"created": 1})), "test").unwrap();
        assert_eq!(out, Some(json!({"created": 1, "version": 1})));
    }

    #[test]
    fn current_version_passes_through() {
        let payload = json!({"version": 1, "steps": ["connect"]});
        assert_eq!(
            normalize(Some(payload.clone()), "test").unwrap(),
            Some(payload)
        );
    }

    #[test]
    fn unsupported_version_is_refused() {
        let err = normalize(Some(json!({"version": 2})), "test").unwrap_err();
        assert!(matches!(err, CoreError::Validation(msg) if msg.contains("version 2")));

        for version in [json!(0), json!(-1), json!(u64::MAX), json!(i64::MIN)] {
            let payload = json!({ "version": version.clone() });
            assert!(
                matches!(normalize(Some(payload), "test"), Err(CoreError::Validation(_))),
                "version {version} should be refused"
            );
        }
    }

    /// Counts `sync_payload_version_stamped_total` increments and their labels.
    #[derive(Default)]
    struct StampRecorder {
        count: Arc<StampCount>,
        sources: Mutex<Vec<String>>,
    }

    #[derive(Default)]
    struct StampCount(AtomicU64);

    impl CounterFn for StampCount {
        fn increment(&self, value: u64) {
            self.0.fetch_add(value, Ordering::SeqCst);
        }

        fn absolute(&self, value: u64) {
            self.0.store(value, Ordering::SeqCst);
        }
    }

    impl Recorder for StampRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            if key.name() != "sync_payload_version_stamped_total" {
                return Counter::noop();
            }
            let mut sources = self.sources.lock().unwrap();
            sources.extend(
                key.labels()
                    .filter(|label| label.key() == "source")
                    .map(|label| label.value().to_string()),
            );
            Counter::from_arc(self.count.clone())
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn stamping_is_counted_per_source() {
        let recorder = StampRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            normalize(Some(json!({"created": 1})), "sync_instance_record").unwrap();
            normalize(Some(json!({"version": 1})), "sync_instance_record").unwrap();
            normalize(None, "task_run").unwrap();
            let _ = normalize(Some(json!({"version": 7})), "task_run");
        });

        assert_eq!(recorder.count.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            *recorder.sources.lock().unwrap(),
            vec!["sync_instance_record".to_string()]
        );
    }

    #[test]
    fn non_integer_version_is_restamped() {
        let out = normalize(Some(json!({"version": "1"})), "test").unwrap();
        assert_eq!(out, Some(json!({"version": 1})));

        let out = normalize(Some(json!({"version": 1.5})), "test").unwrap();
        assert_eq!(out, Some(json!({"version": 1})));
    }

    #[test]
    fn non_object_is_rejected() {
        for bad in [json!([1, 2]), json!("text"), json!(3), json!(null)] {
            assert!(matches!(
                normalize(Some(bad), "test"),
                Err(CoreError::Validation(_))
            ));
        }
    }

    #[test]
    fn stamping_is_idempotent() {
        for payload in [json!({}), json!({"a": {"b": 2}}), json!({"version": 1, "x": 0})] {
            let once = normalize(Some(payload), "test").unwrap();
            let twice = normalize(once.clone(), "test").unwrap();
            assert_eq!(once, twice);
        }
    }
}
