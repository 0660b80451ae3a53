// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Request metrics: an explicit Prometheus registry plus the per-request recording scope.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use metrics::{
    Counter, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, SharedString, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use parking_lot::Mutex;

use crate::error::ServerError;

/// Prometheus client default histogram buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// One registry per process, passed explicitly to everything that records
/// or renders metrics.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    families: Mutex<HashSet<String>>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, ServerError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets(&DEFAULT_BUCKETS)
            .map_err(|err| ServerError::config(format!("invalid histogram buckets: {err}")))?
            .build_recorder();
        let handle = recorder.handle();

        Ok(Self {
            recorder,
            handle,
            families: Mutex::new(HashSet::new()),
        })
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Claims a metric family name. Claiming the same name twice is a
    /// configuration error.
    fn claim(&self, name: &str) -> Result<(), ServerError> {
        if !self.families.lock().insert(name.to_string()) {
            return Err(ServerError::config(format!(
                "metric family {name} is already registered"
            )));
        }
        Ok(())
    }

    fn counter(&self, key: &Key) -> Counter {
        self.recorder.register_counter(key, &metadata())
    }

    fn histogram(&self, key: &Key) -> Histogram {
        self.recorder.register_histogram(key, &metadata())
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// Joins non-empty name parts with `_`, the Prometheus fully qualified name.
fn fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Counts requests and observes their duration, labelled by path and method.
pub struct MetricsRecorder {
    registry: Arc<MetricsRegistry>,
    requests_total: String,
    request_duration: String,
}

impl MetricsRecorder {
    pub fn new(
        registry: Arc<MetricsRegistry>,
        namespace: &str,
        subsystem: &str,
    ) -> Result<Self, ServerError> {
        let namespace = if namespace.is_empty() {
            crate::config::DEFAULT_METRICS_NAMESPACE
        } else {
            namespace
        };
        let requests_total = fq_name(namespace, subsystem, "http_requests_total");
        let request_duration = fq_name(namespace, subsystem, "http_request_duration_seconds");

        registry.claim(&requests_total)?;
        registry.claim(&request_duration)?;

        registry.recorder.describe_counter(
            KeyName::from(requests_total.clone()),
            None,
            SharedString::from("Total number of HTTP requests"),
        );
        registry.recorder.describe_histogram(
            KeyName::from(request_duration.clone()),
            Some(Unit::Seconds),
            SharedString::from("HTTP request duration in seconds"),
        );

        Ok(Self {
            registry,
            requests_total,
            request_duration,
        })
    }

    /// Counts the request now; the returned guard observes its duration
    /// when dropped.
    pub fn record_request(&self, path: &str, method: &str) -> RequestMetricGuard {
        let labels = vec![
            Label::new("path", path.to_string()),
            Label::new("method", method.to_string()),
        ];

        self.registry
            .counter(&Key::from_parts(self.requests_total.clone(), labels.clone()))
            .increment(1);
        let duration = self
            .registry
            .histogram(&Key::from_parts(self.request_duration.clone(), labels));

        RequestMetricGuard {
            duration,
            started: Instant::now(),
        }
    }
}

/// In-flight measurement for one request. Finalized exactly once, on drop.
#[must_use = "the request duration is observed when the guard is dropped"]
pub struct RequestMetricGuard {
    duration: Histogram,
    started: Instant,
}

impl Drop for RequestMetricGuard {
    fn drop(&mut self) {
        self.duration.record(self.started.elapsed().as_secs_f64());
    }
}

/// Reads a sample from Prometheus text output. Test helper.
#[cfg(test)]
pub(crate) fn sample(rendered: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    rendered
        .lines()
        .filter(|line| line.starts_with(&format!("{name}{{")))
        .find(|line| {
            labels
                .iter()
                .all(|(key, value)| line.contains(&format!("{key}=\"{value}\"")))
        })
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<MetricsRegistry> {
        Arc::new(MetricsRegistry::new().expect("registry builds"))
    }

    #[test]
    fn fq_name_skips_empty_parts() {
        assert_eq!(fq_name("default", "", "x_total"), "default_x_total");
        assert_eq!(fq_name("ns", "sub", "x_total"), "ns_sub_x_total");
    }

    #[test]
    fn record_request_counts_then_observes_once_on_drop() {
        let registry = registry();
        let recorder = MetricsRecorder::new(registry.clone(), "unit", "").unwrap();

        let guard = recorder.record_request("/helloworld/:name", "GET");
        let rendered = registry.render();
        let labels = [("path", "/helloworld/:name"), ("method", "GET")];
        assert_eq!(sample(&rendered, "unit_http_requests_total", &labels), Some(1.0));
        assert_eq!(
            sample(&rendered, "unit_http_request_duration_seconds_count", &labels).unwrap_or(0.0),
            0.0
        );

        drop(guard);
        let rendered = registry.render();
        assert_eq!(
            sample(&rendered, "unit_http_request_duration_seconds_count", &labels),
            Some(1.0)
        );
    }

    #[test]
    fn labels_are_kept_apart() {
        let registry = registry();
        let recorder = MetricsRecorder::new(registry.clone(), "split", "api").unwrap();

        for _ in 0..3 {
            let _scope = recorder.record_request("/a", "GET");
        }
        let _scope = recorder.record_request("/a", "POST");

        let rendered = registry.render();
        assert_eq!(
            sample(&rendered, "split_api_http_requests_total", &[("path", "/a"), ("method", "GET")]),
            Some(3.0)
        );
        assert_eq!(
            sample(&rendered, "split_api_http_requests_total", &[("path", "/a"), ("method", "POST")]),
            Some(1.0)
        );
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let registry = registry();
        let _first = MetricsRecorder::new(registry.clone(), "dup", "").unwrap();

        let err = MetricsRecorder::new(registry.clone(), "dup", "")
            .err()
            .expect("second registration fails");
        assert!(matches!(err, ServerError::Configuration(_)));

        assert!(MetricsRecorder::new(registry, "dup", "other").is_ok());
    }

    #[test]
    fn empty_namespace_falls_back_to_default() {
        let registry = registry();
        let recorder = MetricsRecorder::new(registry.clone(), "", "").unwrap();
        let _scope = recorder.record_request("/x", "GET");
        assert!(registry.render().contains("default_http_requests_total"));
        assert!(MetricsRecorder::new(registry, "default", "").is_err());
    }
}
