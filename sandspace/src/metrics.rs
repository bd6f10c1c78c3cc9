use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use sandspace_protocol::{SpaceInfo, SpaceStatus};

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SpaceStatusLabels {
    status: SpaceStatusLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum SpaceStatusLabel {
    Running,
    Paused,
    Stopped,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ExecResultLabels {
    result: ExecResultLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum ExecResultLabel {
    Success,
    Failure,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorTypeLabels {
    error_type: String,
}

// ---------------------------------------------------------------------------
// MetricsRegistry
// ---------------------------------------------------------------------------

/// Prometheus metrics for sandspace.
///
/// Recording is a handful of atomic operations; the struct is `Clone` via an
/// internal `Arc`.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Mutex<Registry>,
    spaces_total: Family<SpaceStatusLabels, Gauge>,
    space_create_duration_seconds: Histogram,
    exec_total: Family<ExecResultLabels, Counter>,
    exec_duration_seconds: Histogram,
    idle_pauses_total: Counter,
    terminal_sessions: Gauge,
    errors_total: Family<ErrorTypeLabels, Counter>,
    start_time: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let spaces_total = Family::<SpaceStatusLabels, Gauge>::default();
        registry.register(
            "sandspace_spaces_total",
            "Current number of spaces by status",
            spaces_total.clone(),
        );

        // Create covers volume bootstrap plus container start: 0.25s to ~32s
        let space_create_duration_seconds = Histogram::new(exponential_buckets(0.25, 2.0, 8));
        registry.register(
            "sandspace_space_create_duration_seconds",
            "Space creation duration in seconds",
            space_create_duration_seconds.clone(),
        );

        let exec_total = Family::<ExecResultLabels, Counter>::default();
        registry.register(
            "sandspace_exec_total",
            "Total exec commands by result",
            exec_total.clone(),
        );

        let exec_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 10));
        registry.register(
            "sandspace_exec_duration_seconds",
            "Exec command duration in seconds",
            exec_duration_seconds.clone(),
        );

        let idle_pauses_total = Counter::default();
        registry.register(
            "sandspace_idle_pauses",
            "Spaces paused by the idle monitor",
            idle_pauses_total.clone(),
        );

        let terminal_sessions = Gauge::default();
        registry.register(
            "sandspace_terminal_sessions",
            "Currently attached terminal sessions",
            terminal_sessions.clone(),
        );

        let errors_total = Family::<ErrorTypeLabels, Counter>::default();
        registry.register(
            "sandspace_errors_total",
            "Total errors by type",
            errors_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsInner {
                registry: Mutex::new(registry),
                spaces_total,
                space_create_duration_seconds,
                exec_total,
                exec_duration_seconds,
                idle_pauses_total,
                terminal_sessions,
                errors_total,
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_create(&self, duration: Duration) {
        self.inner
            .space_create_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Record a completed exec. `None` means the exec failed before an exit code was known.
    pub fn record_exec(&self, duration: Duration, exit_code: Option<i64>) {
        self.inner
            .exec_duration_seconds
            .observe(duration.as_secs_f64());
        let result = match exit_code {
            Some(0) => ExecResultLabel::Success,
            Some(_) => ExecResultLabel::Failure,
            None => ExecResultLabel::Error,
        };
        self.inner
            .exec_total
            .get_or_create(&ExecResultLabels { result })
            .inc();
    }

    pub fn record_idle_pause(&self) {
        self.inner.idle_pauses_total.inc();
    }

    pub fn terminal_opened(&self) {
        self.inner.terminal_sessions.inc();
    }

    pub fn terminal_closed(&self) {
        self.inner.terminal_sessions.dec();
    }

    /// Increment the error counter for a given error type.
    pub fn record_error(&self, error_type: &str) {
        self.inner
            .errors_total
            .get_or_create(&ErrorTypeLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }

    /// Refresh the per-status gauges from a live listing.
    pub fn set_space_counts(&self, spaces: &[SpaceInfo]) {
        let (mut running, mut paused, mut stopped) = (0i64, 0i64, 0i64);
        for space in spaces {
            match space.status {
                SpaceStatus::Running => running += 1,
                SpaceStatus::Paused => paused += 1,
                SpaceStatus::Stopped | SpaceStatus::Creating => stopped += 1,
                SpaceStatus::Destroyed => {}
            }
        }
        for (status, value) in [
            (SpaceStatusLabel::Running, running),
            (SpaceStatusLabel::Paused, paused),
            (SpaceStatusLabel::Stopped, stopped),
        ] {
            self.inner
                .spaces_total
                .get_or_create(&SpaceStatusLabels { status })
                .set(value);
        }
    }

    /// Encode all metrics in OpenMetrics text format.
    pub fn encode_metrics(&self) -> String {
        let mut buf = String::new();
        let registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = encode(&mut buf, &registry) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        buf
    }

    /// Seconds since the registry was created.
    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }
}
