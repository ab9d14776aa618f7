//! Metrics for cloud provider calls
//!
//! Two layers:
//! - [`Reporter`]: exported metrics (OpenTelemetry by default). Reporting may
//!   fail; callers log the failure and carry on.
//! - [`CallStats`]: per-client in-memory call counters and aggregated
//!   wall-clock time, readable through [`CallStats::snapshot`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;
use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

/// Global meter for controller metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("azure-identity-controller"));

/// Histogram of successful cloud provider operation duration
///
/// Labels:
/// - `operation`: get-vmss, update-vmss
pub static CLOUD_OPERATION_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("cloud_provider_operation_duration_seconds")
        .with_description("Duration of successful cloud provider operations in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed cloud provider operations
///
/// Labels:
/// - `operation`: get-vmss, update-vmss
pub static CLOUD_OPERATION_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cloud_provider_operation_errors_total")
        .with_description("Total number of failed cloud provider operations")
        .with_unit("{errors}")
        .build()
});

/// Cloud provider operation names used as metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read a scale set
    GetVmss,
    /// Patch a scale set's identities
    UpdateVmss,
}

impl Operation {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetVmss => "get-vmss",
            Self::UpdateVmss => "update-vmss",
        }
    }
}

/// Named call counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallCounter {
    /// Successful GET calls
    GetCallsTotal,
    /// Successful PATCH calls
    PatchCallsTotal,
}

impl CallCounter {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetCallsTotal => "get-calls-total",
            Self::PatchCallsTotal => "patch-calls-total",
        }
    }
}

/// Coarse call categories whose wall-clock time is aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallCategory {
    /// Cloud reads
    CloudGet,
    /// Cloud writes
    CloudPatch,
}

impl CallCategory {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CloudGet => "cloud-get",
            Self::CloudPatch => "cloud-patch",
        }
    }
}

/// Errors raised by a metrics sink
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Operation label was empty
    #[error("operation name must not be empty")]
    EmptyOperation,

    /// The sink refused the measurement
    #[error("metrics sink rejected measurement: {0}")]
    Rejected(String),
}

/// Sink for cloud provider operation metrics
#[cfg_attr(test, automock)]
pub trait Reporter: Send + Sync {
    /// Record the duration of a successful operation
    fn report_operation_duration(
        &self,
        operation: &str,
        duration: Duration,
    ) -> Result<(), MetricsError>;

    /// Record a failed operation
    fn report_operation_error(&self, operation: &str) -> Result<(), MetricsError>;
}

/// [`Reporter`] backed by the global OpenTelemetry meter
#[derive(Debug, Clone, Copy, Default)]
pub struct OtelReporter;

impl Reporter for OtelReporter {
    fn report_operation_duration(
        &self,
        operation: &str,
        duration: Duration,
    ) -> Result<(), MetricsError> {
        if operation.is_empty() {
            return Err(MetricsError::EmptyOperation);
        }
        CLOUD_OPERATION_DURATION.record(
            duration.as_secs_f64(),
            &[KeyValue::new("operation", operation.to_string())],
        );
        Ok(())
    }

    fn report_operation_error(&self, operation: &str) -> Result<(), MetricsError> {
        if operation.is_empty() {
            return Err(MetricsError::EmptyOperation);
        }
        CLOUD_OPERATION_ERRORS.add(1, &[KeyValue::new("operation", operation.to_string())]);
        Ok(())
    }
}

/// Times one cloud provider operation from creation to [`finish`](Self::finish)
pub struct OperationTimer {
    operation: Operation,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn start(operation: Operation) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// When the timer was started
    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Report the outcome
    ///
    /// Success reports the elapsed duration, failure reports an error count.
    /// A reporter failure is logged and dropped.
    pub fn finish<R: Reporter + ?Sized>(self, reporter: &R, succeeded: bool) {
        let operation = self.operation.as_str();
        let result = if succeeded {
            reporter.report_operation_duration(operation, self.start.elapsed())
        } else {
            reporter.report_operation_error(operation)
        };
        if let Err(e) = result {
            warn!(operation, error = %e, "failed to report metrics");
        }
    }
}

#[derive(Debug, Default)]
struct Aggregate {
    total: Duration,
    /// Most recent contiguous span already counted in `total`
    span: Option<(Instant, Instant)>,
}

#[derive(Debug, Default)]
struct StatsState {
    counters: BTreeMap<CallCounter, u64>,
    aggregates: BTreeMap<CallCategory, Aggregate>,
}

/// Per-client call statistics
#[derive(Debug, Default)]
pub struct CallStats {
    state: Mutex<StatsState>,
}

/// Point-in-time copy of [`CallStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Counter values by name
    pub counters: BTreeMap<CallCounter, u64>,
    /// Aggregated wall-clock time by category
    pub aggregates: BTreeMap<CallCategory, Duration>,
}

impl StatsSnapshot {
    /// Value of a counter, zero if never incremented
    pub fn counter(&self, counter: CallCounter) -> u64 {
        self.counters.get(&counter).copied().unwrap_or(0)
    }

    /// Aggregated time of a category, zero if never recorded
    pub fn aggregate(&self, category: CallCategory) -> Duration {
        self.aggregates
            .get(&category)
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl CallStats {
    /// Create empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `by` to a counter
    pub fn increment(&self, counter: CallCounter, by: u64) {
        *self.state.lock().counters.entry(counter).or_insert(0) += by;
    }

    /// Add the interval `[begin, end]` to a category
    ///
    /// Time already covered by an overlapping interval of the same category
    /// is counted once, so concurrent calls do not inflate the total. An
    /// interval that started before the current span but overlaps it widens
    /// the span on both sides.
    pub fn aggregate_concurrent(&self, category: CallCategory, begin: Instant, end: Instant) {
        if end <= begin {
            return;
        }
        let mut state = self.state.lock();
        let aggregate = state.aggregates.entry(category).or_default();
        match aggregate.span {
            Some((start, until)) if begin <= until && end >= start => {
                let merged = (start.min(begin), until.max(end));
                aggregate.total += (merged.1 - merged.0) - (until - start);
                aggregate.span = Some(merged);
            }
            // Entirely before the current span; counted but not merged
            Some((start, _)) if end < start => {
                aggregate.total += end - begin;
            }
            _ => {
                aggregate.total += end - begin;
                aggregate.span = Some((begin, end));
            }
        }
    }

    /// Copy the current values
    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.state.lock();
        StatsSnapshot {
            counters: state.counters.clone(),
            aggregates: state
                .aggregates
                .iter()
                .map(|(category, aggregate)| (*category, aggregate.total))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::{always, eq};

    #[test]
    fn label_values_match_metric_names() {
        assert_eq!(Operation::GetVmss.as_str(), "get-vmss");
        assert_eq!(Operation::UpdateVmss.as_str(), "update-vmss");
        assert_eq!(CallCounter::GetCallsTotal.as_str(), "get-calls-total");
        assert_eq!(CallCounter::PatchCallsTotal.as_str(), "patch-calls-total");
        assert_eq!(CallCategory::CloudGet.as_str(), "cloud-get");
        assert_eq!(CallCategory::CloudPatch.as_str(), "cloud-patch");
    }

    #[test]
    fn otel_reporter_rejects_empty_operation() {
        let reporter = OtelReporter;
        assert!(reporter
            .report_operation_duration("get-vmss", Duration::from_millis(5))
            .is_ok());
        assert!(reporter.report_operation_error("update-vmss").is_ok());
        assert!(matches!(
            reporter.report_operation_error(""),
            Err(MetricsError::EmptyOperation)
        ));
    }

    #[test]
    fn successful_operation_reports_duration_only() {
        let mut reporter = MockReporter::new();
        reporter
            .expect_report_operation_duration()
            .with(eq("get-vmss"), always())
            .times(1)
            .returning(|_, _| Ok(()));
        reporter.expect_report_operation_error().never();

        OperationTimer::start(Operation::GetVmss).finish(&reporter, true);
    }

    #[test]
    fn failed_operation_reports_error_only() {
        let mut reporter = MockReporter::new();
        reporter.expect_report_operation_duration().never();
        reporter
            .expect_report_operation_error()
            .with(eq("update-vmss"))
            .times(1)
            .returning(|_| Ok(()));

        OperationTimer::start(Operation::UpdateVmss).finish(&reporter, false);
    }

    #[test]
    fn reporter_failure_is_swallowed() {
        let mut reporter = MockReporter::new();
        reporter
            .expect_report_operation_error()
            .times(1)
            .returning(|_| Err(MetricsError::Rejected("sink down".into())));

        // Must not panic or propagate
        OperationTimer::start(Operation::GetVmss).finish(&reporter, false);
    }

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let stats = CallStats::new();
        assert_eq!(stats.snapshot().counter(CallCounter::GetCallsTotal), 0);

        stats.increment(CallCounter::GetCallsTotal, 1);
        stats.increment(CallCounter::GetCallsTotal, 2);
        stats.increment(CallCounter::PatchCallsTotal, 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.counter(CallCounter::GetCallsTotal), 3);
        assert_eq!(snapshot.counter(CallCounter::PatchCallsTotal), 1);
    }

    #[test]
    fn overlapping_intervals_are_counted_once() {
        let stats = CallStats::new();
        let t0 = Instant::now();
        let s = Duration::from_secs;

        stats.aggregate_concurrent(CallCategory::CloudGet, t0, t0 + s(4));
        // overlaps [2, 6] -> adds only [4, 6]
        stats.aggregate_concurrent(CallCategory::CloudGet, t0 + s(2), t0 + s(6));
        // fully covered
        stats.aggregate_concurrent(CallCategory::CloudGet, t0 + s(3), t0 + s(5));
        // disjoint
        stats.aggregate_concurrent(CallCategory::CloudGet, t0 + s(10), t0 + s(11));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.aggregate(CallCategory::CloudGet), s(7));
        assert_eq!(snapshot.aggregate(CallCategory::CloudPatch), Duration::ZERO);
    }

    #[test]
    fn longer_call_started_earlier_widens_the_span() {
        let stats = CallStats::new();
        let t0 = Instant::now();
        let s = Duration::from_secs;

        // a short call finishes first, then a call that began before it
        stats.aggregate_concurrent(CallCategory::CloudPatch, t0 + s(1), t0 + s(3));
        stats.aggregate_concurrent(CallCategory::CloudPatch, t0, t0 + s(10));
        assert_eq!(stats.snapshot().aggregate(CallCategory::CloudPatch), s(10));

        // inside the widened span
        stats.aggregate_concurrent(CallCategory::CloudPatch, t0 + s(2), t0 + s(9));
        assert_eq!(stats.snapshot().aggregate(CallCategory::CloudPatch), s(10));
    }

    #[test]
    fn empty_interval_is_ignored() {
        let stats = CallStats::new();
        let t0 = Instant::now();
        stats.aggregate_concurrent(CallCategory::CloudGet, t0, t0);
        assert_eq!(stats.snapshot().aggregate(CallCategory::CloudGet), Duration::ZERO);
    }
}
