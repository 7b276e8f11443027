//! Resolver telemetry (spec.md §2 ambient components).
//!
//! Mirrors the donor's `tracer.rs`: a trait with no-op default methods so a
//! `NoopSink` compiles away entirely, plus a counting implementation for
//! callers who want batching/timing stats without committing to a specific
//! metrics backend.

use std::fmt;
use std::time::Duration;

use ahash::AHashMap;

/// How much telemetry the resolver should bother collecting.
///
/// Threaded through so a `CountingSink` can skip timing work (`Instant::now`
/// calls around every decorator batch) when the caller only wants counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TelemetryLevel {
    /// No telemetry sink methods are meaningfully invoked.
    Off,
    /// Call counts and batch sizes, no timing.
    #[default]
    Counts,
    /// Call counts, batch sizes, and elapsed time per batch.
    Timing,
}

/// Trait for observing resolver execution.
///
/// All methods default to no-ops, so `NoopSink` requires no code and the
/// compiler can inline every hook away when the resolver is generic over
/// `S: TelemetrySink`.
pub trait TelemetrySink: fmt::Debug {
    /// Called when a new resolution wave begins (spec.md §4.5: collect →
    /// flush → finalize → evaluate blocker).
    fn on_wave_start(&mut self, _wave: usize) {}

    fn on_wave_end(&mut self, _wave: usize) {}

    /// Called once per decorator name per flush, after the batched call
    /// returns (spec.md §5: "decorator calls sharing a name within one wave
    /// are grouped into a single batched call").
    fn on_decorator_batch(&mut self, _name: &str, _batch_size: usize, _elapsed: Option<Duration>) {}

    /// Called when an `If`/`When` branch is pruned from the execution graph.
    fn on_branch_pruned(&mut self, _taken: bool) {}

    /// Called after a `For` loop is unrolled, with the iteration count.
    fn on_loop_unrolled(&mut self, _iterations: usize) {}
}

/// Zero-cost production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {}

/// Per-decorator-name statistics collected by [`CountingSink`].
#[derive(Debug, Clone, Default)]
pub struct DecoratorStats {
    pub total_calls: usize,
    pub batch_calls: usize,
    pub batch_sizes: Vec<usize>,
    pub total_time: Duration,
}

/// Counts decorator batching behavior and (at [`TelemetryLevel::Timing`])
/// accumulates elapsed time, keyed by decorator name.
#[derive(Debug)]
pub struct CountingSink {
    level: TelemetryLevel,
    stats: AHashMap<String, DecoratorStats>,
    waves: usize,
    pruned_branches: usize,
    loop_iterations: usize,
}

impl CountingSink {
    #[must_use]
    pub fn new(level: TelemetryLevel) -> Self {
        Self {
            level,
            stats: AHashMap::new(),
            waves: 0,
            pruned_branches: 0,
            loop_iterations: 0,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &AHashMap<String, DecoratorStats> {
        &self.stats
    }

    #[must_use]
    pub fn wave_count(&self) -> usize {
        self.waves
    }

    #[must_use]
    pub fn pruned_branch_count(&self) -> usize {
        self.pruned_branches
    }
}

impl TelemetrySink for CountingSink {
    fn on_wave_start(&mut self, _wave: usize) {
        if self.level != TelemetryLevel::Off {
            self.waves += 1;
        }
    }

    fn on_decorator_batch(&mut self, name: &str, batch_size: usize, elapsed: Option<Duration>) {
        if self.level == TelemetryLevel::Off {
            return;
        }
        let entry = self.stats.entry(name.to_owned()).or_default();
        entry.total_calls += batch_size;
        entry.batch_calls += 1;
        entry.batch_sizes.push(batch_size);
        if self.level == TelemetryLevel::Timing
            && let Some(elapsed) = elapsed
        {
            entry.total_time += elapsed;
        }
    }

    fn on_branch_pruned(&mut self, _taken: bool) {
        if self.level != TelemetryLevel::Off {
            self.pruned_branches += 1;
        }
    }

    fn on_loop_unrolled(&mut self, iterations: usize) {
        if self.level != TelemetryLevel::Off {
            self.loop_iterations += iterations;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_all_hooks() {
        let mut sink = NoopSink;
        sink.on_wave_start(0);
        sink.on_decorator_batch("env", 3, Some(Duration::from_millis(1)));
        sink.on_branch_pruned(true);
        sink.on_loop_unrolled(5);
    }

    #[test]
    fn counting_sink_aggregates_by_decorator_name() {
        let mut sink = CountingSink::new(TelemetryLevel::Counts);
        sink.on_decorator_batch("env", 2, None);
        sink.on_decorator_batch("env", 3, None);
        sink.on_decorator_batch("aws", 1, None);
        let env = &sink.stats()["env"];
        assert_eq!(env.total_calls, 5);
        assert_eq!(env.batch_calls, 2);
        assert_eq!(env.batch_sizes, vec![2, 3]);
        assert_eq!(sink.stats()["aws"].total_calls, 1);
    }

    #[test]
    fn off_level_does_not_record_calls() {
        let mut sink = CountingSink::new(TelemetryLevel::Off);
        sink.on_wave_start(0);
        sink.on_decorator_batch("env", 2, None);
        assert_eq!(sink.wave_count(), 0);
        assert!(sink.stats().is_empty());
    }

    #[test]
    fn counts_level_ignores_elapsed_time() {
        let mut sink = CountingSink::new(TelemetryLevel::Counts);
        sink.on_decorator_batch("env", 1, Some(Duration::from_secs(5)));
        assert_eq!(sink.stats()["env"].total_time, Duration::ZERO);
    }

    #[test]
    fn timing_level_accumulates_elapsed_time() {
        let mut sink = CountingSink::new(TelemetryLevel::Timing);
        sink.on_decorator_batch("env", 1, Some(Duration::from_millis(10)));
        sink.on_decorator_batch("env", 1, Some(Duration::from_millis(5)));
        assert_eq!(sink.stats()["env"].total_time, Duration::from_millis(15));
    }
}
