//! Multi-sink synchronization
//!
//! A process-wide clock keeps registered sinks dispatching against a common
//! playback timestamp: a reusable generation-counted barrier aligns their
//! dispatch instants, and per-sink rate adjustments (advisory, within ±1%)
//! feed back into the timeshift release timing rather than resampling the
//! output path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use sr_core::SinkTimingReport;

use crate::timeshift::{TimeshiftCommand, TimeshiftHandle};

/// Samples of timestamp error folded into one rate decision.
const RATE_WINDOW_SAMPLES: f64 = 48_000.0;

/// Rate adjustment bounds.
const RATE_MIN: f64 = 0.99;
const RATE_MAX: f64 = 1.01;

/// Ignore trims smaller than this, in seconds.
const TRIM_EPSILON: f64 = 1e-5;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncStats {
    pub active_sinks: usize,
    pub current_playback_timestamp: u32,
    pub max_drift_ppm: f64,
    pub avg_barrier_wait_ms: f64,
    pub total_barrier_timeouts: u64,
}

struct SinkRecord {
    rtp_timestamp: u32,
    had_underrun: bool,
}

struct ClockState {
    sinks: HashMap<String, SinkRecord>,
    target_timestamp: u32,
    barrier_generation: u64,
    barrier_waiting: usize,
    total_barrier_timeouts: u64,
    barrier_wait_total: Duration,
    barrier_wait_count: u64,
    max_drift_ppm: f64,
}

struct ClockInner {
    state: Mutex<ClockState>,
    barrier: Condvar,
    enabled: AtomicBool,
}

/// The process-wide synchronization clock. Cloning shares the instance.
#[derive(Clone)]
pub struct GlobalSyncClock {
    inner: Arc<ClockInner>,
}

impl Default for GlobalSyncClock {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalSyncClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                state: Mutex::new(ClockState {
                    sinks: HashMap::new(),
                    target_timestamp: 0,
                    barrier_generation: 0,
                    barrier_waiting: 0,
                    total_barrier_timeouts: 0,
                    barrier_wait_total: Duration::ZERO,
                    barrier_wait_count: 0,
                    max_drift_ppm: 0.0,
                }),
                barrier: Condvar::new(),
                enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
        if !enabled {
            // Wake anyone parked on the barrier.
            let mut state = self.inner.state.lock();
            release_barrier(&mut state);
            self.inner.barrier.notify_all();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn register_sink(&self, sink_id: &str, initial_rtp_timestamp: u32) {
        let mut state = self.inner.state.lock();
        state.sinks.insert(
            sink_id.to_string(),
            SinkRecord {
                rtp_timestamp: initial_rtp_timestamp,
                had_underrun: false,
            },
        );
        recompute_target(&mut state);
        log::info!("sync clock: registered sink '{sink_id}' ({} active)", state.sinks.len());
    }

    pub fn unregister_sink(&self, sink_id: &str) {
        let mut state = self.inner.state.lock();
        if state.sinks.remove(sink_id).is_none() {
            return;
        }
        recompute_target(&mut state);
        // A departing sink must not strand the rest at the barrier.
        if !state.sinks.is_empty() && state.barrier_waiting >= state.sinks.len() {
            release_barrier(&mut state);
            self.inner.barrier.notify_all();
        } else if state.sinks.is_empty() {
            release_barrier(&mut state);
            self.inner.barrier.notify_all();
        }
        log::info!("sync clock: unregistered sink '{sink_id}' ({} active)", state.sinks.len());
    }

    /// Block until every registered sink has arrived, or the timeout
    /// elapses. Returns false on timeout.
    pub fn wait_for_dispatch_barrier(&self, sink_id: &str, timeout: Duration) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let started = Instant::now();
        let mut state = self.inner.state.lock();
        if !state.sinks.contains_key(sink_id) {
            return true;
        }
        if state.sinks.len() <= 1 {
            return true;
        }

        state.barrier_waiting += 1;
        if state.barrier_waiting >= state.sinks.len() {
            release_barrier(&mut state);
            record_wait(&mut state, started);
            drop(state);
            self.inner.barrier.notify_all();
            return true;
        }

        let generation = state.barrier_generation;
        let deadline = started + timeout;
        while state.barrier_generation == generation {
            let now = Instant::now();
            if now >= deadline {
                // Still in this generation: withdraw from the count.
                state.barrier_waiting = state.barrier_waiting.saturating_sub(1);
                state.total_barrier_timeouts += 1;
                record_wait(&mut state, started);
                return false;
            }
            self.inner.barrier.wait_for(&mut state, deadline - now);
        }
        record_wait(&mut state, started);
        true
    }

    /// Scalar in about [0.99, 1.01] nudging this sink toward the common
    /// playback timestamp.
    pub fn calculate_rate_adjustment(&self, sink_id: &str) -> f64 {
        let mut state = self.inner.state.lock();
        let target = state.target_timestamp;
        let Some(record) = state.sinks.get(sink_id) else {
            return 1.0;
        };
        let diff = target.wrapping_sub(record.rtp_timestamp) as i32 as f64;
        let rate = (1.0 + diff / RATE_WINDOW_SAMPLES).clamp(RATE_MIN, RATE_MAX);

        let drift_ppm = (rate - 1.0).abs() * 1e6;
        if drift_ppm > state.max_drift_ppm {
            state.max_drift_ppm = drift_ppm;
        }
        rate
    }

    /// Update a sink's record and advance the common target.
    pub fn report_sink_timing(&self, sink_id: &str, report: &SinkTimingReport) {
        let mut state = self.inner.state.lock();
        let Some(record) = state.sinks.get_mut(sink_id) else {
            return;
        };
        record.rtp_timestamp = report.rtp_timestamp_output;
        record.had_underrun = report.had_underrun;
        recompute_target(&mut state);
    }

    pub fn get_stats(&self) -> SyncStats {
        let state = self.inner.state.lock();
        let avg_wait = if state.barrier_wait_count > 0 {
            state.barrier_wait_total.as_secs_f64() * 1000.0 / state.barrier_wait_count as f64
        } else {
            0.0
        };
        SyncStats {
            active_sinks: state.sinks.len(),
            current_playback_timestamp: state.target_timestamp,
            max_drift_ppm: state.max_drift_ppm,
            avg_barrier_wait_ms: avg_wait,
            total_barrier_timeouts: state.total_barrier_timeouts,
        }
    }
}

fn release_barrier(state: &mut ClockState) {
    state.barrier_waiting = 0;
    state.barrier_generation = state.barrier_generation.wrapping_add(1);
}

fn record_wait(state: &mut ClockState, started: Instant) {
    state.barrier_wait_total += started.elapsed();
    state.barrier_wait_count += 1;
}

/// Common target: the mean of the registered sinks' timestamps, computed
/// against one sink as wrap reference so sequence wrap-around stays sound.
fn recompute_target(state: &mut ClockState) {
    let mut sinks = state.sinks.values();
    let Some(first) = sinks.next() else {
        return;
    };
    let reference = first.rtp_timestamp;
    let mut sum: i64 = 0;
    let mut count: i64 = 1;
    for record in sinks {
        sum += record.rtp_timestamp.wrapping_sub(reference) as i32 as i64;
        count += 1;
    }
    let mean_offset = (sum / count) as i32;
    state.target_timestamp = reference.wrapping_add(mean_offset as u32);
}

/// Per-sink view of the clock.
pub struct SinkSyncCoordinator {
    sink_id: String,
    clock: Option<GlobalSyncClock>,
    barrier_timeout: Duration,
    /// RTP timestamp advance per dispatched payload.
    samples_per_chunk: u32,
    chunk_duration_secs: f64,
    last_output_rtp_timestamp: u32,
    samples_output: u64,
    barrier_timeouts: u64,
    timeshift: Option<TimeshiftHandle>,
    /// Source instances feeding this sink; kept current by the manager.
    sources: Arc<Mutex<Vec<String>>>,
}

impl SinkSyncCoordinator {
    /// `clock = None` leaves the coordinator as a no-op shim.
    pub fn new(
        sink_id: impl Into<String>,
        clock: Option<GlobalSyncClock>,
        barrier_timeout: Duration,
        samples_per_chunk: u32,
        sample_rate: u32,
        timeshift: Option<TimeshiftHandle>,
    ) -> Self {
        let sink_id = sink_id.into();
        if let Some(clock) = &clock {
            clock.register_sink(&sink_id, 0);
        }
        Self {
            sink_id,
            clock,
            barrier_timeout,
            samples_per_chunk,
            chunk_duration_secs: samples_per_chunk as f64 / sample_rate.max(1) as f64,
            last_output_rtp_timestamp: 0,
            samples_output: 0,
            barrier_timeouts: 0,
            timeshift,
            sources: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared list the manager updates on connect/disconnect.
    pub fn sources_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sources)
    }

    pub fn barrier_timeouts(&self) -> u64 {
        self.barrier_timeouts
    }

    pub fn last_output_rtp_timestamp(&self) -> u32 {
        self.last_output_rtp_timestamp
    }

    /// Align this dispatch with the other synchronized sinks.
    ///
    /// Returns true iff no underrun was observed this cycle. The sink
    /// dispatches regardless of the outcome.
    pub fn coordinate_dispatch(&mut self, buffer_fill_percentage: f32, had_underrun: bool) -> bool {
        let Some(clock) = self.clock.clone() else {
            return true;
        };
        if !clock.is_enabled() {
            return true;
        }

        if !clock.wait_for_dispatch_barrier(&self.sink_id, self.barrier_timeout) {
            self.barrier_timeouts += 1;
            log::debug!(
                "sink '{}': barrier timeout #{}, dispatching anyway",
                self.sink_id,
                self.barrier_timeouts
            );
        }

        let rate = clock.calculate_rate_adjustment(&self.sink_id);
        if rate <= RATE_MIN || rate >= RATE_MAX {
            log::warn!("sink '{}': rate adjustment saturated at {rate:.4}", self.sink_id);
        }
        self.apply_rate_feedback(rate);

        let report = SinkTimingReport {
            samples_output: self.samples_output,
            rtp_timestamp_output: self.last_output_rtp_timestamp,
            dispatch_time: Instant::now(),
            had_underrun,
            buffer_fill_percentage,
        };
        clock.report_sink_timing(&self.sink_id, &report);

        self.last_output_rtp_timestamp = self
            .last_output_rtp_timestamp
            .wrapping_add(self.samples_per_chunk);
        self.samples_output += self.samples_per_chunk as u64;

        !had_underrun
    }

    /// Convert the advisory rate into a release-timing nudge for this
    /// sink's upstream sources.
    fn apply_rate_feedback(&self, rate: f64) {
        let Some(timeshift) = &self.timeshift else {
            return;
        };
        let delta_sec = (1.0 - rate) * self.chunk_duration_secs;
        if delta_sec.abs() < TRIM_EPSILON {
            return;
        }
        for instance_id in self.sources.lock().iter() {
            let _ = timeshift.send(TimeshiftCommand::AdjustTrim {
                instance_id: instance_id.clone(),
                delta_sec,
            });
        }
    }
}

impl Drop for SinkSyncCoordinator {
    fn drop(&mut self) {
        if let Some(clock) = &self.clock {
            clock.unregister_sink(&self.sink_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_sink_barrier_is_immediate() {
        let clock = GlobalSyncClock::new();
        clock.register_sink("a", 0);
        assert!(clock.wait_for_dispatch_barrier("a", Duration::from_millis(10)));
    }

    #[test]
    fn two_sinks_rendezvous() {
        let clock = GlobalSyncClock::new();
        clock.register_sink("a", 0);
        clock.register_sink("b", 0);

        let c2 = clock.clone();
        let handle = thread::spawn(move || c2.wait_for_dispatch_barrier("b", Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(30));
        assert!(clock.wait_for_dispatch_barrier("a", Duration::from_secs(2)));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn barrier_times_out_without_peer() {
        let clock = GlobalSyncClock::new();
        clock.register_sink("a", 0);
        clock.register_sink("b", 0);

        let started = Instant::now();
        assert!(!clock.wait_for_dispatch_barrier("a", Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(clock.get_stats().total_barrier_timeouts, 1);
    }

    #[test]
    fn unregister_releases_waiters() {
        let clock = GlobalSyncClock::new();
        clock.register_sink("a", 0);
        clock.register_sink("b", 0);

        let c2 = clock.clone();
        let handle = thread::spawn(move || c2.wait_for_dispatch_barrier("a", Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(30));
        clock.unregister_sink("b");
        assert!(handle.join().unwrap(), "waiter must unblock when the peer leaves");
    }

    #[test]
    fn rate_adjustment_counteracts_drift() {
        let clock = GlobalSyncClock::new();
        clock.register_sink("fast", 0);
        clock.register_sink("slow", 0);

        // The fast sink races ahead of the slow one.
        let report = |ts: u32| SinkTimingReport {
            samples_output: ts as u64,
            rtp_timestamp_output: ts,
            dispatch_time: Instant::now(),
            had_underrun: false,
            buffer_fill_percentage: 50.0,
        };
        for cycle in 1..=10u32 {
            clock.report_sink_timing("fast", &report(cycle * 302));
            clock.report_sink_timing("slow", &report(cycle * 288));
        }

        let fast_rate = clock.calculate_rate_adjustment("fast");
        let slow_rate = clock.calculate_rate_adjustment("slow");
        assert!(
            (RATE_MIN..1.0).contains(&fast_rate),
            "fast sink should slow down, got {fast_rate}"
        );
        assert!(
            (1.0..=RATE_MAX).contains(&slow_rate) && slow_rate > 1.0,
            "slow sink should speed up, got {slow_rate}"
        );
    }

    #[test]
    fn disabled_clock_skips_coordination() {
        let clock = GlobalSyncClock::new();
        clock.set_enabled(false);
        let mut coordinator = SinkSyncCoordinator::new(
            "a",
            Some(clock),
            Duration::from_millis(10),
            288,
            48_000,
            None,
        );
        assert!(coordinator.coordinate_dispatch(0.0, false));
        // Timestamp does not advance while coordination is off.
        assert_eq!(coordinator.last_output_rtp_timestamp(), 0);
    }

    #[test]
    fn coordinator_advances_timestamp_each_dispatch() {
        let clock = GlobalSyncClock::new();
        let mut coordinator = SinkSyncCoordinator::new(
            "a",
            Some(clock.clone()),
            Duration::from_millis(10),
            288,
            48_000,
            None,
        );
        for _ in 0..3 {
            assert!(coordinator.coordinate_dispatch(50.0, false));
        }
        assert_eq!(coordinator.last_output_rtp_timestamp(), 864);
        assert!(!coordinator.coordinate_dispatch(50.0, true));
    }
}
