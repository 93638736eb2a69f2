//! Latency tracking for peer-to-peer sync
//!
//! Measures round-trip time (RTT) to the remote peer using `rtt-ping`/`rtt-pong`
//! messages and derives the one-way latency and clock offset used by drift
//! correction.
//!
//! One-way latency is half the round trip, so asymmetric links are estimated
//! as if they were symmetric.
//!
//! The smoothed RTT is an exponential moving average. A single sample moves it
//! by at most [`MAX_STEP_FRACTION`] of `max(smoothed, MIN_STEP_BASE_MS)`, so one
//! outlier cannot drag the estimate arbitrarily far. The clock offset keeps the
//! most recent sample.

use std::collections::HashMap;

use tracing::debug;

/// Default upper bound for a plausible round trip (ms)
pub const DEFAULT_MAX_ROUND_TRIP_MS: u64 = 10_000;

/// Pending pings older than this are forgotten (ms)
const PENDING_PING_TTL_MS: u64 = 10_000;

/// Samples that use the faster warm-up alpha
const WARMUP_SAMPLES: u32 = 5;

/// EMA smoothing factor while warming up
const WARMUP_ALPHA: f64 = 0.4;

/// EMA smoothing factor once warmed up
const EMA_ALPHA: f64 = 0.2;

/// Largest step a single sample may apply, as a fraction of the current estimate
const MAX_STEP_FRACTION: f64 = 0.5;

/// Floor for the step bound so a near-zero estimate can still grow (ms)
const MIN_STEP_BASE_MS: f64 = 20.0;

/// One ping/pong measurement, all times in ms since epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    /// Our clock when the ping was sent
    pub send_time_ms: u64,
    /// Remote clock when the pong was produced
    pub echo_time_ms: u64,
    /// Our clock when the pong arrived
    pub receive_time_ms: u64,
}

impl RttSample {
    pub fn round_trip_ms(&self) -> i64 {
        self.receive_time_ms as i64 - self.send_time_ms as i64
    }

    /// Estimated one-way latency (RTT / 2)
    pub fn one_way_latency_ms(&self) -> f64 {
        self.round_trip_ms() as f64 / 2.0
    }

    /// How far the remote clock runs ahead of ours (negative = behind)
    pub fn clock_offset_ms(&self) -> f64 {
        self.echo_time_ms as f64 - (self.send_time_ms as f64 + self.one_way_latency_ms())
    }
}

/// Running estimator state for one peer link
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EstimatorState {
    /// Smoothed round trip, `None` until a valid sample arrived
    pub smoothed_rtt_ms: Option<f64>,
    /// Latest clock offset estimate
    pub clock_offset_ms: Option<f64>,
    /// Number of accepted samples
    pub sample_count: u32,
}

/// Tracks latency and clock offset to the remote peer
#[derive(Debug)]
pub struct LatencyEstimator {
    state: EstimatorState,
    /// Outstanding pings keyed by their `ts`, value is our send time
    pending_pings: HashMap<u64, u64>,
    max_round_trip_ms: u64,
}

impl LatencyEstimator {
    pub fn new() -> Self {
        Self::with_max_round_trip(DEFAULT_MAX_ROUND_TRIP_MS)
    }

    pub fn with_max_round_trip(max_round_trip_ms: u64) -> Self {
        Self {
            state: EstimatorState::default(),
            pending_pings: HashMap::new(),
            max_round_trip_ms,
        }
    }

    /// Clear all state (on reconnect or teardown)
    pub fn clear(&mut self) {
        self.state = EstimatorState::default();
        self.pending_pings.clear();
    }

    /// Record an outgoing ping. Returns the `ts` to put in the `rtt-ping`.
    pub fn create_ping(&mut self, now_ms: u64) -> u64 {
        self.pending_pings
            .retain(|_, sent_at| now_ms.saturating_sub(*sent_at) < PENDING_PING_TTL_MS);
        self.pending_pings.insert(now_ms, now_ms);
        now_ms
    }

    /// Handle a pong. Returns the accepted sample, or `None` if it was discarded.
    pub fn handle_pong(&mut self, ts: u64, ts2: u64, now_ms: u64) -> Option<RttSample> {
        let Some(sent_at) = self.pending_pings.remove(&ts) else {
            debug!("Discarding pong for unknown ping ts={}", ts);
            return None;
        };

        let sample = RttSample {
            send_time_ms: sent_at,
            echo_time_ms: ts2,
            receive_time_ms: now_ms,
        };

        let rtt = sample.round_trip_ms();
        if rtt < 0 || rtt as u64 > self.max_round_trip_ms {
            debug!("Discarding implausible RTT sample: {}ms", rtt);
            return None;
        }

        self.record(&sample);

        debug!(
            "Latency: RTT={}ms, smoothed={:.1}ms, one-way={:.1}ms, offset={:+.1}ms",
            rtt,
            self.state.smoothed_rtt_ms.unwrap_or_default(),
            self.one_way_latency_ms().unwrap_or_default(),
            sample.clock_offset_ms()
        );

        Some(sample)
    }

    fn record(&mut self, sample: &RttSample) {
        let rtt = sample.round_trip_ms() as f64;

        let smoothed = match self.state.smoothed_rtt_ms {
            None => rtt,
            Some(current) => {
                let alpha = if self.state.sample_count < WARMUP_SAMPLES {
                    WARMUP_ALPHA
                } else {
                    EMA_ALPHA
                };
                let max_step = current.max(MIN_STEP_BASE_MS) * MAX_STEP_FRACTION;
                let step = (alpha * (rtt - current)).clamp(-max_step, max_step);
                current + step
            }
        };

        self.state.smoothed_rtt_ms = Some(smoothed.max(0.0));
        self.state.clock_offset_ms = Some(sample.clock_offset_ms());
        self.state.sample_count = self.state.sample_count.saturating_add(1);
    }

    pub fn state(&self) -> EstimatorState {
        self.state
    }

    /// Smoothed round trip, `None` while unknown
    pub fn smoothed_rtt_ms(&self) -> Option<f64> {
        self.state.smoothed_rtt_ms
    }

    /// Estimated one-way latency, `None` while unknown
    pub fn one_way_latency_ms(&self) -> Option<f64> {
        self.state.smoothed_rtt_ms.map(|rtt| rtt / 2.0)
    }

    pub fn clock_offset_ms(&self) -> Option<f64> {
        self.state.clock_offset_ms
    }

    /// Latency to add when compensating a position, zero while unknown
    pub fn compensation_seconds(&self) -> f64 {
        self.one_way_latency_ms().unwrap_or(0.0) / 1000.0
    }

    pub fn pending_ping_count(&self) -> usize {
        self.pending_pings.len()
    }
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self::new()
    }
}
