//! Session-wide performance counters.
//!
//! One `Metrics` value per session, shared by reference into every
//! subsystem (no global singleton, so parallel tests and parallel sessions
//! stay independent). Latency windows are lock-free: writers bump an atomic
//! index and overwrite their slot; readers scan the window and tolerate
//! seeing a partially updated sample.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

const WINDOW: usize = 128;

/// Fixed-size sliding latency window. `record` is wait-free; the summary
/// reads are approximate by design.
pub struct LatencyWindow {
    samples: [AtomicU64; WINDOW],
    write_index: AtomicUsize,
    count: AtomicUsize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self {
            samples: std::array::from_fn(|_| AtomicU64::new(0)),
            write_index: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl LatencyWindow {
    pub fn record(&self, latency_ms: f64) {
        let idx = self.write_index.fetch_add(1, Ordering::Relaxed) % WINDOW;
        self.samples[idx].store(latency_ms.to_bits(), Ordering::Relaxed);
        let current = self.count.load(Ordering::Relaxed);
        if current < WINDOW {
            let _ = self.count.compare_exchange(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    pub fn summary(&self) -> LatencySummary {
        let count = self.count.load(Ordering::Relaxed).min(WINDOW);
        if count == 0 {
            return LatencySummary::default();
        }
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = 0.0f64;
        for slot in &self.samples[..count] {
            let v = f64::from_bits(slot.load(Ordering::Relaxed));
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        LatencySummary {
            avg_ms: sum / count as f64,
            min_ms: min,
            max_ms: max,
        }
    }

    pub fn reset(&self) {
        self.write_index.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct Metrics {
    decode_latency: LatencyWindow,
    render_latency: LatencyWindow,
    input_latency: LatencyWindow,
    network_latency: LatencyWindow,

    fps: AtomicU64,
    frames_decoded: AtomicU64,
    frames_dropped: AtomicU64,
    input_processed: AtomicU64,
    input_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    retransmits: AtomicU64,
    fec_recovered: AtomicU64,
    pending_bytes: AtomicI64,
    queue_depth: AtomicI64,
    pool_used: AtomicI64,
    pool_total: AtomicI64,
}

/// Point-in-time copy handed to subscribers on the 1 Hz tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub fps: u64,
    pub decode: LatencySummary,
    pub render: LatencySummary,
    pub input: LatencySummary,
    pub network: LatencySummary,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub input_processed: u64,
    pub input_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: u64,
    pub fec_recovered: u64,
    pub pending_bytes: i64,
    pub queue_depth: i64,
    pub pool_used: i64,
    pub pool_total: i64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_fps(&self, fps: u64) {
        self.fps.store(fps, Ordering::Relaxed);
    }

    pub fn report_decode_latency(&self, ms: f64) {
        self.decode_latency.record(ms);
    }

    pub fn report_render_latency(&self, ms: f64) {
        self.render_latency.record(ms);
    }

    pub fn report_input_latency(&self, ms: f64) {
        self.input_latency.record(ms);
    }

    pub fn report_network_latency(&self, ms: f64) {
        self.network_latency.record(ms);
    }

    pub fn report_frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_input_processed(&self) {
        self.input_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_input_dropped(&self) {
        self.input_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.store(bytes, Ordering::Relaxed);
    }

    pub fn report_bytes_received(&self, bytes: u64) {
        self.bytes_received.store(bytes, Ordering::Relaxed);
    }

    pub fn report_retransmits(&self, count: u64) {
        self.retransmits.store(count, Ordering::Relaxed);
    }

    pub fn report_fec_recovered(&self, count: u64) {
        self.fec_recovered.store(count, Ordering::Relaxed);
    }

    pub fn report_pending_bytes(&self, bytes: i64) {
        self.pending_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn report_queue_depth(&self, depth: i64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn report_pool_usage(&self, used: i64, total: i64) {
        self.pool_used.store(used, Ordering::Relaxed);
        self.pool_total.store(total, Ordering::Relaxed);
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fps: self.fps.load(Ordering::Relaxed),
            decode: self.decode_latency.summary(),
            render: self.render_latency.summary(),
            input: self.input_latency.summary(),
            network: self.network_latency.summary(),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            input_processed: self.input_processed.load(Ordering::Relaxed),
            input_dropped: self.input_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            fec_recovered: self.fec_recovered.load(Ordering::Relaxed),
            pending_bytes: self.pending_bytes.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            pool_used: self.pool_used.load(Ordering::Relaxed),
            pool_total: self.pool_total.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.decode_latency.reset();
        self.render_latency.reset();
        self.input_latency.reset();
        self.network_latency.reset();
        self.fps.store(0, Ordering::Relaxed);
        self.frames_decoded.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.input_processed.store(0, Ordering::Relaxed);
        self.input_dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_summary_tracks_extremes() {
        let w = LatencyWindow::default();
        for v in [4.0, 2.0, 9.0] {
            w.record(v);
        }
        let s = w.summary();
        assert_eq!(s.min_ms, 2.0);
        assert_eq!(s.max_ms, 9.0);
        assert!((s.avg_ms - 5.0).abs() < 1e-9);
    }

    #[test]
    fn window_wraps_after_capacity() {
        let w = LatencyWindow::default();
        for _ in 0..WINDOW {
            w.record(10.0);
        }
        // Overwrites the oldest slots; summary keeps reflecting the window.
        for _ in 0..16 {
            w.record(20.0);
        }
        let s = w.summary();
        assert!(s.avg_ms > 10.0 && s.avg_ms < 20.0);
    }

    #[test]
    fn snapshot_reflects_reports() {
        let m = Metrics::new();
        m.report_fps(60);
        m.report_frame_decoded();
        m.report_frame_dropped();
        m.report_pool_usage(3, 8);
        m.report_decode_latency(5.0);
        let s = m.snapshot();
        assert_eq!(s.fps, 60);
        assert_eq!(s.frames_decoded, 1);
        assert_eq!(s.frames_dropped, 1);
        assert_eq!(s.pool_used, 3);
        assert_eq!(s.pool_total, 8);
        assert_eq!(s.decode.avg_ms, 5.0);
    }
}
