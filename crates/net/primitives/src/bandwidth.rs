//! Process-level bandwidth accounting.
//!
//! One meter is shared by every metered stream of a swarm. Totals grow
//! monotonically; per-second rates come from a window that a background
//! ticker resets. The ticker is started explicitly (it needs a running
//! runtime) and stops when asked to, or when every handle is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Counters {
    total_in: AtomicU64,
    total_out: AtomicU64,
    window_in: AtomicU64,
    window_out: AtomicU64,
    rate_in: AtomicU64,
    rate_out: AtomicU64,
}

/// Shared inbound/outbound byte counters with a 1 s rate window.
#[derive(Debug, Clone, Default)]
pub struct BandwidthMeter {
    counters: Arc<Counters>,
    ticker: Arc<Mutex<Option<CancellationToken>>>,
}

impl BandwidthMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A meter with the rate ticker already running. Requires a running
    /// tokio runtime.
    pub fn with_rate_ticker() -> Self {
        let meter = Self::new();
        meter.start_rate_ticker();
        meter
    }

    /// Start the rate ticker if it is not running. Requires a running
    /// tokio runtime; the task also exits on its own once every handle
    /// to this meter is dropped.
    pub fn start_rate_ticker(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let task_counters = Arc::downgrade(&self.counters);
        let task_token = token.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RATE_WINDOW);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(counters) = task_counters.upgrade() else { break };
                        let inbound = counters.window_in.swap(0, Ordering::Relaxed);
                        let outbound = counters.window_out.swap(0, Ordering::Relaxed);
                        counters.rate_in.store(inbound, Ordering::Relaxed);
                        counters.rate_out.store(outbound, Ordering::Relaxed);
                    }
                }
            }
        });
        *ticker = Some(token);
    }

    /// Cancel the rate ticker. Totals keep accumulating; the rate
    /// gauges freeze at their last value.
    pub fn stop_rate_ticker(&self) {
        if let Some(token) = self.ticker.lock().take() {
            token.cancel();
        }
    }

    pub fn record_inbound(&self, bytes: u64) {
        self.counters.total_in.fetch_add(bytes, Ordering::Relaxed);
        self.counters.window_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_outbound(&self, bytes: u64) {
        self.counters.total_out.fetch_add(bytes, Ordering::Relaxed);
        self.counters.window_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_inbound(&self) -> u64 {
        self.counters.total_in.load(Ordering::Relaxed)
    }

    pub fn total_outbound(&self) -> u64 {
        self.counters.total_out.load(Ordering::Relaxed)
    }

    /// Bytes received during the last completed rate window.
    pub fn inbound_rate(&self) -> u64 {
        self.counters.rate_in.load(Ordering::Relaxed)
    }

    pub fn outbound_rate(&self) -> u64 {
        self.counters.rate_out.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate() {
        let meter = BandwidthMeter::new();
        meter.record_inbound(10);
        meter.record_inbound(5);
        meter.record_outbound(3);
        assert_eq!(meter.total_inbound(), 15);
        assert_eq!(meter.total_outbound(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_window_resets() {
        let meter = BandwidthMeter::with_rate_ticker();
        meter.record_inbound(100);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(meter.inbound_rate(), 100);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(meter.inbound_rate(), 0);
        assert_eq!(meter.total_inbound(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_start_is_idempotent() {
        let meter = BandwidthMeter::new();
        meter.start_rate_ticker();
        meter.start_rate_ticker();
        meter.record_outbound(7);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(meter.outbound_rate(), 7);

        meter.stop_rate_ticker();
        meter.record_outbound(9);
        tokio::time::sleep(Duration::from_secs(2)).await;
        // Ticker stopped: the gauge keeps its last value.
        assert_eq!(meter.outbound_rate(), 7);
        assert_eq!(meter.total_outbound(), 16);
    }
}
