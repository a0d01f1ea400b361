//! Transfer rate ceiling.
//!
//! `Fixed(0)` means unlimited. In adaptive mode a background sampler reads
//! host interface counters once per interval and sets the ceiling to half
//! of the observed send+receive rate, never below 1 KiB/s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sysinfo::Networks;
use tracing::{debug, info};

use lanshare_shared::constants::ADAPTIVE_FLOOR_BPS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthMode {
    /// Bytes per second, 0 = unlimited.
    Fixed(u64),
    Adaptive,
}

impl Default for BandwidthMode {
    fn default() -> Self {
        BandwidthMode::Fixed(0)
    }
}

pub struct BandwidthGovernor {
    mode: RwLock<BandwidthMode>,
    // 0 until the first sample arrives
    adaptive_ceiling: AtomicU64,
}

impl BandwidthGovernor {
    pub fn new(mode: BandwidthMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            adaptive_ceiling: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> BandwidthMode {
        self.mode.read().map(|m| *m).unwrap_or_default()
    }

    pub fn set_mode(&self, mode: BandwidthMode) {
        if let Ok(mut current) = self.mode.write() {
            *current = mode;
        }
        info!(mode = ?mode, "Bandwidth mode changed");
    }

    /// Current ceiling in bytes per second, `None` when unlimited.
    pub fn ceiling(&self) -> Option<u64> {
        match self.mode() {
            BandwidthMode::Fixed(0) => None,
            BandwidthMode::Fixed(limit) => Some(limit),
            BandwidthMode::Adaptive => match self.adaptive_ceiling.load(Ordering::Relaxed) {
                0 => None,
                limit => Some(limit),
            },
        }
    }

    /// Feed one interface sample: bytes received and sent during `window`.
    pub fn record_sample(&self, received: u64, transmitted: u64, window: Duration) {
        let secs = window.as_secs_f64().max(0.001);
        let rate = (received.saturating_add(transmitted)) as f64 / secs;
        let ceiling = ((rate / 2.0) as u64).max(ADAPTIVE_FLOOR_BPS);
        self.adaptive_ceiling.store(ceiling, Ordering::Relaxed);
        debug!(rate = rate as u64, ceiling, "Adaptive bandwidth sample");
    }

    pub fn throttle(self: &Arc<Self>) -> Throttle {
        Throttle {
            governor: self.clone(),
            started: Instant::now(),
            bytes: 0,
        }
    }
}

/// Pacing state for one stream.
pub struct Throttle {
    governor: Arc<BandwidthGovernor>,
    started: Instant,
    bytes: u64,
}

impl Throttle {
    /// Account for `n` more bytes and sleep until the average rate is back
    /// under the ceiling.
    pub async fn consume(&mut self, n: usize) {
        self.bytes += n as u64;
        let Some(limit) = self.governor.ceiling() else {
            return;
        };
        let due = Duration::from_secs_f64(self.bytes as f64 / limit as f64);
        let elapsed = self.started.elapsed();
        if due > elapsed {
            tokio::time::sleep(due - elapsed).await;
        }
    }
}

/// Sample host interface counters forever.
pub async fn run_adaptive_sampler(governor: Arc<BandwidthGovernor>, interval: Duration) {
    let mut networks = Networks::new_with_refreshed_list();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        networks.refresh();
        let (received, transmitted) = networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.received(), tx + data.transmitted())
            });
        governor.record_sample(received, transmitted, interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_zero_is_unlimited() {
        let g = BandwidthGovernor::new(BandwidthMode::Fixed(0));
        assert_eq!(g.ceiling(), None);
        g.set_mode(BandwidthMode::Fixed(4096));
        assert_eq!(g.ceiling(), Some(4096));
    }

    #[test]
    fn test_adaptive_halves_rate_with_floor() {
        let g = BandwidthGovernor::new(BandwidthMode::Adaptive);
        assert_eq!(g.ceiling(), None);

        g.record_sample(300_000, 100_000, Duration::from_secs(1));
        assert_eq!(g.ceiling(), Some(200_000));

        g.record_sample(10, 10, Duration::from_secs(1));
        assert_eq!(g.ceiling(), Some(ADAPTIVE_FLOOR_BPS));
    }

    #[tokio::test]
    async fn test_throttle_enforces_lower_bound() {
        let g = Arc::new(BandwidthGovernor::new(BandwidthMode::Fixed(64 * 1024)));
        let mut throttle = g.throttle();
        let start = Instant::now();
        for _ in 0..8 {
            throttle.consume(8 * 1024).await;
        }
        // 64 KiB at 64 KiB/s
        assert!(start.elapsed() >= Duration::from_millis(990));
    }
}
