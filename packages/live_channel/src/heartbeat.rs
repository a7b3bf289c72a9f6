//! Liveness probe timer.
//!
//! One recurring timer per open connection. The monitor only decides *when*
//! a probe is due; the controller writes it, after checking that the socket
//! is still there.

use std::future;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// What the controller should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    /// Send the probe.
    Probe,
    /// Nothing has arrived from the peer for longer than the ack timeout.
    Stale { silent_for: Duration },
}

pub struct HeartbeatMonitor {
    period: Option<Duration>,
    ack_timeout: Option<Duration>,
    ticker: Option<Interval>,
    last_inbound: Instant,
}

impl HeartbeatMonitor {
    /// A zero `period` disables the heartbeat; a zero `ack_timeout` disables
    /// stale detection.
    pub fn new(period: Duration, ack_timeout: Duration) -> Self {
        Self {
            period: (!period.is_zero()).then_some(period),
            ack_timeout: (!ack_timeout.is_zero()).then_some(ack_timeout),
            ticker: None,
            last_inbound: Instant::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.period.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Arm the timer. The first probe is due one full period after open.
    pub fn start(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        let now = Instant::now();
        let mut ticker = tokio::time::interval_at(now + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.last_inbound = now;
    }

    /// Disarm the timer. Returns whether it was running.
    pub fn stop(&mut self) -> bool {
        self.ticker.take().is_some()
    }

    /// Any frame from the peer counts as proof of life.
    pub fn record_inbound(&mut self) {
        self.last_inbound = Instant::now();
    }

    /// Resolves at the next tick; pends forever while stopped. Cancel-safe.
    pub async fn tick(&mut self) -> HeartbeatTick {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
                self.evaluate()
            }
            None => future::pending().await,
        }
    }

    fn evaluate(&self) -> HeartbeatTick {
        let silent_for = self.last_inbound.elapsed();
        match self.ack_timeout {
            Some(timeout) if silent_for > timeout => HeartbeatTick::Stale { silent_for },
            _ => HeartbeatTick::Probe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_tick_after_one_period() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(30), Duration::ZERO);
        hb.start();
        let start = Instant::now();
        assert_eq!(hb.tick().await, HeartbeatTick::Probe);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(hb.tick().await, HeartbeatTick::Probe);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_disables() {
        let mut hb = HeartbeatMonitor::new(Duration::ZERO, Duration::ZERO);
        assert!(!hb.is_enabled());
        hb.start();
        assert!(!hb.is_running());
        let tick = tokio::time::timeout(Duration::from_secs(3600), hb.tick()).await;
        assert!(tick.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_monitor_never_ticks() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(1), Duration::ZERO);
        hb.start();
        assert!(hb.stop());
        assert!(!hb.stop());
        let tick = tokio::time::timeout(Duration::from_secs(10), hb.tick()).await;
        assert!(tick.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_timer() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(10), Duration::ZERO);
        hb.start();
        tokio::time::advance(Duration::from_secs(6)).await;
        hb.start();
        let start = Instant::now();
        hb.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_stale() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(10), Duration::from_secs(15));
        hb.start();
        assert_eq!(hb.tick().await, HeartbeatTick::Probe);
        assert!(matches!(hb.tick().await, HeartbeatTick::Stale { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_keeps_connection_fresh() {
        let mut hb = HeartbeatMonitor::new(Duration::from_secs(10), Duration::from_secs(15));
        hb.start();
        for _ in 0..5 {
            assert_eq!(hb.tick().await, HeartbeatTick::Probe);
            hb.record_inbound();
        }
    }
}
