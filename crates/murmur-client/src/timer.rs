//! Elapsed-time counter for a connected call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use murmur_shared::constants::TIMER_TICK_MS;

/// Counts whole seconds since [`CallTimer::start`].
///
/// Elapsed time is measured against the tokio clock, so the count stays
/// exact even if a tick is delayed; the ticker only drives live updates.
pub struct CallTimer {
    started: Option<Instant>,
    stopped_at: Option<Instant>,
    ticks: Arc<watch::Sender<u64>>,
    ticker: Option<JoinHandle<()>>,
}

impl CallTimer {
    pub fn new() -> Self {
        let (ticks, _) = watch::channel(0);
        Self {
            started: None,
            stopped_at: None,
            ticks: Arc::new(ticks),
            ticker: None,
        }
    }

    /// Reset to zero and start counting.
    pub fn start(&mut self) {
        self.stop_ticker();
        let now = Instant::now();
        self.started = Some(now);
        self.stopped_at = None;
        self.ticks.send_replace(0);

        let ticks = self.ticks.clone();
        let period = Duration::from_millis(TIMER_TICK_MS);
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = interval_at(now + period, period);
            loop {
                interval.tick().await;
                ticks.send_replace(now.elapsed().as_secs());
            }
        }));
    }

    /// Halt counting, keeping the elapsed value.
    pub fn stop(&mut self) {
        self.stop_ticker();
        if self.started.is_some() && self.stopped_at.is_none() {
            self.stopped_at = Some(Instant::now());
            self.ticks.send_replace(self.elapsed_secs());
        }
    }

    /// Stop and zero.
    pub fn reset(&mut self) {
        self.stop_ticker();
        self.started = None;
        self.stopped_at = None;
        self.ticks.send_replace(0);
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some() && self.stopped_at.is_none()
    }

    pub fn elapsed_secs(&self) -> u64 {
        match self.started {
            Some(started) => {
                let end = self.stopped_at.unwrap_or_else(Instant::now);
                end.saturating_duration_since(started).as_secs()
            }
            None => 0,
        }
    }

    /// Live elapsed seconds, updated once per tick.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.ticks.subscribe()
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Default for CallTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_counts_whole_seconds() {
        let mut timer = CallTimer::new();
        let mut ticks = timer.subscribe();
        timer.start();

        sleep(Duration::from_millis(3500)).await;
        assert_eq!(timer.elapsed_secs(), 3);
        assert!(ticks.has_changed().unwrap());
        assert_eq!(*ticks.borrow_and_update(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_value() {
        let mut timer = CallTimer::new();
        timer.start();
        sleep(Duration::from_secs(4)).await;
        timer.stop();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(timer.elapsed_secs(), 4);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_resets_and_reset_zeroes() {
        let mut timer = CallTimer::new();
        timer.start();
        sleep(Duration::from_secs(7)).await;
        timer.start();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(timer.elapsed_secs(), 2);

        timer.reset();
        assert_eq!(timer.elapsed_secs(), 0);
        assert_eq!(*timer.subscribe().borrow(), 0);
    }

    #[tokio::test]
    async fn test_unstarted_timer_is_zero() {
        let mut timer = CallTimer::new();
        timer.stop();
        assert_eq!(timer.elapsed_secs(), 0);
    }
}
