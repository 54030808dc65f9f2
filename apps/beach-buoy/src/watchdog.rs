use std::future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep_until, Instant, Sleep};

/// Resettable countdown that keeps firing once per period while enabled.
///
/// The watchdog does not spawn anything; its owner awaits [`Watchdog::expired`]
/// from its own loop, so expiries are serialized with everything else the
/// owner does.
pub struct Watchdog {
    period: Option<Duration>,
    sleep: Pin<Box<Sleep>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            period: None,
            sleep: Box::pin(sleep_until(Instant::now())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.period.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Arm for `period` starting now. Enabling an armed watchdog replaces the
    /// period and restarts the countdown; there is only ever one timer.
    pub fn enable(&mut self, period: Duration) {
        self.period = Some(period);
        self.rearm();
    }

    /// Restart the full countdown. No-op while disabled.
    pub fn reset(&mut self) {
        if self.period.is_some() {
            self.rearm();
        }
    }

    pub fn disable(&mut self) {
        self.period = None;
    }

    /// Resolves when the countdown runs out, already re-armed for the next
    /// period. Never resolves while disabled.
    ///
    /// Cancel safe: dropping the future before it resolves leaves the
    /// deadline untouched.
    pub async fn expired(&mut self) {
        let Some(period) = self.period else {
            return future::pending().await;
        };
        self.sleep.as_mut().await;
        self.sleep.as_mut().reset(Instant::now() + period);
    }

    fn rearm(&mut self) {
        if let Some(period) = self.period {
            self.sleep.as_mut().reset(Instant::now() + period);
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}
