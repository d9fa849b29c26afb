//! Idle watchdog: closes a connection that stays silent for a whole window.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Countdown of silent ticks remaining before a connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    start: u32,
    remaining: u32,
}

impl Countdown {
    pub fn new(ticks: u32) -> Self {
        Self {
            start: ticks,
            remaining: ticks,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_expired(&self) -> bool {
        self.remaining == 0
    }

    /// Count one silent tick. Returns `true` once the countdown hits zero.
    pub fn tick(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.is_expired()
    }

    pub fn reset(&mut self) {
        self.remaining = self.start;
    }
}

/// Sender side of a watchdog's activity signal.
#[derive(Debug)]
pub struct Activity {
    tx: mpsc::Sender<()>,
}

impl Activity {
    /// Note that the peer sent something. Never waits; a reset that is
    /// already pending covers this one.
    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Resolves with `Ok(())` when the watchdog fires.
pub type Expired = oneshot::Receiver<()>;

/// Spawn a watchdog that fires after `ticks` silent periods of `period`.
///
/// Dropping the returned [`Activity`] stops the watchdog without firing.
pub fn spawn(ticks: u32, period: Duration) -> (Activity, Expired) {
    let (activity_tx, activity_rx) = mpsc::channel(1);
    let (expired_tx, expired_rx) = oneshot::channel();
    tokio::spawn(run(Countdown::new(ticks), period, activity_rx, expired_tx));
    (Activity { tx: activity_tx }, expired_rx)
}

async fn run(
    mut countdown: Countdown,
    period: Duration,
    mut activity: mpsc::Receiver<()>,
    expired: oneshot::Sender<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            biased;

            signal = activity.recv() => match signal {
                Some(()) => {
                    countdown.reset();
                    ticker.reset();
                }
                None => return,
            },
            _ = ticker.tick() => {
                tracing::trace!(remaining = countdown.remaining(), "Idle tick");
                if countdown.tick() {
                    tracing::debug!("Idle window exhausted");
                    let _ = expired.send(());
                    return;
                }
            }
        }
    }
}
