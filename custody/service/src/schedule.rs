// Copyright (c) 2024 The Botho Foundation

//! Recurring background tasks.
//!
//! A [`RecurringTask`] fires a callback every `period` plus a random jitter
//! until the shutdown signal arrives. The staking job uses
//! [`RecurringTask::daily_after_rollover`] to run shortly after UTC midnight.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::{future::Future, time::Duration};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Shutdown signal shared by every loop in the process.
pub type ShutdownSignal = broadcast::Receiver<()>;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RecurringTask {
    name: &'static str,
    period: Duration,
    jitter: Duration,
    initial_delay: Duration,
}

impl RecurringTask {
    /// A task that first fires after one period.
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            jitter: Duration::ZERO,
            initial_delay: period,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Fires `offset` after the next UTC midnight, then every 24 hours.
    pub fn daily_after_rollover(name: &'static str, now: DateTime<Utc>, offset: Duration) -> Self {
        Self::new(name, DAY).with_initial_delay(until_next_rollover(now, offset))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Delay before the next firing, with jitter drawn from `rng`.
    pub fn next_delay_with<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.jitter.is_zero() {
            return self.period;
        }
        let jitter_ms = self.jitter.as_millis() as u64;
        self.period + Duration::from_millis(rng.gen_range(0..=jitter_ms))
    }

    fn next_delay(&self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Run `tick` on schedule until shutdown.
    pub async fn run<F, Fut>(self, mut shutdown: ShutdownSignal, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(
            task = self.name,
            "Scheduled task starting (first run in {:?}, period {:?})",
            self.initial_delay,
            self.period
        );

        let mut delay = self.initial_delay;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(task = self.name, "Scheduled task shutting down");
                    return;
                }
                _ = tokio::time::sleep(delay) => {
                    debug!(task = self.name, "Scheduled task firing");
                    tick().await;
                }
            }
            delay = self.next_delay();
        }
    }
}

/// Time from `now` until `offset` past the next UTC midnight.
///
/// If `now` falls between midnight and midnight + `offset`, today's slot is
/// still ahead and is returned.
pub fn until_next_rollover(now: DateTime<Utc>, offset: Duration) -> Duration {
    let offset = ChronoDuration::from_std(offset).unwrap_or_else(|_| ChronoDuration::zero());
    let today = now.date_naive();
    let today_slot = today.and_hms_opt(0, 0, 0).map(|t| t.and_utc() + offset);

    let next = match today_slot {
        Some(slot) if slot > now => slot,
        Some(slot) => slot + ChronoDuration::days(1),
        None => now + ChronoDuration::days(1),
    };

    (next - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[test]
    fn test_until_next_rollover() {
        let offset = Duration::from_secs(300);

        let evening = Utc.with_ymd_and_hms(2024, 1, 10, 23, 0, 0).unwrap();
        assert_eq!(
            until_next_rollover(evening, offset),
            Duration::from_secs(60 * 60 + 300)
        );

        let just_after_midnight = Utc.with_ymd_and_hms(2024, 1, 11, 0, 1, 0).unwrap();
        assert_eq!(
            until_next_rollover(just_after_midnight, offset),
            Duration::from_secs(240)
        );

        let after_slot = Utc.with_ymd_and_hms(2024, 1, 11, 0, 10, 0).unwrap();
        assert_eq!(
            until_next_rollover(after_slot, offset),
            DAY - Duration::from_secs(300)
        );
    }

    #[test]
    fn test_jitter_bounds() {
        let task = RecurringTask::new("reload", Duration::from_secs(60))
            .with_jitter(Duration::from_secs(5));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let delay = task.next_delay_with(&mut rng);
            assert!(delay >= Duration::from_secs(60));
            assert!(delay <= Duration::from_secs(65));
        }

        let plain = RecurringTask::new("plain", Duration::from_secs(60));
        assert_eq!(plain.next_delay_with(&mut rng), Duration::from_secs(60));
    }

    #[test]
    fn test_daily_task_initial_delay() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let task = RecurringTask::daily_after_rollover("staking", now, Duration::ZERO);
        assert_eq!(task.initial_delay(), Duration::from_secs(12 * 60 * 60));
        assert_eq!(task.name(), "staking");
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();

        let task = RecurringTask::new("tick", Duration::from_millis(5))
            .with_initial_delay(Duration::ZERO);
        let handle = tokio::spawn(task.run(rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
