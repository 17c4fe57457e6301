// SPDX-License-Identifier: GPL-3.0-or-later

//! Request pacing for the resolution service.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

/// Hands out request slots at least `interval` apart, in call order.
///
/// A caller only holds the lock long enough to reserve its slot, so one
/// slow request never stalls the queue behind it. When the service answers
/// with its throttling error, [`Throttle::cool_down`] pushes every slot not
/// yet reached behind a longer pause.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    cooldown: Duration,
    next_slot: Arc<Mutex<Option<Instant>>>,
}

impl Throttle {
    pub fn new(interval: Duration, cooldown: Duration) -> Self {
        Self {
            interval,
            cooldown,
            next_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait until this caller's slot comes up.
    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |next| next.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        let now = Instant::now();
        if slot > now {
            tracing::trace!(target: "resolver", wait = ?(slot - now), "waiting for request slot");
            sleep_until(slot).await;
        }
    }

    /// The service said we are too fast: nobody goes before the cooldown ends.
    pub async fn cool_down(&self) {
        let resume_at = Instant::now() + self.cooldown;
        let mut next = self.next_slot.lock().await;
        *next = Some(next.map_or(resume_at, |next| next.max(resume_at)));
        tracing::debug!(target: "resolver", cooldown = ?self.cooldown, "resolution service throttled us");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The paused clock advances in whole timer ticks.
    fn assert_near(elapsed: Duration, expected: Duration) {
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "expected about {expected:?}, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slots_are_spaced_by_the_interval() {
        let throttle = Throttle::new(Duration::from_millis(100), Duration::from_secs(5));
        let start = Instant::now();

        throttle.wait_turn().await;
        assert_near(start.elapsed(), Duration::ZERO);
        throttle.wait_turn().await;
        assert_near(start.elapsed(), Duration::from_millis(100));
        throttle.wait_turn().await;
        assert_near(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_counts_towards_the_interval() {
        let throttle = Throttle::new(Duration::from_millis(100), Duration::from_secs(5));
        throttle.wait_turn().await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let before = Instant::now();
        throttle.wait_turn().await;
        assert_near(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_get_distinct_slots() {
        let throttle = Throttle::new(Duration::from_millis(100), Duration::from_secs(5));
        let start = Instant::now();

        let waits = (0..3).map(|_| {
            let throttle = throttle.clone();
            tokio::spawn(async move {
                throttle.wait_turn().await;
                start.elapsed()
            })
        });
        let mut elapsed = Vec::new();
        for wait in waits.collect::<Vec<_>>() {
            elapsed.push(wait.await.unwrap());
        }
        elapsed.sort();
        for (waited, expected) in elapsed.into_iter().zip([0, 100, 200]) {
            assert_near(waited, Duration::from_millis(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_delays_the_next_slot() {
        let throttle = Throttle::new(Duration::from_millis(100), Duration::from_secs(5));
        throttle.wait_turn().await;
        let start = Instant::now();

        throttle.cool_down().await;
        throttle.wait_turn().await;
        assert_near(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_waits() {
        let throttle = Throttle::new(Duration::ZERO, Duration::ZERO);
        let start = Instant::now();
        for _ in 0..5 {
            throttle.wait_turn().await;
        }
        assert_near(start.elapsed(), Duration::ZERO);
    }
}
