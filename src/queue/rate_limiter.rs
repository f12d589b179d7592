// Sliding-window rate limiter shared by every worker slot

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Allows at most `max` starts in any rolling `window`. A `max` of zero
/// disables limiting.
pub struct SlidingWindowLimiter {
    max: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            starts: Mutex::new(VecDeque::with_capacity(max)),
        }
    }

    /// Wait for a slot in the window and record it. The returned instant can
    /// be handed back to `refund` when the slot went unused.
    pub async fn acquire(&self) -> Instant {
        if self.max == 0 {
            return Instant::now();
        }

        loop {
            let wait = {
                let mut starts = self.starts.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = starts.front() {
                    if now.duration_since(oldest) >= self.window {
                        starts.pop_front();
                    } else {
                        break;
                    }
                }

                if starts.len() < self.max {
                    starts.push_back(now);
                    return now;
                }

                match starts.front() {
                    Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
                    None => Duration::ZERO,
                }
            };
            sleep(wait).await;
        }
    }

    pub async fn refund(&self, started: Instant) {
        if self.max == 0 {
            return;
        }
        let mut starts = self.starts.lock().await;
        if let Some(pos) = starts.iter().rposition(|at| *at == started) {
            starts.remove(pos);
        }
    }

    pub async fn in_window(&self) -> usize {
        let starts = self.starts.lock().await;
        let now = Instant::now();
        starts
            .iter()
            .filter(|at| now.duration_since(**at) < self.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_blocks_once_window_is_full() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(Instant::now(), start);

        limiter.acquire().await;
        assert!(Instant::now() >= start + Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_frees_the_slot() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();

        let permit = limiter.acquire().await;
        limiter.refund(permit).await;
        limiter.acquire().await;

        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.in_window().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_disables_limit() {
        let limiter = SlidingWindowLimiter::new(0, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert_eq!(Instant::now(), start);
    }
}
