//! Per-connection admission control.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Token bucket fed by a background refill task.
///
/// The bucket starts full (`burst` tokens) and refills one token every
/// `1/rate` seconds. A limiter created with `rate == 0` hands out tokens
/// without waiting. Dropping the limiter stops the refill task.
#[derive(Debug)]
pub struct RateLimiter {
    tokens: Option<mpsc::Receiver<()>>,
    refill: Option<JoinHandle<()>>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: usize) -> Self {
        if rate <= 0.0 {
            return Self {
                tokens: None,
                refill: None,
            };
        }
        let (tx, rx) = mpsc::channel(burst.max(1));
        for _ in 0..burst {
            let _ = tx.try_send(());
        }
        let period = Duration::from_secs_f64(1.0 / rate);
        let refill = tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if tx.send(()).await.is_err() {
                    return;
                }
            }
        });
        Self {
            tokens: Some(rx),
            refill: Some(refill),
        }
    }

    /// Wait for the next token. Returns false once the bucket has shut down.
    pub async fn acquire(&mut self) -> bool {
        match &mut self.tokens {
            None => true,
            Some(rx) => rx.recv().await.is_some(),
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self.refill.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_rate_is_unlimited() {
        let mut lim = RateLimiter::new(0.0, 0);
        for _ in 0..100 {
            assert!(lim.acquire().await);
        }
    }

    #[tokio::test]
    async fn burst_tokens_are_immediately_available() {
        let mut lim = RateLimiter::new(1.0, 3);
        for _ in 0..3 {
            let token = tokio::time::timeout(Duration::from_millis(50), lim.acquire())
                .await
                .expect("token should be available without waiting");
            assert!(token);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_paced_by_rate() {
        let mut lim = RateLimiter::new(10.0, 1);
        assert!(lim.acquire().await);
        let start = tokio::time::Instant::now();
        assert!(lim.acquire().await);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn refill_task_exits_when_receiver_is_gone() {
        let mut lim = RateLimiter::new(50.0, 1);
        let task = lim.refill.take().unwrap();
        drop(lim);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
