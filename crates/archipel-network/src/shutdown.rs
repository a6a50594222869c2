//! Process-wide cooperative stop flag

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Granularity at which sleeping loops re-check the flag
const TICK: Duration = Duration::from_millis(100);

/// Stop signal shared by every background loop.
///
/// Loops check it at the top of each iteration; nothing is interrupted
/// mid-operation.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    stopped: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short ticks.
    ///
    /// Returns `false` as soon as the signal is observed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(TICK.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_signal() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_observes_signal() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.trigger();
        });

        let started = tokio::time::Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(60)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_clones_share_state() {
        let a = Shutdown::new();
        let b = a.clone();
        assert!(!b.is_triggered());
        a.trigger();
        assert!(b.is_triggered());
    }
}
