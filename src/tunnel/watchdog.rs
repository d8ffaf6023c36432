//! Resettable inactivity timer.
//!
//! A task sleeps up to `timeout`, racing a kick notification. Each kick
//! restarts the sleep; if the sleep wins, the expiry handler runs once and
//! the task exits. Dropping the [`Watchdog`] cancels it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub struct Watchdog {
    kick: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Watchdog {
    pub fn spawn<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let kick = Arc::new(Notify::new());
        let kicked = Arc::clone(&kick);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        on_expire();
                        return;
                    }
                    () = kicked.notified() => {}
                }
            }
        });
        Self { kick, task }
    }

    /// Restart the countdown.
    pub fn kick(&self) {
        self.kick.notify_one();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        (fired, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_timeout() {
        let (fired, on_expire) = counter();
        let dog = Watchdog::spawn(Duration::from_secs(180), on_expire);

        tokio::time::sleep(Duration::from_secs(179)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(dog.task.is_finished());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn kicks_postpone_expiry() {
        let (fired, on_expire) = counter();
        let dog = Watchdog::spawn(Duration::from_secs(10), on_expire);

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(8)).await;
            dog.kick();
        }
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels() {
        let (fired, on_expire) = counter();
        let dog = Watchdog::spawn(Duration::from_secs(1), on_expire);
        drop(dog);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
