//! Send-budget counter used on both ends of a flow-controlled stream.
//!
//! A [`Credit`] is written by two tasks: the sender consumes it, the task
//! reading `CONN_BUF_SIZE` frames replaces it. The counter has its own lock,
//! independent of any session table lock, and a [`Notify`] so a sender with
//! an empty budget sleeps instead of polling.

use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug)]
pub struct Credit {
    remaining: Mutex<usize>,
    notify: Notify,
}

impl Credit {
    pub fn new(initial: usize) -> Self {
        Self {
            remaining: Mutex::new(initial),
            notify: Notify::new(),
        }
    }

    /// Current budget.
    pub fn remaining(&self) -> usize {
        *self.lock()
    }

    /// Wait until the budget is non-zero and return it. Does not consume.
    pub async fn available(&self) -> usize {
        loop {
            // Registered before the check so a concurrent `set` cannot be missed.
            let notified = self.notify.notified();
            let remaining = self.remaining();
            if remaining > 0 {
                return remaining;
            }
            notified.await;
        }
    }

    /// Subtract bytes that were actually sent.
    pub fn consume(&self, n: usize) {
        let mut remaining = self.lock();
        *remaining = remaining.saturating_sub(n);
    }

    /// Replace the budget (`CONN_BUF_SIZE` has set semantics) and wake senders.
    pub fn set(&self, n: usize) {
        *self.lock() = n;
        self.notify.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.remaining
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_consume_saturates() {
        let credit = Credit::new(10);
        credit.consume(4);
        assert_eq!(credit.remaining(), 6);
        credit.consume(100);
        assert_eq!(credit.remaining(), 0);
    }

    #[tokio::test]
    async fn test_available_returns_immediately_with_budget() {
        let credit = Credit::new(3);
        assert_eq!(credit.available().await, 3);
        assert_eq!(credit.remaining(), 3);
    }

    #[tokio::test]
    async fn test_available_waits_for_set() {
        let credit = Arc::new(Credit::new(0));
        let waiter = {
            let credit = Arc::clone(&credit);
            tokio::spawn(async move { credit.available().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        credit.set(512);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, 512);
    }
}
