//! Idle shutdown for a provider whose work has dried up.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Counts running requests and live transfers, and expires once nothing has
/// been running for `timeout`. Without a timeout it never expires.
pub struct InactivityTimer {
    timeout: Option<Duration>,
    running: watch::Sender<usize>,
}

impl InactivityTimer {
    pub fn new(timeout: Option<Duration>) -> Arc<Self> {
        let (running, _) = watch::channel(0);
        Arc::new(Self { timeout, running })
    }

    /// Record the start of some work. It ends when the guard is dropped.
    pub fn start(self: &Arc<Self>) -> Activity {
        self.running.send_modify(|n| *n += 1);
        Activity {
            timer: Arc::clone(self),
        }
    }

    pub fn running(&self) -> usize {
        *self.running.borrow()
    }

    /// Resolves once the count has stayed at zero for the whole timeout.
    /// Any activity in the meantime restarts the wait.
    pub async fn expired(&self) {
        let Some(timeout) = self.timeout else {
            return std::future::pending().await;
        };
        let mut running = self.running.subscribe();
        loop {
            if *running.borrow_and_update() > 0 {
                let _ = running.changed().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if *running.borrow() == 0 {
                        return;
                    }
                }
                _ = running.changed() => {}
            }
        }
    }
}

/// Guard for one unit of work counted by an [`InactivityTimer`].
pub struct Activity {
    timer: Arc<InactivityTimer>,
}

impl Drop for Activity {
    fn drop(&mut self) {
        self.timer.running.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expires_only_after_the_last_activity_ends() {
        let timer = InactivityTimer::new(Some(Duration::from_millis(200)));
        let work = timer.start();
        let other = timer.start();
        assert_eq!(timer.running(), 2);

        let expired = tokio::spawn({
            let timer = Arc::clone(&timer);
            async move { timer.expired().await }
        });
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!expired.is_finished());

        drop(work);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!expired.is_finished());

        drop(other);
        assert_eq!(timer.running(), 0);
        tokio::time::timeout(Duration::from_secs(5), expired)
            .await
            .expect("timer expires once idle")
            .unwrap();
    }

    #[tokio::test]
    async fn new_activity_restarts_the_wait() {
        let timer = InactivityTimer::new(Some(Duration::from_millis(300)));
        let expired = tokio::spawn({
            let timer = Arc::clone(&timer);
            async move { timer.expired().await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(timer.start());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!expired.is_finished());
        tokio::time::timeout(Duration::from_secs(5), expired)
            .await
            .expect("timer expires once idle")
            .unwrap();
    }

    #[tokio::test]
    async fn without_a_timeout_it_never_expires() {
        let timer = InactivityTimer::new(None);
        let outcome = tokio::time::timeout(Duration::from_millis(200), timer.expired()).await;
        assert!(outcome.is_err());
    }
}
