use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep_until;

/// Process-wide throttle on connect attempts: at most N sessions inside
/// the Connecting/Authenticating/Subscribing region at once, and
/// successive entries spaced apart. This is the mechanism that keeps a
/// mass-recovery event from turning into a rate-limit storm.
pub struct ConnectGate {
    semaphore: Arc<Semaphore>,
    spacing: Duration,
    last_entry: Mutex<Option<Instant>>,
}

impl ConnectGate {
    pub fn new(concurrency: usize, spacing: Duration) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            spacing,
            last_entry: Mutex::new(None),
        })
    }

    /// Wait for a connect slot. The permit must be held through the whole
    /// connect region and dropped once the session is live (or dead).
    pub async fn enter(&self) -> OwnedSemaphorePermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("connect gate semaphore never closes");

        // Spacing is enforced under the lock so two permit holders cannot
        // both schedule the same entry slot.
        let mut last = self.last_entry.lock().await;
        let now = Instant::now();
        let entry_at = match *last {
            Some(previous) if previous + self.spacing > now => previous + self.spacing,
            _ => now,
        };
        *last = Some(entry_at);
        drop(last);

        if entry_at > now {
            sleep_until(tokio::time::Instant::from_std(entry_at)).await;
        }
        permit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn entries_are_spaced_and_bounded() {
        let gate = ConnectGate::new(2, Duration::from_millis(50));
        let in_region = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let entries = Arc::new(Mutex::new(Vec::<Instant>::new()));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let gate = gate.clone();
            let in_region = in_region.clone();
            let max_seen = max_seen.clone();
            let entries = entries.clone();
            handles.push(tokio::spawn(async move {
                let permit = gate.enter().await;
                entries.lock().await.push(Instant::now());
                let current = in_region.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_region.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Never more than the configured concurrency inside the region.
        assert!(max_seen.load(Ordering::SeqCst) <= 2);

        // Successive entries at least the spacing apart (scheduling slack
        // only ever pushes them later).
        let mut times = entries.lock().await.clone();
        times.sort();
        for pair in times.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(45), "gap was {:?}", gap);
        }
    }
}
