//! services/client/src/session/tasks.rs
//!
//! Named background tasks owned by a session. Each task gets its own
//! `CancellationToken`; spawning under a name that is already running cancels the
//! previous task first.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const TICK: &str = "tick";
pub const AUTHORITY_BROADCAST: &str = "authority-broadcast";
pub const HEARTBEAT: &str = "heartbeat";
pub const PRESENCE: &str = "presence";
pub const USER_SWEEP: &str = "user-sweep";
pub const GROUP_SWEEP: &str = "group-sweep";
pub const POLL: &str = "poll";
pub const CHANNEL: &str = "channel";
pub const STORE_CHANGES: &str = "store-changes";
pub const PUBLIC_REFRESH: &str = "public-group-refresh";
pub const AUTH_WATCH: &str = "auth-watch";

struct Task {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskSet {
    tasks: Mutex<HashMap<&'static str, Task>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn spawn<F, Fut>(&self, name: &'static str, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(make(token.clone()));
        let previous = self.tasks.lock().await.insert(name, Task { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        debug!(task = name, "Scheduled task started.");
    }

    /// Cancels one task. The task observes the token at its next await point.
    pub async fn cancel(&self, name: &str) -> bool {
        match self.tasks.lock().await.remove(name) {
            Some(task) => {
                task.token.cancel();
                debug!(task = name, "Scheduled task cancelled.");
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        let drained: Vec<_> = self.tasks.lock().await.drain().collect();
        for (name, task) in drained {
            task.token.cancel();
            debug!(task = name, "Scheduled task cancelled.");
        }
    }

    #[cfg(test)]
    pub(crate) async fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(name)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tasks.lock().await.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Runs `step` every `period` until cancelled. The first run happens one period in.
pub async fn every<F, Fut>(token: CancellationToken, period: Duration, mut step: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => step().await,
        }
    }
}

/// Sleeps unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn periodic_task_stops_when_cancelled() {
        let tasks = TaskSet::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        tasks
            .spawn(TICK, move |token| async move {
                every(token, Duration::from_secs(1), || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await
            })
            .await;

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        assert!(tasks.cancel(TICK).await);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(!tasks.is_running(TICK).await);
    }

    #[tokio::test(start_paused = true)]
    async fn respawning_a_name_replaces_the_old_task() {
        let tasks = TaskSet::new();
        let first = CancellationToken::new();
        let observed = first.clone();

        tasks
            .spawn(POLL, move |token| async move {
                token.cancelled().await;
                observed.cancel();
            })
            .await;
        tasks.spawn(POLL, |token| async move { token.cancelled().await }).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(first.is_cancelled());
        assert_eq!(tasks.names().await, vec![POLL]);

        tasks.cancel_all().await;
        assert!(tasks.names().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_or_cancel_reports_cancellation() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(&token, Duration::from_secs(1)).await);
        token.cancel();
        assert!(!sleep_or_cancel(&token, Duration::from_secs(60)).await);
    }
}
