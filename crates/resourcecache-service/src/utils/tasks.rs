use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawns background tasks and keeps count of the ones still running.
///
/// Clones share the same count.
#[derive(Clone, Debug)]
pub struct ActiveTasks {
    count: watch::Sender<usize>,
}

impl Default for ActiveTasks {
    fn default() -> Self {
        Self {
            count: watch::Sender::new(0),
        }
    }
}

impl ActiveTasks {
    /// Spawns `future` onto the runtime.
    ///
    /// The task stays counted until the future completes or is dropped, the latter also
    /// covers aborted tasks.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.count.send_modify(|count| *count += 1);
        let guard = TaskGuard {
            count: self.count.clone(),
        };

        tokio::spawn(async move {
            let _guard = guard;
            future.await;
        })
    }

    /// Number of spawned tasks that are still alive.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Waits until at most `count` tasks are alive, giving up after `timeout`.
    ///
    /// Returns whether the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let mut receiver = self.count.subscribe();
        let reached = receiver.wait_for(|current| *current <= count);
        // the sender lives in `self`, so `wait_for` can only finish by reaching the count
        matches!(tokio::time::timeout(timeout, reached).await, Ok(Ok(_)))
    }
}

/// Decrements the task count when dropped.
struct TaskGuard {
    count: watch::Sender<usize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count -= 1);
    }
}
