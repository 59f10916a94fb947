use std::future::Future;

use anyhow::Context;
use futures::future::BoxFuture;

/// Work a producer hands back: either already computed, or a future the
/// runner awaits. Callers of [`Task::run`] never see the difference.
pub enum Task<'a, T> {
    Ready(T),
    Pending(BoxFuture<'a, T>),
}

impl<'a, T> Task<'a, T> {
    pub fn ready(value: T) -> Self {
        Self::Ready(value)
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'a,
    {
        Self::Pending(Box::pin(future))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub async fn run(self) -> T {
        match self {
            Self::Ready(value) => value,
            Self::Pending(future) => future.await,
        }
    }
}

impl<T: Send + 'static> Task<'static, anyhow::Result<T>> {
    /// Run synchronous, possibly slow work on the blocking thread pool.
    pub fn blocking<F>(work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::pending(async move {
            tokio::task::spawn_blocking(work)
                .await
                .context("blocking producer did not complete")?
        })
    }
}

impl<T> std::fmt::Debug for Task<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Task::Ready"),
            Self::Pending(_) => f.write_str("Task::Pending"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ready_and_pending_resolve_the_same_way() {
        let ready = Task::ready(7);
        let pending = Task::pending(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            7
        });
        assert!(ready.is_ready());
        assert!(!pending.is_ready());
        assert_eq!(ready.run().await, pending.run().await);
    }

    #[tokio::test]
    async fn blocking_work_runs_off_the_runtime() {
        let task = Task::blocking(|| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(vec![1, 2, 3])
        });
        assert_eq!(task.run().await.expect("blocking result"), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn blocking_panic_becomes_an_error() {
        let task: Task<'static, anyhow::Result<u8>> = Task::blocking(|| panic!("boom"));
        assert!(task.run().await.is_err());
    }
}
