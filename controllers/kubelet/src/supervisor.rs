//! Fail-fast task group.
//!
//! The host manager, the virtual manager and the node loop run side by side.
//! The first one to return, successfully or not, stops all the others and its
//! outcome becomes the process outcome.

use std::future::Future;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::KubeletError;

type TaskResult = (String, Result<(), KubeletError>);

#[derive(Debug, Default)]
pub struct Supervisor {
    tasks: JoinSet<TaskResult>,
}

impl Supervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = Result<(), KubeletError>> + Send + 'static,
    {
        let name = name.to_string();
        info!(task = %name, "Starting task");
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Wait for the first task to finish, then abort the rest.
    ///
    /// A task that returns `Ok` is still reported as an error: none of the
    /// supervised tasks is expected to finish while the process lives.
    pub async fn wait(self) -> Result<(), KubeletError> {
        let (_keep, shutdown) = watch::channel(false);
        self.wait_until(shutdown).await
    }

    /// Like [`Supervisor::wait`], but returns `Ok` once `shutdown` turns true
    pub async fn wait_until(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), KubeletError> {
        let first = tokio::select! {
            first = self.tasks.join_next() => first,
            Ok(()) = shutdown.wait_for(|stop| *stop).map(|r| r.map(|_| ())) => {
                info!("Shutdown requested, stopping tasks");
                self.tasks.shutdown().await;
                return Ok(());
            }
        };
        let Some(first) = first else {
            return Ok(());
        };

        let result = match first {
            Ok((name, Ok(()))) => Err(KubeletError::TaskStopped(name, "exited".to_string())),
            Ok((name, Err(e))) => {
                error!(task = %name, error = %e, "Task failed");
                Err(e)
            }
            Err(e) => Err(KubeletError::TaskStopped("unknown".to_string(), e.to_string())),
        };

        self.tasks.shutdown().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_error_wins_and_aborts_the_rest() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut supervisor = Supervisor::new();

        let flag = Arc::clone(&finished);
        supervisor.spawn("slow", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<(), KubeletError>(())
        });
        supervisor.spawn("node", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err::<(), _>(KubeletError::NodeNotReady("n".to_string(), Duration::from_secs(60)))
        });

        let err = supervisor.wait().await.unwrap_err();
        assert!(matches!(err, KubeletError::NodeNotReady(..)));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_clean_exit_is_fatal() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("virtual-manager", async { Ok::<(), KubeletError>(()) });
        supervisor.spawn("forever", std::future::pending::<Result<(), KubeletError>>());

        let err = supervisor.wait().await.unwrap_err();
        assert!(matches!(err, KubeletError::TaskStopped(ref name, _) if name == "virtual-manager"));
    }

    async fn explode() -> Result<(), KubeletError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("boom", explode());
        assert!(matches!(supervisor.wait().await, Err(KubeletError::TaskStopped(..))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks_cleanly() {
        let (tx, rx) = watch::channel(false);
        let mut supervisor = Supervisor::new();
        supervisor.spawn("forever", std::future::pending::<Result<(), KubeletError>>());
        let waiting = tokio::spawn(supervisor.wait_until(rx));

        tx.send(true).unwrap();
        assert!(waiting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_empty_group_returns_immediately() {
        assert!(Supervisor::new().wait().await.is_ok());
    }
}
