//! Worker pool: N independent loops, each running one task at a time.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::runner::Runner;

/// Worker group handle.
/// - `shutdown_handle().request()` stops every worker from taking new tasks
/// - a task already running is finished and acknowledged first
/// - `join()` waits for all workers to exit
pub struct WorkerGroup {
    shutdown_tx: Arc<watch::Sender<bool>>,
    joins: Vec<JoinHandle<()>>,
}

/// Requests shutdown of a `WorkerGroup` from elsewhere (e.g. a signal handler).
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn request(&self) {
        let _ = self.0.send(true);
    }
}

impl WorkerGroup {
    /// Spawn `n` workers sharing `runner`.
    pub fn spawn(n: usize, runner: Arc<Runner>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let runner = Arc::clone(&runner);
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, runner, &mut rx).await;
            }));
        }

        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            joins,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Wait until every worker has exited, on its own or after a shutdown request.
    pub async fn join(self) {
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn worker_loop(worker_id: usize, runner: Arc<Runner>, shutdown_rx: &mut watch::Receiver<bool>) {
    info!(worker = worker_id, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            info!(worker = worker_id, "worker stopping");
            break;
        }

        // Polling may block for a while, so race it against shutdown. A lease
        // granted to an abandoned poll lapses and the task is requeued.
        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = runner.next_task() => next,
        };

        let task = match next {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                error!(worker = worker_id, error = %e, "worker terminating");
                break;
            }
        };

        // Not raced against shutdown: a started task runs to `done`.
        if let Err(e) = runner.run(task).await {
            error!(worker = worker_id, error = %e, "worker terminating");
            break;
        }
    }
}
