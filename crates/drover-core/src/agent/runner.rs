//! Runs one leased task from start to acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::config::AgentConfig;
use super::context::{CancelReason, RunContext};
use super::hooks::{StatusTracer, UploadLogger};
use crate::domain::{EXIT_CODE_KILLED, ExecutionState, Task, TaskId, WaitOutcome};
use crate::error::{AgentError, ExecError};
use crate::ports::{EngineProvider, Hooks, PipelineExecutor};
use crate::rpc::Peer;

pub struct Runner {
    peer: Arc<dyn Peer>,
    engines: Arc<dyn EngineProvider>,
    executor: Arc<dyn PipelineExecutor>,
    cfg: AgentConfig,
}

impl Runner {
    pub fn new(
        peer: Arc<dyn Peer>,
        engines: Arc<dyn EngineProvider>,
        executor: Arc<dyn PipelineExecutor>,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            peer,
            engines,
            executor,
            cfg,
        }
    }

    /// Lease the next task for this agent's labels.
    pub async fn next_task(&self) -> Result<Option<Task>, AgentError> {
        debug!("requesting next task");
        let task = self
            .peer
            .next(&self.cfg.filter())
            .await
            .map_err(AgentError::Fetch)?;
        if let Some(task) = &task {
            info!(task_id = %task.id, "task received");
        }
        Ok(task)
    }

    /// Supervise `task` until its final state is reported.
    ///
    /// Only engine acquisition can fail; every reporting failure after that
    /// is logged and `done` is still sent exactly once.
    pub async fn run(&self, task: Task) -> Result<ExecutionState, AgentError> {
        let engine = self.engines.acquire().await?;
        let id = task.id.clone();

        let ctx = RunContext::new(self.cfg.deadline_for(&task));
        let deadline = tokio::spawn(ctx.clone().enforce_deadline());
        let watcher = tokio::spawn(watch_cancel(self.peer.clone(), id.clone(), ctx.clone()));
        let heartbeat = tokio::spawn(heartbeat(
            self.peer.clone(),
            id.clone(),
            self.cfg.heartbeat_interval,
            ctx.token(),
        ));

        let mut state = ExecutionState::started_now();
        if let Err(e) = self.peer.init(&id, state.clone()).await {
            warn!(task_id = %id, error = %e, "cannot signal task init");
        }

        let uploads = TaskTracker::new();
        let hooks = Hooks {
            logger: Arc::new(UploadLogger::new(
                self.peer.clone(),
                id.clone(),
                self.cfg.max_log_bytes,
                self.cfg.max_upload_bytes,
                self.cfg.mirror_logs,
                uploads.clone(),
            )),
            tracer: Arc::new(StatusTracer::new(self.peer.clone(), id.clone())),
        };

        let result = self
            .executor
            .execute(&task.data, engine, hooks, ctx.token())
            .await;
        let reason = ctx.settle();

        state.finish();
        resolve_exit(&mut state, result, reason);
        info!(task_id = %id, exit_code = state.exit_code, "execution complete");

        uploads.close();
        uploads.wait().await;
        let (deadline, watcher, heartbeat) = tokio::join!(deadline, watcher, heartbeat);
        let joined = [
            ("deadline", deadline),
            ("watcher", watcher),
            ("heartbeat", heartbeat),
        ];
        for (name, res) in joined {
            if let Err(e) = res {
                warn!(task_id = %id, task = name, error = %e, "supervision task failed");
            }
        }

        match self.peer.done(&id, state.clone()).await {
            Ok(()) => info!(task_id = %id, "done acknowledged"),
            Err(e) => warn!(task_id = %id, error = %e, "cannot signal task done"),
        }
        Ok(state)
    }
}

/// Fold the executor result and the cancellation reason into `state`.
///
/// A structured exit code is kept as is; any other failure becomes exit code
/// 1 with its text. A recorded cancellation forces 137.
pub fn resolve_exit(
    state: &mut ExecutionState,
    result: Result<(), ExecError>,
    reason: Option<CancelReason>,
) {
    match result {
        Ok(()) => {}
        Err(ExecError::Exit(code)) => state.exit_code = code,
        // The reason below says why.
        Err(ExecError::Cancelled) if reason.is_some() => {}
        Err(other) => {
            state.exit_code = 1;
            state.error = Some(other.to_string());
        }
    }

    if let Some(reason) = reason {
        state.exit_code = EXIT_CODE_KILLED;
        if state.error.is_none() {
            state.error = Some(reason.to_string());
        }
    }
}

async fn watch_cancel(peer: Arc<dyn Peer>, id: TaskId, ctx: Arc<RunContext>) {
    let token = ctx.token();
    tokio::select! {
        _ = token.cancelled() => {}
        res = peer.wait(&id) => match res {
            Ok(WaitOutcome::Cancelled) => {
                info!(task_id = %id, "cancel signal received");
                ctx.cancel(CancelReason::Cancelled);
            }
            Ok(WaitOutcome::Completed) => debug!(task_id = %id, "cancel channel closed"),
            Err(e) => warn!(task_id = %id, error = %e, "lost the cancel channel"),
        }
    }
}

async fn heartbeat(peer: Arc<dyn Peer>, id: TaskId, every: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        debug!(task_id = %id, "extending lease");
        tokio::select! {
            _ = token.cancelled() => return,
            res = peer.extend(&id) => {
                if let Err(e) = res {
                    warn!(task_id = %id, error = %e, "cannot extend lease");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::future::BoxFuture;
    use rstest::rstest;

    use super::*;
    use crate::domain::{Filter, LogArtifact, LogLine, Step};
    use crate::error::{EngineError, PeerError};
    use crate::impls::InMemoryStatusStore;
    use crate::ports::{ExecutionEngine, RunningStep, StatusStore};
    use crate::queue::{InMemoryQueue, QueueConfig, TaskQueue};
    use crate::rpc::QueuePeer;

    /// In-process peer that records every report.
    #[derive(Default)]
    pub(crate) struct FakePeer {
        pub tasks: Mutex<VecDeque<Task>>,
        pub fail_reports: bool,
        pub cancel_after: Option<Duration>,
        pub panic_on_wait: bool,
        pub extends: Mutex<usize>,
        pub inits: Mutex<Vec<ExecutionState>>,
        pub updates: Mutex<Vec<ExecutionState>>,
        pub uploads: Mutex<Vec<LogArtifact>>,
        pub done: Mutex<Vec<(TaskId, ExecutionState)>>,
    }

    impl FakePeer {
        pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
            Self {
                tasks: Mutex::new(tasks.into_iter().collect()),
                ..Self::default()
            }
        }

        fn report(&self) -> Result<(), PeerError> {
            if self.fail_reports {
                Err(PeerError::Transport("broker down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Peer for FakePeer {
        async fn next(&self, _filter: &Filter) -> Result<Option<Task>, PeerError> {
            match self.tasks.lock().unwrap().pop_front() {
                Some(task) => Ok(Some(task)),
                None => Err(PeerError::RetriesExhausted {
                    attempts: 1,
                    last: "no more tasks".into(),
                }),
            }
        }

        async fn wait(&self, _id: &TaskId) -> Result<WaitOutcome, PeerError> {
            if self.panic_on_wait {
                panic!("cancel channel exploded");
            }
            match self.cancel_after {
                Some(after) => {
                    tokio::time::sleep(after).await;
                    Ok(WaitOutcome::Cancelled)
                }
                None => std::future::pending().await,
            }
        }

        async fn extend(&self, _id: &TaskId) -> Result<(), PeerError> {
            *self.extends.lock().unwrap() += 1;
            self.report()
        }

        async fn init(&self, _id: &TaskId, state: ExecutionState) -> Result<(), PeerError> {
            self.inits.lock().unwrap().push(state);
            self.report()
        }

        async fn update(&self, _id: &TaskId, state: ExecutionState) -> Result<(), PeerError> {
            self.updates.lock().unwrap().push(state);
            self.report()
        }

        async fn upload(&self, _id: &TaskId, file: LogArtifact) -> Result<(), PeerError> {
            self.uploads.lock().unwrap().push(file);
            self.report()
        }

        async fn done(&self, id: &TaskId, state: ExecutionState) -> Result<(), PeerError> {
            self.done.lock().unwrap().push((id.clone(), state));
            self.report()
        }
    }

    struct NullEngine;

    #[async_trait]
    impl ExecutionEngine for NullEngine {
        fn name(&self) -> &str {
            "null"
        }

        async fn start(
            &self,
            step: &Step,
            _command: &str,
        ) -> Result<Box<dyn RunningStep>, EngineError> {
            Err(EngineError::Start {
                step: step.alias.clone(),
                reason: "null engine".into(),
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct NullEngines {
        pub unavailable: bool,
    }

    #[async_trait]
    impl EngineProvider for NullEngines {
        async fn acquire(&self) -> Result<Arc<dyn ExecutionEngine>, EngineError> {
            if self.unavailable {
                return Err(EngineError::Unavailable("no engine".into()));
            }
            Ok(Arc::new(NullEngine))
        }
    }

    type ExecFn =
        dyn Fn(Hooks, CancellationToken) -> BoxFuture<'static, Result<(), ExecError>> + Send + Sync;

    /// Executor whose behavior is a closure.
    pub(crate) struct FnExecutor(Box<ExecFn>);

    impl FnExecutor {
        pub fn new<F>(f: F) -> Self
        where
            F: Fn(Hooks, CancellationToken) -> BoxFuture<'static, Result<(), ExecError>>
                + Send
                + Sync
                + 'static,
        {
            Self(Box::new(f))
        }

        pub fn returning(result: fn() -> Result<(), ExecError>) -> Self {
            Self::new(move |_, _| Box::pin(async move { result() }))
        }

        /// Runs until cancelled, then reports the cancellation.
        pub fn blocking() -> Self {
            Self::new(|_, cancel| {
                Box::pin(async move {
                    cancel.cancelled().await;
                    Err(ExecError::Cancelled)
                })
            })
        }
    }

    #[async_trait]
    impl PipelineExecutor for FnExecutor {
        async fn execute(
            &self,
            _pipeline: &serde_json::Value,
            _engine: Arc<dyn ExecutionEngine>,
            hooks: Hooks,
            cancel: CancellationToken,
        ) -> Result<(), ExecError> {
            (self.0)(hooks, cancel).await
        }
    }

    pub(crate) fn test_config() -> AgentConfig {
        AgentConfig {
            mirror_logs: false,
            ..AgentConfig::default()
        }
    }

    fn runner(peer: &Arc<FakePeer>, executor: FnExecutor, cfg: AgentConfig) -> Runner {
        Runner::new(
            peer.clone(),
            Arc::new(NullEngines::default()),
            Arc::new(executor),
            cfg,
        )
    }

    fn task() -> Task {
        Task::new("t1", serde_json::json!({}))
    }

    #[tokio::test]
    async fn success_reports_exit_zero() {
        let peer = Arc::new(FakePeer::default());
        let runner = runner(&peer, FnExecutor::returning(|| Ok(())), test_config());

        let state = runner.run(task()).await.unwrap();

        assert_eq!(state.exit_code, 0);
        assert!(state.exited);
        assert!(state.finished >= state.started);
        assert_eq!(peer.inits.lock().unwrap().len(), 1);
        let done = peer.done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1, state);
    }

    #[rstest]
    #[case(|| Err(ExecError::Exit(3)), 3, None)]
    #[case(|| Err(ExecError::Other("boom".into())), 1, Some("boom"))]
    #[case(|| Err(ExecError::InvalidPipeline("no steps".into())), 1, Some("invalid pipeline: no steps"))]
    #[tokio::test]
    async fn executor_failures_map_to_exit_codes(
        #[case] result: fn() -> Result<(), ExecError>,
        #[case] exit_code: i32,
        #[case] error: Option<&str>,
    ) {
        let peer = Arc::new(FakePeer::default());
        let runner = runner(&peer, FnExecutor::returning(result), test_config());

        let state = runner.run(task()).await.unwrap();

        assert_eq!(state.exit_code, exit_code);
        assert_eq!(state.error.as_deref(), error);
    }

    #[tokio::test]
    async fn cancellation_reports_137() {
        let peer = Arc::new(FakePeer {
            cancel_after: Some(Duration::from_millis(20)),
            ..FakePeer::default()
        });
        let runner = runner(&peer, FnExecutor::blocking(), test_config());

        let state = runner.run(task()).await.unwrap();

        assert_eq!(state.exit_code, EXIT_CODE_KILLED);
        assert_eq!(state.error.as_deref(), Some("cancelled"));
        assert_eq!(peer.done.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_137() {
        let peer = Arc::new(FakePeer::default());
        let runner = runner(&peer, FnExecutor::blocking(), test_config());

        let state = runner.run(task().with_timeout_minutes(2)).await.unwrap();

        assert_eq!(state.exit_code, EXIT_CODE_KILLED);
        assert_eq!(state.error.as_deref(), Some("deadline exceeded"));
        // The lease was kept alive while the task ran.
        assert!(*peer.extends.lock().unwrap() >= 1);
    }

    #[tokio::test]
    async fn done_is_sent_once_even_when_reporting_fails() {
        let peer = Arc::new(FakePeer {
            fail_reports: true,
            ..FakePeer::default()
        });
        let executor = FnExecutor::new(|hooks, _| {
            Box::pin(async move {
                let output = Box::new(Cursor::new(b"hello\n".to_vec()));
                hooks.logger.log(&Step::new("build"), output).await.unwrap();
                let mut trace = crate::ports::TraceState {
                    pipeline: Default::default(),
                    process: Default::default(),
                    step: Step::new("build"),
                };
                hooks.tracer.trace(&mut trace).await;
                Ok(())
            })
        });
        let runner = runner(&peer, executor, test_config());

        let state = runner.run(task()).await.unwrap();

        let done = peer.done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].1.exited);
        assert!(done[0].1.finished > 0);
        assert_eq!(state.exit_code, 0);
        // Upload was attempted before done.
        assert_eq!(peer.uploads.lock().unwrap().len(), 1);
        assert_eq!(peer.updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_logs_are_truncated_and_run_completes() {
        let peer = Arc::new(FakePeer::default());
        let executor = FnExecutor::new(|hooks, _| {
            Box::pin(async move {
                let data: String = (0..100).map(|i| format!("line {i}\n")).collect();
                let output = Box::new(Cursor::new(data.into_bytes()));
                hooks.logger.log(&Step::new("build"), output).await.unwrap();
                Ok(())
            })
        });
        let cfg = AgentConfig {
            max_log_bytes: 64,
            ..test_config()
        };
        let runner = runner(&peer, executor, cfg);

        let state = runner.run(task()).await.unwrap();
        assert_eq!(state.exit_code, 0);

        let uploads = peer.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].proc, "build");
        let lines: Vec<LogLine> = serde_json::from_str(&uploads[0].data).unwrap();
        let captured: usize = lines.iter().map(|l| l.out.len()).sum();
        assert_eq!(captured, 64);
        assert_eq!(lines[0].out, "line 0\n");
    }

    #[tokio::test]
    async fn tracer_sequences_updates_and_stamps_environment() {
        let peer = Arc::new(FakePeer::default());
        let executor = FnExecutor::new(|hooks, _| {
            Box::pin(async move {
                let mut trace = crate::ports::TraceState {
                    pipeline: Default::default(),
                    process: Default::default(),
                    step: Step::new("build"),
                };
                hooks.tracer.trace(&mut trace).await;
                let env = trace.step.environment.clone().unwrap_or_default();
                if env.get("CI_BUILD_STATUS").map(String::as_str) != Some("success") {
                    return Err(ExecError::Other("environment not stamped".into()));
                }

                trace.process.exited = true;
                trace.process.exit_code = 2;
                hooks.tracer.trace(&mut trace).await;
                Err(ExecError::Exit(2))
            })
        });
        let runner = runner(&peer, executor, test_config());

        let state = runner.run(task()).await.unwrap();
        assert_eq!(state.exit_code, 2);

        let updates = peer.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].seq, 1);
        assert_eq!(updates[1].seq, 2);
        assert!(updates[1].exited);
        assert_eq!(updates[1].exit_code, 2);
        assert_eq!(updates[1].proc, "build");
    }

    #[tokio::test]
    async fn panicking_watcher_does_not_stop_done() {
        let peer = Arc::new(FakePeer {
            panic_on_wait: true,
            ..FakePeer::default()
        });
        let runner = runner(&peer, FnExecutor::returning(|| Ok(())), test_config());

        let state = runner.run(task()).await.unwrap();

        assert_eq!(state.exit_code, 0);
        assert_eq!(peer.done.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn engine_failure_is_an_agent_error() {
        let peer = Arc::new(FakePeer::default());
        let runner = Runner::new(
            peer.clone(),
            Arc::new(NullEngines { unavailable: true }),
            Arc::new(FnExecutor::returning(|| Ok(()))),
            test_config(),
        );

        let err = runner.run(task()).await.unwrap_err();
        assert!(matches!(err, AgentError::Engine(_)));
        assert!(peer.done.lock().unwrap().is_empty());
    }

    struct QueueSetup {
        queue: Arc<InMemoryQueue>,
        store: Arc<InMemoryStatusStore>,
        runner: Runner,
    }

    async fn queue_setup(executor: FnExecutor) -> QueueSetup {
        let queue = Arc::new(InMemoryQueue::new(QueueConfig {
            lease_ttl: Duration::from_secs(60),
            poll_timeout: Duration::from_millis(50),
        }));
        let store = Arc::new(InMemoryStatusStore::new());
        queue
            .push(task().with_label("platform", "linux/amd64"))
            .await
            .unwrap();

        let cfg = AgentConfig {
            labels: [("platform".to_string(), "linux/amd64".to_string())].into(),
            ..test_config()
        };
        let runner = Runner::new(
            Arc::new(QueuePeer::new(queue.clone(), store.clone())),
            Arc::new(NullEngines::default()),
            Arc::new(executor),
            cfg,
        );
        QueueSetup {
            queue,
            store,
            runner,
        }
    }

    #[tokio::test]
    async fn leased_task_completes_through_the_queue() {
        let QueueSetup {
            queue,
            store,
            runner,
        } = queue_setup(FnExecutor::returning(|| Ok(()))).await;

        let task = runner.next_task().await.unwrap().unwrap();
        assert_eq!(task.id.as_str(), "t1");
        runner.run(task).await.unwrap();

        let status = store.get(&TaskId::from("t1")).await.unwrap().unwrap();
        assert_eq!(status.state.exit_code, 0);
        assert!(status.state.exited);
        let counts = queue.info().await.unwrap();
        assert_eq!((counts.pending, counts.leased), (0, 0));
    }

    #[tokio::test]
    async fn queue_cancellation_kills_the_run() {
        let QueueSetup {
            queue,
            store,
            runner,
        } = queue_setup(FnExecutor::blocking()).await;

        let task = runner.next_task().await.unwrap().unwrap();
        tokio::spawn({
            let queue = queue.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                queue.cancel(&TaskId::from("t1")).await.unwrap();
            }
        });
        let state = runner.run(task).await.unwrap();
        assert_eq!(state.exit_code, EXIT_CODE_KILLED);

        let status = store.get(&TaskId::from("t1")).await.unwrap().unwrap();
        assert_eq!(status.state.exit_code, EXIT_CODE_KILLED);
        assert_eq!(status.state.error.as_deref(), Some("cancelled"));
        let counts = queue.info().await.unwrap();
        assert_eq!((counts.pending, counts.leased), (0, 0));
    }

    #[test]
    fn late_cancel_without_error_still_reports_killed() {
        let mut state = ExecutionState::started_now();
        resolve_exit(&mut state, Ok(()), Some(CancelReason::Cancelled));
        assert_eq!(state.exit_code, EXIT_CODE_KILLED);
        assert_eq!(state.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn executor_text_survives_cancellation() {
        let mut state = ExecutionState::started_now();
        resolve_exit(
            &mut state,
            Err(ExecError::Other("container vanished".into())),
            Some(CancelReason::DeadlineExceeded),
        );
        assert_eq!(state.exit_code, EXIT_CODE_KILLED);
        assert_eq!(state.error.as_deref(), Some("container vanished"));
    }
}
