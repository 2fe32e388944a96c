//! SequentialExecutor: runs a JSON list of shell steps in order.
//!
//! Payload shape:
//!
//! ```json
//! {"steps": [{"alias": "build", "command": "make", "environment": {}, "on_failure": false}]}
//! ```
//!
//! After a step fails, later steps are skipped unless they set `on_failure`.
//! The first failing exit code becomes the pipeline's exit code.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{Step, now_unix};
use crate::error::ExecError;
use crate::ports::{
    ExecutionEngine, Hooks, PipelineExecutor, PipelineState, ProcessState, TraceState,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub alias: String,
    pub command: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Run even after an earlier step failed.
    #[serde(default)]
    pub on_failure: bool,
}

#[derive(Debug, Clone)]
pub struct SequentialExecutor {
    /// How long to keep reading a step's output after it exits or is killed.
    log_drain_grace: Duration,
}

impl Default for SequentialExecutor {
    fn default() -> Self {
        Self {
            log_drain_grace: Duration::from_secs(5),
        }
    }
}

impl SequentialExecutor {
    pub fn new(log_drain_grace: Duration) -> Self {
        Self { log_drain_grace }
    }

    /// Run one step to completion. Returns its exit code.
    async fn run_step(
        &self,
        spec: &StepSpec,
        engine: &Arc<dyn ExecutionEngine>,
        hooks: &Hooks,
        pipeline: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<i32, ExecError> {
        let mut step = Step::new(&spec.alias);
        if !spec.environment.is_empty() {
            step.environment = Some(spec.environment.clone());
        }

        let started = now_unix();
        let mut trace = TraceState {
            pipeline: pipeline.clone(),
            process: ProcessState {
                started,
                ..ProcessState::default()
            },
            step,
        };
        hooks.tracer.trace(&mut trace).await;
        let step = trace.step;

        let mut running = engine.start(&step, &spec.command).await?;
        let log_task = running.take_output().map(|output| {
            let logger = hooks.logger.clone();
            let step = step.clone();
            tokio::spawn(async move {
                if let Err(e) = logger.log(&step, output).await {
                    warn!(proc = %step.alias, error = %e, "reading step output failed");
                }
            })
        });

        let exited = tokio::select! {
            res = running.wait() => Some(res),
            _ = cancel.cancelled() => None,
        };

        let code = match exited {
            Some(res) => {
                self.drain(&step.alias, log_task).await;
                res?
            }
            None => {
                debug!(proc = %step.alias, "cancelled; killing step");
                if let Err(e) = running.kill().await {
                    warn!(proc = %step.alias, error = %e, "kill failed");
                }
                self.drain(&step.alias, log_task).await;
                return Err(ExecError::Cancelled);
            }
        };

        if code != 0 && pipeline.error.is_none() {
            pipeline.error = Some(format!("step {} exited with code {code}", step.alias));
        }

        let mut trace = TraceState {
            pipeline: pipeline.clone(),
            process: ProcessState {
                started,
                exited: true,
                exit_code: code,
            },
            step,
        };
        hooks.tracer.trace(&mut trace).await;

        Ok(code)
    }

    async fn drain(&self, alias: &str, log_task: Option<JoinHandle<()>>) {
        let Some(mut handle) = log_task else {
            return;
        };
        if tokio::time::timeout(self.log_drain_grace, &mut handle)
            .await
            .is_err()
        {
            warn!(proc = %alias, "step output still open after exit; detaching");
            handle.abort();
        }
    }
}

#[async_trait]
impl PipelineExecutor for SequentialExecutor {
    async fn execute(
        &self,
        pipeline: &serde_json::Value,
        engine: Arc<dyn ExecutionEngine>,
        hooks: Hooks,
        cancel: CancellationToken,
    ) -> Result<(), ExecError> {
        let spec: PipelineSpec = serde_json::from_value(pipeline.clone())
            .map_err(|e| ExecError::InvalidPipeline(e.to_string()))?;
        if spec.steps.is_empty() {
            return Err(ExecError::InvalidPipeline("pipeline has no steps".into()));
        }

        let mut state = PipelineState {
            started: now_unix(),
            error: None,
        };
        let mut first_failure = None;

        for step in &spec.steps {
            if cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            if state.error.is_some() && !step.on_failure {
                debug!(proc = %step.alias, "skipping step after failure");
                continue;
            }

            let code = self.run_step(step, &engine, &hooks, &mut state, &cancel).await?;
            if code != 0 && first_failure.is_none() {
                first_failure = Some(code);
            }
        }

        match first_failure {
            Some(code) => Err(ExecError::Exit(code)),
            None => Ok(()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Mutex;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::impls::ProcessEngine;
    use crate::ports::{LogStream, StepLogger, Tracer};

    #[derive(Default)]
    struct Recorder {
        output: Mutex<Vec<(String, String)>>,
        traces: Mutex<Vec<(String, bool, i32)>>,
        inject: Option<(String, String)>,
    }

    #[async_trait]
    impl StepLogger for Recorder {
        async fn log(&self, step: &Step, mut output: LogStream) -> std::io::Result<()> {
            let mut buf = String::new();
            output.read_to_string(&mut buf).await?;
            self.output.lock().unwrap().push((step.alias.clone(), buf));
            Ok(())
        }
    }

    #[async_trait]
    impl Tracer for Recorder {
        async fn trace(&self, state: &mut TraceState) {
            if let Some((k, v)) = &self.inject {
                state.step.environment_mut().insert(k.clone(), v.clone());
            }
            self.traces.lock().unwrap().push((
                state.step.alias.clone(),
                state.process.exited,
                state.process.exit_code,
            ));
        }
    }

    fn hooks(recorder: &Arc<Recorder>) -> Hooks {
        Hooks {
            logger: recorder.clone(),
            tracer: recorder.clone(),
        }
    }

    fn engine() -> Arc<dyn ExecutionEngine> {
        Arc::new(ProcessEngine::default())
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = serde_json::json!({"steps": [
            {"alias": "one", "command": "echo first"},
            {"alias": "two", "command": "echo second"},
        ]});

        SequentialExecutor::default()
            .execute(&pipeline, engine(), hooks(&recorder), CancellationToken::new())
            .await
            .unwrap();

        let output = recorder.output.lock().unwrap().clone();
        assert_eq!(output[0], ("one".to_string(), "first\n".to_string()));
        assert_eq!(output[1], ("two".to_string(), "second\n".to_string()));

        let traces = recorder.traces.lock().unwrap().clone();
        assert_eq!(
            traces,
            vec![
                ("one".to_string(), false, 0),
                ("one".to_string(), true, 0),
                ("two".to_string(), false, 0),
                ("two".to_string(), true, 0),
            ]
        );
    }

    #[tokio::test]
    async fn failure_skips_steps_unless_on_failure() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = serde_json::json!({"steps": [
            {"alias": "build", "command": "exit 2"},
            {"alias": "deploy", "command": "echo never"},
            {"alias": "notify", "command": "exit 4", "on_failure": true},
        ]});

        let err = SequentialExecutor::default()
            .execute(&pipeline, engine(), hooks(&recorder), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Exit(2)));
        let ran: Vec<String> = recorder
            .traces
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, exited, _)| *exited)
            .map(|(alias, _, _)| alias.clone())
            .collect();
        assert_eq!(ran, vec!["build".to_string(), "notify".to_string()]);
    }

    #[tokio::test]
    async fn tracer_environment_reaches_the_step() {
        let recorder = Arc::new(Recorder {
            inject: Some(("DROVER_INJECTED".into(), "from-tracer".into())),
            ..Recorder::default()
        });
        let pipeline = serde_json::json!({"steps": [
            {"alias": "show", "command": "echo $DROVER_INJECTED"},
        ]});

        SequentialExecutor::default()
            .execute(&pipeline, engine(), hooks(&recorder), CancellationToken::new())
            .await
            .unwrap();

        let output = recorder.output.lock().unwrap().clone();
        assert_eq!(output[0].1.trim(), "from-tracer");
    }

    #[tokio::test]
    async fn cancellation_kills_the_running_step() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = serde_json::json!({"steps": [
            {"alias": "hang", "command": "exec sleep 30"},
            {"alias": "after", "command": "echo never"},
        ]});
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let res = tokio::time::timeout(
            Duration::from_secs(10),
            SequentialExecutor::new(Duration::from_millis(200)).execute(
                &pipeline,
                engine(),
                hooks(&recorder),
                cancel,
            ),
        )
        .await
        .unwrap();

        assert!(matches!(res, Err(ExecError::Cancelled)));
        assert!(
            recorder
                .traces
                .lock()
                .unwrap()
                .iter()
                .all(|(alias, _, _)| alias == "hang")
        );
    }

    #[tokio::test]
    async fn rejects_malformed_payload() {
        let recorder = Arc::new(Recorder::default());
        for payload in [serde_json::json!({"nope": 1}), serde_json::json!({"steps": []})] {
            let err = SequentialExecutor::default()
                .execute(&payload, engine(), hooks(&recorder), CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, ExecError::InvalidPipeline(_)));
        }
    }
}
