//! ProcessEngine: runs each step as a local shell process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, trace};

use crate::domain::Step;
use crate::error::EngineError;
use crate::ports::{EngineProvider, ExecutionEngine, LogStream, RunningStep};

/// Exit code reported for a step stopped by a signal the OS did not name.
const EXIT_CODE_UNKNOWN: i32 = 1;

#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    /// Shell used to run step commands (`<shell> -c <command>`).
    pub shell: String,
    pub workdir: Option<PathBuf>,
}

impl Default for ProcessEngineConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            workdir: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessEngine {
    cfg: ProcessEngineConfig,
}

impl ProcessEngine {
    pub fn new(cfg: ProcessEngineConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    fn name(&self) -> &str {
        "process"
    }

    async fn start(&self, step: &Step, command: &str) -> Result<Box<dyn RunningStep>, EngineError> {
        if command.trim().is_empty() {
            return Err(EngineError::Start {
                step: step.alias.clone(),
                reason: "empty command".into(),
            });
        }
        trace!(proc = %step.alias, shell = %self.cfg.shell, "spawn");

        // Fold stderr into stdout so the step has a single ordered stream.
        let script = format!("exec 2>&1\n{command}");
        let mut cmd = Command::new(&self.cfg.shell);
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.cfg.workdir {
            cmd.current_dir(dir);
        }
        if let Some(env) = &step.environment {
            cmd.envs(env);
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::Start {
            step: step.alias.clone(),
            reason: format!("spawn: {e}"),
        })?;
        let output = child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as LogStream);

        Ok(Box::new(ProcessStep { child, output }))
    }
}

struct ProcessStep {
    child: Child,
    output: Option<LogStream>,
}

#[async_trait]
impl RunningStep for ProcessStep {
    fn take_output(&mut self) -> Option<LogStream> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<i32, EngineError> {
        let status = self.child.wait().await?;
        if let Some(code) = status.code() {
            return Ok(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Ok(128 + signal);
            }
        }
        Ok(EXIT_CODE_UNKNOWN)
    }

    async fn kill(&mut self) -> Result<(), EngineError> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                debug!("kill on exited step ignored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Shares one `ProcessEngine` across all tasks.
#[derive(Debug, Clone, Default)]
pub struct ProcessEngineProvider {
    engine: Arc<ProcessEngine>,
}

impl ProcessEngineProvider {
    pub fn new(engine: ProcessEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

#[async_trait]
impl EngineProvider for ProcessEngineProvider {
    async fn acquire(&self) -> Result<Arc<dyn ExecutionEngine>, EngineError> {
        Ok(self.engine.clone())
    }
}
