//! Lifecycle supervision of the local ComfyUI server process.
//!
//! A single [`ProcessSupervisor`] owns at most one child process. Callers
//! ask for readiness with [`ProcessSupervisor::ensure_ready`]; the first
//! caller launches the server and waits for `/system_stats` to answer while
//! concurrent callers queue on the same lock and observe the result.
//!
//! State transitions:
//!
//! ```text
//! NotStarted/Stopped/Unhealthy --launch--> Starting --probe ok--> Ready
//! Starting --process exit--> Unhealthy
//! Starting --max_wait elapsed--> Starting (process left running)
//! Ready --probe fails--> Unhealthy --relaunch--> Starting
//! any --stop()--> Stopped
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use avagen_core::clock::Clock;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::backend::HealthProbe;
use crate::output::{self, OutputBuffer};

/// How long reader tasks get to flush after the process has exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Observable lifecycle state of the supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    NotStarted,
    Starting,
    Ready,
    Unhealthy,
    Stopped,
}

/// Errors from launching or waiting on the server.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The process could not be spawned at all.
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited before its health probe succeeded.
    #[error("Rendering server exited before becoming ready ({})", describe_exit(.exit_code))]
    ProcessExited {
        /// `None` when the process was terminated by a signal.
        exit_code: Option<i32>,
        tail: String,
    },

    /// `max_wait` elapsed without a successful probe. The process is left
    /// running.
    #[error("Rendering server not ready after {}s", .elapsed.as_secs())]
    Timeout { elapsed: Duration, tail: String },

    /// Required model files could not be provisioned.
    #[error("Model provisioning failed: {0}")]
    Provisioning(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Captured server output attached to the error, if any.
    pub fn tail(&self) -> Option<&str> {
        match self {
            Self::ProcessExited { tail, .. } | Self::Timeout { tail, .. } => Some(tail),
            _ => None,
        }
    }
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Program and arguments used to start the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// `<python> -u main.py --listen <listen> --port <port>` inside `comfy_dir`.
    pub fn comfyui(python: &str, comfy_dir: impl Into<PathBuf>, listen: &str, port: u16) -> Self {
        Self::new(python)
            .args(["-u", "main.py", "--listen", listen, "--port"])
            .arg(port.to_string())
            .working_dir(comfy_dir)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub launch: LaunchSpec,
    /// Delay between readiness probes.
    pub health_interval: Duration,
    /// Lines of server output retained for diagnostics.
    pub output_lines: usize,
    /// Bounded wait for the process to exit after it has been killed.
    pub stop_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            health_interval: Duration::from_secs(1),
            output_lines: output::DEFAULT_CAPACITY,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// A spawned server plus the tasks draining its output.
struct ManagedProcess {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

impl ManagedProcess {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn drain(self) {
        for reader in self.readers {
            let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
        }
    }

    async fn terminate(mut self, timeout: Duration) {
        let pid = self.child.id();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(?pid, error = %e, "Kill signal not delivered");
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(?pid, %status, "Rendering server stopped"),
            Ok(Err(e)) => tracing::warn!(?pid, error = %e, "Failed to reap rendering server"),
            Err(_) => tracing::warn!(?pid, "Rendering server did not exit in time"),
        }
        self.drain().await;
    }
}

enum WaitOutcome {
    Healthy,
    Exited(Option<i32>),
    TimedOut(Duration),
}

/// Owns the rendering-server child process.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    process: Mutex<Option<ManagedProcess>>,
    state: watch::Sender<ServerState>,
    output: Arc<OutputBuffer>,
    launches: AtomicUsize,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, probe: Arc<dyn HealthProbe>, clock: Arc<dyn Clock>) -> Self {
        let output = Arc::new(OutputBuffer::new(config.output_lines));
        let (state, _) = watch::channel(ServerState::NotStarted);
        Self {
            config,
            probe,
            clock,
            process: Mutex::new(None),
            state,
            output,
            launches: AtomicUsize::new(0),
        }
    }

    /// Make sure the server is up and answering, launching it if needed.
    ///
    /// Concurrent callers serialize on an internal lock, so at most one
    /// launch happens; later callers find the server Ready.
    pub async fn ensure_ready(&self, max_wait: Duration) -> Result<(), SupervisorError> {
        let mut guard = self.process.lock().await;

        if self.state() == ServerState::Ready {
            if self.probe.health_check().await {
                return Ok(());
            }
            tracing::warn!("Rendering server failed its health probe, restarting");
            self.set_state(ServerState::Unhealthy);
            if let Some(process) = guard.take() {
                process.terminate(self.config.stop_timeout).await;
            }
        }

        let process = match guard.take() {
            Some(mut process) => {
                if process.is_running() {
                    tracing::info!("Rendering server still starting, resuming readiness wait");
                    guard.insert(process)
                } else {
                    process.drain().await;
                    guard.insert(self.launch()?)
                }
            }
            None => guard.insert(self.launch()?),
        };

        match self.wait_until_ready(process, max_wait).await? {
            WaitOutcome::Healthy => {
                self.set_state(ServerState::Ready);
                tracing::info!(launches = self.launch_count(), "Rendering server is ready");
                Ok(())
            }
            WaitOutcome::Exited(exit_code) => {
                if let Some(process) = guard.take() {
                    process.drain().await;
                }
                self.set_state(ServerState::Unhealthy);
                let tail = self.output_tail();
                tracing::error!(?exit_code, %tail, "Rendering server exited during startup");
                Err(SupervisorError::ProcessExited { exit_code, tail })
            }
            WaitOutcome::TimedOut(elapsed) => {
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Rendering server not ready in time, leaving it running",
                );
                Err(SupervisorError::Timeout {
                    elapsed,
                    tail: self.output_tail(),
                })
            }
        }
    }

    /// Single liveness probe. Never fails.
    pub async fn health_check(&self) -> bool {
        self.probe.health_check().await
    }

    /// Kill the server, if any, and wait a bounded time for it to exit.
    pub async fn stop(&self) {
        let mut guard = self.process.lock().await;
        if let Some(process) = guard.take() {
            tracing::info!("Stopping rendering server");
            process.terminate(self.config.stop_timeout).await;
        }
        self.set_state(ServerState::Stopped);
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Number of processes spawned over the supervisor's lifetime.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Retained server output, oldest line first.
    pub fn output_tail(&self) -> String {
        self.output.tail(self.config.output_lines)
    }

    // ---- private helpers ----

    fn set_state(&self, state: ServerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, current = ?state, "Server state changed");
        }
    }

    fn launch(&self) -> Result<ManagedProcess, SupervisorError> {
        let spec = &self.config.launch;
        let mut child = spec.command().spawn().map_err(|source| SupervisorError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        self.output.clear();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(output::pump(stdout, "stdout", self.output.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(output::pump(stderr, "stderr", self.output.clone())));
        }

        let launches = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            program = %spec.program,
            args = ?spec.args,
            pid = ?child.id(),
            launches,
            "Launched rendering server",
        );
        self.set_state(ServerState::Starting);
        Ok(ManagedProcess { child, readers })
    }

    async fn wait_until_ready(
        &self,
        process: &mut ManagedProcess,
        max_wait: Duration,
    ) -> Result<WaitOutcome, SupervisorError> {
        let started = self.clock.now();
        loop {
            if let Some(status) = process.child.try_wait()? {
                return Ok(WaitOutcome::Exited(status.code()));
            }
            if self.probe.health_check().await {
                return Ok(WaitOutcome::Healthy);
            }

            let elapsed = self.clock.since(started);
            if elapsed >= max_wait {
                return Ok(WaitOutcome::TimedOut(elapsed));
            }
            let pause = self.config.health_interval.min(max_wait - elapsed);
            self.clock.sleep(pause).await;
        }
    }
}
