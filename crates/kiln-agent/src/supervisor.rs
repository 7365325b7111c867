use std::{sync::Arc, time::Duration};

use kiln_process::{EnvironmentStatus, LifecycleState, RunId, ShutdownProfile};
use tokio::sync::{Mutex, watch};

use crate::environment::{self, ManagedEnvironment};
use crate::error::{BindError, CommandError, HandleError, StartError, StopError};
use crate::handle::{self, ManagedProcess};
use crate::log_buffer::{LogBuffer, LogLine};
use crate::supervisor_support::{self, format_error_chain};
use crate::tunnel::{AgentProviders, TunnelCoordinator, TunnelProviderFactory, TunnelRequest};

/// Upper bound on lines moved into the buffer by one poll, so a chatty
/// server cannot turn a poll into a long-running call.
pub const MAX_LINES_PER_POLL: usize = 512;

const STOP_TICK: Duration = Duration::from_millis(100);
const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// What to do with a freshly spawned server when its tunnel cannot be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelFailurePolicy {
    /// Leave the server running (a cold start can be expensive); the operator
    /// retries the tunnel or stops the server.
    #[default]
    KeepProcess,
    /// Stop the server before reporting the failure.
    StopProcess,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub term_grace: Duration,
    pub kill_reap: Duration,
    /// How long one stdin write may block before `send_command` gives up.
    pub stdin_write: Duration,
    pub log_capacity: usize,
    pub tunnel_failure: TunnelFailurePolicy,
}

impl SupervisorOptions {
    pub fn from_env() -> Self {
        Self {
            term_grace: supervisor_support::graceful_term_grace(),
            kill_reap: supervisor_support::kill_reap_timeout(),
            stdin_write: supervisor_support::stdin_write_timeout(),
            log_capacity: supervisor_support::log_max_lines(),
            tunnel_failure: TunnelFailurePolicy::default(),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Running {
    pub pid: Option<u32>,
    pub run_id: RunId,
    pub tunnel_address: Option<String>,
}

/// How far a stop had to go before the process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    None,
    Terminated,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stopped {
    pub exit_code: Option<i32>,
    pub escalation: Escalation,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    NoData,
    Lines(Vec<LogLine>),
    Exited { code: Option<i32> },
}

#[derive(Debug, Clone, Copy)]
enum ExitReason {
    Exited,
    Stopped,
    WriteFailed,
}

#[derive(Debug)]
struct Inner {
    state: LifecycleState,
    process: Option<ManagedProcess>,
    run_id: Option<RunId>,
    last_exit: Option<i32>,
    message: Option<String>,
    tunnel: TunnelCoordinator,
}

fn timestamp() -> String {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    now.format(time::macros::format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

/// Owns one environment's server process, tunnel and console history.
///
/// Every lifecycle operation runs under one lock, so `start`, `stop`,
/// `poll` and `send_command` never interleave for the same environment.
/// The console buffer and the published status have their own locks and
/// stay readable while a long `stop` is in progress.
#[derive(Debug)]
pub struct Supervisor {
    env: Arc<ManagedEnvironment>,
    options: SupervisorOptions,
    inner: Mutex<Inner>,
    logs: Arc<Mutex<LogBuffer>>,
    status: watch::Sender<EnvironmentStatus>,
}

impl Supervisor {
    pub fn new(env: ManagedEnvironment, options: SupervisorOptions) -> Self {
        Self::with_tunnel_providers(env, options, Arc::new(AgentProviders))
    }

    pub fn with_tunnel_providers(
        env: ManagedEnvironment,
        options: SupervisorOptions,
        providers: Arc<dyn TunnelProviderFactory>,
    ) -> Self {
        let (status, _) = watch::channel(EnvironmentStatus::idle(env.name.clone(), env.kind));
        let logs = Arc::new(Mutex::new(LogBuffer::with_capacity(options.log_capacity)));
        Self {
            env: Arc::new(env),
            options,
            inner: Mutex::new(Inner {
                state: LifecycleState::Idle,
                process: None,
                run_id: None,
                last_exit: None,
                message: None,
                tunnel: TunnelCoordinator::new(providers),
            }),
            logs,
            status,
        }
    }

    pub fn name(&self) -> &str {
        &self.env.name
    }

    pub fn environment(&self) -> &ManagedEnvironment {
        &self.env
    }

    pub fn status(&self) -> EnvironmentStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EnvironmentStatus> {
        self.status.subscribe()
    }

    pub fn tunnel_address(&self) -> Option<String> {
        self.status.borrow().tunnel_address.clone()
    }

    pub async fn snapshot(&self) -> Vec<LogLine> {
        self.logs.lock().await.snapshot()
    }

    pub async fn tail(&self, limit: usize) -> Vec<LogLine> {
        self.logs.lock().await.tail(limit)
    }

    pub async fn since(&self, cursor: u64, limit: usize) -> Vec<LogLine> {
        self.logs.lock().await.since(cursor, limit)
    }

    pub async fn clear_logs(&self) {
        self.logs.lock().await.clear();
    }

    fn publish(&self, inner: &Inner) {
        let st = EnvironmentStatus {
            name: self.env.name.clone(),
            kind: self.env.kind,
            state: inner.state,
            pid: inner.process.as_ref().and_then(|p| p.pid()),
            run_id: inner.run_id.clone(),
            exit_code: inner.last_exit,
            tunnel_address: inner.tunnel.public_address().map(str::to_string),
            message: inner.message.clone(),
        };
        self.status.send_replace(st);
    }

    async fn emit(&self, line: impl Into<String>) -> LogLine {
        let text = line.into();
        let mut logs = self.logs.lock().await;
        let seq = logs.append(text.clone());
        LogLine { seq, text }
    }

    async fn marker(&self, text: impl AsRef<str>) {
        self.emit(format!("[{}] [kiln] {}", timestamp(), text.as_ref()))
            .await;
    }

    async fn append_lines(&self, lines: Vec<String>) -> Vec<LogLine> {
        if lines.is_empty() {
            return Vec::new();
        }
        let mut logs = self.logs.lock().await;
        lines
            .into_iter()
            .map(|text| {
                let seq = logs.append(text.clone());
                LogLine { seq, text }
            })
            .collect()
    }

    pub async fn start(&self) -> Result<Running, StartError> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_active() {
            return Err(StartError::AlreadyRunning(inner.state));
        }

        inner.state = LifecycleState::Starting;
        inner.message = Some("starting".to_string());
        self.publish(&inner);

        let res = self.start_locked(&mut inner).await;
        if let Err(err) = &res
            && inner.process.is_none()
        {
            inner.state = LifecycleState::Idle;
            inner.message = Some(format_error_chain(err));
            self.publish(&inner);
            tracing::warn!(env = %self.env.name, error = %format_error_chain(err), "start failed");
        }
        res
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<Running, StartError> {
        let spec = &self.env.launch;

        if !spec.working_dir.is_dir() {
            return Err(StartError::WorkingDirectoryMissing(spec.working_dir.clone()));
        }
        if let Some(artifact) = &spec.artifact
            && !artifact.exists()
        {
            return Err(StartError::ExecutableNotFound(artifact.display().to_string()));
        }
        if handle::resolve_program(spec).is_none() {
            return Err(StartError::ExecutableNotFound(spec.program.clone()));
        }

        let wrote = environment::ensure_acceptance_artifacts(&self.env.root, self.env.kind)
            .map_err(|source| StartError::Prepare {
                artifact: "eula.txt",
                source,
            })?;
        if wrote {
            self.marker("wrote eula.txt (eula=true)").await;
        }

        self.marker(format!(
            "starting {} ({}): {}",
            self.env.name,
            self.env.kind,
            spec.command_line()
        ))
        .await;

        let mut process = ManagedProcess::spawn(spec).map_err(|err| match err {
            HandleError::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                StartError::ExecutableNotFound(spec.program.clone())
            }
            other => StartError::SpawnFailed(other),
        })?;

        process.set_write_timeout(self.options.stdin_write);
        let pid = process.pid();
        let run_id = RunId::new();
        inner.process = Some(process);
        inner.run_id = Some(run_id.clone());
        inner.last_exit = None;
        tracing::info!(env = %self.env.name, ?pid, run_id = %run_id, "server process spawned");

        if let Some(settings) = &self.env.tunnel {
            inner.message = Some(format!("binding {} tunnel", settings.service));
            self.publish(inner);

            if let Err(err) = inner.tunnel.open(&TunnelRequest::from(settings)).await {
                let msg = format_error_chain(&err);
                self.marker(format!("tunnel {} failed: {msg}", settings.service))
                    .await;
                tracing::warn!(env = %self.env.name, service = %settings.service, error = %msg, "tunnel bind failed");

                match self.options.tunnel_failure {
                    TunnelFailurePolicy::KeepProcess => {
                        inner.state = LifecycleState::Running;
                        inner.message = Some(format!("running without tunnel: {msg}"));
                        self.publish(inner);
                    }
                    TunnelFailurePolicy::StopProcess => {
                        let timeout = self.options.term_grace;
                        if let Err(stop_err) = self.stop_locked(inner, timeout).await {
                            tracing::error!(env = %self.env.name, error = %stop_err, "rollback stop failed");
                        }
                    }
                }
                return Err(StartError::TunnelBindFailed(err));
            }

            if let Some(addr) = inner.tunnel.public_address() {
                self.marker(format!("tunnel {} ready at {addr}", settings.service))
                    .await;
            }
        }

        inner.state = LifecycleState::Running;
        inner.message = None;
        self.publish(inner);

        Ok(Running {
            pid,
            run_id,
            tunnel_address: inner.tunnel.public_address().map(str::to_string),
        })
    }

    pub async fn send_command(&self, line: &str) -> Result<(), CommandError> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Running {
            return Err(CommandError::NotRunning);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(process) = inner.process.as_mut() else {
            return Err(CommandError::NotRunning);
        };

        match process.write_line(line).await {
            Ok(()) => {
                self.emit(format!("> {line}")).await;
                Ok(())
            }
            Err(err @ HandleError::WriteTimedOut) => {
                // The server is alive but not reading; it keeps its handle and
                // the operator decides whether to stop it.
                tracing::warn!(env = %self.env.name, timeout_ms = self.options.stdin_write.as_millis() as u64, "stdin write timed out");
                self.marker(format!("command not delivered, server is not reading stdin: {line}"))
                    .await;
                inner.message = Some("stdin write timed out".to_string());
                self.publish(&inner);
                Err(CommandError::WriteFailed(err))
            }
            Err(err) => {
                tracing::warn!(env = %self.env.name, error = %format_error_chain(&err), "stdin write failed; cleaning up");
                if let Some(p) = inner.process.as_mut()
                    && p.is_alive()
                {
                    // Stdin is gone but the server is not; an idle environment
                    // must not leave it running untracked.
                    if let Err(kill_err) = p.kill() {
                        tracing::warn!(env = %self.env.name, pid = ?p.pid(), %kill_err, "SIGKILL after stdin loss failed");
                    }
                    if p.wait_timeout(self.options.kill_reap).await.is_none() {
                        tracing::error!(env = %self.env.name, pid = ?p.pid(), "process not reaped after kill");
                    }
                }
                self.finish(&mut inner, ExitReason::WriteFailed).await;
                Err(CommandError::WriteFailed(err))
            }
        }
    }

    pub async fn poll(&self) -> PollOutcome {
        let mut inner = self.inner.lock().await;
        let Some(process) = inner.process.as_mut() else {
            return PollOutcome::NoData;
        };

        let lines = process.drain(MAX_LINES_PER_POLL);
        let alive = process.is_alive();
        let appended = self.append_lines(lines).await;

        if alive {
            if let Some(gone) = inner.tunnel.reap_dead().await {
                self.marker(format!(
                    "tunnel {} agent exited; {} is no longer reachable (use bind-tunnel)",
                    gone.service, gone.public_address
                ))
                .await;
                inner.message = Some(format!("tunnel {} lost", gone.service));
                self.publish(&inner);
            }
            return if appended.is_empty() {
                PollOutcome::NoData
            } else {
                PollOutcome::Lines(appended)
            };
        }

        let code = self.finish(&mut inner, ExitReason::Exited).await;
        PollOutcome::Exited { code }
    }

    pub async fn stop(&self, timeout: Duration) -> Result<Stopped, StopError> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Running || inner.process.is_none() {
            return Err(StopError::NotRunning);
        }
        self.stop_locked(&mut inner, timeout).await
    }

    async fn stop_locked(&self, inner: &mut Inner, timeout: Duration) -> Result<Stopped, StopError> {
        let started = tokio::time::Instant::now();
        let mut escalation = Escalation::None;

        inner.state = LifecycleState::Stopping;
        inner.message = Some("stopping".to_string());
        self.publish(inner);
        self.marker(format!("stop requested (timeout_ms={})", timeout.as_millis()))
            .await;
        tracing::info!(env = %self.env.name, timeout_ms = timeout.as_millis() as u64, "stopping");

        let Some(process) = inner.process.as_mut() else {
            return Err(StopError::NotRunning);
        };

        if process.is_alive() {
            let graceful_sent = match &self.env.shutdown {
                ShutdownProfile::Cooperative { command } => {
                    match process.write_line(command).await {
                        Ok(()) => {
                            self.emit(format!("> {command}")).await;
                            true
                        }
                        Err(err) => {
                            self.marker(format!(
                                "stop: shutdown command failed: {}",
                                format_error_chain(&err)
                            ))
                            .await;
                            false
                        }
                    }
                }
                ShutdownProfile::SignalOnly => false,
            };

            let exited = graceful_sent && self.wait_for_exit(inner, timeout).await;

            if !exited {
                escalation = Escalation::Terminated;
                if let Some(p) = inner.process.as_mut()
                    && let Err(err) = p.terminate_gracefully()
                {
                    tracing::warn!(env = %self.env.name, %err, "SIGTERM failed");
                }
                self.marker("stop: sent SIGTERM").await;

                if !self.wait_for_exit(inner, self.options.term_grace).await {
                    escalation = Escalation::Killed;
                    if let Some(p) = inner.process.as_mut()
                        && let Err(err) = p.kill()
                    {
                        tracing::warn!(env = %self.env.name, %err, "SIGKILL failed");
                    }
                    self.marker("stop: sent SIGKILL").await;

                    if !self.wait_for_exit(inner, self.options.kill_reap).await {
                        return Err(self.unreaped(inner).await);
                    }
                }
            }
        }

        let exit_code = self.finish(inner, ExitReason::Stopped).await;
        let elapsed = started.elapsed();
        tracing::info!(env = %self.env.name, ?exit_code, ?escalation, elapsed_ms = elapsed.as_millis() as u64, "stopped");
        Ok(Stopped {
            exit_code,
            escalation,
            elapsed,
        })
    }

    async fn unreaped(&self, inner: &mut Inner) -> StopError {
        // The tunnel must not outlive the server; close it even though the
        // process is stuck.
        inner.tunnel.close().await;
        let pid = inner.process.as_ref().and_then(|p| p.pid());
        inner.state = LifecycleState::Running;
        inner.message = Some("kill did not reap the process; intervention required".to_string());
        self.publish(inner);
        self.marker("stop: process still not reaped after SIGKILL").await;
        tracing::error!(env = %self.env.name, ?pid, "process not reaped after SIGKILL");
        StopError::Unreaped {
            pid,
            timeout_ms: self.options.kill_reap.as_millis(),
        }
    }

    /// Drains output while waiting up to `within` for the process to exit.
    async fn wait_for_exit(&self, inner: &mut Inner, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let Some(process) = inner.process.as_mut() else {
                return true;
            };
            let lines = process.drain(MAX_LINES_PER_POLL);
            let alive = process.is_alive();
            self.append_lines(lines).await;
            if !alive {
                return true;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(STOP_TICK.min(deadline - now)).await;
        }
    }

    /// Common cleanup once the process is gone: last output, tunnel, handle,
    /// state. Returns the exit code.
    async fn finish(&self, inner: &mut Inner, reason: ExitReason) -> Option<i32> {
        let Some(mut process) = inner.process.take() else {
            return inner.last_exit;
        };

        let rest = process.drain_remaining(EXIT_DRAIN).await;
        self.append_lines(rest).await;

        inner.tunnel.close().await;

        let code = process.exit_code();
        let desc = process.describe_exit();
        let pid = process.pid();
        drop(process);

        inner.state = LifecycleState::Idle;
        inner.last_exit = code;
        inner.message = Some(match reason {
            ExitReason::Exited => format!("exited ({desc})"),
            ExitReason::Stopped => format!("stopped ({desc})"),
            ExitReason::WriteFailed => format!("stdin lost; process discarded ({desc})"),
        });
        self.publish(inner);

        match reason {
            ExitReason::Stopped => self.marker(format!("server stopped ({desc})")).await,
            ExitReason::Exited => {
                tracing::warn!(env = %self.env.name, ?pid, exit = %desc, "server process exited");
                self.marker(format!("server process exited ({desc})")).await
            }
            ExitReason::WriteFailed => {
                self.marker(format!("lost server stdin; process discarded ({desc})"))
                    .await
            }
        }
        code
    }

    /// Retries the tunnel for a running server whose start reported
    /// `TunnelBindFailed`.
    pub async fn bind_tunnel(&self) -> Result<String, BindError> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Running {
            return Err(BindError::NotRunning);
        }
        let Some(settings) = &self.env.tunnel else {
            return Err(BindError::NotConfigured);
        };
        let alive = inner.process.as_mut().is_some_and(|p| p.is_alive());
        if !alive {
            self.finish(&mut inner, ExitReason::Exited).await;
            return Err(BindError::NotRunning);
        }

        let binding = inner.tunnel.open(&TunnelRequest::from(settings)).await?;
        inner.message = None;
        self.publish(&inner);
        self.marker(format!(
            "tunnel {} ready at {}",
            binding.service, binding.public_address
        ))
        .await;
        Ok(binding.public_address)
    }
}
