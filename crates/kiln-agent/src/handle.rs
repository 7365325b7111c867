use std::{
    ffi::OsString,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
};

use crate::environment::LaunchSpec;
use crate::error::HandleError;
use crate::supervisor_support;

/// Locates the program a launch spec names: relative paths against the
/// working directory, bare names on `PATH`.
pub fn resolve_program(spec: &LaunchSpec) -> Option<PathBuf> {
    let paths = spec
        .env
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"));
    which::which_in(&spec.program, paths, &spec.working_dir).ok()
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Child gets SIGTERM if the agent dies without stopping it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // The child called setsid(), so its pid is also its process group id.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    // Servers print non-UTF-8 bytes now and then; keep the line.
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// One spawned server process with captured stdio.
///
/// Output from stdout and stderr is merged into a single line channel fed by
/// two reader tasks, so reads never block the caller. The channel is
/// unbounded: whoever owns the handle must keep reading it, or hand the
/// receiver off with [`ManagedProcess::take_output`].
#[derive(Debug)]
pub struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    output: Option<mpsc::UnboundedReceiver<String>>,
    exit: Option<ExitStatus>,
    write_timeout: Duration,
}

impl ManagedProcess {
    pub fn spawn(spec: &LaunchSpec) -> Result<Self, HandleError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            let bind_to_agent = supervisor_support::bind_child_to_agent();
            unsafe {
                cmd.pre_exec(move || {
                    if bind_to_agent {
                        set_parent_death_signal()?;
                    }
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| HandleError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        if let Some(out) = child.stdout.take() {
            spawn_line_reader(out, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_line_reader(err, tx.clone());
        }
        drop(tx);

        Ok(Self {
            child,
            pid,
            stdin,
            output: Some(rx),
            exit: None,
            write_timeout: supervisor_support::stdin_write_timeout(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    /// Detaches the output channel. Later reads on this handle return nothing.
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.output.take()
    }

    /// Lines captured but not yet read.
    pub fn pending_lines(&self) -> usize {
        self.output.as_ref().map_or(0, |rx| rx.len())
    }

    /// Non-blocking liveness check; reaps the child if it has exited.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                self.stdin = None;
                false
            }
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(pid = ?self.pid, %err, "try_wait failed; treating process as gone");
                self.stdin = None;
                false
            }
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|s| s.code())
    }

    /// Human-readable exit summary, e.g. `code 0` or `signal 9`.
    pub fn describe_exit(&self) -> String {
        let Some(status) = self.exit else {
            return "unknown".to_string();
        };
        if let Some(code) = status.code() {
            return format!("code {code}");
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return format!("signal {sig}");
            }
        }
        "unknown".to_string()
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), HandleError> {
        if !self.is_alive() {
            return Err(HandleError::BrokenPipe);
        }
        let stdin = self.stdin.as_mut().ok_or(HandleError::BrokenPipe)?;

        let res = tokio::time::timeout(self.write_timeout, async {
            stdin.write_all(bytes).await?;
            stdin.flush().await
        })
        .await;

        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                self.stdin = None;
                Err(HandleError::BrokenPipe)
            }
            Ok(Err(err)) => {
                self.stdin = None;
                Err(HandleError::Io(err))
            }
            Err(_) => Err(HandleError::WriteTimedOut),
        }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), HandleError> {
        let mut data = String::with_capacity(line.len() + 1);
        data.push_str(line);
        data.push('\n');
        self.write(data.as_bytes()).await
    }

    /// Next buffered output line, or `None` if nothing is available yet.
    pub fn read_line(&mut self) -> Option<String> {
        self.output.as_mut()?.try_recv().ok()
    }

    /// Up to `max` already-buffered lines.
    pub fn drain(&mut self, max: usize) -> Vec<String> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.read_line() {
                Some(line) => out.push(line),
                None => break,
            }
        }
        out
    }

    /// After exit: collect output still in flight until both streams close
    /// or `within` elapses (a grandchild may hold the pipes open).
    pub async fn drain_remaining(&mut self, within: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + within;
        let mut out = Vec::new();
        let Some(output) = self.output.as_mut() else {
            return out;
        };
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, output.recv()).await {
            out.push(line);
        }
        out
    }

    /// SIGTERM to the whole process group.
    pub fn terminate_gracefully(&mut self) -> std::io::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            match self.pid {
                Some(pid) => signal_group(pid, libc::SIGTERM),
                None => Ok(()),
            }
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    /// SIGKILL to the whole process group.
    pub fn kill(&mut self) -> std::io::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            match self.pid {
                Some(pid) => signal_group(pid, libc::SIGKILL),
                None => self.child.start_kill(),
            }
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    /// Waits up to `timeout` for the process to exit and reaps it.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.exit {
            return Some(status);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit = Some(status);
                self.stdin = None;
                Some(status)
            }
            Ok(Err(err)) => {
                tracing::warn!(pid = ?self.pid, %err, "wait failed");
                None
            }
            Err(_) => None,
        }
    }
}
