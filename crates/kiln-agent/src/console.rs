//! The `kiln` command line: one-shot commands, the attached `start`, and the
//! interactive console.

use std::{
    collections::BTreeSet,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use kiln_process::{EnvironmentStatus, LifecycleState};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::control;
use crate::error::{ExitClass, StartError, exit};
use crate::registry::Registry;
use crate::supervisor::{Escalation, PollOutcome, Supervisor};
use crate::supervisor_support::{self, format_error_chain};

#[derive(Debug, Parser)]
#[command(name = "kiln", version, about = "Supervise game-server processes and their tunnels")]
pub struct Cli {
    /// Provisioning file (defaults to $KILN_CONFIG, then ./kiln.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: TopCommand,
}

#[derive(Debug, Subcommand)]
pub enum TopCommand {
    /// Start a server and attach to its console; EOF or Ctrl-C stops it
    Start {
        env: String,
        /// Seconds to wait for a graceful stop when detaching
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    #[command(flatten)]
    Op(Op),
    /// Interactive console over every configured environment
    Console,
}

/// Commands shared by the command line, the console and the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Op {
    /// Stop a running server
    Stop {
        env: String,
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// Send a command line to the server's stdin
    Send {
        env: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Print the console buffer
    Logs {
        env: String,
        #[arg(long, value_name = "N")]
        tail: Option<usize>,
    },
    /// Show lifecycle state, pid and tunnel address
    Status {
        env: String,
        #[arg(long)]
        json: bool,
    },
    /// Retry the tunnel of a running server
    BindTunnel { env: String },
    /// Empty the console buffer
    ClearLogs { env: String },
    /// List configured environments
    List,
}

impl Op {
    /// The environment a command targets; `None` for `list`.
    pub fn env(&self) -> Option<&str> {
        match self {
            Op::Stop { env, .. }
            | Op::Send { env, .. }
            | Op::Logs { env, .. }
            | Op::Status { env, .. }
            | Op::BindTunnel { env }
            | Op::ClearLogs { env } => Some(env),
            Op::List => None,
        }
    }
}

#[derive(Debug, Parser)]
#[command(multicall = true)]
struct ReplLine {
    #[command(subcommand)]
    command: ReplCommand,
}

#[derive(Debug, Subcommand)]
enum ReplCommand {
    /// Start a server in the background
    Start { env: String },
    #[command(flatten)]
    Op(Op),
    /// Stop running servers and leave
    #[command(alias = "exit")]
    Quit,
}

/// `--timeout` seconds, or `KILN_STOP_TIMEOUT_SEC`.
pub fn stop_timeout(secs: Option<u64>) -> Duration {
    secs.map(Duration::from_secs)
        .unwrap_or_else(supervisor_support::default_stop_timeout)
}

fn lookup<'a>(
    registry: &'a Registry,
    name: &str,
    err: &mut impl Write,
) -> Result<&'a Arc<Supervisor>, i32> {
    registry.get(name).ok_or_else(|| {
        let _ = writeln!(err, "error: unknown environment `{name}`");
        exit::NOT_FOUND
    })
}

fn report<E: std::error::Error + ExitClass + 'static>(error: &E, err: &mut impl Write) -> i32 {
    let _ = writeln!(err, "error: {}", format_error_chain(error));
    error.exit_code()
}

fn describe_escalation(e: Escalation) -> &'static str {
    match e {
        Escalation::None => "graceful",
        Escalation::Terminated => "after SIGTERM",
        Escalation::Killed => "after SIGKILL",
    }
}

fn write_list_row(out: &mut impl Write, st: &EnvironmentStatus) {
    let _ = writeln!(out, "{:<20} {:<8} {}", st.name, st.kind.as_str(), st.state);
}

/// Runs one command against `registry`. Results go to `out`, diagnostics to
/// `err`; returns the exit code.
pub async fn run_op(
    registry: &Registry,
    op: Op,
    out: &mut impl Write,
    err: &mut impl Write,
) -> i32 {
    match run_op_inner(registry, op, out, err).await {
        Ok(code) | Err(code) => code,
    }
}

async fn run_op_inner(
    registry: &Registry,
    op: Op,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<i32, i32> {
    match op {
        Op::Stop { env, timeout } => {
            let sup = lookup(registry, &env, err)?;
            match sup.stop(stop_timeout(timeout)).await {
                Ok(stopped) => {
                    let code = stopped
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "none".to_string());
                    let _ = writeln!(
                        out,
                        "stopped {env} {} in {:.1}s (exit code {code})",
                        describe_escalation(stopped.escalation),
                        stopped.elapsed.as_secs_f64()
                    );
                    Ok(exit::OK)
                }
                Err(e) => Err(report(&e, err)),
            }
        }
        Op::Send { env, text } => {
            let sup = lookup(registry, &env, err)?;
            sup.send_command(&text.join(" "))
                .await
                .map_err(|e| report(&e, err))?;
            Ok(exit::OK)
        }
        Op::Logs { env, tail } => {
            let sup = lookup(registry, &env, err)?;
            let lines = match tail {
                Some(n) => sup.tail(n).await,
                None => sup.snapshot().await,
            };
            for l in lines {
                let _ = writeln!(out, "{}", l.text);
            }
            Ok(exit::OK)
        }
        Op::Status { env, json } => {
            let sup = lookup(registry, &env, err)?;
            let st = sup.status();
            if json {
                let text = serde_json::to_string_pretty(&st).map_err(|e| {
                    let _ = writeln!(err, "error: encode status: {e}");
                    exit::FAILURE
                })?;
                let _ = writeln!(out, "{text}");
            } else {
                let _ = write!(out, "{}: {} ({})", st.name, st.state, st.kind);
                if let Some(pid) = st.pid {
                    let _ = write!(out, " pid={pid}");
                }
                if let Some(code) = st.exit_code {
                    let _ = write!(out, " last_exit={code}");
                }
                if let Some(addr) = &st.tunnel_address {
                    let _ = write!(out, " tunnel={addr}");
                }
                if let Some(msg) = &st.message {
                    let _ = write!(out, " - {msg}");
                }
                let _ = writeln!(out);
            }
            Ok(exit::OK)
        }
        Op::BindTunnel { env } => {
            let sup = lookup(registry, &env, err)?;
            let addr = sup.bind_tunnel().await.map_err(|e| report(&e, err))?;
            let _ = writeln!(out, "{env} reachable at {addr}");
            Ok(exit::OK)
        }
        Op::ClearLogs { env } => {
            let sup = lookup(registry, &env, err)?;
            sup.clear_logs().await;
            Ok(exit::OK)
        }
        Op::List => {
            for sup in registry.iter() {
                write_list_row(out, &sup.status());
            }
            Ok(exit::OK)
        }
    }
}

/// Routes commands to whichever kiln process supervises the environment:
/// this one for environments it owns, otherwise the owner's control socket.
/// With no owner anywhere the environment is idle and the local registry
/// answers.
#[derive(Debug)]
pub struct Dispatch<'a> {
    registry: &'a Registry,
    run_dir: Option<PathBuf>,
    owned: BTreeSet<String>,
}

impl<'a> Dispatch<'a> {
    /// Local registry only; nothing is forwarded.
    pub fn local(registry: &'a Registry) -> Self {
        Self {
            registry,
            run_dir: None,
            owned: BTreeSet::new(),
        }
    }

    pub fn new(registry: &'a Registry, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: Some(run_dir.into()),
            ..Self::local(registry)
        }
    }

    /// Environments this process serves itself.
    pub fn owning<'n>(mut self, names: impl IntoIterator<Item = &'n str>) -> Self {
        self.owned.extend(names.into_iter().map(str::to_string));
        self
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    pub fn owns(&self, env: &str) -> bool {
        self.run_dir.is_none() || self.owned.contains(env)
    }

    fn remote_socket(&self, env: &str) -> Option<PathBuf> {
        if self.owns(env) || self.registry.get(env).is_none() {
            return None;
        }
        self.run_dir.as_deref().map(|dir| control::socket_path(dir, env))
    }

    pub async fn run(&self, op: Op, out: &mut impl Write, err: &mut impl Write) -> i32 {
        if op == Op::List {
            return self.list(out).await;
        }
        if let Some(path) = op.env().and_then(|env| self.remote_socket(env))
            && let Some(code) = forward(&path, &op, out, err).await
        {
            return code;
        }
        run_op(self.registry, op, out, err).await
    }

    async fn list(&self, out: &mut impl Write) -> i32 {
        for sup in self.registry.iter() {
            let mut st = sup.status();
            if let Some(path) = self.remote_socket(sup.name())
                && let Some(remote) = remote_status(&path, sup.name()).await
            {
                st = remote;
            }
            write_list_row(out, &st);
        }
        exit::OK
    }
}

/// `None` when nobody listens on `path`.
async fn forward(path: &Path, op: &Op, out: &mut impl Write, err: &mut impl Write) -> Option<i32> {
    match control::request(path, op).await {
        Ok(resp) => {
            let _ = out.write_all(resp.stdout.as_bytes());
            let _ = err.write_all(resp.stderr.as_bytes());
            Some(resp.code)
        }
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::Unsupported
            ) =>
        {
            None
        }
        Err(e) => {
            let _ = writeln!(err, "error: control socket {}: {e}", path.display());
            Some(exit::FAILURE)
        }
    }
}

async fn remote_status(path: &Path, env: &str) -> Option<EnvironmentStatus> {
    let op = Op::Status {
        env: env.to_string(),
        json: true,
    };
    let resp = control::request(path, &op).await.ok()?;
    if resp.code != exit::OK {
        return None;
    }
    serde_json::from_str(&resp.stdout).ok()
}

async fn start_detached(
    dispatch: &Dispatch<'_>,
    env: &str,
    out: &mut impl Write,
    err: &mut impl Write,
) -> i32 {
    let sup = match lookup(dispatch.registry(), env, err) {
        Ok(s) => s,
        Err(code) => return code,
    };
    if !dispatch.owns(env) {
        let _ = writeln!(err, "error: `{env}` is supervised by another kiln process");
        return exit::INVALID_STATE;
    }
    match sup.start().await {
        Ok(running) => {
            let _ = write!(out, "started {env} (run {})", running.run_id);
            if let Some(pid) = running.pid {
                let _ = write!(out, " pid={pid}");
            }
            if let Some(addr) = &running.tunnel_address {
                let _ = write!(out, " tunnel={addr}");
            }
            let _ = writeln!(out);
            exit::OK
        }
        Err(e) => {
            let code = report(&e, err);
            if matches!(e, StartError::TunnelBindFailed(_)) && sup.status().state.is_active() {
                let _ = writeln!(out, "{env} is running without a tunnel; try `bind-tunnel {env}`");
            }
            code
        }
    }
}

async fn print_since(sup: &Supervisor, cursor: u64) -> u64 {
    let lines = sup.since(cursor, usize::MAX).await;
    let mut stdout = std::io::stdout().lock();
    let mut last = cursor;
    for l in lines {
        let _ = writeln!(stdout, "{}", l.text);
        last = l.seq;
    }
    let _ = stdout.flush();
    last
}

/// `kiln start <env>`: runs the server in the foreground, streaming its
/// console and forwarding stdin lines as commands.
pub async fn run_attached(sup: &Supervisor, stop_timeout: Duration) -> i32 {
    let mut cursor = sup.tail(1).await.last().map(|l| l.seq).unwrap_or(0);

    if let Err(err) = sup.start().await {
        let code = report(&err, &mut std::io::stderr());
        let kept = matches!(err, StartError::TunnelBindFailed(_)) && sup.status().state.is_active();
        if !kept {
            print_since(sup, cursor).await;
            return code;
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(supervisor_support::poll_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let outcome = sup.poll().await;
                cursor = print_since(sup, cursor).await;
                if let PollOutcome::Exited { code } = outcome {
                    return if code == Some(0) { exit::OK } else { exit::FAILURE };
                }
                // Stopped through the control socket.
                if sup.status().state == LifecycleState::Idle {
                    return exit::OK;
                }
            }
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(err) = sup.send_command(&line).await {
                        let code = report(&err, &mut std::io::stderr());
                        print_since(sup, cursor).await;
                        return code;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "stdin read failed; stopping");
                    break;
                }
            },
            _ = &mut ctrl_c => break,
        }
    }

    let res = sup.stop(stop_timeout).await;
    print_since(sup, cursor).await;
    match res {
        Ok(_) => exit::OK,
        Err(err) => report(&err, &mut std::io::stderr()),
    }
}

/// `kiln console`: a line-oriented shell over the registry. Servers keep
/// being polled in the background; leaving the console stops them.
pub async fn run_console(dispatch: &Dispatch<'_>, stop_timeout: Duration) -> i32 {
    let registry = dispatch.registry();
    let _workers = registry.spawn_pollers(supervisor_support::poll_interval());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!(
        "kiln console: {} environment(s); type `help` for commands",
        registry.len()
    );

    loop {
        {
            let mut stdout = std::io::stdout().lock();
            let _ = write!(stdout, "kiln> ");
            let _ = stdout.flush();
        }

        let line = tokio::select! {
            line = stdin.next_line() => line,
            _ = &mut ctrl_c => Ok(None),
        };
        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, "stdin read failed");
                break;
            }
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let parsed = match ReplLine::try_parse_from(words) {
            Ok(p) => p,
            Err(err) => {
                let _ = err.print();
                continue;
            }
        };

        let mut stdout = std::io::stdout();
        let mut stderr = std::io::stderr();
        let code = match parsed.command {
            ReplCommand::Quit => break,
            ReplCommand::Start { env } => {
                start_detached(dispatch, &env, &mut stdout, &mut stderr).await
            }
            ReplCommand::Op(op) => dispatch.run(op, &mut stdout, &mut stderr).await,
        };
        if code != exit::OK {
            tracing::debug!(code, "console command failed");
        }
    }

    registry.stop_all(stop_timeout).await;
    exit::OK
}

#[cfg(test)]
mod tests {
    use kiln_process::ServerKind;

    use super::*;
    use crate::environment::{LaunchSpec, ManagedEnvironment};
    use crate::supervisor::SupervisorOptions;

    fn registry(dir: &std::path::Path) -> Registry {
        let env = ManagedEnvironment::new(
            "survival",
            dir,
            ServerKind::Bedrock,
            LaunchSpec::new("sh", dir).args(["-c", "echo hello; sleep 30"]),
        );
        Registry::new(
            vec![env],
            SupervisorOptions {
                term_grace: Duration::from_millis(500),
                kill_reap: Duration::from_secs(5),
                stdin_write: Duration::from_secs(2),
                log_capacity: 50,
                tunnel_failure: Default::default(),
            },
        )
    }

    #[test]
    fn parses_top_level_commands() {
        let cli = Cli::try_parse_from(["kiln", "stop", "survival", "--timeout", "5"]).unwrap();
        assert!(matches!(
            cli.command,
            TopCommand::Op(Op::Stop { ref env, timeout: Some(5) }) if env == "survival"
        ));

        let cli = Cli::try_parse_from(["kiln", "send", "survival", "say", "-hi"]).unwrap();
        assert!(matches!(
            cli.command,
            TopCommand::Op(Op::Send { ref text, .. }) if text == &["say", "-hi"]
        ));

        let cli = Cli::try_parse_from(["kiln", "--config", "x.toml", "start", "survival"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, TopCommand::Start { timeout: None, .. }));
    }

    #[test]
    fn parses_console_lines() {
        let p = ReplLine::try_parse_from(["bind-tunnel", "survival"]).unwrap();
        assert!(matches!(p.command, ReplCommand::Op(Op::BindTunnel { .. })));
        let p = ReplLine::try_parse_from(["exit"]).unwrap();
        assert!(matches!(p.command, ReplCommand::Quit));
        assert!(ReplLine::try_parse_from(["console"]).is_err());
    }

    #[tokio::test]
    async fn exit_codes_for_one_shot_ops() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let mut out = Vec::new();
        let mut err = Vec::new();

        let code = run_op(
            &reg,
            Op::Stop {
                env: "missing".into(),
                timeout: None,
            },
            &mut out,
            &mut err,
        )
        .await;
        assert_eq!(code, exit::NOT_FOUND);
        assert!(String::from_utf8_lossy(&err).contains("unknown environment `missing`"));

        let code = run_op(
            &reg,
            Op::Stop {
                env: "survival".into(),
                timeout: Some(1),
            },
            &mut out,
            &mut err,
        )
        .await;
        assert_eq!(code, exit::INVALID_STATE);

        let code = run_op(
            &reg,
            Op::BindTunnel {
                env: "survival".into(),
            },
            &mut out,
            &mut err,
        )
        .await;
        assert_eq!(code, exit::INVALID_STATE);

        let code = run_op(
            &reg,
            Op::Status {
                env: "survival".into(),
                json: true,
            },
            &mut out,
            &mut err,
        )
        .await;
        assert_eq!(code, exit::OK);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"state\": \"idle\""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_then_stop_from_console() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let dispatch = Dispatch::local(&reg);
        let mut out = Vec::new();
        let mut err = Vec::new();

        assert_eq!(start_detached(&dispatch, "survival", &mut out, &mut err).await, exit::OK);
        assert_eq!(
            start_detached(&dispatch, "survival", &mut out, &mut err).await,
            exit::INVALID_STATE
        );

        let code = run_op(
            &reg,
            Op::Stop {
                env: "survival".into(),
                timeout: Some(1),
            },
            &mut out,
            &mut err,
        )
        .await;
        assert_eq!(code, exit::OK);

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("started survival"));
        assert!(text.contains("stopped survival after SIGTERM"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn one_shot_commands_reach_the_supervising_process() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");

        // The process that runs the server.
        let owner = Arc::new(registry(dir.path()));
        let mut control = control::ControlServer::default();
        control.claim(&owner, &run_dir, "survival").await.unwrap();
        owner.get("survival").unwrap().start().await.unwrap();

        // A later `kiln` invocation with its own, idle registry.
        let fresh = registry(dir.path());
        let dispatch = Dispatch::new(&fresh, &run_dir);
        let mut out = Vec::new();
        let mut err = Vec::new();

        let code = dispatch.run(Op::List, &mut out, &mut err).await;
        assert_eq!(code, exit::OK);
        assert!(String::from_utf8_lossy(&out).contains("running"));

        let code = dispatch
            .run(
                Op::Stop {
                    env: "survival".into(),
                    timeout: Some(1),
                },
                &mut out,
                &mut err,
            )
            .await;
        assert_eq!(code, exit::OK, "{}", String::from_utf8_lossy(&err));
        assert_eq!(owner.get("survival").unwrap().status().state, LifecycleState::Idle);
        assert!(String::from_utf8_lossy(&out).contains("stopped survival after SIGTERM"));

        // The owner cannot be double-started from another console.
        let code = start_detached(&dispatch, "survival", &mut out, &mut err).await;
        assert_eq!(code, exit::INVALID_STATE);
        assert!(String::from_utf8_lossy(&err).contains("supervised by another kiln process"));

        // With the owner gone, commands fall back to the local registry.
        drop(control);
        let code = dispatch
            .run(
                Op::Stop {
                    env: "survival".into(),
                    timeout: Some(1),
                },
                &mut out,
                &mut err,
            )
            .await;
        assert_eq!(code, exit::INVALID_STATE);
    }

    #[test]
    fn ops_travel_as_tagged_json() {
        let op = Op::Send {
            env: "survival".into(),
            text: vec!["say".into(), "hi".into()],
        };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"op":"send","env":"survival","text":["say","hi"]}"#);
        assert_eq!(serde_json::from_str::<Op>(&json).unwrap(), op);
        assert_eq!(
            serde_json::from_str::<Op>(r#"{"op":"bind-tunnel","env":"x"}"#).unwrap(),
            Op::BindTunnel { env: "x".into() }
        );
        assert_eq!(op.env(), Some("survival"));
        assert_eq!(Op::List.env(), None);
    }
}
