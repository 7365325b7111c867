use std::time::Duration;

use async_trait::async_trait;
use kiln_process::{Protocol, TunnelService};

use super::{TunnelProvider, TunnelRequest};
use crate::environment::LaunchSpec;
use crate::error::TunnelError;
use crate::handle::{self, ManagedProcess};
use crate::supervisor_support;

const AGENT_STOP_GRACE: Duration = Duration::from_secs(3);

/// How to run one vendor's relay agent and find the public address in its
/// output.
#[derive(Debug, Clone, Copy)]
pub struct AgentProfile {
    pub service: TunnelService,
    pub program: &'static str,
    pub protocols: &'static [Protocol],
    build: fn(&TunnelRequest, &mut LaunchSpec),
    extract: fn(&str) -> Option<String>,
}

fn token(request: &TunnelRequest) -> String {
    request.credentials.token.clone().unwrap_or_default()
}

fn ngrok_build(request: &TunnelRequest, spec: &mut LaunchSpec) {
    spec.args.extend([
        request.protocol.as_str().to_string(),
        request.local_port.to_string(),
        "--log".to_string(),
        "stdout".to_string(),
        "--log-format".to_string(),
        "logfmt".to_string(),
    ]);
    if let Some(region) = request.credentials.region.as_deref().filter(|r| !r.is_empty()) {
        spec.args.extend(["--region".to_string(), region.to_string()]);
    }
    // Env rather than argv keeps the token out of `ps`.
    spec.env.insert("NGROK_AUTHTOKEN".to_string(), token(request));
}

fn ngrok_extract(line: &str) -> Option<String> {
    line.split_whitespace()
        .find_map(|t| t.strip_prefix("url="))
        .map(|u| u.trim_matches('"').to_string())
        .filter(|u| u.contains("://"))
}

fn playit_build(request: &TunnelRequest, spec: &mut LaunchSpec) {
    spec.args.push("start".to_string());
    spec.env.insert("SECRET_KEY".to_string(), token(request));
}

fn playit_extract(line: &str) -> Option<String> {
    find_host_token(line, &[".joinmc.link", ".ply.gg", ".playit.gg", ".at.ply.gg"])
}

fn zrok_build(request: &TunnelRequest, spec: &mut LaunchSpec) {
    let mode = match request.protocol {
        Protocol::Tcp => "tcpTunnel",
        Protocol::Udp => "udpTunnel",
    };
    spec.args.extend([
        "share".to_string(),
        "private".to_string(),
        "--headless".to_string(),
        "--backend-mode".to_string(),
        mode.to_string(),
        format!("127.0.0.1:{}", request.local_port),
    ]);
    spec.env.insert("ZROK_ENABLE_TOKEN".to_string(), token(request));
}

fn zrok_extract(line: &str) -> Option<String> {
    // Private shares print the token peers pass to `zrok access private`.
    let rest = line.split("zrok access private").nth(1)?;
    let share = rest
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if share.is_empty() {
        return None;
    }
    Some(format!("zrok://{share}"))
}

fn localtonet_build(request: &TunnelRequest, spec: &mut LaunchSpec) {
    spec.args.extend(["authtoken".to_string(), token(request)]);
}

fn localtonet_extract(line: &str) -> Option<String> {
    find_host_token(line, &[".localto.net"])
}

/// First whitespace-separated token whose host part ends with one of
/// `suffixes`, e.g. `abc.joinmc.link` or `tcp://x.localto.net:4242`.
fn find_host_token(line: &str, suffixes: &[&str]) -> Option<String> {
    line.split(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | ',' | '(' | ')' | '<' | '>'))
        .map(|t| t.trim_end_matches(['.', ';']))
        .find(|t| {
            let host = t.split_once("://").map(|(_, h)| h).unwrap_or(t);
            let host = host.split(['/', ':']).next().unwrap_or(host);
            let host = host.to_ascii_lowercase();
            suffixes.iter().any(|s| host.ends_with(s) && host.len() > s.len())
        })
        .map(str::to_string)
}

impl AgentProfile {
    pub fn for_service(service: TunnelService) -> Self {
        match service {
            TunnelService::Ngrok => Self {
                service,
                program: "ngrok",
                protocols: &[Protocol::Tcp],
                build: ngrok_build,
                extract: ngrok_extract,
            },
            TunnelService::Playit => Self {
                service,
                program: "playit",
                protocols: &[Protocol::Tcp, Protocol::Udp],
                build: playit_build,
                extract: playit_extract,
            },
            TunnelService::Zrok => Self {
                service,
                program: "zrok",
                protocols: &[Protocol::Tcp, Protocol::Udp],
                build: zrok_build,
                extract: zrok_extract,
            },
            TunnelService::Localtonet => Self {
                service,
                program: "localtonet",
                protocols: &[Protocol::Tcp, Protocol::Udp],
                build: localtonet_build,
                extract: localtonet_extract,
            },
        }
    }

    pub fn extract_address(&self, line: &str) -> Option<String> {
        (self.extract)(line)
    }

    fn launch_spec(&self, program: &str, request: &TunnelRequest) -> LaunchSpec {
        let mut spec = LaunchSpec::new(program, std::env::temp_dir());
        (self.build)(request, &mut spec);
        spec
    }
}

/// Tunnel backed by a vendor relay agent running as a child process. The
/// agent lives exactly as long as the binding.
#[derive(Debug)]
pub struct AgentTunnel {
    profile: AgentProfile,
    program: String,
    open_timeout: Duration,
    agent: Option<ManagedProcess>,
}

impl AgentTunnel {
    pub fn new(profile: AgentProfile) -> Self {
        let program = supervisor_support::tunnel_bin_override(profile.service.as_str())
            .unwrap_or_else(|| profile.program.to_string());
        Self::with_program(profile, program)
    }

    pub fn with_program(profile: AgentProfile, program: impl Into<String>) -> Self {
        Self {
            profile,
            program: program.into(),
            open_timeout: supervisor_support::tunnel_open_timeout(),
            agent: None,
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Keeps reading a bound agent's output so its pipes never back up.
    fn forward_output(&self, agent: &mut ManagedProcess) {
        let Some(mut output) = agent.take_output() else {
            return;
        };
        let service = self.profile.service;
        let pid = agent.pid();
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                tracing::debug!(%service, ?pid, "{line}");
            }
        });
    }

    async fn shutdown_agent(agent: &mut ManagedProcess) {
        let _ = agent.terminate_gracefully();
        if agent.wait_timeout(AGENT_STOP_GRACE).await.is_some() {
            return;
        }
        let _ = agent.kill();
        if agent.wait_timeout(AGENT_STOP_GRACE).await.is_none() {
            tracing::warn!(pid = ?agent.pid(), "tunnel agent not reaped after kill");
        }
    }
}

#[async_trait]
impl TunnelProvider for AgentTunnel {
    async fn open(&mut self, request: &TunnelRequest) -> Result<String, TunnelError> {
        if self.agent.is_some() {
            return Err(TunnelError::AlreadyBound);
        }
        if !self.profile.protocols.contains(&request.protocol) {
            return Err(TunnelError::UnsupportedProtocol {
                service: self.profile.service,
                protocol: request.protocol,
            });
        }

        let spec = self.profile.launch_spec(&self.program, request);
        if handle::resolve_program(&spec).is_none() {
            return Err(TunnelError::ServiceUnavailable(format!(
                "{} agent `{}` not found",
                self.profile.service, self.program
            )));
        }

        let mut agent = ManagedProcess::spawn(&spec).map_err(|e| {
            TunnelError::ServiceUnavailable(supervisor_support::format_error_chain(&e))
        })?;

        let deadline = tokio::time::Instant::now() + self.open_timeout;
        let mut last_line: Option<String> = None;
        loop {
            for line in agent.drain(256) {
                if let Some(addr) = self.profile.extract_address(&line) {
                    self.forward_output(&mut agent);
                    self.agent = Some(agent);
                    return Ok(addr);
                }
                last_line = Some(line);
            }

            if !agent.is_alive() {
                // An address printed right before dying is not usable either.
                if let Some(line) = agent.drain_remaining(Duration::from_millis(500)).await.pop() {
                    last_line = Some(line);
                }
                return Err(TunnelError::ServiceUnavailable(format!(
                    "{} agent exited ({}){}",
                    self.profile.service,
                    agent.describe_exit(),
                    last_line.map(|l| format!(": {l}")).unwrap_or_default()
                )));
            }

            if tokio::time::Instant::now() >= deadline {
                Self::shutdown_agent(&mut agent).await;
                return Err(TunnelError::ServiceUnavailable(format!(
                    "{} agent reported no public address within {}ms",
                    self.profile.service,
                    self.open_timeout.as_millis()
                )));
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn close(&mut self) {
        if let Some(mut agent) = self.agent.take() {
            Self::shutdown_agent(&mut agent).await;
        }
    }

    fn is_alive(&mut self) -> bool {
        self.agent.as_mut().is_none_or(|a| a.is_alive())
    }
}
