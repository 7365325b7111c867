use std::fmt;

/// Identifies one spawn of an environment's server process.
///
/// NOTE: A new id is minted on every successful start, so consumers can tell
/// restarts apart even when the OS reuses a pid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Jar-based servers (vanilla, paper, purpur, forge packs, proxies).
    Java,
    /// The native bedrock dedicated server.
    Bedrock,
}

/// How a server is asked to shut down before signals are used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownProfile {
    /// The server reads a shutdown command from stdin and saves before exiting.
    Cooperative { command: String },
    /// Only signals are used.
    SignalOnly,
}

impl ServerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerKind::Java => "java",
            ServerKind::Bedrock => "bedrock",
        }
    }

    /// Default stop behaviour for the kind. An environment may override the
    /// command text, but the kind decides whether a command is sent at all
    /// when nothing is configured.
    pub fn shutdown_profile(self) -> ShutdownProfile {
        match self {
            ServerKind::Java => ShutdownProfile::Cooperative {
                command: "stop".to_string(),
            },
            ServerKind::Bedrock => ShutdownProfile::SignalOnly,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            ServerKind::Java => 25565,
            ServerKind::Bedrock => 19132,
        }
    }

    pub fn default_protocol(self) -> Protocol {
        match self {
            ServerKind::Java => Protocol::Tcp,
            ServerKind::Bedrock => Protocol::Udp,
        }
    }

    /// Whether the kind refuses to boot until `eula.txt` says `eula=true`.
    pub fn requires_eula(self) -> bool {
        matches!(self, ServerKind::Java)
    }
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Third-party relay services that can front a server. Exactly one may be
/// selected per environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelService {
    Ngrok,
    Playit,
    Zrok,
    Localtonet,
}

impl TunnelService {
    pub const ALL: [TunnelService; 4] = [
        TunnelService::Ngrok,
        TunnelService::Playit,
        TunnelService::Zrok,
        TunnelService::Localtonet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelService::Ngrok => "ngrok",
            TunnelService::Playit => "playit",
            TunnelService::Zrok => "zrok",
            TunnelService::Localtonet => "localtonet",
        }
    }
}

impl fmt::Display for TunnelService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    /// Any state other than `Idle` owns (or is about to own) a process.
    pub fn is_active(self) -> bool {
        !matches!(self, LifecycleState::Idle)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EnvironmentStatus {
    pub name: String,
    pub kind: ServerKind,
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub run_id: Option<RunId>,
    /// Exit code of the most recent run, kept after the environment goes idle.
    pub exit_code: Option<i32>,
    pub tunnel_address: Option<String>,
    pub message: Option<String>,
}

impl EnvironmentStatus {
    pub fn idle(name: impl Into<String>, kind: ServerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            state: LifecycleState::Idle,
            pid: None,
            run_id: None,
            exit_code: None,
            tunnel_address: None,
            message: None,
        }
    }
}
