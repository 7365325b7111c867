use std::{
    collections::BTreeMap,
    fmt,
    io::Write,
    path::{Path, PathBuf},
};

use kiln_process::{Protocol, ServerKind, ShutdownProfile, TunnelService};

/// Everything needed to spawn a server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// The jar or binary the command runs, checked before spawning.
    pub artifact: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            artifact: None,
        }
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact = Some(path.into());
        self
    }

    pub fn command_line(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

/// Opaque credentials for a tunnel service. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TunnelCredentials {
    pub token: Option<String>,
    pub region: Option<String>,
}

impl TunnelCredentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            region: None,
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

impl fmt::Debug for TunnelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelCredentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSettings {
    pub service: TunnelService,
    pub credentials: TunnelCredentials,
    pub local_port: u16,
    pub protocol: Protocol,
}

/// One provisioned server instance. Immutable once handed to a supervisor.
#[derive(Debug, Clone)]
pub struct ManagedEnvironment {
    pub name: String,
    pub root: PathBuf,
    pub kind: ServerKind,
    pub memory_mb: u32,
    pub launch: LaunchSpec,
    pub shutdown: ShutdownProfile,
    pub tunnel: Option<TunnelSettings>,
}

impl ManagedEnvironment {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        kind: ServerKind,
        launch: LaunchSpec,
    ) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            kind,
            memory_mb: 0,
            launch,
            shutdown: kind.shutdown_profile(),
            tunnel: None,
        }
    }

    /// Overrides the kind's shutdown behaviour. `None` means signals only.
    pub fn with_shutdown_command(mut self, command: Option<String>) -> Self {
        self.shutdown = match command.map(|c| c.trim().to_string()) {
            Some(c) if !c.is_empty() => ShutdownProfile::Cooperative { command: c },
            _ => ShutdownProfile::SignalOnly,
        };
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelSettings) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }
}

fn eula_accepted(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|s| {
            s.lines()
                .map(str::trim)
                .any(|l| l.eq_ignore_ascii_case("eula=true"))
        })
        .unwrap_or(false)
}

fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> std::io::Result<()> {
    let path = dir.join(name);
    let tmp = dir.join(format!("{name}.tmp"));
    let mut f = std::fs::File::create(&tmp)?;
    f.write_all(data)?;
    f.flush()?;
    drop(f);
    std::fs::rename(tmp, path)
}

/// Writes the one-time files a kind needs before its first boot.
///
/// Returns `true` when something was written. An `eula.txt` that does not
/// accept the EULA (the server writes `eula=false` on its first run) is
/// replaced.
pub fn ensure_acceptance_artifacts(root: &Path, kind: ServerKind) -> std::io::Result<bool> {
    if !kind.requires_eula() {
        return Ok(false);
    }
    if eula_accepted(&root.join("eula.txt")) {
        return Ok(false);
    }
    write_atomic(root, "eula.txt", b"eula=true\n")?;
    Ok(true)
}
