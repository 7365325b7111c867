//! The provisioning file: which environments exist and how to reach them.
//!
//! ```toml
//! data_root = "/srv/kiln"
//!
//! [tunnels.ngrok]
//! token = "..."
//! region = "eu"
//!
//! [[environments]]
//! name = "survival"
//! kind = "java"
//! memory_mb = 4096
//! tunnel = "ngrok"
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use kiln_process::{ServerKind, TunnelService};
use serde::Deserialize;

use crate::environment::{LaunchSpec, ManagedEnvironment, TunnelCredentials, TunnelSettings};
use crate::error::ConfigError;
use crate::launch::{self, DEFAULT_MEMORY_MB};
use crate::supervisor::{SupervisorOptions, TunnelFailurePolicy};

pub const DEFAULT_CONFIG_FILE: &str = "kiln.toml";

/// `KILN_CONFIG`, falling back to `kiln.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    std::env::var_os("KILN_CONFIG")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Directory holding the per-environment control sockets: `KILN_RUN_DIR`,
/// else `<data_root>/.kiln`.
pub fn run_dir(data_root: &Path) -> PathBuf {
    std::env::var_os("KILN_RUN_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_root.join(".kiln"))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelCredentialsConfig {
    pub token: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub tunnel_failure: TunnelFailurePolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub name: String,
    pub kind: ServerKind,
    /// Relative paths resolve against `data_root`; defaults to `<data_root>/<name>`.
    pub root: Option<PathBuf>,
    pub memory_mb: Option<u32>,
    pub port: Option<u16>,
    pub command: Option<Vec<String>>,
    /// Empty string means "signals only".
    pub shutdown_command: Option<String>,
    pub tunnel: Option<TunnelService>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub tunnels: BTreeMap<TunnelService, TunnelCredentialsConfig>,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::parse(&text, path)?;
        // A relative data_root is relative to the file, not to the cwd.
        let base = path.parent().unwrap_or(Path::new(""));
        cfg.data_root = Some(match cfg.data_root.take() {
            Some(root) if root.is_relative() => base.join(root),
            Some(root) => root,
            None => base.to_path_buf(),
        });
        Ok(cfg)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            tunnel_failure: self.supervisor.tunnel_failure,
            ..SupervisorOptions::from_env()
        }
    }

    fn data_root(&self) -> PathBuf {
        self.data_root.clone().unwrap_or_default()
    }

    pub fn run_dir(&self) -> PathBuf {
        run_dir(&self.data_root())
    }

    /// Validates the file and resolves every environment's launch command.
    ///
    /// Missing jars or binaries are not an error here; `start` reports them.
    pub fn environments(&self) -> Result<Vec<ManagedEnvironment>, ConfigError> {
        let data_root = self.data_root();
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(self.environments.len());

        for e in &self.environments {
            let name = e.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid {
                    name: e.name.clone(),
                    reason: "name must not be empty".to_string(),
                });
            }
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::DuplicateName(name.to_string()));
            }
            out.push(self.build_environment(&data_root, name, e)?);
        }
        Ok(out)
    }

    fn build_environment(
        &self,
        data_root: &Path,
        name: &str,
        e: &EnvironmentConfig,
    ) -> Result<ManagedEnvironment, ConfigError> {
        let root = match &e.root {
            Some(r) if r.is_absolute() => r.clone(),
            Some(r) => data_root.join(r),
            None => data_root.join(name),
        };
        let memory_mb = e.memory_mb.unwrap_or(DEFAULT_MEMORY_MB);

        let launch = match &e.command {
            Some(cmd) => {
                let Some((program, args)) = cmd.split_first() else {
                    return Err(ConfigError::Invalid {
                        name: name.to_string(),
                        reason: "command must not be empty".to_string(),
                    });
                };
                LaunchSpec::new(program.clone(), &root).args(args.iter().cloned())
            }
            None => launch::resolve_launch_spec(&root, e.kind, memory_mb),
        };

        let mut env =
            ManagedEnvironment::new(name, &root, e.kind, launch).with_memory_mb(memory_mb);
        if let Some(cmd) = &e.shutdown_command {
            env = env.with_shutdown_command(Some(cmd.clone()));
        }

        if let Some(service) = e.tunnel {
            let creds = self
                .tunnels
                .get(&service)
                .map(|c| TunnelCredentials {
                    token: c.token.clone(),
                    region: c.region.clone(),
                })
                .unwrap_or_default();
            env = env.with_tunnel(TunnelSettings {
                service,
                credentials: creds,
                local_port: e.port.unwrap_or_else(|| e.kind.default_port()),
                protocol: e.kind.default_protocol(),
            });
        }
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use kiln_process::{Protocol, ShutdownProfile};

    use super::*;

    fn parse(text: &str) -> AgentConfig {
        AgentConfig::parse(text, Path::new("kiln.toml")).unwrap()
    }

    #[test]
    fn full_file() {
        let cfg = parse(
            r#"
data_root = "/srv/kiln"

[supervisor]
tunnel_failure = "stop-process"

[tunnels.playit]
token = "secret"

[[environments]]
name = "survival"
kind = "java"
memory_mb = 2048
tunnel = "playit"

[[environments]]
name = "pe"
kind = "bedrock"
root = "/opt/bedrock"
port = 19133
tunnel = "ngrok"
"#,
        );
        assert_eq!(
            cfg.supervisor_options().tunnel_failure,
            TunnelFailurePolicy::StopProcess
        );

        let envs = cfg.environments().unwrap();
        assert_eq!(envs.len(), 2);

        let java = &envs[0];
        assert_eq!(java.root, PathBuf::from("/srv/kiln/survival"));
        assert_eq!(java.memory_mb, 2048);
        assert_eq!(java.launch.program, "java");
        assert_eq!(
            java.shutdown,
            ShutdownProfile::Cooperative {
                command: "stop".to_string()
            }
        );
        let t = java.tunnel.as_ref().unwrap();
        assert_eq!(t.service, TunnelService::Playit);
        assert_eq!(t.local_port, 25565);
        assert_eq!(t.protocol, Protocol::Tcp);
        assert!(t.credentials.has_token());

        let pe = &envs[1];
        assert_eq!(pe.root, PathBuf::from("/opt/bedrock"));
        assert_eq!(pe.launch.program, "./bedrock_server");
        assert_eq!(pe.shutdown, ShutdownProfile::SignalOnly);
        let t = pe.tunnel.as_ref().unwrap();
        assert_eq!(t.local_port, 19133);
        assert_eq!(t.protocol, Protocol::Udp);
        // No [tunnels.ngrok] table: surfaces as MissingCredentials at bind time.
        assert!(!t.credentials.has_token());
    }

    #[test]
    fn explicit_command_and_shutdown() {
        let cfg = parse(
            r#"
[[environments]]
name = "modded"
kind = "java"
root = "modded"
command = ["./run.sh", "--nogui"]
shutdown_command = ""
"#,
        );
        let envs = cfg.environments().unwrap();
        assert_eq!(envs[0].launch.program, "./run.sh");
        assert_eq!(envs[0].launch.args, vec!["--nogui".to_string()]);
        assert_eq!(envs[0].launch.working_dir, PathBuf::from("modded"));
        assert_eq!(envs[0].shutdown, ShutdownProfile::SignalOnly);
        assert!(envs[0].tunnel.is_none());
    }

    #[test]
    fn duplicate_names_rejected() {
        let cfg = parse(
            r#"
[[environments]]
name = "a"
kind = "java"

[[environments]]
name = "a"
kind = "bedrock"
"#,
        );
        assert!(matches!(
            cfg.environments(),
            Err(ConfigError::DuplicateName(n)) if n == "a"
        ));
    }

    #[test]
    fn empty_command_rejected() {
        let cfg = parse(
            r#"
[[environments]]
name = "a"
kind = "java"
command = []
"#,
        );
        assert!(matches!(
            cfg.environments(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        let err = AgentConfig::parse(
            "[[environments]]\nname = \"a\"\nkind = \"forge\"\n",
            Path::new("kiln.toml"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_resolves_relative_data_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(
            &path,
            "data_root = \"servers\"\n[[environments]]\nname = \"a\"\nkind = \"bedrock\"\n",
        )
        .unwrap();
        let cfg = AgentConfig::load(&path).unwrap();
        let envs = cfg.environments().unwrap();
        assert_eq!(envs[0].root, dir.path().join("servers").join("a"));

        if std::env::var_os("KILN_RUN_DIR").is_none() {
            assert_eq!(cfg.run_dir(), dir.path().join("servers").join(".kiln"));
        }

        let missing = AgentConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
