use std::path::PathBuf;

use kiln_process::{LifecycleState, Protocol, TunnelService};

/// Process exit codes of the `kiln` CLI.
pub mod exit {
    pub const OK: i32 = 0;
    pub const NOT_FOUND: i32 = 1;
    pub const INVALID_STATE: i32 = 2;
    pub const FAILURE: i32 = 3;
}

/// Maps an error onto the CLI exit code contract.
pub trait ExitClass {
    fn exit_code(&self) -> i32;
}

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process stdin is closed (broken pipe)")]
    BrokenPipe,
    #[error("write to process stdin timed out")]
    WriteTimedOut,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("no credentials configured for {0}")]
    MissingCredentials(TunnelService),
    #[error("{service} does not support {protocol} tunnels")]
    UnsupportedProtocol {
        service: TunnelService,
        protocol: Protocol,
    },
    #[error("tunnel service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("a tunnel is already bound")]
    AlreadyBound,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("environment is already {0}")]
    AlreadyRunning(LifecycleState),
    #[error("working directory does not exist: {}", .0.display())]
    WorkingDirectoryMissing(PathBuf),
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("failed to spawn server process")]
    SpawnFailed(#[source] HandleError),
    #[error("failed to write {artifact}")]
    Prepare {
        artifact: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("server started but tunnel binding failed")]
    TunnelBindFailed(#[source] TunnelError),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("environment is not running")]
    NotRunning,
    /// A timed-out write leaves the process running; any other failure
    /// discards it.
    #[error("failed to write command to server stdin")]
    WriteFailed(#[source] HandleError),
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("environment is not running")]
    NotRunning,
    #[error("process {} was killed but not reaped within {timeout_ms}ms; operator intervention required", pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()))]
    Unreaped { pid: Option<u32>, timeout_ms: u128 },
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("environment is not running")]
    NotRunning,
    #[error("no tunnel service configured for this environment")]
    NotConfigured,
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("duplicate environment name: {0}")]
    DuplicateName(String),
    #[error("invalid environment {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Claiming an environment's control socket.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("environment `{0}` is already supervised by another kiln process")]
    AlreadyOwned(String),
    #[error("control socket {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExitClass for StartError {
    fn exit_code(&self) -> i32 {
        match self {
            StartError::AlreadyRunning(_) => exit::INVALID_STATE,
            _ => exit::FAILURE,
        }
    }
}

impl ExitClass for CommandError {
    fn exit_code(&self) -> i32 {
        match self {
            CommandError::NotRunning => exit::INVALID_STATE,
            CommandError::WriteFailed(_) => exit::FAILURE,
        }
    }
}

impl ExitClass for StopError {
    fn exit_code(&self) -> i32 {
        match self {
            StopError::NotRunning => exit::INVALID_STATE,
            StopError::Unreaped { .. } => exit::FAILURE,
        }
    }
}

impl ExitClass for BindError {
    fn exit_code(&self) -> i32 {
        match self {
            BindError::NotRunning | BindError::NotConfigured => exit::INVALID_STATE,
            BindError::Tunnel(_) => exit::FAILURE,
        }
    }
}

impl ExitClass for ControlError {
    fn exit_code(&self) -> i32 {
        match self {
            ControlError::AlreadyOwned(_) => exit::INVALID_STATE,
            ControlError::Io { .. } => exit::FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor_support::format_error_chain;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(
            StartError::AlreadyRunning(LifecycleState::Running).exit_code(),
            exit::INVALID_STATE
        );
        assert_eq!(
            StartError::ExecutableNotFound("java".into()).exit_code(),
            exit::FAILURE
        );
        assert_eq!(StopError::NotRunning.exit_code(), exit::INVALID_STATE);
        assert_eq!(
            StopError::Unreaped {
                pid: Some(1),
                timeout_ms: 10
            }
            .exit_code(),
            exit::FAILURE
        );
        assert_eq!(CommandError::NotRunning.exit_code(), exit::INVALID_STATE);
        assert_eq!(
            BindError::Tunnel(TunnelError::AlreadyBound).exit_code(),
            exit::FAILURE
        );
    }

    #[test]
    fn tunnel_failure_keeps_cause_in_chain() {
        let err = StartError::TunnelBindFailed(TunnelError::MissingCredentials(
            TunnelService::Ngrok,
        ));
        assert_eq!(
            format_error_chain(&err),
            "server started but tunnel binding failed: no credentials configured for ngrok"
        );
    }
}
