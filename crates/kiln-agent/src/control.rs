//! Per-environment control sockets.
//!
//! The process that supervises an environment (`kiln start` or
//! `kiln console`) listens on `<run_dir>/<env>.sock`. One-shot commands from
//! other `kiln` invocations are sent there as one JSON [`Op`] per line and
//! answered with one JSON [`ControlResponse`] per line. A live socket also
//! keeps a second process from supervising the same environment.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::console::{Op, run_op};
use crate::error::exit;
use crate::registry::Registry;

pub fn socket_path(run_dir: &Path, env: &str) -> PathBuf {
    run_dir.join(format!("{env}.sock"))
}

/// What the owning process printed and returned for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ControlResponse {
    fn error(code: i32, message: impl std::fmt::Display) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: format!("error: {message}\n"),
        }
    }
}

async fn answer(registry: &Registry, env: &str, op: Op) -> ControlResponse {
    if op.env().is_some_and(|target| target != env) {
        return ControlResponse::error(
            exit::NOT_FOUND,
            format_args!("this socket only serves `{env}`"),
        );
    }
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let code = run_op(registry, op, &mut stdout, &mut stderr).await;
    ControlResponse {
        code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}

/// Sockets this process listens on. Dropping it stops accepting and removes
/// the socket files.
#[derive(Debug, Default)]
pub struct ControlServer {
    listeners: BTreeMap<String, (PathBuf, JoinHandle<()>)>,
}

impl ControlServer {
    pub fn owns(&self, env: &str) -> bool {
        self.listeners.contains_key(env)
    }

    pub fn owned(&self) -> impl Iterator<Item = &str> {
        self.listeners.keys().map(String::as_str)
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        for (env, (path, task)) in std::mem::take(&mut self.listeners) {
            task.abort();
            if let Err(err) = std::fs::remove_file(&path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(%env, path = %path.display(), %err, "remove control socket failed");
            }
        }
    }
}

#[cfg(unix)]
mod unix {
    use std::{io, path::Path, sync::Arc};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};

    use super::{ControlResponse, ControlServer, answer, socket_path};
    use crate::console::Op;
    use crate::error::{ControlError, exit};
    use crate::registry::Registry;

    async fn handle_connection(
        registry: Arc<Registry>,
        env: Arc<str>,
        stream: UnixStream,
    ) -> io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Op>(&line) {
                Ok(op) => answer(&registry, &env, op).await,
                Err(err) => {
                    ControlResponse::error(exit::FAILURE, format_args!("malformed request: {err}"))
                }
            };
            let mut json = serde_json::to_string(&response).map_err(io::Error::other)?;
            json.push('\n');
            writer.write_all(json.as_bytes()).await?;
        }
        Ok(())
    }

    async fn accept_loop(listener: UnixListener, registry: Arc<Registry>, env: Arc<str>) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let registry = registry.clone();
                    let env = env.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(registry, env.clone(), stream).await {
                            tracing::debug!(env = %env, %err, "control connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(env = %env, %err, "control accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    impl ControlServer {
        /// Starts serving `env` from this process. Fails if another live
        /// process already serves it; a socket left by a dead one is replaced.
        pub async fn claim(
            &mut self,
            registry: &Arc<Registry>,
            run_dir: &Path,
            env: &str,
        ) -> Result<(), ControlError> {
            if self.owns(env) {
                return Ok(());
            }
            let path = socket_path(run_dir, env);
            let io_err = |source| ControlError::Io {
                path: path.clone(),
                source,
            };

            tokio::fs::create_dir_all(run_dir).await.map_err(io_err)?;
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(ControlError::AlreadyOwned(env.to_string()));
                }
                tokio::fs::remove_file(&path).await.map_err(io_err)?;
            }

            let listener = match UnixListener::bind(&path) {
                Ok(l) => l,
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    return Err(ControlError::AlreadyOwned(env.to_string()));
                }
                Err(err) => return Err(io_err(err)),
            };
            tracing::info!(%env, socket = %path.display(), "control socket listening");
            let task = tokio::spawn(accept_loop(listener, registry.clone(), Arc::from(env)));
            self.listeners.insert(env.to_string(), (path, task));
            Ok(())
        }
    }

    pub async fn request(path: &Path, op: &Op) -> io::Result<ControlResponse> {
        let stream = UnixStream::connect(path).await?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(op).map_err(io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.shutdown().await?;

        let mut reply = String::new();
        BufReader::new(reader).read_line(&mut reply).await?;
        if reply.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control socket closed without a reply",
            ));
        }
        serde_json::from_str(&reply).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

#[cfg(unix)]
pub use unix::request;

#[cfg(not(unix))]
impl ControlServer {
    pub async fn claim(
        &mut self,
        _registry: &std::sync::Arc<Registry>,
        _run_dir: &Path,
        _env: &str,
    ) -> Result<(), crate::error::ControlError> {
        Ok(())
    }
}

#[cfg(not(unix))]
pub async fn request(_path: &Path, _op: &Op) -> std::io::Result<ControlResponse> {
    Err(std::io::ErrorKind::Unsupported.into())
}

#[cfg(all(test, unix))]
mod tests {
    use std::{sync::Arc, time::Duration};

    use kiln_process::{EnvironmentStatus, LifecycleState, ServerKind};

    use super::*;
    use crate::environment::{LaunchSpec, ManagedEnvironment};
    use crate::error::ControlError;
    use crate::supervisor::SupervisorOptions;

    fn registry(dir: &Path) -> Arc<Registry> {
        let env = |name: &str| {
            ManagedEnvironment::new(
                name,
                dir,
                ServerKind::Bedrock,
                LaunchSpec::new("sh", dir).args(["-c", "echo up; sleep 30"]),
            )
        };
        Arc::new(Registry::new(
            vec![env("lobby"), env("survival")],
            SupervisorOptions {
                term_grace: Duration::from_millis(500),
                kill_reap: Duration::from_secs(5),
                stdin_write: Duration::from_secs(2),
                log_capacity: 50,
                tunnel_failure: Default::default(),
            },
        ))
    }

    #[tokio::test]
    async fn commands_reach_the_owning_process() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        let reg = registry(dir.path());
        let mut server = ControlServer::default();
        server.claim(&reg, &run_dir, "survival").await.unwrap();
        assert!(server.owns("survival"));
        assert!(!server.owns("lobby"));

        reg.get("survival").unwrap().start().await.unwrap();
        let path = socket_path(&run_dir, "survival");

        let resp = request(
            &path,
            &Op::Status {
                env: "survival".into(),
                json: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.code, exit::OK);
        let st: EnvironmentStatus = serde_json::from_str(&resp.stdout).unwrap();
        assert_eq!(st.state, LifecycleState::Running);
        assert!(st.pid.is_some());

        let resp = request(
            &path,
            &Op::Stop {
                env: "survival".into(),
                timeout: Some(1),
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.code, exit::OK, "{}", resp.stderr);
        assert!(resp.stdout.contains("stopped survival"));
        assert_eq!(reg.get("survival").unwrap().status().state, LifecycleState::Idle);

        let resp = request(
            &path,
            &Op::Stop {
                env: "survival".into(),
                timeout: Some(1),
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.code, exit::INVALID_STATE);
        assert!(resp.stderr.contains("not running"));

        // A socket only answers for its own environment.
        let resp = request(&path, &Op::ClearLogs { env: "lobby".into() }).await.unwrap();
        assert_eq!(resp.code, exit::NOT_FOUND);

        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_owner_blocks_a_second_claim() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let mut first = ControlServer::default();
        first.claim(&reg, dir.path(), "lobby").await.unwrap();

        let mut second = ControlServer::default();
        let err = second.claim(&reg, dir.path(), "lobby").await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyOwned(ref env) if env == "lobby"));

        // Once the owner is gone the environment can be claimed again.
        drop(first);
        second.claim(&reg, dir.path(), "lobby").await.unwrap();
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "lobby");
        // Bound then dropped: the file stays but nobody accepts on it.
        drop(tokio::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        assert!(request(&path, &Op::List).await.is_err());

        let reg = registry(dir.path());
        let mut server = ControlServer::default();
        server.claim(&reg, dir.path(), "lobby").await.unwrap();
        let op = Op::Logs {
            env: "lobby".into(),
            tail: None,
        };
        let resp = request(&path, &op).await.unwrap();
        assert_eq!(resp.code, exit::OK);
    }

    #[tokio::test]
    async fn malformed_request_gets_an_error_reply() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let mut server = ControlServer::default();
        server.claim(&reg, dir.path(), "lobby").await.unwrap();

        let stream = tokio::net::UnixStream::connect(socket_path(dir.path(), "lobby"))
            .await
            .unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"{\"op\":\"reboot\"}\n").await.unwrap();
        let mut reply = String::new();
        BufReader::new(reader).read_line(&mut reply).await.unwrap();
        let resp: ControlResponse = serde_json::from_str(&reply).unwrap();
        assert_eq!(resp.code, exit::FAILURE);
        assert!(resp.stderr.contains("malformed request"));
    }
}
