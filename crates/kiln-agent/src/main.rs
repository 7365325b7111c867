use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kiln_agent::config::{self, AgentConfig};
use kiln_agent::console::{self, Cli, Dispatch, TopCommand};
use kiln_agent::control::ControlServer;
use kiln_agent::error::{ControlError, ExitClass, exit};
use kiln_agent::registry::Registry;
use kiln_agent::supervisor_support::format_error_chain;

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let path = cli.config.unwrap_or_else(config::default_config_path);
    let cfg = AgentConfig::load(&path)
        .with_context(|| format!("load provisioning file {}", path.display()))?;
    let envs = cfg.environments().context("invalid provisioning file")?;
    tracing::info!(config = %path.display(), environments = envs.len(), "kiln starting");

    let registry = Arc::new(Registry::new(envs, cfg.supervisor_options()));
    let run_dir = cfg.run_dir();

    let code = match cli.command {
        TopCommand::Start { env, timeout } => {
            let Some(sup) = registry.get(&env).cloned() else {
                eprintln!("error: unknown environment `{env}`");
                return Ok(exit::NOT_FOUND);
            };
            let mut control = ControlServer::default();
            if let Err(err) = control.claim(&registry, &run_dir, &env).await {
                eprintln!("error: {}", format_error_chain(&err));
                return Ok(err.exit_code());
            }
            console::run_attached(&sup, console::stop_timeout(timeout)).await
        }
        TopCommand::Op(op) => {
            Dispatch::new(&registry, run_dir)
                .run(op, &mut std::io::stdout(), &mut std::io::stderr())
                .await
        }
        TopCommand::Console => {
            let mut control = ControlServer::default();
            let mut local = Vec::new();
            for name in registry.names() {
                match control.claim(&registry, &run_dir, name).await {
                    Ok(()) => local.push(name),
                    Err(err @ ControlError::AlreadyOwned(_)) => eprintln!("warning: {err}"),
                    Err(err) => {
                        // Still manageable here, just not from other kiln invocations.
                        tracing::warn!(env = %name, error = %format_error_chain(&err), "control socket unavailable");
                        local.push(name);
                    }
                }
            }
            let dispatch = Dispatch::new(&registry, run_dir).owning(local);
            console::run_console(&dispatch, console::stop_timeout(None)).await
        }
    };
    Ok(code)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit::FAILURE
        }
    };
    std::process::ExitCode::from(u8::try_from(code).unwrap_or(1))
}
