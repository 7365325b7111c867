use std::{collections::BTreeMap, sync::Arc, time::Duration};

use kiln_process::LifecycleState;
use tokio::task::JoinHandle;

use crate::environment::ManagedEnvironment;
use crate::supervisor::{PollOutcome, Supervisor, SupervisorOptions};
use crate::tunnel::{AgentProviders, TunnelProviderFactory};

/// All supervised environments, keyed by name. Fixed after construction.
#[derive(Debug, Default)]
pub struct Registry {
    supervisors: BTreeMap<String, Arc<Supervisor>>,
}

impl Registry {
    pub fn new(envs: Vec<ManagedEnvironment>, options: SupervisorOptions) -> Self {
        Self::with_tunnel_providers(envs, options, Arc::new(AgentProviders))
    }

    pub fn with_tunnel_providers(
        envs: Vec<ManagedEnvironment>,
        options: SupervisorOptions,
        providers: Arc<dyn TunnelProviderFactory>,
    ) -> Self {
        let supervisors = envs
            .into_iter()
            .map(|env| {
                let name = env.name.clone();
                let sup = Supervisor::with_tunnel_providers(env, options.clone(), providers.clone());
                (name, Arc::new(sup))
            })
            .collect();
        Self { supervisors }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Supervisor>> {
        self.supervisors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.supervisors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Supervisor>> {
        self.supervisors.values()
    }

    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    /// One background poll loop per environment. Workers stop when the
    /// returned guard is dropped.
    pub fn spawn_pollers(&self, every: Duration) -> PollWorkers {
        let handles = self
            .supervisors
            .values()
            .map(|sup| {
                let sup = sup.clone();
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(every);
                    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tick.tick().await;
                        if let PollOutcome::Exited { code } = sup.poll().await {
                            tracing::info!(env = %sup.name(), ?code, "poll observed exit");
                        }
                    }
                })
            })
            .collect();
        PollWorkers { handles }
    }

    /// Stops every environment that is currently running.
    pub async fn stop_all(&self, timeout: Duration) {
        for sup in self.supervisors.values() {
            if sup.status().state != LifecycleState::Running {
                continue;
            }
            match sup.stop(timeout).await {
                Ok(stopped) => {
                    tracing::info!(env = %sup.name(), exit_code = ?stopped.exit_code, "stopped on shutdown")
                }
                Err(err) => tracing::warn!(env = %sup.name(), %err, "stop on shutdown failed"),
            }
        }
    }
}

#[derive(Debug)]
pub struct PollWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for PollWorkers {
    fn drop(&mut self) {
        for h in &self.handles {
            h.abort();
        }
    }
}
