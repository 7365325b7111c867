//! Public endpoints for a running server.
//!
//! A [`TunnelCoordinator`] holds at most one binding and delegates the actual
//! work to a [`TunnelProvider`] picked per service. The supervisor only sees
//! the coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_process::{Protocol, TunnelService};

use crate::environment::{TunnelCredentials, TunnelSettings};
use crate::error::TunnelError;

mod agent;

pub use agent::{AgentProfile, AgentTunnel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub service: TunnelService,
    pub credentials: TunnelCredentials,
    pub local_port: u16,
    pub protocol: Protocol,
}

impl From<&TunnelSettings> for TunnelRequest {
    fn from(s: &TunnelSettings) -> Self {
        Self {
            service: s.service,
            credentials: s.credentials.clone(),
            local_port: s.local_port,
            protocol: s.protocol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelBinding {
    pub service: TunnelService,
    pub local_port: u16,
    pub protocol: Protocol,
    pub public_address: String,
}

/// One relay service. `close` must be safe to call when nothing is open.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn open(&mut self, request: &TunnelRequest) -> Result<String, TunnelError>;
    async fn close(&mut self);

    /// Whether an open binding is still being served. Providers without a
    /// local agent have nothing to watch.
    fn is_alive(&mut self) -> bool {
        true
    }
}

pub trait TunnelProviderFactory: Send + Sync {
    fn provider(&self, service: TunnelService) -> Box<dyn TunnelProvider>;
}

/// Runs each service's relay agent binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgentProviders;

impl TunnelProviderFactory for AgentProviders {
    fn provider(&self, service: TunnelService) -> Box<dyn TunnelProvider> {
        Box::new(AgentTunnel::new(AgentProfile::for_service(service)))
    }
}

struct ActiveTunnel {
    provider: Box<dyn TunnelProvider>,
    binding: TunnelBinding,
}

pub struct TunnelCoordinator {
    factory: Arc<dyn TunnelProviderFactory>,
    active: Option<ActiveTunnel>,
}

impl Default for TunnelCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(AgentProviders))
    }
}

impl std::fmt::Debug for TunnelCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelCoordinator")
            .field("binding", &self.binding())
            .finish()
    }
}

impl TunnelCoordinator {
    pub fn new(factory: Arc<dyn TunnelProviderFactory>) -> Self {
        Self {
            factory,
            active: None,
        }
    }

    pub fn binding(&self) -> Option<&TunnelBinding> {
        self.active.as_ref().map(|a| &a.binding)
    }

    pub fn public_address(&self) -> Option<&str> {
        self.binding().map(|b| b.public_address.as_str())
    }

    pub async fn open(&mut self, request: &TunnelRequest) -> Result<TunnelBinding, TunnelError> {
        if self.active.is_some() {
            return Err(TunnelError::AlreadyBound);
        }
        if !request.credentials.has_token() {
            return Err(TunnelError::MissingCredentials(request.service));
        }

        let mut provider = self.factory.provider(request.service);
        let public_address = match provider.open(request).await {
            Ok(addr) => addr,
            Err(err) => {
                // Providers may have spawned something before failing.
                provider.close().await;
                return Err(err);
            }
        };

        let binding = TunnelBinding {
            service: request.service,
            local_port: request.local_port,
            protocol: request.protocol,
            public_address,
        };
        tracing::info!(
            service = %binding.service,
            port = binding.local_port,
            protocol = %binding.protocol,
            address = %binding.public_address,
            "tunnel bound"
        );
        self.active = Some(ActiveTunnel {
            provider,
            binding: binding.clone(),
        });
        Ok(binding)
    }

    pub async fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.provider.close().await;
        tracing::info!(service = %active.binding.service, "tunnel closed");
    }

    /// Drops a binding whose provider stopped serving it and returns it.
    pub async fn reap_dead(&mut self) -> Option<TunnelBinding> {
        if self.active.as_mut()?.provider.is_alive() {
            return None;
        }
        let mut active = self.active.take()?;
        active.provider.close().await;
        tracing::warn!(
            service = %active.binding.service,
            address = %active.binding.public_address,
            "tunnel agent exited; binding dropped"
        );
        Some(active.binding)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;

    /// In-memory provider: succeeds unless the token is `"invalid"`.
    /// Setting `down` makes every open binding report its relay as gone.
    #[derive(Debug, Default)]
    pub struct FakeProviders {
        pub opened: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
        pub down: Arc<AtomicBool>,
    }

    impl FakeProviders {
        pub fn take_down(&self) {
            self.down.store(true, Ordering::SeqCst);
        }

        pub fn open_count(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn close_count(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct FakeTunnel {
        opened: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        down: Arc<AtomicBool>,
        bound: bool,
    }

    #[async_trait]
    impl TunnelProvider for FakeTunnel {
        async fn open(&mut self, request: &TunnelRequest) -> Result<String, TunnelError> {
            if request.credentials.token.as_deref() == Some("invalid") {
                return Err(TunnelError::ServiceUnavailable(
                    "authentication failed".to_string(),
                ));
            }
            self.bound = true;
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(format!(
                "{}://relay.example:{}",
                request.protocol, request.local_port
            ))
        }

        async fn close(&mut self) {
            if self.bound {
                self.bound = false;
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_alive(&mut self) -> bool {
            !self.down.load(Ordering::SeqCst)
        }
    }

    impl TunnelProviderFactory for FakeProviders {
        fn provider(&self, _service: TunnelService) -> Box<dyn TunnelProvider> {
            Box::new(FakeTunnel {
                opened: self.opened.clone(),
                closed: self.closed.clone(),
                down: self.down.clone(),
                bound: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeProviders;
    use super::*;

    fn request(token: &str) -> TunnelRequest {
        TunnelRequest {
            service: TunnelService::Ngrok,
            credentials: TunnelCredentials::token(token),
            local_port: 25565,
            protocol: Protocol::Tcp,
        }
    }

    #[tokio::test]
    async fn close_without_binding_is_noop() {
        let mut c = TunnelCoordinator::new(Arc::new(FakeProviders::default()));
        c.close().await;
        c.close().await;
        assert!(c.binding().is_none());
    }

    #[tokio::test]
    async fn open_then_close() {
        let fake = Arc::new(FakeProviders::default());
        let mut c = TunnelCoordinator::new(fake.clone());
        let b = c.open(&request("tok")).await.unwrap();
        assert_eq!(b.public_address, "tcp://relay.example:25565");
        assert_eq!(c.public_address(), Some("tcp://relay.example:25565"));

        c.close().await;
        assert!(c.public_address().is_none());
        assert_eq!(fake.open_count(), 1);
        assert_eq!(fake.close_count(), 1);
    }

    #[tokio::test]
    async fn second_open_is_already_bound() {
        let mut c = TunnelCoordinator::new(Arc::new(FakeProviders::default()));
        c.open(&request("tok")).await.unwrap();
        let err = c.open(&request("tok")).await.unwrap_err();
        assert!(matches!(err, TunnelError::AlreadyBound));
    }

    #[tokio::test]
    async fn missing_credentials_rejected_before_provider() {
        let fake = Arc::new(FakeProviders::default());
        let mut c = TunnelCoordinator::new(fake.clone());
        let mut req = request("");
        req.credentials = TunnelCredentials::default();
        let err = c.open(&req).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::MissingCredentials(TunnelService::Ngrok)
        ));
        assert_eq!(fake.open_count(), 0);
    }

    #[tokio::test]
    async fn failed_open_leaves_nothing_bound() {
        let mut c = TunnelCoordinator::new(Arc::new(FakeProviders::default()));
        let err = c.open(&request("invalid")).await.unwrap_err();
        assert!(matches!(err, TunnelError::ServiceUnavailable(_)));
        assert!(c.binding().is_none());
        // A retry with good credentials works.
        c.open(&request("tok")).await.unwrap();
    }

    #[tokio::test]
    async fn dead_relay_is_reaped_once() {
        let fake = Arc::new(FakeProviders::default());
        let mut c = TunnelCoordinator::new(fake.clone());
        assert!(c.reap_dead().await.is_none());

        c.open(&request("tok")).await.unwrap();
        assert!(c.reap_dead().await.is_none());
        assert!(c.binding().is_some());

        fake.take_down();
        let gone = c.reap_dead().await.unwrap();
        assert_eq!(gone.public_address, "tcp://relay.example:25565");
        assert!(c.binding().is_none());
        assert_eq!(fake.close_count(), 1);
        assert!(c.reap_dead().await.is_none());
    }
}
