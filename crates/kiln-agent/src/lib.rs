//! Supervision of long-running game-server processes: spawning, console
//! capture, graceful shutdown, and optional public tunnels.

pub mod config;
pub mod console;
pub mod control;
pub mod environment;
pub mod error;
pub mod handle;
pub mod launch;
pub mod log_buffer;
pub mod registry;
pub mod supervisor;
pub mod supervisor_support;
pub mod tunnel;

pub use environment::{LaunchSpec, ManagedEnvironment, TunnelCredentials, TunnelSettings};
pub use error::{
    BindError, CommandError, ConfigError, ControlError, HandleError, StartError, StopError,
    TunnelError,
};
pub use log_buffer::{LogBuffer, LogLine};
pub use registry::Registry;
pub use supervisor::{
    Escalation, PollOutcome, Running, Stopped, Supervisor, SupervisorOptions, TunnelFailurePolicy,
};
