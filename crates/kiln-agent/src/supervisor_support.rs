use std::time::Duration;

const DEFAULT_LOG_MAX_LINES: usize = 500;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_TERM_GRACE_SEC: u64 = 10;
const DEFAULT_KILL_REAP_SEC: u64 = 10;
const DEFAULT_STOP_TIMEOUT_SEC: u64 = 30;
const DEFAULT_STDIN_WRITE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_TUNNEL_OPEN_TIMEOUT_MS: u64 = 20_000;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

pub fn log_max_lines() -> usize {
    env_usize("KILN_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

pub fn poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("KILN_POLL_INTERVAL_MS")
            .map(|v| v.clamp(50, 5000))
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
    )
}

pub fn graceful_term_grace() -> Duration {
    Duration::from_secs(
        env_u64("KILN_TERM_GRACE_SEC")
            .map(|v| v.clamp(1, 120))
            .unwrap_or(DEFAULT_TERM_GRACE_SEC),
    )
}

pub fn kill_reap_timeout() -> Duration {
    Duration::from_secs(
        env_u64("KILN_KILL_REAP_SEC")
            .map(|v| v.clamp(1, 120))
            .unwrap_or(DEFAULT_KILL_REAP_SEC),
    )
}

pub fn default_stop_timeout() -> Duration {
    Duration::from_secs(
        env_u64("KILN_STOP_TIMEOUT_SEC")
            .map(|v| v.clamp(1, 3600))
            .unwrap_or(DEFAULT_STOP_TIMEOUT_SEC),
    )
}

pub fn stdin_write_timeout() -> Duration {
    Duration::from_millis(
        env_u64("KILN_STDIN_WRITE_TIMEOUT_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(DEFAULT_STDIN_WRITE_TIMEOUT_MS),
    )
}

pub fn tunnel_open_timeout() -> Duration {
    Duration::from_millis(
        env_u64("KILN_TUNNEL_OPEN_TIMEOUT_MS")
            .map(|v| v.clamp(1000, 120_000))
            .unwrap_or(DEFAULT_TUNNEL_OPEN_TIMEOUT_MS),
    )
}

/// Linux only: deliver SIGTERM to the server if the agent itself dies.
/// Off by default so servers outlive a restart of the control surface.
pub fn bind_child_to_agent() -> bool {
    env_flag("KILN_BIND_CHILD_TO_AGENT")
}

/// Override for a tunnel agent binary, e.g. `KILN_NGROK_BIN=/opt/ngrok`.
pub(crate) fn tunnel_bin_override(service: &str) -> Option<String> {
    let key = format!("KILN_{}_BIN", service.to_ascii_uppercase());
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Joins an error and its sources into one line, skipping empty and
/// repeated messages.
pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
