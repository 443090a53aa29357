use std::time::Duration;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_CONTAINER_CLI: &str = "docker";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts and endpoints shared by every component of a debug launch.
#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Address the published debugger ports are reachable on.
    pub host: String,
    /// Container engine CLI used for listing and exec.
    pub container_cli: String,
    /// Deadline for container/process discovery and for the debugger handshake.
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    /// Upper bound for a single discovery command.
    pub attempt_timeout: Duration,
    /// How long to wait for a response from the debugger worker.
    pub request_timeout: Duration,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            container_cli: DEFAULT_CONTAINER_CLI.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl DebugConfig {
    pub fn new(host: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            connect_timeout,
            ..Self::default()
        }
    }

    pub fn with_container_cli(mut self, cli: impl Into<String>) -> Self {
        self.container_cli = cli.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn from_env() -> Self {
        let host = std::env::var("SAM_DEBUG_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let container_cli = std::env::var("SAM_DEBUG_CONTAINER_CLI")
            .unwrap_or_else(|_| DEFAULT_CONTAINER_CLI.to_string());

        Self {
            host,
            container_cli,
            connect_timeout: duration_from_env("SAM_DEBUG_CONNECT_TIMEOUT_MS")
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            poll_interval: duration_from_env("SAM_DEBUG_POLL_INTERVAL_MS")
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            attempt_timeout: duration_from_env("SAM_DEBUG_ATTEMPT_TIMEOUT_MS")
                .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT),
            request_timeout: duration_from_env("SAM_DEBUG_REQUEST_TIMEOUT_MS")
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

fn duration_from_env(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
