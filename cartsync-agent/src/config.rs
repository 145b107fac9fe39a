//! Agent configuration.
//!
//! Parsed from the command line with environment fallbacks, then turned into
//! an [`AgentConfig`] that the composition root consumes.

use std::path::PathBuf;
use std::time::Duration;

use cartsync_core::TrackerConfig;
use clap::Parser;

/// Default control API port.
pub const DEFAULT_PORT: u16 = 9474;

/// Default storefront API base URL.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api";

/// Command line arguments for the agent.
#[derive(Debug, Clone, Parser)]
#[command(name = "cartsync-agent")]
#[command(about = "Offline-resilient cart and interaction sync agent for the storefront client")]
#[command(version)]
pub struct CliArgs {
    /// Port of the localhost control API.
    #[arg(long, env = "CARTSYNC_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Base URL of the storefront REST API.
    #[arg(long, env = "CARTSYNC_API_URL")]
    pub api_url: String,

    /// Bearer token sent with every storefront request.
    #[arg(long, env = "CARTSYNC_API_TOKEN")]
    pub api_token: Option<String>,

    /// Directory for the durable queue. In-memory storage when omitted.
    #[arg(long, env = "CARTSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Quiet period before buffered interactions are flushed, in milliseconds.
    #[arg(long, default_value = "5000")]
    pub flush_window_ms: u64,

    /// Buffered interactions that trigger an early flush.
    #[arg(long, default_value = "50")]
    pub max_batch_size: usize,

    /// Timeout of a single storefront request, in seconds.
    #[arg(long, default_value = "15")]
    pub request_timeout_secs: u64,

    /// Reachability probe interval in seconds. 0 disables the probe.
    #[arg(long, default_value = "0")]
    pub probe_interval_secs: u64,

    /// Start in the offline state until told otherwise.
    #[arg(long)]
    pub start_offline: bool,
}

/// Resolved agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Control API port.
    pub port: u16,
    /// Storefront API base URL.
    pub api_url: String,
    /// Optional bearer token.
    pub api_token: Option<String>,
    /// Queue directory; `None` keeps the queue in memory.
    pub data_dir: Option<PathBuf>,
    /// Interaction flush scheduling.
    pub tracker: TrackerConfig,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Reachability probe interval; `None` disables the probe.
    pub probe_interval: Option<Duration>,
    /// Initial connectivity.
    pub start_online: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            data_dir: None,
            tracker: TrackerConfig::default(),
            request_timeout: cartsync_core::DEFAULT_CALL_TIMEOUT,
            probe_interval: None,
            start_online: true,
        }
    }
}

impl AgentConfig {
    /// Default configuration pointed at `api_url`.
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::default()
        }
    }

    /// Keep the queue under `dir`.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set the initial connectivity.
    #[must_use]
    pub const fn with_start_online(mut self, online: bool) -> Self {
        self.start_online = online;
        self
    }

    /// Override the interaction flush window.
    #[must_use]
    pub const fn with_flush_window(mut self, window: Duration) -> Self {
        self.tracker.window = window;
        self
    }
}

impl From<CliArgs> for AgentConfig {
    fn from(args: CliArgs) -> Self {
        let defaults = TrackerConfig::default();
        Self {
            port: args.port,
            api_url: args.api_url,
            api_token: args.api_token.filter(|t| !t.trim().is_empty()),
            data_dir: args.data_dir,
            tracker: TrackerConfig {
                window: Duration::from_millis(args.flush_window_ms),
                max_batch_size: if args.max_batch_size == 0 {
                    defaults.max_batch_size
                } else {
                    args.max_batch_size
                },
            },
            request_timeout: Duration::from_secs(args.request_timeout_secs.max(1)),
            probe_interval: (args.probe_interval_secs > 0)
                .then(|| Duration::from_secs(args.probe_interval_secs)),
            start_online: !args.start_offline,
        }
    }
}
