use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::ScannerKind;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scanners: ScannersConfig,
    #[serde(default)]
    pub callbacks: CallbackConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = BufReader::new(
            File::open(path)
                .with_context(|| format!("Failed to open config file {}", path.display()))?,
        );
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Externally reachable base URL of the dispatcher, used to build callback URLs.
    /// When unset, the URL of the incoming request is used.
    pub public_url: Option<Url>,
}

impl Default for ServerConfig {
    fn default() -> Self { Self { port: 8000, public_url: None } }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// Bearer token used for repository host calls and checkouts.
    pub token: Option<String>,
    /// Secret used to verify webhook signatures. Verification is skipped when unset.
    pub webhook_secret: Option<String>,
    /// Override for GitHub Enterprise installations.
    pub api_url: Option<Url>,
    pub timeout_secs: u64,
}

impl GitHubConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self { token: None, webhook_secret: None, api_url: None, timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Scanner classes every job fans out to.
    pub scanners: Vec<ScannerKind>,
    pub stream_prefix: String,
    pub context_ttl_secs: u64,
}

impl DispatchConfig {
    pub fn stream_name(&self, kind: ScannerKind) -> String {
        format!("{}{}", self.stream_prefix, kind.as_str())
    }

    pub fn context_ttl(&self) -> Duration { Duration::from_secs(self.context_ttl_secs) }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            scanners: ScannerKind::variants().to_vec(),
            stream_prefix: "worker-".to_string(),
            context_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub consumer_group: String,
    /// Must be unique per worker process. Defaults to the scanner's application name followed
    /// by a random suffix.
    pub consumer_name: Option<String>,
    /// Upper bound of a single blocking claim.
    pub block_ms: u64,
    /// Cap for the reconnect backoff after broker errors.
    pub max_backoff_secs: u64,
    /// Entries left unacknowledged this long are taken over from their consumer. Must exceed
    /// the longest expected scan.
    pub reclaim_idle_secs: u64,
    /// Entries delivered more often than this are discarded with a failure callback.
    pub max_deliveries: u64,
    /// Parent directory for checkouts. Defaults to the system temp directory.
    pub work_dir: Option<String>,
}

impl WorkerConfig {
    pub fn block_timeout(&self) -> Duration { Duration::from_millis(self.block_ms) }

    pub fn max_backoff(&self) -> Duration { Duration::from_secs(self.max_backoff_secs) }

    pub fn reclaim_idle(&self) -> Duration { Duration::from_secs(self.reclaim_idle_secs) }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "workers".to_string(),
            consumer_name: None,
            block_ms: 5000,
            max_backoff_secs: 30,
            reclaim_idle_secs: 60 * 60,
            max_deliveries: 3,
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannersConfig {
    pub kics: KicsConfig,
    pub blackduck: BlackduckConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KicsConfig {
    pub binary: String,
    /// Output directory relative to the scanned source tree.
    pub output_dir: String,
}

impl Default for KicsConfig {
    fn default() -> Self {
        Self { binary: "kics".to_string(), output_dir: "kics-results".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BlackduckConfig {
    pub binary: String,
    pub output_dir: String,
    /// Without a server URL and token the scan runs in offline mode.
    pub server_url: Option<String>,
    pub api_token: Option<String>,
}

impl Default for BlackduckConfig {
    fn default() -> Self {
        Self {
            binary: "bridge-cli".to_string(),
            output_dir: "blackduck-results".to_string(),
            server_url: None,
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// How long received callbacks are kept for inspection.
    pub ttl_secs: u64,
    /// Timeout for a worker's outbound callback request.
    pub timeout_secs: u64,
}

impl CallbackConfig {
    pub fn ttl(&self) -> Duration { Duration::from_secs(self.ttl_secs) }

    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

impl Default for CallbackConfig {
    fn default() -> Self { Self { ttl_secs: 24 * 60 * 60, timeout_secs: 10 } }
}
