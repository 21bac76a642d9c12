use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
    time::Duration,
};

use outlane_common::{Signal, internal, logging};
use outlane_delivery::{
    DeliveryConfig, DnsConfig, DnsResolver, FileBodySource, Lane, Services, ThrottleGate,
    ZoneConfig,
};
use outlane_queue::QueueClient;
use outlane_tracing::traced;
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinSet};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "OUTLANE_CONFIG";

/// Where to look when [`CONFIG_ENV`] is not set, in order
pub const DEFAULT_CONFIG_PATHS: [&str; 2] =
    ["./outlane.config.ron", "/etc/outlane/outlane.config.ron"];

/// Where the queue authority listens
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_queue_host")]
    pub host: String,
    #[serde(default = "default_queue_port")]
    pub port: u16,
    /// Round trip timeout for a single queue command
    #[serde(default = "default_queue_timeout")]
    pub timeout_secs: u64,
}

fn default_queue_host() -> String {
    String::from("127.0.0.1")
}

const fn default_queue_port() -> u16 {
    8081
}

const fn default_queue_timeout() -> u64 {
    10
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            host: default_queue_host(),
            port: default_queue_port(),
            timeout_secs: default_queue_timeout(),
        }
    }
}

impl QueueSettings {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where message bodies are read from
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BodySettings {
    #[serde(default = "default_body_path")]
    pub path: PathBuf,
}

fn default_body_path() -> PathBuf {
    PathBuf::from("./data/bodies")
}

impl Default for BodySettings {
    fn default() -> Self {
        Self {
            path: default_body_path(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Outlane {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(alias = "bodies", default)]
    pub body: BodySettings,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(alias = "zone", default)]
    pub zones: BTreeMap<String, ZoneConfig>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Find the configuration file using the following precedence:
/// 1. `OUTLANE_CONFIG` environment variable
/// 2. ./outlane.config.ron (current working directory)
/// 3. /etc/outlane/outlane.config.ron (system-wide config)
///
/// # Errors
///
/// If `OUTLANE_CONFIG` names a file that does not exist, or none of the
/// default paths exist.
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    let defaults = DEFAULT_CONFIG_PATHS.map(PathBuf::from);
    locate_config(std::env::var(CONFIG_ENV).ok(), &defaults)
}

fn locate_config(env_path: Option<String>, default_paths: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(env_path) = env_path {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

/// Waits for every lane, stopping at the first one that fails.
async fn supervise(lanes: &mut JoinSet<(String, anyhow::Result<()>)>) -> anyhow::Result<()> {
    while let Some(joined) = lanes.join_next().await {
        let (zone, result) = joined?;
        result.map_err(|err| err.context(format!("Lane '{zone}' failed")))?;
        internal!(level = INFO, zone = %zone, "Lane finished");
    }

    Ok(())
}

impl Outlane {
    /// Parses a RON configuration, names every zone after its key and checks
    /// the zones are usable.
    ///
    /// A configuration without zones gets a single `default` zone.
    ///
    /// # Errors
    ///
    /// If the configuration does not parse, or a zone fails validation.
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        let mut outlane: Self = ron::from_str(content)?;

        if outlane.zones.is_empty() {
            outlane
                .zones
                .insert(String::from("default"), ZoneConfig::default());
        }

        for (name, zone) in &mut outlane.zones {
            zone.name.clone_from(name);
            zone.validate()?;
        }

        Ok(outlane)
    }

    /// Reads and parses the configuration at `path`.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or [`from_ron`](Self::from_ron) fails.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;

        Self::from_ron(&content)
    }

    /// Builds a lane for every configured zone, all sharing `services`.
    #[must_use]
    pub fn lanes(&self, services: &Services) -> Vec<Lane> {
        let delivery = Arc::new(self.delivery.clone());

        self.zones
            .values()
            .map(|zone| {
                Lane::new(
                    Arc::new(zone.clone()),
                    delivery.clone(),
                    services,
                    Arc::new(ThrottleGate::new()),
                )
            })
            .collect()
    }

    fn services(&self) -> anyhow::Result<Services> {
        let authority = QueueClient::new(self.queue.address())
            .with_timeout(Duration::from_secs(self.queue.timeout_secs));
        let resolver = DnsResolver::new(self.dns.clone())?;
        let body = FileBodySource::new(self.body.path.clone());

        Ok(Services::new(
            Arc::new(authority),
            Arc::new(resolver),
            Arc::new(body),
        ))
    }

    /// Run every zone until shutdown, or until a lane fails
    ///
    /// # Errors
    ///
    /// This function will return an error if the resolver cannot be built, or
    /// if any lane stops on a fatal error.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let services = self.services()?;
        internal!(
            level = INFO,
            queue = %self.queue.address(),
            zones = self.zones.len(),
            "Controller running"
        );

        let mut lanes = JoinSet::new();
        for lane in self.lanes(&services) {
            let zone = lane.zone().name.clone();
            let shutdown = SHUTDOWN_BROADCAST.subscribe();
            lanes.spawn(async move { (zone, lane.run(shutdown).await.map_err(anyhow::Error::from)) });
        }

        let ret = tokio::select! {
            r = supervise(&mut lanes) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");
        // Nobody may be listening if every lane has already stopped.
        let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);

        tokio::select! {
            () = async {
                while let Some(joined) = lanes.join_next().await {
                    match joined {
                        Ok((zone, Err(err))) => {
                            internal!(level = ERROR, zone = %zone, "Lane stopped: {err:#}");
                        }
                        Ok((zone, Ok(()))) => {
                            internal!(zone = %zone, "Lane drained");
                        }
                        Err(err) => {
                            internal!(level = ERROR, "Lane task failed: {err}");
                        }
                    }
                }
            } => {}
            _ = tokio::signal::ctrl_c() => {
                internal!(level = INFO, "Forcing shutdown");
            }
        }

        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);

        ret
    }
}
