use serde::{Deserialize, Serialize};
use anyhow::{Result, Context};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub trackers: TrackersConfig,
    pub signatures: SignaturesConfig,
    pub hub: HubConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub instance_id: Option<String>,
    pub hostname: Option<String>,
    /// Upper bound on waiting for tracker loops to finish at shutdown.
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackersConfig {
    pub process: ProcessTrackerConfig,
    pub network: NetworkTrackerConfig,
    pub file: FileTrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTrackerConfig {
    pub enabled: bool,
    pub scan_interval_ms: u64,
    /// Try the kernel-event backend before falling back to polling.
    pub prefer_kernel_backend: bool,
    /// Metric deltas below these thresholds do not produce update events.
    pub significant_cpu_delta: f32,
    pub significant_memory_delta_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkTrackerConfig {
    pub enabled: bool,
    pub scan_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTrackerConfig {
    pub enabled: bool,
    pub scan_interval_ms: u64,
    /// Paths watched for filesystem events in addition to fd scanning.
    pub watched_paths: Vec<PathBuf>,
    /// Glob deny-list; matching paths never become file-op records.
    pub noise_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturesConfig {
    /// YAML file with the ordered signature list. Built-in defaults are
    /// used when unset.
    pub file_path: Option<PathBuf>,
    pub hot_reload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Per-subscriber buffered event capacity; overflowing subscribers
    /// lose their oldest buffered events.
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub enabled: bool,
    pub data_directory: PathBuf,
    pub compress_batches: bool,
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file()?;

        let settings = config::Config::builder()
            .add_source(config::File::from(config_path))
            .add_source(config::Environment::with_prefix("AGENTWATCH"))
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.set_defaults()?;
        config.validate()?;

        Ok(config)
    }

    fn find_config_file() -> Result<PathBuf> {
        let possible_paths = vec![
            PathBuf::from("config.yaml"),
            PathBuf::from("config.yml"),
            PathBuf::from("/etc/agentwatch/config.yaml"),
            PathBuf::from("/usr/local/etc/agentwatch/config.yaml"),
        ];

        for path in possible_paths {
            if path.exists() {
                return Ok(path);
            }
        }

        // Create default config if none found
        let default_config = Self::default();
        let config_content = serde_yaml::to_string(&default_config)
            .context("Failed to serialize default config")?;

        std::fs::write("config.yaml", config_content)
            .context("Failed to write default config")?;

        Ok(PathBuf::from("config.yaml"))
    }

    fn set_defaults(&mut self) -> Result<()> {
        if self.daemon.instance_id.is_none() {
            self.daemon.instance_id = Some(uuid::Uuid::new_v4().to_string());
        }

        if self.daemon.hostname.is_none() {
            self.daemon.hostname = Some(
                hostname::get()
                    .context("Failed to get hostname")?
                    .to_string_lossy()
                    .to_string(),
            );
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.trackers.process.scan_interval_ms == 0
            || self.trackers.network.scan_interval_ms == 0
            || self.trackers.file.scan_interval_ms == 0
        {
            anyhow::bail!("Tracker scan intervals must be greater than 0");
        }

        if self.hub.subscriber_buffer == 0 {
            anyhow::bail!("Hub subscriber buffer must be greater than 0");
        }

        if self.storage.enabled && self.storage.max_batch_size == 0 {
            anyhow::bail!("Storage max batch size must be greater than 0");
        }

        if self.storage.enabled {
            let data_dir = &self.storage.data_directory;
            if let Some(parent) = data_dir.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .context("Failed to create data directory")?;
                }
            }
        }

        Ok(())
    }
}

/// Noise patterns applied when the config does not override them: temp
/// files, build caches, VCS internals, and OS pseudo-filesystems.
pub fn default_noise_patterns() -> Vec<String> {
    vec![
        "/proc/**".to_string(),
        "/sys/**".to_string(),
        "/dev/**".to_string(),
        "/run/**".to_string(),
        "/tmp/**".to_string(),
        "*.tmp".to_string(),
        "*.swp".to_string(),
        "**/node_modules/**".to_string(),
        "**/.git/objects/**".to_string(),
        "**/__pycache__/**".to_string(),
        "**/.cache/**".to_string(),
        "**/.npm/**".to_string(),
        "**/.cargo/registry/**".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig {
                instance_id: None,
                hostname: None,
                shutdown_timeout_ms: 5000,
            },
            trackers: TrackersConfig {
                process: ProcessTrackerConfig {
                    enabled: true,
                    scan_interval_ms: 1000,
                    prefer_kernel_backend: true,
                    significant_cpu_delta: 10.0,
                    significant_memory_delta_bytes: 10_000_000,
                },
                network: NetworkTrackerConfig {
                    enabled: true,
                    scan_interval_ms: 2000,
                },
                file: FileTrackerConfig {
                    enabled: true,
                    scan_interval_ms: 2000,
                    watched_paths: vec![],
                    noise_patterns: default_noise_patterns(),
                },
            },
            signatures: SignaturesConfig {
                file_path: None,
                hot_reload: true,
            },
            hub: HubConfig {
                subscriber_buffer: 4096,
            },
            storage: StorageConfig {
                enabled: true,
                data_directory: PathBuf::from("./data"),
                compress_batches: true,
                max_batch_size: 1000,
                flush_interval_ms: 5000,
                retention_days: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                directory: PathBuf::from("./logs"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let mut config = Config::default();
        config.set_defaults().unwrap();
        config.validate().unwrap();
        assert!(config.daemon.instance_id.is_some());
    }

    #[test]
    fn zero_interval_rejected() {
        let mut config = Config::default();
        config.trackers.process.scan_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
