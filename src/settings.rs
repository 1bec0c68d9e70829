//! Daemon configuration, read from a single TOML document.
//!
//! Every option has a default so a missing or partial file still yields a
//! working daemon. The file is watched; on change the whole document is
//! re-read and swapped atomically, long-running loops pick up the new values
//! on their next iteration.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

pub const DEFAULT_PATH: &str = "/etc/wg-steward.toml";

const SAMPLE: &str = include_str!("../etc/wg-steward.sample.toml");

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub ddns: Ddns,
    pub start_on_boot: StartOnBoot,
    pub enhanced_dns: EnhancedDns,
    pub wireguard: WireguardDefaults,
    pub log: Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Ddns {
    /// Reconciliation tick period, in seconds.
    pub interval: u64,
    /// Peer staleness threshold, in seconds.
    pub handshake_max: u64,
    pub only_ifaces: Vec<String>,
    pub skip_ifaces: Vec<String>,
}

impl Default for Ddns {
    fn default() -> Self {
        Self {
            interval: 60,
            handshake_max: 150,
            only_ifaces: Vec::new(),
            skip_ifaces: Vec::new(),
        }
    }
}

impl Ddns {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn handshake_max(&self) -> Duration {
        Duration::from_secs(self.handshake_max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct StartOnBoot {
    pub enabled: bool,
    pub only_ifaces: Vec<String>,
    pub skip_ifaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct EnhancedDns {
    pub direct_resolver: DirectResolver,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct DirectResolver {
    pub enabled: bool,
    /// Seed DNS servers for the authority walk, `host` or `host:port`.
    pub roa_finder: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WireguardDefaults {
    /// Applied when a `.conf` has no MTU of its own.
    pub mtu: u32,
    /// Force an ephemeral listen port when a `.conf` has none.
    pub random_port: bool,
}

impl Default for WireguardDefaults {
    fn default() -> Self {
        Self {
            mtu: crate::quick::config::DEFAULT_MTU,
            random_port: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Log {
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl Log {
    /// Maps the configured level to a filter. `warning` is accepted as a
    /// synonym for `warn`; anything unrecognized falls back to `info`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            other => {
                tracing::warn!(level = %other, "unrecognized log level, using `info`");
                LevelFilter::INFO
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create config file {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Loads the config, seeding a missing file with the embedded sample
    /// document first. A file that cannot be created is fatal for the
    /// caller.
    pub fn load_or_create(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config does not exist, creating it");
            let create = |path: &Path| -> std::io::Result<()> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, SAMPLE)
            };
            create(path).map_err(|source| SettingsError::Create {
                path: path.to_owned(),
                source,
            })?;
        }
        Self::load(path)
    }
}

/// Shared, hot-swappable settings.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn current(&self) -> Settings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    pub fn replace(&self, settings: Settings) {
        *self.inner.write().expect("settings lock poisoned") = settings;
    }
}

/// Watches the config file and re-reads it on every change. `on_reload`
/// runs after the swap, with the fresh settings. The returned watcher must
/// be kept alive.
pub fn watch(
    handle: SettingsHandle,
    path: PathBuf,
    on_reload: impl Fn(&Settings) + Send + 'static,
) -> notify::Result<RecommendedWatcher> {
    let watch_dir = path
        .parent()
        .map(Path::to_owned)
        .unwrap_or_else(|| PathBuf::from("/"));
    let file = path.clone();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(%err, "config watcher error");
                return;
            }
        };
        if !event.paths.iter().any(|p| p == &file) {
            return;
        }
        if !matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        ) {
            return;
        }
        match Settings::load(&file) {
            Ok(settings) => {
                handle.replace(settings.clone());
                tracing::info!(path = %file.display(), "config reloaded");
                on_reload(&settings);
            }
            Err(err) => tracing::warn!(%err, "failed to reload config, keeping previous"),
        }
    })?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.ddns.interval(), Duration::from_secs(60));
        assert_eq!(settings.ddns.handshake_max(), Duration::from_secs(150));
        assert!(!settings.start_on_boot.enabled);
        assert!(!settings.enhanced_dns.direct_resolver.enabled);
        assert_eq!(settings.wireguard.mtu, 1420);
        assert!(!settings.wireguard.random_port);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn sample_document_parses_to_defaults() {
        let settings: Settings = toml::from_str(SAMPLE).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_document_overrides_selected_keys() {
        let settings: Settings = toml::from_str(
            r#"
[ddns]
interval = 30
only_ifaces = ["wg0"]

[enhanced_dns.direct_resolver]
enabled = true
roa_finder = ["223.5.5.5"]
"#,
        )
        .unwrap();
        assert_eq!(settings.ddns.interval(), Duration::from_secs(30));
        assert_eq!(settings.ddns.only_ifaces, vec!["wg0".to_owned()]);
        assert_eq!(settings.ddns.handshake_max, 150);
        assert!(settings.enhanced_dns.direct_resolver.enabled);
    }

    #[test]
    fn warning_is_a_synonym_for_warn() {
        let log = Log {
            level: "warning".to_owned(),
        };
        assert_eq!(log.level_filter(), LevelFilter::WARN);
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let log = Log {
            level: "chatty".to_owned(),
        };
        assert_eq!(log.level_filter(), LevelFilter::INFO);
    }

    #[test]
    fn load_or_create_seeds_the_sample() {
        let dir = std::env::temp_dir().join("wg-steward-settings-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::remove_file(&path).ok();

        let settings = Settings::load_or_create(&path).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(path.exists());

        std::fs::remove_file(&path).ok();
    }
}
