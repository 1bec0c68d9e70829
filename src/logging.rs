//! Global tracing subscriber with a runtime-reloadable level filter.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::settings::Settings;

pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// level; `--verbose` lowers the floor to debug.
pub fn init(settings: &Settings, verbose: bool) -> anyhow::Result<LogHandle> {
    let (filter, handle) = reload::Layer::new(filter_for(settings, verbose));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?;

    Ok(LogHandle { reload: handle })
}

impl LogHandle {
    /// Applies a freshly reloaded config to the live filter.
    pub fn apply(&self, settings: &Settings) {
        if let Err(err) = self.reload.reload(filter_for(settings, false)) {
            tracing::warn!(%err, "failed to update log level");
        }
    }
}

fn filter_for(settings: &Settings, verbose: bool) -> EnvFilter {
    if let Ok(directives) = std::env::var(EnvFilter::DEFAULT_ENV) {
        return EnvFilter::new(directives);
    }
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        settings.log.level_filter()
    };
    EnvFilter::default().add_directive(level.into())
}
