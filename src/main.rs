//! The `wg-steward` CLI.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};

use wg_steward::device::DeviceManager;
use wg_steward::quick::{self, config};
use wg_steward::resolver::Resolver;
use wg_steward::settings::{self, Settings, SettingsHandle};
use wg_steward::{daemon, logging, service};

#[derive(Parser)]
#[command(name = "wg-steward", version, about = "Keeps wg-quick style WireGuard interfaces configured and their DDNS peer endpoints fresh")]
struct Cli {
    /// Path to the daemon configuration file.
    #[arg(short, long, global = true, default_value = settings::DEFAULT_PATH)]
    config: PathBuf,

    /// Log at debug level.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Clone)]
enum Cmd {
    /// Bring matching interfaces up.
    ///
    /// The argument is matched against configured interface names as the
    /// anchored regular expression `^<iface>$`.
    Up { iface: String },

    /// Bring matching interfaces down.
    Down { iface: String },

    /// Bring matching interfaces down and back up.
    Bounce { iface: String },

    /// Re-sync matching interfaces in place. Deprecated, prefer `bounce`.
    #[command(hide = true)]
    Sync { iface: String },

    /// Run the reconciliation daemon.
    Service {
        #[command(subcommand)]
        action: Option<ServiceCmd>,
    },

    /// Install this binary to the system path.
    Install,

    /// Remove the installed binary.
    Uninstall,

    /// Print the version.
    Version,
}

#[derive(Subcommand, Clone)]
enum ServiceCmd {
    /// Install the init.d script or systemd unit.
    Install,
    /// Remove the init.d script or systemd unit.
    Uninstall,
}

fn main() {
    match try_main() {
        Ok(()) => {}
        Err(err) => {
            // Print the error chain by hand so a failure does not look like
            // a crash with a stack trace.
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    if let Cmd::Version = cli.command {
        println!("wg-steward {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = Settings::load_or_create(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let log = logging::init(&settings, cli.verbose)?;
    let settings = SettingsHandle::new(settings);

    match cli.command {
        Cmd::Version => unreachable!("handled before logging is set up"),
        Cmd::Install => service::install_binary(),
        Cmd::Uninstall => service::uninstall_binary(),
        Cmd::Service {
            action: Some(ServiceCmd::Install),
        } => service::install_service(),
        Cmd::Service {
            action: Some(ServiceCmd::Uninstall),
        } => service::uninstall_service(),
        Cmd::Service { action: None } => run_service(settings, log, cli.config),
        Cmd::Up { ref iface } => run_oneshot(&settings, Op::Up, iface),
        Cmd::Down { ref iface } => run_oneshot(&settings, Op::Down, iface),
        Cmd::Bounce { ref iface } => run_oneshot(&settings, Op::Bounce, iface),
        Cmd::Sync { ref iface } => {
            tracing::warn!("`sync` is deprecated, use `bounce` instead");
            run_oneshot(&settings, Op::Sync, iface)
        }
    }
}

fn run_service(settings: SettingsHandle, log: logging::LogHandle, config_path: PathBuf) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async move {
        let _watcher = match settings::watch(settings.clone(), config_path, move |fresh| {
            log.apply(fresh)
        }) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!(%err, "failed to watch the config file, changes need a restart");
                None
            }
        };

        daemon::serve(settings, PathBuf::from(config::CONFIG_DIR)).await
    })
}

#[derive(Clone, Copy)]
enum Op {
    Up,
    Down,
    Bounce,
    Sync,
}

fn run_oneshot(settings: &SettingsHandle, op: Op, pattern: &str) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async move {
        let dir = Path::new(config::CONFIG_DIR);
        let names = config::matching_interfaces(dir, pattern)?;
        if names.is_empty() {
            bail!("no configured interface matches `{pattern}`");
        }

        let mgr = DeviceManager::new().context("failed to open netlink connections")?;
        let current = settings.current();
        let resolver = Resolver::from_settings(&current);

        let mut failed = false;
        for name in names {
            let loaded = match config::load(dir, &name, &resolver, &current.wireguard).await {
                Ok(loaded) => loaded,
                Err(err) => {
                    tracing::error!(iface = %name, %err, "failed to load interface config");
                    failed = true;
                    continue;
                }
            };

            let result = match op {
                Op::Up => quick::up(&mgr, &loaded.config, &name).await,
                Op::Down => quick::down(&mgr, &loaded.config, &name).await,
                Op::Bounce => quick::bounce(&mgr, &loaded.config, &name).await,
                Op::Sync => quick::sync(&mgr, &loaded.config, &name).await,
            };
            if let Err(err) = result {
                tracing::error!(iface = %name, %err, "operation failed");
                failed = true;
            }
        }

        if failed {
            bail!("one or more interfaces failed");
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_up_with_pattern() {
        let cli = Cli::try_parse_from(["wg-steward", "up", "wg.*"]).unwrap();
        assert!(matches!(cli.command, Cmd::Up { iface } if iface == "wg.*"));
        assert_eq!(cli.config, PathBuf::from(settings::DEFAULT_PATH));
    }

    #[test]
    fn parses_global_config_flag() {
        let cli =
            Cli::try_parse_from(["wg-steward", "--config", "/tmp/steward.toml", "service"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/steward.toml"));
        assert!(matches!(cli.command, Cmd::Service { action: None }));
    }

    #[test]
    fn parses_service_install() {
        let cli = Cli::try_parse_from(["wg-steward", "service", "install"]).unwrap();
        assert!(matches!(
            cli.command,
            Cmd::Service {
                action: Some(ServiceCmd::Install)
            }
        ));
    }

    #[test]
    fn up_requires_an_interface() {
        assert!(Cli::try_parse_from(["wg-steward", "up"]).is_err());
    }
}
