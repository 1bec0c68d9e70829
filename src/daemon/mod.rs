//! The reconciliation daemon.
//!
//! Tracks a dynamic set of interfaces, re-resolves the endpoints of peers
//! that stopped handshaking and pushes the delta back into the kernel. One
//! mutex guards the running and pending sets; it is held across a whole
//! tick so that file-watcher events never observe a half-updated interface.

mod watcher;

pub use watcher::{classify, WatchEvent};

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use notify::RecommendedWatcher;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;

use crate::device::{self, DeviceManager, PeerSnapshot};
use crate::key::Key;
use crate::quick::{self, config, config::InterfaceConfig};
use crate::resolver::{ResolveEndpoint, Resolver};
use crate::settings::{Settings, SettingsHandle};

const BOOT_RETRIES: u32 = 5;
const BOOT_RETRY_BASE: Duration = Duration::from_secs(1);

/// The kernel-facing operations the tick loop needs. The real
/// implementation is [`DeviceManager`]; tests substitute a stub.
pub trait WgControl {
    fn peer_status(
        &self,
        iface: &str,
    ) -> impl Future<Output = Result<Vec<PeerSnapshot>, device::Error>> + Send;

    fn sync_device(
        &self,
        cfg: &InterfaceConfig,
        iface: &str,
    ) -> impl Future<Output = Result<(), quick::Error>> + Send;
}

impl WgControl for Arc<DeviceManager> {
    async fn peer_status(&self, iface: &str) -> Result<Vec<PeerSnapshot>, device::Error> {
        DeviceManager::peer_status(self, iface).await
    }

    async fn sync_device(&self, cfg: &InterfaceConfig, iface: &str) -> Result<(), quick::Error> {
        quick::sync_device(self, cfg, iface).await
    }
}

/// Per-interface runtime state. The config is mutable (peer endpoints get
/// rewritten); the unresolved-endpoint table is frozen at parse time and
/// stays the authority for re-resolution.
pub struct Managed {
    config: InterfaceConfig,
    unresolved: HashMap<Key, String>,
}

impl Managed {
    pub fn new(config: InterfaceConfig, unresolved: HashMap<Key, String>) -> Self {
        Self { config, unresolved }
    }
}

#[derive(Default)]
struct State {
    running: HashMap<String, Managed>,
    pending: Vec<String>,
}

pub struct Daemon<C, R> {
    control: C,
    resolver: R,
    settings: SettingsHandle,
    config_dir: PathBuf,
    state: Mutex<State>,
}

impl<C, R> Daemon<C, R>
where
    C: WgControl,
    R: ResolveEndpoint,
{
    pub fn new(control: C, resolver: R, settings: SettingsHandle, config_dir: PathBuf) -> Self {
        Self {
            control,
            resolver,
            settings,
            config_dir,
            state: Mutex::new(State::default()),
        }
    }

    /// Scans the config directory once; interfaces that fail to load are
    /// parked in the pending set for the retry loop.
    pub async fn init(&self) {
        let settings = self.settings.current();
        let names = match config::list_interfaces(&self.config_dir) {
            Ok(names) => names,
            Err(err) => {
                tracing::warn!(%err, dir = %self.config_dir.display(), "failed to scan config directory");
                return;
            }
        };
        let names =
            config::filter_interfaces(names, &settings.ddns.only_ifaces, &settings.ddns.skip_ifaces);

        let mut state = self.state.lock().await;
        for name in names {
            tracing::info!(iface = %name, "found interface, initializing ddns state");
            match self.load_managed(&name, &settings).await {
                Ok(managed) => {
                    state.running.insert(name, managed);
                }
                Err(err) => {
                    tracing::error!(iface = %name, %err, "failed to init ddns state, will retry");
                    state.pending.push(name);
                }
            }
        }
    }

    /// The main loop: sleep one interval, sweep every running interface.
    pub async fn run(&self) {
        loop {
            tokio::time::sleep(self.settings.current().ddns.interval()).await;
            self.tick().await;
            tracing::info!("endpoint re-resolve sweep done");
        }
    }

    /// One reconciliation sweep under the daemon mutex. Errors are logged
    /// per interface and per peer; the sweep always visits everything.
    pub async fn tick(&self) {
        let handshake_max = self.settings.current().ddns.handshake_max();
        let mut state = self.state.lock().await;
        for (name, managed) in state.running.iter_mut() {
            self.reconcile(name, managed, handshake_max).await;
        }
    }

    async fn reconcile(&self, name: &str, managed: &mut Managed, handshake_max: Duration) {
        let peers = match self.control.peer_status(name).await {
            Ok(peers) => peers,
            Err(err) => {
                tracing::error!(iface = %name, %err, "failed to read peer status");
                return;
            }
        };

        let mut needs_sync = false;

        for peer in peers {
            let peer_key = peer.public_key;
            let Some(endpoint) = peer.endpoint else {
                tracing::debug!(iface = %name, peer = %peer_key, "peer has no endpoint, skipping");
                continue;
            };
            let Some(unresolved) = managed.unresolved.get(&peer_key) else {
                // static endpoint, nothing to re-resolve
                continue;
            };

            let fresh = peer
                .last_handshake
                .and_then(|at| SystemTime::now().duration_since(at).ok())
                .is_some_and(|age| age < handshake_max);
            if fresh {
                tracing::debug!(iface = %name, peer = %peer_key, "peer ok");
                continue;
            }

            tracing::debug!(iface = %name, peer = %peer_key, "peer handshake timed out, re-resolving endpoint");
            let addr = match self.resolver.resolve_udp_addr(unresolved).await {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::error!(iface = %name, peer = %peer_key, %err, "failed to resolve endpoint");
                    continue;
                }
            };

            // endpoints are compared by IP, a changed port alone is not a move
            if endpoint.ip() != addr.ip() {
                if let Some(peer) = managed.config.peer_mut(&peer_key) {
                    peer.endpoint = Some(addr);
                    needs_sync = true;
                }
            }
        }

        if !needs_sync {
            tracing::debug!(iface = %name, "addresses unchanged, skipping sync");
            return;
        }

        if managed.config.listen_port == Some(0) {
            tracing::info!(iface = %name, "listen port is ephemeral, re-sync keeps the kernel-chosen port");
        }

        match self.control.sync_device(&managed.config, name).await {
            Ok(()) => tracing::info!(iface = %name, "endpoint re-resolve applied"),
            Err(err) => tracing::error!(iface = %name, %err, "device sync failed"),
        }
    }

    /// Retries every pending interface; wakes at twice the tick interval.
    pub async fn pending_loop(&self) {
        loop {
            tokio::time::sleep(self.settings.current().ddns.interval() * 2).await;
            self.drain_pending().await;
        }
    }

    async fn drain_pending(&self) {
        let settings = self.settings.current();
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.pending);
        for name in pending {
            match self.load_managed(&name, &settings).await {
                Ok(managed) => {
                    tracing::info!(iface = %name, "init success, moving to run list");
                    state.running.insert(name, managed);
                }
                Err(err) => {
                    tracing::error!(iface = %name, %err, "failed to init ddns state, keeping pending");
                    state.pending.push(name);
                }
            }
        }
    }

    async fn load_managed(
        &self,
        name: &str,
        settings: &Settings,
    ) -> Result<Managed, config::LoadError> {
        let loaded =
            config::load(&self.config_dir, name, &self.resolver, &settings.wireguard).await?;
        Ok(Managed::new(loaded.config, loaded.unresolved))
    }

    fn accepts(&self, name: &str) -> bool {
        let settings = self.settings.current();
        (settings.ddns.only_ifaces.is_empty()
            || settings.ddns.only_ifaces.iter().any(|o| o == name))
            && !settings.ddns.skip_ifaces.iter().any(|s| s == name)
    }

    fn apply_update(state: &mut State, name: &str) {
        if state.running.contains_key(name) || state.pending.iter().any(|p| p == name) {
            return;
        }
        tracing::info!(iface = %name, "interface updated, adding to pending list");
        state.pending.push(name.to_owned());
    }

    fn apply_remove(state: &mut State, name: &str) {
        tracing::info!(iface = %name, "interface removed, dropping runtime state");
        state.running.remove(name);
        state.pending.retain(|p| p != name);
    }

    async fn handle_update(&self, name: &str) {
        if !self.accepts(name) {
            return;
        }
        Self::apply_update(&mut *self.state.lock().await, name);
    }

    async fn handle_remove(&self, name: &str) {
        if !self.accepts(name) {
            return;
        }
        Self::apply_remove(&mut *self.state.lock().await, name);
    }

    /// Starts the config-directory watcher. The callbacks only take the
    /// state mutex briefly, they never do kernel or DNS work.
    pub fn spawn_watcher(self: &Arc<Self>) -> notify::Result<RecommendedWatcher>
    where
        C: Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let on_update = {
            let daemon = Arc::clone(self);
            move |name: &str| {
                if daemon.accepts(name) {
                    Self::apply_update(&mut daemon.state.blocking_lock(), name);
                }
            }
        };
        let on_remove = {
            let daemon = Arc::clone(self);
            move |name: &str| {
                if daemon.accepts(name) {
                    Self::apply_remove(&mut daemon.state.blocking_lock(), name);
                }
            }
        };
        watcher::spawn(&self.config_dir, on_update, on_remove)
    }
}

/// Runs the daemon until SIGINT or SIGTERM.
pub async fn serve(settings: SettingsHandle, config_dir: PathBuf) -> anyhow::Result<()> {
    let control = Arc::new(
        DeviceManager::new().context("failed to open netlink connections, cannot continue")?,
    );
    let resolver = Arc::new(Resolver::from_settings(&settings.current()));

    let current = settings.current();
    if current.start_on_boot.enabled {
        start_on_boot(&control, &resolver, &current, &config_dir).await;
    }

    let daemon = Arc::new(Daemon::new(
        control,
        resolver,
        settings,
        config_dir,
    ));
    daemon.init().await;

    let _watcher = daemon
        .spawn_watcher()
        .context("failed to watch the interface config directory")?;

    let pending = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.pending_loop().await })
    };

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = daemon.run() => {}
        _ = terminate.recv() => tracing::info!("caught SIGTERM, shutting down"),
        _ = interrupt.recv() => tracing::info!("caught SIGINT, shutting down"),
    }

    pending.abort();
    Ok(())
}

/// Brings every configured interface up at service start, each in its own
/// task with exponential backoff. An interface that is already up counts as
/// success.
async fn start_on_boot(
    control: &Arc<DeviceManager>,
    resolver: &Arc<Resolver>,
    settings: &Settings,
    config_dir: &Path,
) {
    let names = match config::list_interfaces(config_dir) {
        Ok(names) => names,
        Err(err) => {
            tracing::error!(%err, dir = %config_dir.display(), "failed to scan config directory");
            return;
        }
    };
    let names = config::filter_interfaces(
        names,
        &settings.start_on_boot.only_ifaces,
        &settings.start_on_boot.skip_ifaces,
    );

    for name in names {
        let loaded = match config::load(config_dir, &name, resolver.as_ref(), &settings.wireguard)
            .await
        {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::error!(iface = %name, %err, "failed to load config, skipping boot bring-up");
                continue;
            }
        };

        let control = Arc::clone(control);
        tokio::spawn(async move {
            let mut wait = BOOT_RETRY_BASE;
            for attempt in 0..BOOT_RETRIES {
                if attempt > 0 {
                    tokio::time::sleep(wait).await;
                    wait *= 2;
                }
                match quick::up(&control, &loaded.config, &name).await {
                    Ok(()) => {
                        tracing::info!(iface = %name, "interface up");
                        return;
                    }
                    Err(quick::Error::AlreadyExists(_)) => {
                        tracing::info!(iface = %name, "interface already up");
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(iface = %name, %err, "failed to bring interface up, will retry");
                    }
                }
            }
            tracing::error!(iface = %name, "giving up on boot bring-up");
        });
    }

    tracing::info!("boot bring-up scheduled for all configured interfaces");
}
