//! Companion daemon for kernel WireGuard on Linux.
//!
//! Brings `wg-quick`-style interfaces up and down, watches their config
//! files, and keeps DDNS-named peer endpoints fresh by re-resolving them
//! with a built-in iterative DNS resolver that bypasses OS resolver caches.

pub mod daemon;
pub mod device;
pub mod key;
pub mod logging;
pub mod quick;
pub mod resolver;
pub mod service;
pub mod settings;
