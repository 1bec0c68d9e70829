//! Binary and service installation for OpenWrt (`init.d`) and systemd hosts.

use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::process::Command;

use anyhow::{Context as _, Result};

pub const INSTALL_PATH: &str = "/usr/sbin/wg-steward";
const INITD_PATH: &str = "/etc/init.d/wg-steward";
const SYSTEMD_PATH: &str = "/etc/systemd/system/wg-steward.service";

const INITD_SCRIPT: &str = include_str!("../etc/wg-steward.init");
const SYSTEMD_UNIT: &str = include_str!("../etc/wg-steward.service");

fn is_systemd() -> bool {
    Path::new("/run/systemd/system").exists()
}

/// Copies the running binary to the system path.
pub fn install_binary() -> Result<()> {
    let current = std::env::current_exe().context("cannot locate the running binary")?;
    if current == Path::new(INSTALL_PATH) {
        tracing::info!(path = INSTALL_PATH, "binary already installed");
        return Ok(());
    }

    std::fs::copy(&current, INSTALL_PATH)
        .with_context(|| format!("failed to copy {} to {INSTALL_PATH}", current.display()))?;
    std::fs::set_permissions(INSTALL_PATH, std::fs::Permissions::from_mode(0o755))
        .context("failed to mark the installed binary executable")?;

    tracing::info!(path = INSTALL_PATH, "installed binary");
    Ok(())
}

pub fn uninstall_binary() -> Result<()> {
    match std::fs::remove_file(INSTALL_PATH) {
        Ok(()) => {
            tracing::info!(path = INSTALL_PATH, "removed binary");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = INSTALL_PATH, "binary not installed, nothing to remove");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("failed to remove {INSTALL_PATH}")),
    }
}

/// Installs the init.d script or systemd unit, installing the binary first
/// if it is not in place yet.
pub fn install_service() -> Result<()> {
    if !Path::new(INSTALL_PATH).exists() {
        tracing::warn!("binary not installed yet, installing it first");
        install_binary()?;
    }

    if is_systemd() {
        tracing::info!("systemd detected, installing unit");
        std::fs::write(SYSTEMD_PATH, SYSTEMD_UNIT)
            .with_context(|| format!("failed to write {SYSTEMD_PATH}"))?;
        daemon_reload();
        tracing::info!(path = SYSTEMD_PATH, "installed systemd service");
    } else {
        tracing::info!("init.d detected, installing service script");
        std::fs::write(INITD_PATH, INITD_SCRIPT)
            .with_context(|| format!("failed to write {INITD_PATH}"))?;
        std::fs::set_permissions(INITD_PATH, std::fs::Permissions::from_mode(0o755))
            .context("failed to mark the init script executable")?;
        tracing::info!(path = INITD_PATH, "installed init.d service");
    }
    Ok(())
}

pub fn uninstall_service() -> Result<()> {
    if is_systemd() {
        // disable returns 1 and stop returns 5 when the unit does not exist
        run_tolerant("systemctl", &["disable", "wg-steward.service"], &[1]);
        run_tolerant("systemctl", &["stop", "wg-steward.service"], &[5]);
        remove_service_file(SYSTEMD_PATH)?;
        daemon_reload();
    } else {
        run_tolerant(INITD_PATH, &["stop"], &[]);
        remove_service_file(INITD_PATH)?;
    }
    Ok(())
}

fn remove_service_file(path: &str) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(path, "removed service file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path, "service file not found, nothing to remove");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("failed to remove {path}")),
    }
}

fn daemon_reload() {
    run_tolerant("systemctl", &["daemon-reload"], &[]);
}

/// Runs a command whose failure is reported but never fatal; `tolerated`
/// exit codes are not even worth a warning.
fn run_tolerant(program: &str, args: &[&str], tolerated: &[i32]) {
    match Command::new(program).args(args).output() {
        Ok(output) => {
            let code = output.status.code().unwrap_or(-1);
            if output.status.success() || tolerated.contains(&code) {
                tracing::info!(%program, ?args, "command finished");
            } else {
                tracing::warn!(
                    %program,
                    ?args,
                    code,
                    output = %crate::device::combined_output(&output),
                    "command finished with an unexpected exit code"
                );
            }
        }
        Err(err) => tracing::warn!(%program, ?args, %err, "failed to run command"),
    }
}
