//! Watches the interface config directory and maps file events onto
//! per-interface update/remove callbacks.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// `<name>.conf` appeared or changed.
    Update(String),
    /// `<name>.conf` was removed or renamed away.
    Remove(String),
}

/// Starts watching `dir`. Callbacks run on the watcher's own thread and must
/// only enqueue; the returned watcher has to be kept alive.
pub fn spawn(
    dir: &Path,
    on_update: impl Fn(&str) + Send + 'static,
    on_remove: impl Fn(&str) + Send + 'static,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(%err, "interface watcher error");
                return;
            }
        };
        for action in classify(&event) {
            match action {
                WatchEvent::Update(name) => {
                    tracing::info!(iface = %name, "interface config updated");
                    on_update(&name);
                }
                WatchEvent::Remove(name) => {
                    tracing::info!(iface = %name, "interface config removed");
                    on_remove(&name);
                }
            }
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Maps one raw filesystem event onto interface actions, dropping anything
/// that is not a `.conf` file.
pub fn classify(event: &Event) -> Vec<WatchEvent> {
    let mut names = event.paths.iter().filter_map(|path| iface_name(path));

    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
            names.map(WatchEvent::Update).collect()
        }
        EventKind::Remove(_) => names.map(WatchEvent::Remove).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            names.map(WatchEvent::Remove).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            names.map(WatchEvent::Update).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // one event carrying [old, new]
            let mut actions = Vec::new();
            if let Some(old) = names.next() {
                actions.push(WatchEvent::Remove(old));
            }
            if let Some(new) = names.next() {
                actions.push(WatchEvent::Update(new));
            }
            actions
        }
        EventKind::Modify(ModifyKind::Name(_)) => names.map(WatchEvent::Remove).collect(),
        _ => Vec::new(),
    }
}

fn iface_name(path: &PathBuf) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("conf") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn create_and_write_map_to_update() {
        let created = event(
            EventKind::Create(CreateKind::File),
            &["/etc/wireguard/wg0.conf"],
        );
        assert_eq!(classify(&created), vec![WatchEvent::Update("wg0".into())]);

        let written = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/etc/wireguard/wg0.conf"],
        );
        assert_eq!(classify(&written), vec![WatchEvent::Update("wg0".into())]);
    }

    #[test]
    fn remove_and_rename_map_to_remove() {
        let removed = event(
            EventKind::Remove(RemoveKind::File),
            &["/etc/wireguard/wg0.conf"],
        );
        assert_eq!(classify(&removed), vec![WatchEvent::Remove("wg0".into())]);

        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/etc/wireguard/wg0.conf"],
        );
        assert_eq!(classify(&renamed), vec![WatchEvent::Remove("wg0".into())]);
    }

    #[test]
    fn rename_pair_removes_old_and_updates_new() {
        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/etc/wireguard/wg0.conf", "/etc/wireguard/wg1.conf"],
        );
        assert_eq!(
            classify(&renamed),
            vec![
                WatchEvent::Remove("wg0".into()),
                WatchEvent::Update("wg1".into())
            ]
        );
    }

    #[test]
    fn non_conf_files_are_ignored() {
        let created = event(
            EventKind::Create(CreateKind::File),
            &["/etc/wireguard/notes.txt", "/etc/wireguard/wg0.conf.bak"],
        );
        assert!(classify(&created).is_empty());
    }
}
