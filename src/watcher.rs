//! Hot-plug tracking through sysfs
//!
//! Every `video4linux` class entry is resolved to its USB ancestor to find a
//! stable serial number. Polling the class directory and diffing successive
//! scans yields add/remove events keyed by both device path and serial.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flume::Receiver;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::{Result, WatcherConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub path: String,
    pub serial: String,
    pub action: DeviceAction,
}

impl DeviceEvent {
    pub fn add(path: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            serial: serial.into(),
            action: DeviceAction::Add,
        }
    }

    pub fn remove(path: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            serial: serial.into(),
            action: DeviceAction::Remove,
        }
    }
}

/// Identity of a capture node as found in sysfs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct NodeInfo {
    serial: Option<String>,
    manufacturer: Option<String>,
    product: Option<String>,
}

/// Sysfs scanner for supported capture devices.
#[derive(Debug, Clone)]
pub struct DeviceWatcher {
    config: WatcherConfig,
}

impl DeviceWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self { config }
    }

    /// Serial to device path for every present, supported capture node.
    pub fn get_devices(&self) -> Result<HashMap<String, String>> {
        let mut devices = HashMap::new();
        let root = Path::new(&self.config.sysfs_root);
        if !root.exists() {
            debug!("{} does not exist, no devices", root.display());
            return Ok(devices);
        }

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("video") {
                continue;
            }
            let node = entry.path();

            // Capture devices expose metadata nodes too; only the first
            // node of a device streams frames.
            if let Some(index) = read_attribute(&node, "index") {
                if index != "0" {
                    continue;
                }
            }

            let info = resolve_node(&node);
            let Some(serial) = info.serial else {
                debug!("{} has no serial, skipping", node.display());
                continue;
            };
            if !self.is_supported(info.manufacturer.as_deref(), info.product.as_deref()) {
                debug!(
                    "{} ({:?} {:?}) not supported",
                    name, info.manufacturer, info.product
                );
                continue;
            }

            let dev_path = Path::new(&self.config.dev_root).join(&name);
            devices.insert(serial, dev_path.to_string_lossy().into_owned());
        }

        Ok(devices)
    }

    pub fn get_dev_path(&self, serial: &str) -> Result<Option<String>> {
        Ok(self.get_devices()?.remove(serial))
    }

    pub fn get_serial(&self, dev_path: &str) -> Result<Option<String>> {
        Ok(self
            .get_devices()?
            .into_iter()
            .find_map(|(serial, path)| (path == dev_path).then_some(serial)))
    }

    fn is_supported(&self, manufacturer: Option<&str>, product: Option<&str>) -> bool {
        if self.config.supported_cameras.is_empty() {
            return true;
        }
        let name = format!(
            "{} {}",
            manufacturer.unwrap_or_default(),
            product.unwrap_or_default()
        );
        self.config.supported_cameras.iter().any(|s| *s == name)
    }

    /// Poll sysfs until the returned handle is stopped or dropped.
    ///
    /// The first scan reports every present device as added.
    pub fn spawn(self) -> (WatcherHandle, Receiver<DeviceEvent>) {
        let (events_tx, events_rx) = flume::unbounded();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        let task = tokio::spawn(async move {
            let mut known = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Watching {}", self.config.sysfs_root);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                let watcher = self.clone();
                let current = match tokio::task::spawn_blocking(move || watcher.get_devices()).await {
                    Ok(Ok(devices)) => devices,
                    Ok(Err(e)) => {
                        warn!("Device scan failed: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!("Device scan task failed: {}", e);
                        continue;
                    }
                };

                for event in diff_devices(&known, &current) {
                    debug!("{:?} {} ({})", event.action, event.serial, event.path);
                    if events_tx.send(event).is_err() {
                        debug!("Event receiver gone, watcher exiting");
                        return;
                    }
                }
                known = current;
            }
            debug!("Watcher stopped");
        });

        (
            WatcherHandle {
                stop: Some(stop_tx),
                task: Some(task),
            },
            events_rx,
        )
    }
}

/// Running watcher task
pub struct WatcherHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Events turning `old` into `new`, both serial to path. Removals come first
/// so a device that moved to another node is stopped before it is restarted.
pub fn diff_devices(
    old: &HashMap<String, String>,
    new: &HashMap<String, String>,
) -> Vec<DeviceEvent> {
    let mut removed: Vec<_> = old
        .iter()
        .filter(|(serial, path)| new.get(*serial) != Some(*path))
        .map(|(serial, path)| DeviceEvent::remove(path.as_str(), serial.as_str()))
        .collect();
    let mut added: Vec<_> = new
        .iter()
        .filter(|(serial, path)| old.get(*serial) != Some(*path))
        .map(|(serial, path)| DeviceEvent::add(path.as_str(), serial.as_str()))
        .collect();

    removed.sort_by(|a, b| a.serial.cmp(&b.serial));
    added.sort_by(|a, b| a.serial.cmp(&b.serial));
    removed.extend(added);
    removed
}

#[instrument(level = "trace")]
fn resolve_node(node: &Path) -> NodeInfo {
    let start = fs::canonicalize(node).unwrap_or_else(|_| node.to_path_buf());
    NodeInfo {
        serial: find_upwards(&start, "serial"),
        manufacturer: find_upwards(&start, "manufacturer"),
        product: find_upwards(&start, "product"),
    }
}

/// First value of `attribute` on `start` or one of its ancestors.
fn find_upwards(start: &Path, attribute: &str) -> Option<String> {
    let mut dir: Option<PathBuf> = Some(start.to_path_buf());
    while let Some(current) = dir {
        if let Some(value) = read_attribute(&current, attribute) {
            return Some(value);
        }
        dir = current.parent().map(Path::to_path_buf);
    }
    None
}

fn read_attribute(dir: &Path, attribute: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(attribute)).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
