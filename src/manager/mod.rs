//! Reconciles desired camera configuration with the devices actually present
//!
//! [`DeviceManager`] is a handle to a single task that owns every
//! [`ManagedCamera`], the hot-plug view of which serial sits on which device
//! node, and the persisted [`CameraManagerConfig`] per serial. Hot-plug
//! events and configuration calls are processed one at a time in arrival
//! order.

mod camera;
mod config;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub use camera::ManagedCamera;
pub use config::CameraManagerConfig;

use crate::capture::{CaptureBackend, Frame};
use crate::watcher::{DeviceAction, DeviceEvent};
use crate::{Error, Result};

/// Builds a fresh backend for every camera start.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn CaptureBackend> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Device absent or could not be opened
    Unplugged,
    /// Running on device defaults, no configuration
    Idle,
    /// Running with its configuration applied
    Active,
    /// Reserved for device health reporting
    Malfunctioned,
}

enum Command {
    DeviceEvent(DeviceEvent),
    SetConfig {
        configs: HashMap<String, CameraManagerConfig>,
        done: oneshot::Sender<()>,
    },
    GetConfig {
        reply: oneshot::Sender<HashMap<String, CameraManagerConfig>>,
    },
    GetDevices {
        reply: oneshot::Sender<Vec<String>>,
    },
    GetStatus {
        reply: oneshot::Sender<HashMap<String, Status>>,
    },
    GetFrames {
        serials: Option<Vec<String>>,
        reply: oneshot::Sender<HashMap<String, Option<Frame>>>,
    },
    ResetFilter {
        serial: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the manager task. The task ends once every handle
/// is dropped or [`DeviceManager::shutdown`] is called.
#[derive(Clone)]
pub struct DeviceManager {
    tx: Sender<Command>,
}

impl DeviceManager {
    pub fn spawn(factory: BackendFactory) -> Self {
        let (tx, rx) = flume::unbounded();
        let actor = ManagerActor {
            rx,
            factory,
            devices: HashMap::new(),
            cameras: HashMap::new(),
            configs: HashMap::new(),
        };
        tokio::spawn(actor.run());
        Self { tx }
    }

    /// Queue a hot-plug event without waiting for it to be handled.
    pub fn handle_device_event(&self, event: DeviceEvent) -> Result<()> {
        self.send(Command::DeviceEvent(event))
    }

    /// Forward every event from `events` until either side goes away.
    pub fn attach_watcher(&self, events: Receiver<DeviceEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                if manager.handle_device_event(event).is_err() {
                    break;
                }
            }
            debug!("Watcher feed closed");
        })
    }

    /// Replace the desired configuration. Serials missing from `configs`
    /// become unconfigured.
    pub async fn set_config(&self, configs: HashMap<String, CameraManagerConfig>) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::SetConfig { configs, done })?;
        wait.await.map_err(|_| Error::ActorGone("device manager"))
    }

    pub async fn get_config(&self) -> Result<HashMap<String, CameraManagerConfig>> {
        let (reply, wait) = oneshot::channel();
        self.send(Command::GetConfig { reply })?;
        wait.await.map_err(|_| Error::ActorGone("device manager"))
    }

    /// Serials currently present according to hot-plug tracking.
    pub async fn get_devices(&self) -> Result<Vec<String>> {
        let (reply, wait) = oneshot::channel();
        self.send(Command::GetDevices { reply })?;
        wait.await.map_err(|_| Error::ActorGone("device manager"))
    }

    pub async fn get_status(&self) -> Result<HashMap<String, Status>> {
        let (reply, wait) = oneshot::channel();
        self.send(Command::GetStatus { reply })?;
        wait.await.map_err(|_| Error::ActorGone("device manager"))
    }

    /// Newest frame per serial, all configured serials when `serials` is `None`.
    pub async fn get_frames(
        &self,
        serials: Option<Vec<String>>,
    ) -> Result<HashMap<String, Option<Frame>>> {
        let (reply, wait) = oneshot::channel();
        self.send(Command::GetFrames { serials, reply })?;
        wait.await.map_err(|_| Error::ActorGone("device manager"))
    }

    /// Retake the base frame of `serial` from what the camera sees now.
    pub async fn reset_filter(&self, serial: &str) -> Result<()> {
        let (reply, wait) = oneshot::channel();
        self.send(Command::ResetFilter {
            serial: serial.to_string(),
            reply,
        })?;
        wait.await.map_err(|_| Error::ActorGone("device manager"))?
    }

    /// Stop every camera and end the manager task.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Shutdown { done })?;
        wait.await.map_err(|_| Error::ActorGone("device manager"))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::ActorGone("device manager"))
    }
}

struct ManagerActor {
    rx: Receiver<Command>,
    factory: BackendFactory,
    /// serial -> device path, as reported by hot-plug events
    devices: HashMap<String, String>,
    cameras: HashMap<String, ManagedCamera>,
    configs: HashMap<String, CameraManagerConfig>,
}

impl ManagerActor {
    async fn run(mut self) {
        while let Ok(command) = self.rx.recv_async().await {
            match command {
                Command::DeviceEvent(event) => self.handle_device_event(event).await,
                Command::SetConfig { configs, done } => {
                    self.set_config(configs).await;
                    let _ = done.send(());
                }
                Command::GetConfig { reply } => {
                    let _ = reply.send(self.configs.clone());
                }
                Command::GetDevices { reply } => {
                    let mut serials: Vec<_> = self.devices.keys().cloned().collect();
                    serials.sort();
                    let _ = reply.send(serials);
                }
                Command::GetStatus { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::GetFrames { serials, reply } => {
                    let _ = reply.send(self.frames(serials));
                }
                Command::ResetFilter { serial, reply } => {
                    let result = match self.cameras.get(&serial) {
                        Some(camera) => camera.reset_filter().await,
                        None => Err(Error::NotStarted("camera")),
                    };
                    let _ = reply.send(result);
                }
                Command::Shutdown { done } => {
                    self.stop_all().await;
                    let _ = done.send(());
                    return;
                }
            }
        }
        self.stop_all().await;
    }

    #[instrument(skip_all, fields(serial = %event.serial, path = %event.path))]
    async fn handle_device_event(&mut self, event: DeviceEvent) {
        let DeviceEvent {
            path,
            serial,
            action,
        } = event;
        match action {
            DeviceAction::Add => {
                if let Some(camera) = self.cameras.get(&serial) {
                    if camera.path() == path && camera.is_sampling() {
                        debug!("{} already running on {}", serial, path);
                        return;
                    }
                }
                self.devices.insert(serial.clone(), path);
                let config = self.configs.get(&serial).cloned();
                self.restart(&serial, config).await;
            }
            DeviceAction::Remove => {
                self.devices.remove(&serial);
                if let Some(camera) = self.cameras.remove(&serial) {
                    if let Err(e) = camera.stop().await {
                        warn!("{}: stop failed: {}", serial, e);
                    }
                }
                info!("{} unplugged", serial);
            }
        }
    }

    async fn set_config(&mut self, configs: HashMap<String, CameraManagerConfig>) {
        let mut serials: Vec<_> = configs.keys().cloned().collect();
        serials.sort();

        for serial in serials {
            let Some(requested) = configs.get(&serial) else {
                continue;
            };
            let previous = self.configs.get(&serial);
            let mut merged = previous
                .map(|p| p.merge(requested))
                .unwrap_or_else(|| requested.clone());

            if let Err(e) = merged.roi() {
                warn!("{}: rejecting roi {:?}: {}", serial, merged.roi, e);
                metrics::counter!("pxlcam_rejected_roi_total", "camera" => serial.clone())
                    .increment(1);
                merged.roi = previous.and_then(|p| p.roi.clone());
            }
            self.configs.insert(serial.clone(), merged.clone());

            let Some(path) = self.devices.get(&serial).cloned() else {
                debug!("{} not present, config kept for later", serial);
                continue;
            };
            let restart = match self.cameras.get(&serial) {
                Some(camera) => camera.needs_restart(&path, &merged),
                None => {
                    debug!("{} present but not running, config kept", serial);
                    continue;
                }
            };
            if restart {
                self.restart(&serial, Some(merged)).await;
                continue;
            }
            let Some(camera) = self.cameras.get_mut(&serial) else {
                continue;
            };
            match camera.update(merged).await {
                Ok(0) => debug!("{}: nothing to update", serial),
                Ok(n) => {
                    info!("{}: {} field(s) updated in place", serial, n);
                    metrics::counter!("pxlcam_in_place_updates_total", "camera" => serial.clone())
                        .increment(1);
                }
                Err(e) => error!("{}: update failed: {}", serial, e),
            }
        }

        let dropped: Vec<_> = self
            .configs
            .keys()
            .filter(|serial| !configs.contains_key(*serial))
            .cloned()
            .collect();
        for serial in dropped {
            self.configs.remove(&serial);
            if self.cameras.contains_key(&serial) {
                info!("{} unconfigured, back to device defaults", serial);
                self.restart(&serial, None).await;
            }
        }
    }

    /// Stop the camera of `serial` if running and start it again on its
    /// tracked device node. A failed start leaves the serial without camera.
    async fn restart(&mut self, serial: &str, config: Option<CameraManagerConfig>) {
        if let Some(camera) = self.cameras.remove(serial) {
            if let Err(e) = camera.stop().await {
                warn!("{}: stop failed: {}", serial, e);
            }
        }
        let Some(path) = self.devices.get(serial).cloned() else {
            return;
        };

        let defaults = crate::CONFIG.load().capture.clone();
        let backend = (self.factory)();
        match ManagedCamera::start(serial, &path, config, backend, &defaults).await {
            Ok(camera) => {
                metrics::counter!("pxlcam_camera_starts_total", "camera" => serial.to_string())
                    .increment(1);
                self.cameras.insert(serial.to_string(), camera);
            }
            Err(e) => error!("{}: could not start on {}: {}", serial, path, e),
        }
    }

    fn status(&self) -> HashMap<String, Status> {
        let serials: BTreeSet<&String> = self.devices.keys().chain(self.configs.keys()).collect();
        serials
            .into_iter()
            .map(|serial| {
                let status = if !self.cameras.contains_key(serial) {
                    Status::Unplugged
                } else if !self.configs.contains_key(serial) {
                    Status::Idle
                } else {
                    Status::Active
                };
                (serial.clone(), status)
            })
            .collect()
    }

    fn frames(&self, serials: Option<Vec<String>>) -> HashMap<String, Option<Frame>> {
        let serials = serials.unwrap_or_else(|| self.configs.keys().cloned().collect());
        serials
            .into_iter()
            .map(|serial| {
                let frame = self
                    .cameras
                    .get(&serial)
                    .and_then(|camera| match camera.get_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("{}: no frame: {}", serial, e);
                            None
                        }
                    });
                (serial, frame)
            })
            .collect()
    }

    async fn stop_all(&mut self) {
        for (serial, camera) in self.cameras.drain() {
            if let Err(e) = camera.stop().await {
                warn!("{}: stop failed: {}", serial, e);
            }
        }
        info!("Device manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::mock::{MockBackend, MockControl};
    use crate::capture::Attribute;

    fn shared_factory() -> (BackendFactory, MockControl) {
        let control = MockBackend::new().control();
        let shared = control.clone();
        let factory: BackendFactory =
            Arc::new(move || Box::new(MockBackend::with_control(&shared)) as Box<dyn CaptureBackend>);
        (factory, control)
    }

    fn sized(width: u32, height: u32) -> CameraManagerConfig {
        CameraManagerConfig {
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    fn one(serial: &str, config: CameraManagerConfig) -> HashMap<String, CameraManagerConfig> {
        HashMap::from([(serial.to_string(), config)])
    }

    #[tokio::test]
    async fn plug_configure_unplug() {
        let (factory, control) = shared_factory();
        let manager = DeviceManager::spawn(factory);

        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();
        assert_eq!(manager.get_status().await.unwrap()["S1"], Status::Idle);
        assert_eq!(control.opens(), 1);

        manager.set_config(one("S1", sized(320, 240))).await.unwrap();
        assert_eq!(manager.get_status().await.unwrap()["S1"], Status::Active);
        // configuring a camera running on defaults reopens it
        assert_eq!(control.opens(), 2);
        assert_eq!(control.closes(), 1);

        manager
            .handle_device_event(DeviceEvent::remove("/dev/cam0", "S1"))
            .unwrap();
        assert!(manager.get_devices().await.unwrap().is_empty());
        assert_eq!(manager.get_status().await.unwrap()["S1"], Status::Unplugged);
        assert_eq!(manager.get_config().await.unwrap()["S1"], sized(320, 240));
        assert_eq!(control.closes(), 2);
    }

    #[tokio::test]
    async fn config_before_device_is_applied_on_plug() {
        let (factory, control) = shared_factory();
        let manager = DeviceManager::spawn(factory);

        manager.set_config(one("S1", sized(32, 24))).await.unwrap();
        assert_eq!(manager.get_status().await.unwrap()["S1"], Status::Unplugged);
        assert_eq!(control.opens(), 0);

        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();
        assert_eq!(manager.get_status().await.unwrap()["S1"], Status::Active);
        assert!(control.sets().contains(&(Attribute::Width, 32)));
    }

    #[tokio::test]
    async fn repeated_config_does_not_restart() {
        let (factory, control) = shared_factory();
        let manager = DeviceManager::spawn(factory);
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();

        manager.set_config(one("S1", sized(32, 24))).await.unwrap();
        let opens = control.opens();
        manager.set_config(one("S1", sized(32, 24))).await.unwrap();
        assert_eq!(control.opens(), opens);
    }

    #[tokio::test]
    async fn duplicate_add_is_ignored() {
        let (factory, control) = shared_factory();
        let manager = DeviceManager::spawn(factory);
        for _ in 0..3 {
            manager
                .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
                .unwrap();
        }
        assert_eq!(manager.get_devices().await.unwrap(), ["S1"]);
        assert_eq!(control.opens(), 1);
    }

    #[tokio::test]
    async fn repeated_add_restarts_a_halted_camera() {
        let (factory, control) = shared_factory();
        let manager = DeviceManager::spawn(factory);
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();
        manager.set_config(one("S1", sized(32, 24))).await.unwrap();

        control.fail_after(0);
        let mut reads = control.reads();
        loop {
            tokio::time::sleep(Duration::from_millis(40)).await;
            if control.reads() == reads {
                break;
            }
            reads = control.reads();
        }
        let opens = control.opens();

        control.recover();
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();
        assert_eq!(manager.get_devices().await.unwrap(), ["S1"]);
        assert_eq!(control.opens(), opens + 1);
        assert_eq!(manager.get_status().await.unwrap()["S1"], Status::Active);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(control.reads() > reads);
    }

    #[tokio::test]
    async fn focus_updates_in_place_width_restarts() {
        let (factory, control) = shared_factory();
        let manager = DeviceManager::spawn(factory);
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();
        manager.set_config(one("S1", sized(32, 24))).await.unwrap();
        let opens = control.opens();

        let focus = CameraManagerConfig {
            focus: Some(42),
            ..Default::default()
        };
        manager.set_config(one("S1", focus)).await.unwrap();
        assert_eq!(control.opens(), opens);
        assert!(control.sets().contains(&(Attribute::Focus, 42)));
        assert_eq!(manager.get_config().await.unwrap()["S1"].width, Some(32));

        manager.set_config(one("S1", sized(64, 48))).await.unwrap();
        assert_eq!(control.opens(), opens + 1);
        // the restart keeps the focus merged in earlier
        assert_eq!(manager.get_config().await.unwrap()["S1"].focus, Some(42));
    }

    #[tokio::test]
    async fn invalid_roi_is_rejected_without_failing_the_batch() {
        let (factory, _control) = shared_factory();
        let manager = DeviceManager::spawn(factory);
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();

        let good = CameraManagerConfig {
            roi: Some(vec![0.1, 0.1, 0.5, 0.5]),
            ..sized(32, 24)
        };
        manager.set_config(one("S1", good)).await.unwrap();

        let bad = CameraManagerConfig {
            roi: Some(vec![0.1, 0.1, 1.5]),
            focus: Some(7),
            ..Default::default()
        };
        let mut configs = one("S1", bad);
        configs.insert("S2".into(), sized(32, 24));
        manager.set_config(configs).await.unwrap();

        let stored = manager.get_config().await.unwrap();
        assert_eq!(stored["S1"].roi, Some(vec![0.1, 0.1, 0.5, 0.5]));
        assert_eq!(stored["S1"].focus, Some(7));
        assert!(stored.contains_key("S2"));
    }

    #[tokio::test]
    async fn dropped_serial_goes_idle() {
        let (factory, _control) = shared_factory();
        let manager = DeviceManager::spawn(factory);
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();
        manager.set_config(one("S1", sized(32, 24))).await.unwrap();

        manager.set_config(HashMap::new()).await.unwrap();
        assert_eq!(manager.get_status().await.unwrap()["S1"], Status::Idle);
        assert!(manager.get_config().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unopenable_device_stays_unplugged() {
        let factory: BackendFactory =
            Arc::new(|| Box::new(MockBackend::new().failing_open()) as Box<dyn CaptureBackend>);
        let manager = DeviceManager::spawn(factory);
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();

        assert_eq!(manager.get_devices().await.unwrap(), ["S1"]);
        assert_eq!(manager.get_status().await.unwrap()["S1"], Status::Unplugged);
        let frames = manager
            .get_frames(Some(vec!["S1".into()]))
            .await
            .unwrap();
        assert!(frames["S1"].is_none());
    }

    #[tokio::test]
    async fn frames_are_collected_per_serial() {
        let (factory, _control) = shared_factory();
        let manager = DeviceManager::spawn(factory);
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();
        let mut configs = one("S1", sized(32, 24));
        configs.insert("S2".into(), sized(32, 24));
        manager.set_config(configs).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let frames = manager.get_frames(None).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames["S1"].as_ref().unwrap().width(), 32);
        assert!(frames["S2"].is_none());
    }

    #[tokio::test]
    async fn filter_on_serves_tagged_frames_and_reset_works() {
        let (factory, _control) = shared_factory();
        let manager = DeviceManager::spawn(factory);
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();
        manager.set_config(one("S1", sized(32, 24))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let filter = CameraManagerConfig {
            filter: Some(true),
            ..Default::default()
        };
        manager.set_config(one("S1", filter)).await.unwrap();
        manager.reset_filter("S1").await.unwrap();
        assert!(matches!(
            manager.reset_filter("S9").await,
            Err(Error::NotStarted(_))
        ));

        let mut frame = None;
        for _ in 0..200 {
            frame = manager.get_frames(None).await.unwrap().remove("S1").flatten();
            if frame.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(frame.unwrap().state.is_some());
    }

    #[tokio::test]
    async fn shutdown_releases_every_device_once() {
        let (factory, control) = shared_factory();
        let manager = DeviceManager::spawn(factory);
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam0", "S1"))
            .unwrap();
        manager
            .handle_device_event(DeviceEvent::add("/dev/cam1", "S2"))
            .unwrap();
        assert_eq!(manager.get_devices().await.unwrap().len(), 2);

        manager.shutdown().await.unwrap();
        assert_eq!(control.closes(), 2);
        assert!(matches!(
            manager.get_status().await,
            Err(Error::ActorGone(_))
        ));
    }
}
