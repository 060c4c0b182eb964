//! pxlcam daemon: tracks plugged cameras, applies their configuration and
//! stores every frame classified GOOD.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pxlcam::capture::{CaptureBackend, V4l2Backend};
use pxlcam::manager::BackendFactory;
use pxlcam::watcher::DeviceWatcher;
use pxlcam::{ClassificationState, Config, DeviceManager, Frame, Status};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pxlcam=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("pxlcam launching...");

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "pxlcam.toml".into());
    let config = Config::load(&path).wrap_err_with(|| format!("loading {path}"))?;
    pxlcam::CONFIG.store(Arc::new(config.clone()));
    debug!("Configuration: {:?}", config);

    let buffer_count = config.capture.buffer_count;
    let factory: BackendFactory =
        Arc::new(move || Box::new(V4l2Backend::new(buffer_count)) as Box<dyn CaptureBackend>);
    let manager = DeviceManager::spawn(factory);

    let (watcher, events) = DeviceWatcher::new(config.watcher.clone()).spawn();
    let feed = manager.attach_watcher(events);

    manager.set_config(config.camera_configs()).await?;

    let frames_dir = config.output.frames_dir.as_ref().map(PathBuf::from);
    if let Some(dir) = &frames_dir {
        info!("Saving GOOD frames under {}", dir.display());
    }

    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.output.poll_interval_ms.max(1)));
    let mut shutdown = std::pin::pin!(tokio::signal::ctrl_c());
    let mut statuses: HashMap<String, Status> = HashMap::new();
    let mut saved: HashMap<String, u64> = HashMap::new();

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Signal handler failed: {}", e);
                }
                break;
            }
            _ = ticker.tick() => {}
        }

        let current = manager.get_status().await?;
        for (serial, status) in &current {
            if statuses.get(serial) != Some(status) {
                info!("{}: {:?}", serial, status);
            }
        }
        statuses = current;

        let Some(dir) = &frames_dir else {
            continue;
        };
        for (serial, frame) in manager.get_frames(None).await? {
            let Some(frame) = frame else {
                continue;
            };
            if frame.state != Some(ClassificationState::Good)
                || saved.get(&serial) == Some(&frame.sequence())
            {
                continue;
            }
            saved.insert(serial.clone(), frame.sequence());

            let dir = dir.join(&serial);
            let quality = config.output.jpeg_quality;
            match tokio::task::spawn_blocking(move || save_frame(&dir, &frame, quality)).await {
                Ok(Ok(file)) => debug!("{}: saved {}", serial, file.display()),
                Ok(Err(e)) => warn!("{}: could not save frame: {}", serial, e),
                Err(e) => error!("{}: save task failed: {}", serial, e),
            }
        }
    }

    info!("pxlcam shutting down");
    watcher.stop().await;
    if let Err(e) = feed.await {
        warn!("Watcher feed ended abnormally: {}", e);
    }
    manager.shutdown().await?;
    Ok(())
}

fn save_frame(dir: &Path, frame: &Frame, quality: u8) -> pxlcam::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let file = dir.join(format!("{}.jpeg", frame.timestamp_string()));
    std::fs::write(&file, frame.to_jpeg(quality)?)?;
    Ok(file)
}
