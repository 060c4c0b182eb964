//! Continuous frame sampling from a single capture source
//!
//! The sampler is a tokio task that owns its [`CaptureSource`]. Every cycle
//! reads one frame and re-enqueues itself, so production runs at device pace
//! regardless of who consumes. Only the newest frame is kept; readers pick it
//! up through a lock-free snapshot and never wait on the mailbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Local};
use flume::{Receiver, Sender};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::capture::{decoder, CaptureConfig, CaptureSource, Frame, PixelFormat, RawFrame};
use crate::{Error, Result};

struct Captured {
    raw: RawFrame,
    timestamp: DateTime<Local>,
    sequence: u64,
}

struct Shared {
    name: String,
    started: AtomicBool,
    running: AtomicBool,
    latest: ArcSwapOption<Captured>,
}

/// Read side of a sampler, cheap to clone and hand to other actors.
#[derive(Clone)]
pub struct SamplerReader {
    shared: Arc<Shared>,
}

impl SamplerReader {
    /// Newest frame, converted to RGB on every call so callers never share
    /// a buffer with each other.
    pub fn get_frame(&self) -> Result<Option<Frame>> {
        if !self.shared.started.load(Ordering::Acquire) {
            return Err(Error::NotStarted("frame sampler"));
        }
        let Some(captured) = self.shared.latest.load_full() else {
            return Ok(None);
        };
        let rgb = decoder::decode_frame(&captured.raw)?;
        Ok(Some(Frame::new(
            rgb,
            captured.raw.width,
            captured.raw.height,
            PixelFormat::Rgb24,
            captured.sequence,
            captured.timestamp,
        )))
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

enum Message {
    Start {
        source: CaptureSource,
        done: oneshot::Sender<()>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    ApplyConfig {
        config: CaptureConfig,
        reply: oneshot::Sender<Result<bool>>,
    },
    AppliedConfig {
        reply: oneshot::Sender<Option<CaptureConfig>>,
    },
    Cycle {
        generation: u64,
    },
    Shutdown,
}

/// Handle to a sampler task. Dropping it shuts the task down and releases
/// the device.
pub struct FrameSampler {
    tx: Sender<Message>,
    reader: SamplerReader,
}

impl FrameSampler {
    /// Spawn an idle sampler on the current tokio runtime.
    pub fn spawn(name: impl Into<String>) -> Self {
        let (tx, rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            name: name.into(),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            latest: ArcSwapOption::empty(),
        });

        let actor = SamplerActor {
            tx: tx.clone(),
            rx,
            shared: shared.clone(),
            source: None,
            generation: 0,
            sequence: 0,
        };
        tokio::spawn(actor.run());

        Self {
            tx,
            reader: SamplerReader { shared },
        }
    }

    /// Take ownership of `source` and begin sampling it. A previously held
    /// source is released first.
    pub async fn start(&self, source: CaptureSource) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Message::Start { source, done })?;
        wait.await.map_err(|_| Error::ActorGone("frame sampler"))
    }

    /// Halt sampling and release the device. The last frame stays readable.
    pub async fn stop(&self) -> Result<()> {
        self.reader.shared.running.store(false, Ordering::Release);
        let (done, wait) = oneshot::channel();
        self.send(Message::Stop { done })?;
        wait.await.map_err(|_| Error::ActorGone("frame sampler"))
    }

    /// Apply `config` to the owned source between two cycles.
    pub async fn apply_config(&self, config: CaptureConfig) -> Result<bool> {
        let (reply, wait) = oneshot::channel();
        self.send(Message::ApplyConfig { config, reply })?;
        wait.await.map_err(|_| Error::ActorGone("frame sampler"))?
    }

    pub async fn applied_config(&self) -> Result<Option<CaptureConfig>> {
        let (reply, wait) = oneshot::channel();
        self.send(Message::AppliedConfig { reply })?;
        wait.await.map_err(|_| Error::ActorGone("frame sampler"))
    }

    pub fn get_frame(&self) -> Result<Option<Frame>> {
        self.reader.get_frame()
    }

    pub fn reader(&self) -> SamplerReader {
        self.reader.clone()
    }

    pub fn is_running(&self) -> bool {
        self.reader.is_running()
    }

    fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::ActorGone("frame sampler"))
    }
}

impl Drop for FrameSampler {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
    }
}

struct SamplerActor {
    /// Own mailbox, used to schedule the next cycle
    tx: Sender<Message>,
    rx: Receiver<Message>,
    shared: Arc<Shared>,
    source: Option<CaptureSource>,
    /// Bumped on every start so cycles of an older run die out
    generation: u64,
    sequence: u64,
}

impl SamplerActor {
    async fn run(mut self) {
        while let Ok(message) = self.rx.recv_async().await {
            match message {
                Message::Start { source, done } => {
                    self.release();
                    self.source = Some(source);
                    self.generation += 1;
                    self.shared.started.store(true, Ordering::Release);
                    self.shared.running.store(true, Ordering::Release);
                    info!("Sampler {} started", self.shared.name);
                    self.schedule();
                    let _ = done.send(());
                }
                Message::Stop { done } => {
                    self.shared.running.store(false, Ordering::Release);
                    self.release();
                    debug!("Sampler {} stopped", self.shared.name);
                    let _ = done.send(());
                }
                Message::ApplyConfig { config, reply } => {
                    let result = match self.source.as_mut() {
                        Some(source) => source.apply_config(&config),
                        None => Err(Error::NotStarted("frame sampler")),
                    };
                    let _ = reply.send(result);
                }
                Message::AppliedConfig { reply } => {
                    let applied = self.source.as_ref().map(|s| s.applied_config().clone());
                    let _ = reply.send(applied);
                }
                Message::Cycle { generation } => self.cycle(generation).await,
                Message::Shutdown => break,
            }
        }

        self.shared.running.store(false, Ordering::Release);
        self.release();
        debug!("Sampler {} exited", self.shared.name);
    }

    fn schedule(&self) {
        let _ = self.tx.send(Message::Cycle {
            generation: self.generation,
        });
    }

    async fn cycle(&mut self, generation: u64) {
        if generation != self.generation || !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        let Some(mut source) = self.source.take() else {
            self.halt();
            return;
        };

        let read = tokio::task::spawn_blocking(move || {
            let frame = source.read_frame();
            (source, frame)
        })
        .await;

        let (source, result) = match read {
            Ok(read) => read,
            Err(e) => {
                // The source went down with the task
                error!("Sampler {} capture task failed: {}", self.shared.name, e);
                self.halt();
                return;
            }
        };
        self.source = Some(source);

        match result {
            Ok(Some(raw)) => {
                let timestamp = Local::now();
                self.sequence += 1;
                self.shared.latest.store(Some(Arc::new(Captured {
                    raw,
                    timestamp,
                    sequence: self.sequence,
                })));
                metrics::counter!("pxlcam_frames_sampled_total", "camera" => self.shared.name.clone())
                    .increment(1);
                self.schedule();
            }
            Ok(None) => {
                warn!("Sampler {} got no frame, stopping", self.shared.name);
                self.halt();
            }
            Err(e) => {
                error!("Sampler {} capture failed, stopping: {}", self.shared.name, e);
                self.halt();
            }
        }
    }

    /// Stop after a failed cycle. No retry: a restart must come from outside.
    fn halt(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.release();
        metrics::counter!("pxlcam_sampler_halts_total", "camera" => self.shared.name.clone())
            .increment(1);
    }

    fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::mock::{MockBackend, MockControl};

    async fn opened_source() -> (CaptureSource, MockControl) {
        let backend = MockBackend::new();
        let control = backend.control();
        let mut source = CaptureSource::new(Box::new(backend));
        let config = CaptureConfig {
            device: Some("/dev/video0".into()),
            width: Some(16),
            height: Some(8),
            ..Default::default()
        };
        assert!(source.apply_config(&config).unwrap());
        (source, control)
    }

    async fn first_frame(sampler: &FrameSampler) -> Frame {
        for _ in 0..200 {
            if let Some(frame) = sampler.get_frame().unwrap() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sampler produced no frame");
    }

    async fn wait_stopped(sampler: &FrameSampler) {
        for _ in 0..200 {
            if !sampler.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sampler kept running");
    }

    #[tokio::test]
    async fn get_frame_before_start_is_not_started() {
        let sampler = FrameSampler::spawn("test");
        assert!(matches!(sampler.get_frame(), Err(Error::NotStarted(_))));
    }

    #[tokio::test]
    async fn frames_keep_advancing_without_consumers() {
        let sampler = FrameSampler::spawn("test");
        let (source, control) = opened_source().await;
        sampler.start(source).await.unwrap();

        let first = first_frame(&sampler).await;
        assert_eq!((first.width(), first.height()), (16, 8));
        assert_eq!(first.meta.format, PixelFormat::Rgb24);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = sampler.get_frame().unwrap().unwrap();
        assert!(later.sequence() > first.sequence());
        assert!(control.reads() > 1);
    }

    #[tokio::test]
    async fn reads_do_not_share_buffers() {
        let sampler = FrameSampler::spawn("test");
        let (source, _control) = opened_source().await;
        sampler.start(source).await.unwrap();
        first_frame(&sampler).await;

        sampler.stop().await.unwrap();
        let a = sampler.get_frame().unwrap().unwrap();
        let b = sampler.get_frame().unwrap().unwrap();
        assert_eq!(a.sequence(), b.sequence());
        assert_ne!(a.data.as_ptr(), b.data.as_ptr());
    }

    #[tokio::test]
    async fn capture_failure_stops_sampler_and_releases_device() {
        let sampler = FrameSampler::spawn("test");
        let (source, control) = opened_source().await;
        control.fail_after(3);
        sampler.start(source).await.unwrap();

        wait_stopped(&sampler).await;
        assert_eq!(control.closes(), 1);
        let reads = control.reads();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(control.reads(), reads);

        // frames captured before the failure remain readable
        assert!(sampler.get_frame().unwrap().is_some());

        sampler.stop().await.unwrap();
        assert_eq!(control.closes(), 1);
    }

    #[tokio::test]
    async fn empty_read_stops_sampler() {
        let sampler = FrameSampler::spawn("test");
        let (source, control) = opened_source().await;
        control.deliver_nothing();
        sampler.start(source).await.unwrap();

        wait_stopped(&sampler).await;
        assert!(sampler.get_frame().unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_releases_device_once() {
        let sampler = FrameSampler::spawn("test");
        let (source, control) = opened_source().await;
        sampler.start(source).await.unwrap();
        first_frame(&sampler).await;

        sampler.stop().await.unwrap();
        sampler.stop().await.unwrap();
        drop(sampler);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(control.closes(), 1);
    }

    #[tokio::test]
    async fn apply_config_reaches_the_device() {
        let sampler = FrameSampler::spawn("test");
        let (source, control) = opened_source().await;
        sampler.start(source).await.unwrap();

        let applied = sampler
            .apply_config(CaptureConfig {
                focus: Some(42),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(applied);
        assert!(control.sets().contains(&(crate::capture::Attribute::Focus, 42)));
        let config = sampler.applied_config().await.unwrap().unwrap();
        assert_eq!(config.focus, Some(42));
        assert_eq!(control.opens(), 1);
    }

    #[tokio::test]
    async fn apply_config_without_source_is_not_started() {
        let sampler = FrameSampler::spawn("test");
        let result = sampler.apply_config(CaptureConfig::default()).await;
        assert!(matches!(result, Err(Error::NotStarted(_))));
    }
}
