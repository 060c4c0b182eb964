//! Frame classification against the previous frame and a base frame
//!
//! Each cycle pulls the newest frame from a [`SamplerReader`], compares it
//! with the frame seen one cycle earlier (movement) and, while still, with the
//! base frame (background). The outcome is published as a
//! [`ClassificationState`] together with the movement diff mask.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace};

use crate::capture::{Frame, PixelFormat};
use crate::diff::{self, DiffMask, DiffOptions};
use crate::rectangle::Roi;
use crate::sampler::SamplerReader;
use crate::{ClassifierConfig, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationState {
    /// Frame matches the base frame
    Base,
    /// Scene is moving
    Move,
    /// Scene is still and differs from the base frame
    Good,
    /// Still, but no base frame to compare with
    NoBase,
    /// No previous frame to detect movement; not the base
    NoMove,
    /// Nothing known
    None,
}

impl ClassificationState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClassificationState::Base => "BASE",
            ClassificationState::Move => "MOVE",
            ClassificationState::Good => "GOOD",
            ClassificationState::NoBase => "NO_BASE",
            ClassificationState::NoMove => "NO_MOVE",
            ClassificationState::None => "NONE",
        }
    }
}

/// First match wins. `None` inputs mean the signal could not be computed.
pub fn resolve_state(moved: Option<bool>, base: Option<bool>) -> ClassificationState {
    match (moved, base) {
        (Some(true), _) => ClassificationState::Move,
        (_, Some(true)) => ClassificationState::Base,
        (Some(false), Some(false)) => ClassificationState::Good,
        (Some(false), None) => ClassificationState::NoBase,
        (None, Some(false)) => ClassificationState::NoMove,
        (None, None) => ClassificationState::None,
    }
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub state: ClassificationState,
    pub moved: Option<bool>,
    pub base: Option<bool>,
    /// Binary mask of the movement comparison
    pub diff: Option<DiffMask>,
}

/// Classify `frame` given the previous frame and the base frame.
pub fn classify(
    frame: &Frame,
    last: Option<&Frame>,
    base_frame: Option<&Frame>,
    roi: Option<&Roi>,
    config: &ClassifierConfig,
) -> Classification {
    let options = DiffOptions::from(config);
    let mut diff = None;

    let moved = last.map(|last| {
        let cmp = diff::equal(frame, last, config.move_threshold, roi, &options);
        trace!("movement diff factor {:.4}", cmp.factor);
        diff = cmp.mask;
        !cmp.equal
    });

    let base = match (moved, base_frame) {
        (Some(true), _) | (_, None) => None,
        (_, Some(base_frame)) => match (frame.to_greyscale(), base_frame.to_greyscale()) {
            (Ok(grey), Ok(base_grey)) => {
                let cmp = diff::equal(&grey, &base_grey, config.base_threshold, roi, &options);
                trace!("base diff factor {:.4}", cmp.factor);
                Some(cmp.equal)
            }
            (Err(e), _) | (_, Err(e)) => {
                debug!("greyscale conversion failed: {}", e);
                None
            }
        },
    };

    Classification {
        state: resolve_state(moved, base),
        moved,
        base,
        diff,
    }
}

#[derive(Clone, Default)]
struct Published {
    state: Option<ClassificationState>,
    frame: Option<Frame>,
    diff: Option<Frame>,
    base: Option<Frame>,
    roi: Option<Roi>,
}

struct Shared {
    name: String,
    running: AtomicBool,
    published: ArcSwap<Published>,
}

enum Message {
    Start {
        reader: SamplerReader,
        done: oneshot::Sender<()>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    SetBaseFrame {
        frame: Option<Frame>,
        done: oneshot::Sender<()>,
    },
    SetRoi {
        roi: Option<Roi>,
        done: oneshot::Sender<()>,
    },
    Cycle {
        generation: u64,
    },
    Shutdown,
}

/// Handle to a classifier task. Dropping it shuts the task down.
pub struct FrameClassifier {
    tx: Sender<Message>,
    shared: Arc<Shared>,
}

impl FrameClassifier {
    pub fn spawn(name: impl Into<String>) -> Self {
        let (tx, rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            name: name.into(),
            running: AtomicBool::new(false),
            published: ArcSwap::from_pointee(Published::default()),
        });

        let actor = ClassifierActor {
            tx: tx.clone(),
            rx,
            shared: shared.clone(),
            reader: None,
            frame: None,
            last_frame: None,
            base_frame: None,
            diff_frame: None,
            roi: None,
            state: ClassificationState::None,
            generation: 0,
        };
        tokio::spawn(actor.run());

        Self { tx, shared }
    }

    pub async fn start(&self, reader: SamplerReader) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Message::Start { reader, done })?;
        wait.await.map_err(|_| Error::ActorGone("frame classifier"))
    }

    /// Halt cycles and forget the previous and base frames.
    pub async fn stop(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        let (done, wait) = oneshot::channel();
        self.send(Message::Stop { done })?;
        wait.await.map_err(|_| Error::ActorGone("frame classifier"))
    }

    /// Store a private copy of `frame` as the background, or clear it.
    pub async fn set_base_frame(&self, frame: Option<Frame>) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Message::SetBaseFrame { frame, done })?;
        wait.await.map_err(|_| Error::ActorGone("frame classifier"))
    }

    /// Takes effect on the next cycle.
    pub async fn set_roi(&self, roi: Option<Roi>) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Message::SetRoi { roi, done })?;
        wait.await.map_err(|_| Error::ActorGone("frame classifier"))
    }

    pub fn get_state(&self) -> ClassificationState {
        self.shared
            .published
            .load()
            .state
            .unwrap_or(ClassificationState::None)
    }

    /// Newest classified frame, tagged with its state.
    pub fn get_frame(&self) -> Option<Frame> {
        self.shared.published.load().frame.clone()
    }

    pub fn get_diff_frame(&self) -> Option<Frame> {
        self.shared.published.load().diff.clone()
    }

    pub fn get_base_frame(&self) -> Option<Frame> {
        self.shared.published.load().base.clone()
    }

    pub fn get_roi(&self) -> Option<Roi> {
        self.shared.published.load().roi
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::ActorGone("frame classifier"))
    }
}

impl Drop for FrameClassifier {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
    }
}

struct ClassifierActor {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    shared: Arc<Shared>,
    reader: Option<SamplerReader>,
    frame: Option<Frame>,
    last_frame: Option<Frame>,
    base_frame: Option<Frame>,
    diff_frame: Option<Frame>,
    roi: Option<Roi>,
    state: ClassificationState,
    generation: u64,
}

impl ClassifierActor {
    async fn run(mut self) {
        while let Ok(message) = self.rx.recv_async().await {
            match message {
                Message::Start { reader, done } => {
                    info!("Classifier {} following {}", self.shared.name, reader.name());
                    self.reader = Some(reader);
                    self.generation += 1;
                    self.shared.running.store(true, Ordering::Release);
                    self.schedule(self.generation);
                    let _ = done.send(());
                }
                Message::Stop { done } => {
                    self.shared.running.store(false, Ordering::Release);
                    self.reader = None;
                    self.frame = None;
                    self.last_frame = None;
                    self.base_frame = None;
                    self.state = ClassificationState::None;
                    self.publish();
                    debug!("Classifier {} stopped", self.shared.name);
                    let _ = done.send(());
                }
                Message::SetBaseFrame { frame, done } => {
                    self.base_frame = frame.map(|f| f.deep_copy());
                    self.publish();
                    let _ = done.send(());
                }
                Message::SetRoi { roi, done } => {
                    self.roi = roi;
                    self.publish();
                    let _ = done.send(());
                }
                Message::Cycle { generation } => self.cycle(generation).await,
                Message::Shutdown => break,
            }
        }
        self.shared.running.store(false, Ordering::Release);
        debug!("Classifier {} exited", self.shared.name);
    }

    fn schedule(&self, generation: u64) {
        let _ = self.tx.send(Message::Cycle { generation });
    }

    /// Reschedule after a pause, used when there was nothing new to look at.
    async fn schedule_idle(&self, generation: u64) {
        let backoff = crate::CONFIG.load().classifier.idle_backoff_ms;
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        self.schedule(generation);
    }

    async fn cycle(&mut self, generation: u64) {
        if generation != self.generation || !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        let Some(reader) = &self.reader else {
            return;
        };

        // A halted sampler only holds a stale frame
        let fetched = match reader.get_frame() {
            Ok(_) if !reader.is_running() => None,
            Ok(frame) => frame,
            Err(e) => {
                trace!("Classifier {} has no source frame: {}", self.shared.name, e);
                None
            }
        };

        // The sampler has not moved on since the last cycle
        if let (Some(fetched), Some(current)) = (&fetched, &self.frame) {
            if fetched.sequence() == current.sequence() {
                self.schedule_idle(generation).await;
                return;
            }
        }

        self.last_frame = self.frame.take();
        self.frame = fetched;

        let Some(frame) = self.frame.clone() else {
            self.state = ClassificationState::None;
            self.publish();
            self.schedule_idle(generation).await;
            return;
        };

        let last = self.last_frame.clone();
        let base = self.base_frame.clone();
        let roi = self.roi;
        let config = crate::CONFIG.load().classifier.clone();
        let work = tokio::task::spawn_blocking(move || {
            classify(&frame, last.as_ref(), base.as_ref(), roi.as_ref(), &config)
        })
        .await;

        let classification = match work {
            Ok(classification) => classification,
            Err(e) => {
                error!("Classifier {} worker failed: {}", self.shared.name, e);
                self.state = ClassificationState::None;
                self.publish();
                self.schedule_idle(generation).await;
                return;
            }
        };

        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }

        self.state = classification.state;
        if let (Some(mask), Some(frame)) = (classification.diff, &self.frame) {
            self.diff_frame = Some(Frame::new(
                mask.data,
                mask.width,
                mask.height,
                PixelFormat::Grey,
                frame.sequence(),
                frame.timestamp,
            ));
        }
        metrics::counter!("pxlcam_classifications_total", "state" => self.state.as_str())
            .increment(1);
        self.publish();
        self.schedule(generation);
    }

    fn publish(&self) {
        let frame = self.frame.clone().map(|f| f.with_state(self.state));
        self.shared.published.store(Arc::new(Published {
            state: Some(self.state),
            frame,
            diff: self.diff_frame.clone(),
            base: self.base_frame.clone(),
            roi: self.roi,
        }));
    }
}
