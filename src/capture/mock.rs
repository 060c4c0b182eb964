//! Scripted backend for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::{Attribute, CaptureBackend, PixelFormat, RawFrame};
use crate::{Error, Result};

const DEFAULT_FOCUS: i64 = 60;

#[derive(Default)]
pub struct MockState {
    opens: AtomicUsize,
    closes: AtomicUsize,
    reads: AtomicUsize,
    fill: AtomicU8,
    /// Overrides `fill` for the lower half of each frame
    bottom_fill: Mutex<Option<u8>>,
    /// Reads fail once this many frames were delivered
    fail_after: Mutex<Option<usize>>,
    empty_reads: AtomicBool,
    sets: Mutex<Vec<(Attribute, i64)>>,
    opened_paths: Mutex<Vec<String>>,
}

/// Shared view into a [`MockBackend`] that outlives the backend itself.
#[derive(Clone)]
pub struct MockControl(Arc<MockState>);

impl MockControl {
    pub fn opens(&self) -> usize {
        self.0.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.0.reads.load(Ordering::SeqCst)
    }

    pub fn default_focus(&self) -> i64 {
        DEFAULT_FOCUS
    }

    pub fn set_fill(&self, value: u8) {
        self.0.fill.store(value, Ordering::SeqCst);
    }

    pub fn set_bottom_fill(&self, value: Option<u8>) {
        *self.0.bottom_fill.lock().unwrap() = value;
    }

    pub fn fail_after(&self, frames: usize) {
        *self.0.fail_after.lock().unwrap() = Some(frames);
    }

    /// Undo [`MockControl::fail_after`] so the next opened backend reads again.
    pub fn recover(&self) {
        *self.0.fail_after.lock().unwrap() = None;
    }

    pub fn deliver_nothing(&self) {
        self.0.empty_reads.store(true, Ordering::SeqCst);
    }

    pub fn sets(&self) -> Vec<(Attribute, i64)> {
        self.0.sets.lock().unwrap().clone()
    }

    pub fn opened_paths(&self) -> Vec<String> {
        self.0.opened_paths.lock().unwrap().clone()
    }
}

pub struct MockBackend {
    state: Arc<MockState>,
    open: bool,
    attributes: HashMap<Attribute, i64>,
    refused: HashSet<Attribute>,
    fail_open: bool,
    frame_interval: Duration,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_state(Arc::new(MockState::default()))
    }

    /// Backend sharing counters with earlier backends, as a factory would.
    pub fn with_control(control: &MockControl) -> Self {
        Self::with_state(control.0.clone())
    }

    fn with_state(state: Arc<MockState>) -> Self {
        let attributes = HashMap::from([
            (Attribute::PixelFormat, i64::from(PixelFormat::Rgb24.code())),
            (Attribute::Width, 64),
            (Attribute::Height, 48),
            (Attribute::Fps, 30),
            (Attribute::Autofocus, 0),
            (Attribute::Focus, DEFAULT_FOCUS),
            (Attribute::Exposure, 100),
            (Attribute::Brightness, 0),
            (Attribute::Contrast, 32),
            (Attribute::Gain, 0),
        ]);
        Self {
            state,
            open: false,
            attributes,
            refused: HashSet::new(),
            fail_open: false,
            frame_interval: Duration::from_millis(5),
        }
    }

    pub fn control(&self) -> MockControl {
        MockControl(self.state.clone())
    }

    pub fn refusing(mut self, attribute: Attribute) -> Self {
        self.refused.insert(attribute);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl CaptureBackend for MockBackend {
    fn open(&mut self, path: &str) -> Result<()> {
        if self.fail_open {
            return Err(Error::DeviceOpenFailure {
                path: path.into(),
                reason: "mock refuses to open".into(),
            });
        }
        self.open = true;
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.opened_paths.lock().unwrap().push(path.into());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn set_attribute(&mut self, attribute: Attribute, value: i64) -> Result<bool> {
        if self.refused.contains(&attribute) {
            return Ok(false);
        }
        self.attributes.insert(attribute, value);
        self.state.sets.lock().unwrap().push((attribute, value));
        Ok(true)
    }

    fn get_attribute(&mut self, attribute: Attribute) -> Result<Option<i64>> {
        Ok(self.attributes.get(&attribute).copied())
    }

    fn read_frame(&mut self) -> Result<Option<RawFrame>> {
        std::thread::sleep(self.frame_interval);

        let delivered = self.state.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.state.fail_after.lock().unwrap() {
            if delivered >= limit {
                return Err(Error::DeviceMalfunction("mock".into()));
            }
        }
        if self.state.empty_reads.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let width = self.attributes[&Attribute::Width] as u32;
        let height = self.attributes[&Attribute::Height] as u32;
        let fill = self.state.fill.load(Ordering::SeqCst);
        let mut data = vec![fill; (width * height * 3) as usize];
        if let Some(bottom) = *self.state.bottom_fill.lock().unwrap() {
            data[(width * (height / 2) * 3) as usize..].fill(bottom);
        }
        Ok(Some(RawFrame {
            data: Bytes::from(data),
            width,
            height,
            format: PixelFormat::Rgb24,
        }))
    }

    fn close(&mut self) {
        self.open = false;
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
