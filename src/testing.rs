//! Scripted collaborators for unit and end-to-end tests

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::analysis::scene::{SceneClassifier, ScenePrediction};
use crate::audio::{SpeechEngine, SpeechFactory, SpeechListener};
use crate::capture::frame::Frame;
use crate::capture::{CameraDevice, CameraFactory};
use crate::clock::ManualClock;
use crate::error::CollaboratorError;
use crate::input::{InputEvent, InputSource};
use crate::vision::detection::{Detector, DetectorFactory, RawDetection};
use crate::vision::ocr::{Extraction, TextExtractor};

pub const SYNTHETIC_WIDTH: u32 = 640;
pub const SYNTHETIC_HEIGHT: u32 = 480;

/// Cameras that open only on the configured indices and yield a fixed
/// number of 640x480 frames per opened device
pub struct SyntheticCameraFactory {
    working: Vec<usize>,
    frames_per_device: u64,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    disconnected: AtomicBool,
    step: Option<(Arc<ManualClock>, Duration)>,
}

impl SyntheticCameraFactory {
    pub fn new(working: Vec<usize>, frames_per_device: u64) -> Self {
        Self {
            working,
            frames_per_device,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            disconnected: AtomicBool::new(false),
            step: None,
        }
    }

    /// Advance `clock` by `per_frame` on every delivered frame
    pub fn with_clock(mut self, clock: Arc<ManualClock>, per_frame: Duration) -> Self {
        self.step = Some((clock, per_frame));
        self
    }

    /// Every later `open` fails; devices already open keep their frames
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Devices opened and not yet closed
    pub fn open_devices(&self) -> usize {
        self.opens() - self.closes.load(Ordering::SeqCst)
    }
}

impl CameraFactory for SyntheticCameraFactory {
    fn open(&self, index: usize) -> Result<Box<dyn CameraDevice>> {
        if self.disconnected.load(Ordering::SeqCst) || !self.working.contains(&index) {
            return Err(CollaboratorError::Camera(format!("no camera at index {index}")).into());
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticCamera {
            remaining: self.frames_per_device,
            sequence: 0,
            closed: false,
            closes: self.closes.clone(),
            step: self.step.clone(),
        }))
    }
}

struct SyntheticCamera {
    remaining: u64,
    sequence: u64,
    closed: bool,
    closes: Arc<AtomicUsize>,
    step: Option<(Arc<ManualClock>, Duration)>,
}

impl CameraDevice for SyntheticCamera {
    fn read(&mut self) -> Result<Option<Frame>> {
        if self.closed {
            return Err(anyhow!("camera closed"));
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let frame = Frame::filled(SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT, 128, self.sequence);
        self.sequence += 1;
        if let Some((clock, per_frame)) = &self.step {
            clock.advance(*per_frame);
        }
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

type DetectionScript = Box<dyn FnMut(usize) -> Vec<RawDetection> + Send>;

/// Detector whose output is a function of the inference call index
pub struct ScriptedDetector {
    script: DetectionScript,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDetector {
    pub fn constant(detections: Vec<RawDetection>) -> Self {
        Self::per_call(move |_| detections.clone())
    }

    pub fn per_call<F>(script: F) -> Self
    where
        F: FnMut(usize) -> Vec<RawDetection> + Send + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of inference calls
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Detector for ScriptedDetector {
    fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.script)(call))
    }
}

/// Detector whose every inference fails
pub struct FailingDetector;

impl Detector for FailingDetector {
    fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
        Err(CollaboratorError::Model("inference failed".into()).into())
    }
}

/// Counts loads; yields an empty-output detector or fails
pub struct CountingDetectorFactory {
    succeed: bool,
    pub loads: AtomicUsize,
}

impl CountingDetectorFactory {
    pub fn new(succeed: bool) -> Self {
        Self {
            succeed,
            loads: AtomicUsize::new(0),
        }
    }
}

impl DetectorFactory for CountingDetectorFactory {
    fn load(&self) -> Result<Box<dyn Detector>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(Box::new(ScriptedDetector::constant(Vec::new())))
        } else {
            Err(CollaboratorError::Model("model file missing".into()).into())
        }
    }
}

enum SpeechMode {
    Normal,
    Failing,
    Blocking {
        started: Sender<()>,
        release: Receiver<()>,
    },
    /// Reports the utterance finished, then takes `tail` to return
    Lagging { tail: Duration },
}

/// Speech engine that records every utterance it completes
pub struct RecordingSpeechEngine {
    mode: SpeechMode,
    queue: Mutex<Vec<String>>,
    spoken: Arc<Mutex<Vec<String>>>,
    listeners: Mutex<Vec<Arc<dyn SpeechListener>>>,
    started_rx: Option<Receiver<()>>,
    active: AtomicUsize,
    max_active: Arc<AtomicUsize>,
}

impl RecordingSpeechEngine {
    fn with_mode(mode: SpeechMode, started_rx: Option<Receiver<()>>) -> Self {
        Self {
            mode,
            queue: Mutex::new(Vec::new()),
            spoken: Arc::new(Mutex::new(Vec::new())),
            listeners: Mutex::new(Vec::new()),
            started_rx,
            active: AtomicUsize::new(0),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn new() -> Self {
        Self::with_mode(SpeechMode::Normal, None)
    }

    /// Each utterance blocks until a value is sent on the returned sender
    pub fn blocking() -> (Self, Sender<()>) {
        let (started, started_rx) = unbounded();
        let (release_tx, release) = unbounded();
        (
            Self::with_mode(SpeechMode::Blocking { started, release }, Some(started_rx)),
            release_tx,
        )
    }

    /// Every call fails
    pub fn failing() -> Self {
        Self::with_mode(SpeechMode::Failing, None)
    }

    /// Fires the finished event `tail` before `run_and_wait` returns, like
    /// the command engine does
    pub fn lagging(tail: Duration) -> Self {
        Self::with_mode(SpeechMode::Lagging { tail }, None)
    }

    /// Highest number of callers seen inside `run_and_wait` at once
    pub fn max_concurrent(&self) -> Arc<AtomicUsize> {
        self.max_active.clone()
    }

    pub fn spoken(&self) -> Arc<Mutex<Vec<String>>> {
        self.spoken.clone()
    }

    /// Signaled when a blocking utterance has started
    pub fn started(&self) -> Receiver<()> {
        match &self.started_rx {
            Some(rx) => rx.clone(),
            None => unbounded().1,
        }
    }
}

impl SpeechEngine for RecordingSpeechEngine {
    fn name(&self) -> &str {
        "recording"
    }

    fn subscribe(&self, listener: Arc<dyn SpeechListener>) {
        self.listeners.lock().push(listener);
    }

    fn say(&self, text: &str) -> Result<()> {
        if matches!(self.mode, SpeechMode::Failing) {
            return Err(CollaboratorError::Speech("engine unavailable".into()).into());
        }
        self.queue.lock().push(text.to_string());
        Ok(())
    }

    fn run_and_wait(&self) -> Result<()> {
        if matches!(self.mode, SpeechMode::Failing) {
            return Err(CollaboratorError::Speech("engine unavailable".into()).into());
        }

        let inside = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(inside, Ordering::SeqCst);

        let utterances = std::mem::take(&mut *self.queue.lock());
        let listeners = self.listeners.lock().clone();
        for text in utterances {
            for listener in &listeners {
                listener.on_speech_started();
            }
            if let SpeechMode::Blocking { started, release } = &self.mode {
                let _ = started.send(());
                let _ = release.recv();
            }
            self.spoken.lock().push(text);
            for listener in &listeners {
                listener.on_speech_finished(true);
            }
            if let SpeechMode::Lagging { tail } = &self.mode {
                std::thread::sleep(*tail);
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.queue.lock().clear();
    }
}

/// Creates fresh [`RecordingSpeechEngine`]s
#[derive(Default)]
pub struct RecordingSpeechFactory;

impl SpeechFactory for RecordingSpeechFactory {
    fn create(&self) -> Result<Box<dyn SpeechEngine>> {
        Ok(Box::new(RecordingSpeechEngine::new()))
    }
}

/// Produces engines that fail on every call
pub struct BrokenSpeechFactory;

impl SpeechFactory for BrokenSpeechFactory {
    fn create(&self) -> Result<Box<dyn SpeechEngine>> {
        Ok(Box::new(RecordingSpeechEngine::failing()))
    }
}

/// Never produces an engine
pub struct FailingSpeechFactory;

impl SpeechFactory for FailingSpeechFactory {
    fn create(&self) -> Result<Box<dyn SpeechEngine>> {
        Err(anyhow!("no speech program available"))
    }
}

type ScriptStep = Result<Option<String>, String>;

enum AfterScript {
    Empty,
    Repeat(ScriptStep),
    Panic,
}

/// Extractor replaying a fixed list of outcomes
pub struct ScriptedExtractor {
    steps: Mutex<VecDeque<ScriptStep>>,
    after: AfterScript,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    /// Outcomes in order, then "no text" forever
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            after: AfterScript::Empty,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn repeating(step: ScriptStep) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            after: AfterScript::Repeat(step),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn panicking() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            after: AfterScript::Panic,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextExtractor for ScriptedExtractor {
    fn extract(&self, _frame: &Frame) -> Result<Extraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = match self.steps.lock().pop_front() {
            Some(step) => step,
            None => match &self.after {
                AfterScript::Empty => Ok(None),
                AfterScript::Repeat(step) => step.clone(),
                AfterScript::Panic => panic!("scripted extractor panic"),
            },
        };
        match step {
            Ok(Some(text)) => Ok(Extraction::found(text)),
            Ok(None) => Ok(Extraction::empty("No text detected")),
            Err(message) => Err(CollaboratorError::Ocr(message).into()),
        }
    }
}

/// Extractor that parks inside `extract` until released
pub struct BlockingExtractor {
    text: String,
    entered_tx: Sender<()>,
    entered_rx: Receiver<()>,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
    calls: AtomicUsize,
    last_byte: Mutex<Option<u8>>,
}

impl BlockingExtractor {
    pub fn new(text: &str) -> Self {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        Self {
            text: text.to_string(),
            entered_tx,
            entered_rx,
            release_tx,
            release_rx,
            calls: AtomicUsize::new(0),
            last_byte: Mutex::new(None),
        }
    }

    pub fn wait_until_entered(&self, timeout: Duration) {
        self.entered_rx
            .recv_timeout(timeout)
            .expect("extractor was never called");
    }

    pub fn release(&self) {
        let _ = self.release_tx.send(());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// First pixel byte of the last frame seen
    pub fn last_frame_byte(&self) -> Option<u8> {
        *self.last_byte.lock()
    }
}

impl TextExtractor for BlockingExtractor {
    fn extract(&self, frame: &Frame) -> Result<Extraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_byte.lock() = frame.data.first().copied();
        let _ = self.entered_tx.send(());
        let _ = self.release_rx.recv_timeout(Duration::from_secs(10));
        Ok(Extraction::found(self.text.clone()))
    }
}

/// Scene classifier replaying fixed predictions, then nothing
pub struct ScriptedScenes {
    predictions: VecDeque<ScenePrediction>,
}

impl ScriptedScenes {
    pub fn new(predictions: Vec<(&str, f32)>) -> Self {
        Self {
            predictions: predictions
                .into_iter()
                .map(|(label, confidence)| ScenePrediction {
                    label: label.to_string(),
                    confidence,
                })
                .collect(),
        }
    }
}

impl SceneClassifier for ScriptedScenes {
    fn classify(&mut self, _frame: &Frame) -> Result<Option<ScenePrediction>> {
        Ok(self.predictions.pop_front())
    }
}

/// Input that fires each event on a given poll
pub struct ScriptedInput {
    events: Vec<(usize, InputEvent)>,
    polls: usize,
}

impl ScriptedInput {
    /// `(poll index, event)` pairs; polls are counted from zero
    pub fn new(events: Vec<(usize, InputEvent)>) -> Self {
        Self { events, polls: 0 }
    }

    pub fn silent() -> Self {
        Self::new(Vec::new())
    }
}

impl InputSource for ScriptedInput {
    fn poll(&mut self, _timeout: Duration) -> Option<InputEvent> {
        let poll = self.polls;
        self.polls += 1;
        self.events.iter().find(|(at, _)| *at == poll).map(|(_, event)| *event)
    }
}
