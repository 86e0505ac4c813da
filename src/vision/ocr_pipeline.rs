//! Asynchronous OCR requests
//!
//! `process_frame` is called from the main loop and never blocks. A request
//! is accepted only while the pipeline is idle and the cooldown since the
//! last accepted request has elapsed; the frame is copied into the job and
//! handed to the single worker thread. Whatever happens during processing,
//! the pipeline returns to idle afterwards.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::ocr::{Extraction, TextExtractor, TextValidator, NO_TEXT_MESSAGE};
use crate::audio::AudioGate;
use crate::capture::frame::Frame;
use crate::clock::Clock;
use crate::config::OcrSettings;
use crate::recovery::{ErrorCategory, ErrorHandler, RecoveryContext};

/// Spoken when a request is picked up
pub const PROCESSING_MESSAGE: &str = "Processing text";
/// Spoken when extraction failed outright
pub const FAILURE_MESSAGE: &str = "OCR processing failed";

/// How long the worker waits on the queue before rechecking the stop flag
const WORKER_POLL: Duration = Duration::from_millis(250);
/// Upper bound for waiting on the worker in `stop`
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of the one request the pipeline may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrPhase {
    Idle,
    /// Accepted and queued, not yet picked up
    Pending,
    Processing,
}

/// An accepted request
struct OcrJob {
    frame: Frame,
    submitted_at: Instant,
}

struct PipelineState {
    phase: OcrPhase,
    last_accepted: Option<Instant>,
}

/// State shared with the worker thread
struct Worker {
    state: Mutex<PipelineState>,
    running: AtomicBool,
    extractor: Arc<dyn TextExtractor>,
    gate: Arc<AudioGate>,
    errors: Arc<ErrorHandler>,
    validator: TextValidator,
    retry_speak_delay: Duration,
}

/// Puts the pipeline back to idle when processing ends, however it ends
struct IdleOnDrop<'a>(&'a Mutex<PipelineState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.lock().phase = OcrPhase::Idle;
    }
}

impl Worker {
    fn run(&self, jobs: Receiver<OcrJob>) {
        info!("OCR worker started");
        while self.running.load(Ordering::SeqCst) {
            match jobs.recv_timeout(WORKER_POLL) {
                Ok(job) => self.process(job),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("OCR worker stopped");
    }

    fn process(&self, job: OcrJob) {
        self.state.lock().phase = OcrPhase::Processing;
        let _idle = IdleOnDrop(&self.state);

        debug!("OCR job picked up {:?} after submission", job.submitted_at.elapsed());
        if panic::catch_unwind(AssertUnwindSafe(|| self.process_inner(&job.frame))).is_err() {
            error!("OCR job panicked");
            self.gate.speak_text(FAILURE_MESSAGE);
        }
    }

    fn process_inner(&self, frame: &Frame) {
        info!("Starting OCR processing");
        if !self.gate.is_busy() {
            self.gate.speak_text(PROCESSING_MESSAGE);
        }

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.extractor.extract(frame)));
        info!("OCR processing completed in {:.2?}", started.elapsed());

        let error = match outcome {
            Ok(Ok(extraction)) => {
                self.errors.record_success(ErrorCategory::Ocr);
                self.report(extraction);
                return;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => "text extraction panicked".to_string(),
        };

        error!("Error processing OCR frame: {}", error);
        let mut context = RecoveryContext::new().with_detail(format!(
            "extracting text from {}x{} frame {}",
            frame.width, frame.height, frame.sequence
        ));
        self.errors.handle_error(ErrorCategory::Ocr, &error, &mut context);
        self.gate.speak_text(FAILURE_MESSAGE);
    }

    fn report(&self, extraction: Extraction) {
        let accepted = extraction.text.as_deref().and_then(|text| self.validator.accept(text));
        match accepted {
            Some(text) => {
                info!("Text extracted: {}", text.chars().take(100).collect::<String>());
                if !self.gate.speak_text(&text) {
                    std::thread::sleep(self.retry_speak_delay);
                    if !self.gate.speak_text(&text) {
                        warn!("Audio busy, extracted text was not spoken");
                    }
                }
            }
            None => {
                info!("No text found: {}", extraction.status);
                self.gate.speak_text(NO_TEXT_MESSAGE);
            }
        }
    }
}

/// Single-flight, cooldown-gated OCR request channel
pub struct OcrPipeline {
    worker: Arc<Worker>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    jobs: Sender<OcrJob>,
    queue: Receiver<OcrJob>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OcrPipeline {
    pub fn new(
        extractor: Arc<dyn TextExtractor>,
        gate: Arc<AudioGate>,
        errors: Arc<ErrorHandler>,
        clock: Arc<dyn Clock>,
        settings: &OcrSettings,
    ) -> Self {
        let (jobs, queue) = bounded(settings.queue_capacity.max(1));
        Self {
            worker: Arc::new(Worker {
                state: Mutex::new(PipelineState {
                    phase: OcrPhase::Idle,
                    last_accepted: None,
                }),
                running: AtomicBool::new(false),
                extractor,
                gate,
                errors,
                validator: TextValidator::from(settings),
                retry_speak_delay: Duration::from_millis(settings.retry_speak_delay_ms),
            }),
            clock,
            cooldown: settings.cooldown(),
            jobs,
            queue,
            handle: Mutex::new(None),
        }
    }

    /// Start the worker thread
    pub fn start(&self) -> anyhow::Result<()> {
        let mut handle = self.handle.lock();
        if self.worker.running.swap(true, Ordering::SeqCst) {
            warn!("OCR processor already running");
            return Ok(());
        }

        let worker = self.worker.clone();
        let queue = self.queue.clone();
        let spawned = std::thread::Builder::new()
            .name("ocr-worker".into())
            .spawn(move || worker.run(queue));
        match spawned {
            Ok(h) => {
                *handle = Some(h);
                Ok(())
            }
            Err(e) => {
                self.worker.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Signal the worker to exit and wait for it a bounded time. An
    /// extraction in flight is allowed to finish.
    pub fn stop(&self) {
        self.worker.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.lock().take() else {
            return;
        };

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!("OCR worker still busy after {:?}, detaching", STOP_TIMEOUT);
        }
        info!("OCR processor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.running.load(Ordering::SeqCst)
    }

    /// Submit a frame. Returns false, with no side effects, when the request
    /// is rejected.
    pub fn process_frame(&self, frame: &Frame) -> bool {
        if !self.is_running() {
            warn!("OCR processor not running");
            return false;
        }

        let now = self.clock.now();
        let mut state = self.worker.state.lock();

        if let Some(last) = state.last_accepted {
            if now.saturating_duration_since(last) < self.cooldown {
                info!("OCR request ignored - cooldown period ({:?})", self.cooldown);
                return false;
            }
        }
        if state.phase != OcrPhase::Idle {
            info!("OCR request ignored - already processing");
            return false;
        }

        let job = OcrJob {
            frame: frame.clone(),
            submitted_at: Instant::now(),
        };
        match self.jobs.try_send(job) {
            Ok(()) => {
                state.phase = OcrPhase::Pending;
                state.last_accepted = Some(now);
                info!("Frame queued for OCR processing");
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                error!("Failed to queue frame for OCR");
                false
            }
        }
    }

    /// True while a request is pending or processing
    pub fn is_busy(&self) -> bool {
        self.phase() != OcrPhase::Idle
    }

    pub fn phase(&self) -> OcrPhase {
        self.worker.state.lock().phase
    }

    /// Frames waiting for the worker
    pub fn queue_len(&self) -> usize {
        self.jobs.len()
    }
}

impl Drop for OcrPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
