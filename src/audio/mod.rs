//! Audio output
//!
//! All spoken output goes through [`AudioGate`]. The gate owns a single busy
//! flag: a `speak_*` call made while something is being spoken is dropped,
//! never queued. When no speech engine is usable the gate degrades to a
//! text side channel and still reports success.

pub mod command_engine;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::recovery::{ErrorCategory, ErrorHandler, RecoveryContext};

pub use command_engine::{CommandSpeechEngine, CommandSpeechFactory};

/// Spoken for OCR requests that produced nothing at all
pub const EMPTY_TEXT_MESSAGE: &str = "No text found";

/// Receives utterance start/finish events from a speech engine's own thread
pub trait SpeechListener: Send + Sync {
    fn on_speech_started(&self);
    fn on_speech_finished(&self, completed: bool);
}

/// Black-box text to speech engine. Not reentrant: the gate guarantees a
/// single caller at a time.
pub trait SpeechEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Register for start/finish events
    fn subscribe(&self, listener: Arc<dyn SpeechListener>);

    /// Queue an utterance
    fn say(&self, text: &str) -> Result<()>;

    /// Speak everything queued and block until done
    fn run_and_wait(&self) -> Result<()>;

    /// Interrupt the current utterance
    fn stop(&self);
}

/// Creates speech engines, used at startup and by TTS recovery
pub trait SpeechFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn SpeechEngine>>;
}

/// Phrase spoken for a close object
pub fn alert_message(label: &str) -> String {
    match label {
        "person" => "Person ahead".to_string(),
        "chair" => "Chair detected".to_string(),
        "car" => "Car nearby".to_string(),
        "door" => "Door detected".to_string(),
        other => format!("{other} detected"),
    }
}

/// What a message is, used to tag the text fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Alert,
    Text,
    Scene,
}

impl MessageKind {
    fn fallback_prefix(&self) -> &'static str {
        match self {
            MessageKind::Alert => "AUDIO ALERT",
            MessageKind::Text => "AUDIO TEXT",
            MessageKind::Scene => "AUDIO SCENE",
        }
    }
}

/// The busy/idle flag. The gate's claim and the engine's speaking state
/// are tracked apart: engine callbacks never clear a claim the gate holds.
#[derive(Debug, Default)]
pub struct BusyFlag {
    state: Mutex<BusyState>,
}

#[derive(Debug, Default)]
struct BusyState {
    claimed: bool,
    speaking: bool,
}

impl BusyFlag {
    pub fn is_set(&self) -> bool {
        let state = self.state.lock();
        state.claimed || state.speaking
    }

    /// Claim the engine if nobody holds it and it is silent
    pub fn try_claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.claimed || state.speaking {
            false
        } else {
            state.claimed = true;
            true
        }
    }

    /// Drop the claim once the engine call has returned
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.claimed = false;
        state.speaking = false;
    }

    fn clear_speaking(&self) {
        self.state.lock().speaking = false;
    }
}

impl SpeechListener for BusyFlag {
    fn on_speech_started(&self) {
        self.state.lock().speaking = true;
    }

    fn on_speech_finished(&self, _completed: bool) {
        self.state.lock().speaking = false;
    }
}

type FallbackSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Serializes every spoken message through one busy flag
pub struct AudioGate {
    engine: RwLock<Option<Arc<dyn SpeechEngine>>>,
    busy: Arc<BusyFlag>,
    errors: Arc<ErrorHandler>,
    sink: FallbackSink,
}

impl AudioGate {
    /// `None` starts the gate in text fallback mode
    pub fn new(engine: Option<Box<dyn SpeechEngine>>, errors: Arc<ErrorHandler>) -> Self {
        let busy = Arc::new(BusyFlag::default());
        let engine: Option<Arc<dyn SpeechEngine>> = engine.map(Arc::from);
        match &engine {
            Some(engine) => {
                engine.subscribe(busy.clone());
                info!("Audio gate using {} speech engine", engine.name());
            }
            None => warn!("No speech engine available, spoken output falls back to text"),
        }

        Self {
            engine: RwLock::new(engine),
            busy,
            errors,
            sink: Arc::new(|line: &str| println!("{line}")),
        }
    }

    /// Redirect the text fallback
    pub fn with_fallback_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.sink = Arc::new(sink);
        self
    }

    pub fn is_busy(&self) -> bool {
        self.busy.is_set()
    }

    /// True when no engine is in use and messages go to the text channel
    pub fn is_fallback(&self) -> bool {
        self.engine.read().is_none()
    }

    pub fn speak_alert(&self, label: &str) -> bool {
        self.speak(MessageKind::Alert, &alert_message(label))
    }

    pub fn speak_text(&self, text: &str) -> bool {
        let cleaned = text.trim();
        let message = if cleaned.is_empty() { EMPTY_TEXT_MESSAGE } else { cleaned };
        self.speak(MessageKind::Text, message)
    }

    pub fn speak_scene(&self, scene: &str) -> bool {
        self.speak(MessageKind::Scene, &format!("Environment: {scene}"))
    }

    /// Interrupt whatever is being spoken. The caller inside the engine
    /// keeps its claim until the engine returns.
    pub fn stop(&self) {
        let engine = self.engine.read().clone();
        if let Some(engine) = engine {
            if self.is_busy() {
                engine.stop();
            }
        }
        self.busy.clear_speaking();
    }

    fn speak(&self, kind: MessageKind, message: &str) -> bool {
        if !self.busy.try_claim() {
            debug!("Audio busy, dropping: {}", message);
            return false;
        }
        let spoken = self.speak_claimed(kind, message);
        self.busy.release();
        spoken
    }

    fn speak_claimed(&self, kind: MessageKind, message: &str) -> bool {
        let engine = self.engine.read().clone();
        let Some(engine) = engine else {
            self.emit_fallback(kind, message);
            return true;
        };

        match say_on(engine.as_ref(), message) {
            Ok(()) => {
                self.errors.record_success(ErrorCategory::Tts);
                true
            }
            Err(e) => {
                error!("Error speaking {:?} message: {:#}", kind, e);
                self.recover(kind, message, &e)
            }
        }
    }

    /// Runs with the claim held. Whatever happens the message reaches the
    /// user, through a recovered engine or the text channel.
    fn recover(&self, kind: MessageKind, message: &str, err: &anyhow::Error) -> bool {
        let mut context = RecoveryContext::new().with_detail(format!("speaking {kind:?} message"));
        if !self.errors.handle_error(ErrorCategory::Tts, &format!("{err:#}"), &mut context) {
            warn!("Speech engine keeps failing, switching to text output");
            self.switch_to_fallback(kind, message);
            return true;
        }

        if let Some(engine) = context.recovered_speech.take() {
            let engine: Arc<dyn SpeechEngine> = Arc::from(engine);
            engine.subscribe(self.busy.clone());
            *self.engine.write() = Some(engine.clone());

            match say_on(engine.as_ref(), message) {
                Ok(()) => {
                    self.errors.record_success(ErrorCategory::Tts);
                    return true;
                }
                Err(e) => error!("Recovered speech engine failed as well: {:#}", e),
            }
        } else if context.speech_fallback.is_none() {
            warn!("TTS recovery produced no engine");
        }

        self.switch_to_fallback(kind, message);
        true
    }

    fn switch_to_fallback(&self, kind: MessageKind, message: &str) {
        if self.engine.write().take().is_some() {
            info!("Spoken output now goes to the text channel");
        }
        self.emit_fallback(kind, message);
    }

    fn emit_fallback(&self, kind: MessageKind, message: &str) {
        let line = format!("{}: {}", kind.fallback_prefix(), message);
        info!(target: "speech", "{}", line);
        (self.sink)(&line);
    }
}

fn say_on(engine: &dyn SpeechEngine, message: &str) -> Result<()> {
    engine.say(message)?;
    engine.run_and_wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{RecoveryConfig, RecoveryHooks};
    use crate::testing::{BrokenSpeechFactory, FailingSpeechFactory, RecordingSpeechEngine, RecordingSpeechFactory};
    use std::time::Duration;

    fn errors() -> Arc<ErrorHandler> {
        Arc::new(ErrorHandler::new(RecoveryConfig::default().without_pauses()))
    }

    fn captured() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync + 'static) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = lines.clone();
        (lines, move |line: &str| sink_lines.lock().push(line.to_string()))
    }

    #[test]
    fn test_alert_phrases() {
        assert_eq!(alert_message("person"), "Person ahead");
        assert_eq!(alert_message("chair"), "Chair detected");
        assert_eq!(alert_message("car"), "Car nearby");
        assert_eq!(alert_message("door"), "Door detected");
        assert_eq!(alert_message("bicycle"), "bicycle detected");
    }

    #[test]
    fn test_speaks_through_engine() {
        let engine = RecordingSpeechEngine::new();
        let spoken = engine.spoken();
        let gate = AudioGate::new(Some(Box::new(engine)), errors());

        assert!(gate.speak_alert("person"));
        assert!(gate.speak_text("  "));
        assert!(gate.speak_scene("kitchen"));
        assert_eq!(
            *spoken.lock(),
            vec!["Person ahead", EMPTY_TEXT_MESSAGE, "Environment: kitchen"]
        );
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_fallback_reports_success() {
        let (lines, sink) = captured();
        let gate = AudioGate::new(None, errors()).with_fallback_sink(sink);

        assert!(gate.is_fallback());
        assert!(gate.speak_alert("car"));
        assert!(gate.speak_text("EXIT"));
        assert!(gate.speak_scene("street"));
        assert_eq!(
            *lines.lock(),
            vec!["AUDIO ALERT: Car nearby", "AUDIO TEXT: EXIT", "AUDIO SCENE: Environment: street"]
        );
    }

    #[test]
    fn test_busy_gate_drops_second_speaker() {
        let (engine, release) = RecordingSpeechEngine::blocking();
        let spoken = engine.spoken();
        let started = engine.started();
        let gate = Arc::new(AudioGate::new(Some(Box::new(engine)), errors()));

        let first = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.speak_alert("person"))
        };
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(gate.is_busy());
        assert!(!gate.speak_alert("car"));
        assert!(!gate.speak_text("ROOM 101"));

        release.send(()).unwrap();
        assert!(first.join().unwrap());
        assert_eq!(*spoken.lock(), vec!["Person ahead"]);
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_engine_failure_degrades_to_text() {
        let (lines, sink) = captured();
        let errors = Arc::new(
            ErrorHandler::new(RecoveryConfig::default().without_pauses()).with_hooks(RecoveryHooks {
                speech: Some(Arc::new(FailingSpeechFactory)),
                ..Default::default()
            }),
        );
        let gate = AudioGate::new(Some(Box::new(RecordingSpeechEngine::failing())), errors).with_fallback_sink(sink);

        assert!(gate.speak_alert("person"));
        assert!(gate.is_fallback());
        assert_eq!(*lines.lock(), vec!["AUDIO ALERT: Person ahead"]);
    }

    #[test]
    fn test_engine_callbacks_do_not_release_gate_claim() {
        let flag = BusyFlag::default();
        assert!(flag.try_claim());
        assert!(!flag.try_claim());

        flag.on_speech_started();
        flag.on_speech_finished(true);
        assert!(flag.is_set());
        assert!(!flag.try_claim());

        flag.release();
        assert!(!flag.is_set());

        // an engine speaking on its own still blocks new claims
        flag.on_speech_started();
        assert!(!flag.try_claim());
        flag.on_speech_finished(true);
        assert!(flag.try_claim());
    }

    #[test]
    fn test_single_caller_inside_engine_when_finish_fires_early() {
        let engine = RecordingSpeechEngine::lagging(Duration::from_millis(5));
        let max_concurrent = engine.max_concurrent();
        let spoken = engine.spoken();
        let gate = Arc::new(AudioGate::new(Some(Box::new(engine)), errors()));

        let deadline = std::time::Instant::now() + Duration::from_millis(300);
        let speakers: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    while std::time::Instant::now() < deadline {
                        gate.speak_alert("person");
                    }
                })
            })
            .collect();
        for speaker in speakers {
            speaker.join().unwrap();
        }

        assert!(!spoken.lock().is_empty());
        assert_eq!(max_concurrent.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_replacement_engines_that_fail_fall_back_to_text() {
        let (lines, sink) = captured();
        let errors = Arc::new(
            ErrorHandler::new(RecoveryConfig::default().without_pauses()).with_hooks(RecoveryHooks {
                speech: Some(Arc::new(BrokenSpeechFactory)),
                ..Default::default()
            }),
        );
        let gate = AudioGate::new(Some(Box::new(RecordingSpeechEngine::failing())), errors).with_fallback_sink(sink);

        let results: Vec<bool> = (0..8).map(|_| gate.speak_alert("person")).collect();

        assert!(results.iter().all(|spoken| *spoken));
        assert!(gate.is_fallback());
        assert_eq!(lines.lock().len(), 8);
        assert!(lines.lock().iter().all(|line| line == "AUDIO ALERT: Person ahead"));
    }

    #[test]
    fn test_exhausted_tts_retries_still_emit_text() {
        let (lines, sink) = captured();
        let errors = Arc::new(
            ErrorHandler::new(RecoveryConfig::default().without_pauses()).with_hooks(RecoveryHooks {
                speech: Some(Arc::new(RecordingSpeechFactory)),
                ..Default::default()
            }),
        );
        for _ in 0..errors.max_retries() {
            errors.handle_error(ErrorCategory::Tts, &"earlier failure", &mut RecoveryContext::new());
        }
        let gate = AudioGate::new(Some(Box::new(RecordingSpeechEngine::failing())), errors.clone())
            .with_fallback_sink(sink);

        assert!(gate.speak_text("EXIT"));
        assert!(gate.is_fallback());
        assert_eq!(*lines.lock(), vec!["AUDIO TEXT: EXIT"]);
        assert_eq!(errors.error_count(ErrorCategory::Tts), errors.max_retries() + 1);
    }

    #[test]
    fn test_message_survives_engine_reinit() {
        let (lines, sink) = captured();
        let errors = Arc::new(
            ErrorHandler::new(RecoveryConfig::default().without_pauses()).with_hooks(RecoveryHooks {
                speech: Some(Arc::new(RecordingSpeechFactory)),
                ..Default::default()
            }),
        );
        let gate = AudioGate::new(Some(Box::new(RecordingSpeechEngine::failing())), errors.clone())
            .with_fallback_sink(sink);

        assert!(gate.speak_alert("car"));
        assert!(!gate.is_fallback());
        assert!(lines.lock().is_empty());
        assert_eq!(errors.error_count(ErrorCategory::Tts), 0);
    }
}
