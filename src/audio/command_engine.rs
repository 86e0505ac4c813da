//! Speech engine backed by the platform's speech program
//!
//! Utterances run on a dedicated engine thread, one child process each.
//! Start/finish events are delivered to subscribed listeners from that
//! thread; `stop()` kills the current child.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{SpeechEngine, SpeechFactory, SpeechListener};
use crate::config::AudioSettings;

/// How an utterance is turned into a command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechProgram {
    /// `espeak` / `espeak-ng`
    Espeak(String),
    /// macOS `say`
    Say,
    /// Windows SAPI through PowerShell
    PowerShell,
    /// Any program taking the text as its last argument
    Custom(String),
}

impl SpeechProgram {
    /// Platform default, probing for an installed espeak on Linux
    pub fn detect() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(SpeechProgram::Say)
        } else if cfg!(target_os = "windows") {
            Some(SpeechProgram::PowerShell)
        } else {
            ["espeak-ng", "espeak"]
                .into_iter()
                .find(|program| is_runnable(program))
                .map(|program| SpeechProgram::Espeak(program.to_string()))
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SpeechProgram::Espeak(program) | SpeechProgram::Custom(program) => program,
            SpeechProgram::Say => "say",
            SpeechProgram::PowerShell => "powershell",
        }
    }

    /// Command speaking `text` at `rate` words per minute
    pub fn command(&self, text: &str, rate: u32) -> Command {
        match self {
            SpeechProgram::Espeak(program) => {
                let mut cmd = Command::new(program);
                cmd.arg("-s").arg(rate.to_string()).arg(text);
                cmd
            }
            SpeechProgram::Say => {
                let mut cmd = Command::new("say");
                cmd.arg("-r").arg(rate.to_string()).arg(text);
                cmd
            }
            SpeechProgram::PowerShell => {
                let mut cmd = Command::new("powershell");
                cmd.args(["-NoProfile", "-NonInteractive", "-Command"]).arg(sapi_script(text, rate));
                cmd
            }
            SpeechProgram::Custom(program) => {
                let mut cmd = Command::new(program);
                cmd.arg(text);
                cmd
            }
        }
    }
}

/// SAPI rate runs from -10 to 10, 0 being roughly 200 wpm
fn sapi_script(text: &str, rate: u32) -> String {
    let sapi_rate = ((rate as i64 - 200) / 20).clamp(-10, 10);
    format!(
        "Add-Type -AssemblyName System.Speech; \
         $s = New-Object System.Speech.Synthesis.SpeechSynthesizer; \
         $s.Rate = {}; $s.Speak('{}')",
        sapi_rate,
        text.replace('\'', "''")
    )
}

fn is_runnable(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Creates [`CommandSpeechEngine`]s from the audio settings
#[derive(Debug, Clone)]
pub struct CommandSpeechFactory {
    program: Option<SpeechProgram>,
    rate: u32,
}

impl CommandSpeechFactory {
    pub fn new(settings: &AudioSettings) -> Self {
        let program = match &settings.command {
            Some(command) => Some(SpeechProgram::Custom(command.clone())),
            None => SpeechProgram::detect(),
        };
        Self {
            program,
            rate: settings.speech_rate,
        }
    }
}

impl SpeechFactory for CommandSpeechFactory {
    fn create(&self) -> Result<Box<dyn SpeechEngine>> {
        let program = self
            .program
            .clone()
            .ok_or_else(|| anyhow!("no speech program found on this system"))?;
        Ok(Box::new(CommandSpeechEngine::spawn(program, self.rate)?))
    }
}

type Listeners = Arc<Mutex<Vec<Arc<dyn SpeechListener>>>>;

struct Job {
    utterances: Vec<String>,
    done: Sender<Result<()>>,
}

/// Speech engine running one child process per utterance on its own thread
pub struct CommandSpeechEngine {
    program: SpeechProgram,
    queue: Mutex<Vec<String>>,
    jobs: Mutex<Option<Sender<Job>>>,
    listeners: Listeners,
    current: Arc<Mutex<Option<Child>>>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandSpeechEngine {
    pub fn spawn(program: SpeechProgram, rate: u32) -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        let current = Arc::new(Mutex::new(None));
        let stopped = Arc::new(AtomicBool::new(false));

        let worker = {
            let program = program.clone();
            let listeners = listeners.clone();
            let current = current.clone();
            let stopped = stopped.clone();
            std::thread::Builder::new()
                .name("speech-engine".into())
                .spawn(move || {
                    debug!("Speech engine thread starting");
                    for job in rx.iter() {
                        stopped.store(false, Ordering::SeqCst);
                        let mut result = Ok(());
                        for text in &job.utterances {
                            if stopped.load(Ordering::SeqCst) {
                                break;
                            }
                            if let Err(e) = speak_one(&program, rate, text, &listeners, &current) {
                                result = Err(e);
                                break;
                            }
                        }
                        let _ = job.done.send(result);
                    }
                    debug!("Speech engine thread exiting");
                })
                .context("Failed to start speech engine thread")?
        };

        info!("Speech engine started using {}", program.name());
        Ok(Self {
            program,
            queue: Mutex::new(Vec::new()),
            jobs: Mutex::new(Some(tx)),
            listeners,
            current,
            stopped,
            worker: Mutex::new(Some(worker)),
        })
    }
}

fn speak_one(
    program: &SpeechProgram,
    rate: u32,
    text: &str,
    listeners: &Listeners,
    current: &Arc<Mutex<Option<Child>>>,
) -> Result<()> {
    let child = program
        .command(text, rate)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to run {}", program.name()))?;
    *current.lock() = Some(child);

    let subscribers = listeners.lock().clone();
    for listener in &subscribers {
        listener.on_speech_started();
    }

    let status = loop {
        let polled = match current.lock().as_mut() {
            Some(child) => child.try_wait(),
            None => break None,
        };
        match polled {
            Ok(Some(status)) => break Some(status),
            Ok(None) => std::thread::sleep(Duration::from_millis(10)),
            Err(e) => {
                warn!("Lost track of speech process: {}", e);
                break None;
            }
        }
    };
    current.lock().take();

    let completed = status.map(|s| s.success()).unwrap_or(false);
    for listener in &subscribers {
        listener.on_speech_finished(completed);
    }
    debug!("Utterance finished (completed: {})", completed);
    Ok(())
}

impl SpeechEngine for CommandSpeechEngine {
    fn name(&self) -> &str {
        self.program.name()
    }

    fn subscribe(&self, listener: Arc<dyn SpeechListener>) {
        self.listeners.lock().push(listener);
    }

    fn say(&self, text: &str) -> Result<()> {
        self.queue.lock().push(text.to_string());
        Ok(())
    }

    fn run_and_wait(&self) -> Result<()> {
        let utterances = std::mem::take(&mut *self.queue.lock());
        if utterances.is_empty() {
            return Ok(());
        }

        let (done, finished) = bounded(1);
        {
            let jobs = self.jobs.lock();
            let Some(jobs) = jobs.as_ref() else {
                bail!("speech engine is shut down");
            };
            jobs.send(Job { utterances, done })
                .map_err(|_| anyhow!("speech engine thread is gone"))?;
        }

        finished
            .recv()
            .map_err(|_| anyhow!("speech engine thread exited mid-utterance"))?
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.queue.lock().clear();
        if let Some(child) = self.current.lock().as_mut() {
            if let Err(e) = child.kill() {
                debug!("Could not stop utterance: {}", e);
            }
        }
    }
}

impl Drop for CommandSpeechEngine {
    fn drop(&mut self) {
        self.stop();
        self.jobs.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
