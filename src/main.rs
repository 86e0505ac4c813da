//! VisionMate - assistive perception loop
//!
//! Watches a camera feed, speaks proximity alerts for nearby people and
//! obstacles, and reads text aloud on request. Everything spoken goes
//! through one audio channel that never talks over itself.

mod analysis;
mod app;
mod audio;
mod capture;
mod clock;
mod config;
mod error;
mod input;
mod recovery;
mod storage;
mod vision;

#[cfg(test)]
mod testing;

use clap::Parser;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::analysis::{BrightnessSceneClassifier, SceneAnnouncer};
use crate::app::{Components, Coordinator, LoopSettings, RuntimeContext};
use crate::audio::{AudioGate, CommandSpeechFactory, SpeechFactory};
use crate::capture::{FileCameraFactory, FrameSource};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::input::StdinInput;
use crate::recovery::{ErrorHandler, RecoveryConfig, RecoveryHooks, ShutdownRegistry, StartupValidator};
use crate::vision::{DetectorFactory, ObjectDetector, OcrPipeline, TesseractEngine, YoloDetectorFactory};

/// Startup failures: bad configuration, failed validation, failed initialization
const EXIT_STARTUP: u8 = 1;

/// VisionMate - spoken proximity alerts and on-demand text reading
#[derive(Parser, Debug)]
#[command(name = "visionmate")]
#[command(about = "Assistive perception loop: proximity alerts and text reading through one audio channel")]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera index to open
    #[arg(long)]
    camera: Option<usize>,

    /// Frame source (image file or directory); repeat to add cameras
    #[arg(long = "source")]
    sources: Vec<PathBuf>,

    /// YOLO ONNX model path
    #[arg(long)]
    model: Option<PathBuf>,

    /// Print spoken messages instead of using a speech engine
    #[arg(long)]
    no_audio: bool,

    /// Start without running the startup checks
    #[arg(long)]
    skip_validation: bool,

    /// Debug logging and the full validation report
    #[arg(short, long)]
    verbose: bool,

    /// Write the default configuration to this path and exit
    #[arg(long)]
    write_default_config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(path) = &args.write_default_config {
        return match config::save_config(&AppConfig::default(), path) {
            Ok(()) => {
                info!("Default configuration written to {:?}", path);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Could not write configuration: {}", e);
                ExitCode::from(EXIT_STARTUP)
            }
        };
    }

    info!("VisionMate starting...");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    match run(config, &args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Initialization failed: {:#}", e);
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

/// `RUST_LOG` wins; otherwise info, or debug with `--verbose` / `ENABLE_LOGGING=true`
fn init_logging(verbose: bool) {
    let debug = verbose
        || std::env::var("ENABLE_LOGGING")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {e}");
    }
}

/// Config file (if any) with command-line overrides applied, validated
fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let path = match &args.config {
        Some(path) => Some(path.clone()),
        None => storage::default_config_path().ok(),
    };

    let mut config = match path {
        Some(path) if path.exists() => {
            let config = config::load_config(&path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        Some(path) if args.config.is_some() => {
            anyhow::bail!("config file {:?} does not exist", path);
        }
        _ => {
            info!("Using default configuration");
            AppConfig::default()
        }
    };

    if let Some(index) = args.camera {
        config.camera.index = index;
    }
    config.camera.sources.extend(args.sources.iter().cloned());
    if let Some(model) = &args.model {
        config.detection.model_path = model.clone();
    }
    if args.no_audio {
        config.audio.enabled = false;
    }

    config.validate()?;
    Ok(config)
}

/// Build the collaborators, validate, run the loop, shut down. Returns the exit code.
fn run(config: AppConfig, args: &Args) -> anyhow::Result<u8> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cameras = Arc::new(FileCameraFactory::new(config.camera.sources.clone()));
    let detectors = Arc::new(YoloDetectorFactory::new(&config.detection));
    let speech = Arc::new(CommandSpeechFactory::new(&config.audio));
    let text = Arc::new(TesseractEngine::new(&config.ocr));

    let hooks = RecoveryHooks {
        cameras: Some(cameras.clone()),
        detectors: Some(detectors.clone()),
        speech: config.audio.enabled.then(|| speech.clone() as Arc<dyn SpeechFactory>),
        text: Some(text.clone()),
    };
    let errors = Arc::new(ErrorHandler::new(RecoveryConfig::from(&config)).with_hooks(hooks.clone()));

    if args.skip_validation {
        warn!("Startup validation skipped");
    } else {
        let mut validator = StartupValidator::standard(&config, &hooks);
        let passed = validator.validate_all();
        if !passed || args.verbose {
            println!("{}", validator.report());
        }
        if !passed {
            error!("Critical validation failures detected. Cannot start application.");
            return Ok(EXIT_STARTUP);
        }
    }

    let mut camera = FrameSource::new(cameras, errors.clone());
    if !camera.initialize(config.camera.index) {
        error!("Failed to initialize camera {}", config.camera.index);
        return Ok(EXIT_STARTUP);
    }

    let model = match detectors.load() {
        Ok(model) => Some(model),
        Err(e) => {
            warn!("Detection model unavailable: {:#}", e);
            None
        }
    };
    let detector = ObjectDetector::new(model, config.detection.confidence_threshold, errors.clone())?;

    let engine = if config.audio.enabled {
        match speech.create() {
            Ok(engine) => Some(engine),
            Err(e) => {
                warn!("Speech engine unavailable: {:#}", e);
                None
            }
        }
    } else {
        None
    };
    let gate = Arc::new(AudioGate::new(engine, errors.clone()));

    let ocr = Arc::new(OcrPipeline::new(text, gate.clone(), errors.clone(), clock.clone(), &config.ocr));
    ocr.start()?;

    let input = StdinInput::spawn()?;

    let shutdown = Arc::new(ShutdownRegistry::new());
    let context = RuntimeContext::new(&config, errors.clone(), shutdown.clone(), clock.clone());
    let mut coordinator = Coordinator::new(
        context,
        LoopSettings::from(&config),
        Components {
            camera,
            detector,
            gate: gate.clone(),
            ocr: ocr.clone(),
            input: Box::new(input),
        },
    );
    if config.scene.enabled {
        coordinator = coordinator.with_scene(SceneAnnouncer::new(
            Box::new(BrightnessSceneClassifier),
            clock,
            &config.scene,
        ));
    }
    let coordinator = Arc::new(Mutex::new(coordinator));

    {
        let ocr = ocr.clone();
        shutdown.register("ocr processor", move || {
            ocr.stop();
            Ok(())
        });
    }
    {
        let gate = gate.clone();
        shutdown.register("speech", move || {
            gate.stop();
            Ok(())
        });
    }
    {
        let coordinator = coordinator.clone();
        shutdown.register("camera and model", move || {
            coordinator.lock().release();
            Ok(())
        });
    }

    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || shutdown.request_shutdown()) {
            warn!("Could not install signal handler: {}", e);
        }
    }

    let exit = coordinator.lock().run();
    shutdown.shutdown();

    let summary = errors.error_summary();
    if !summary.is_empty() {
        info!("Error summary: {:?}", summary);
    }
    info!("VisionMate shutdown complete");

    Ok(exit.exit_code())
}
