//! User input for the main loop
//!
//! Commands are typed on stdin, one per line. A reader thread parses lines
//! into [`InputEvent`]s so the loop can poll with a bounded timeout.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::io::BufRead;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Read the text in the current frame
    OcrTrigger,
    /// Stop the application
    Quit,
}

/// Non-blocking source of input events
pub trait InputSource: Send {
    /// Wait at most `timeout` for the next event
    fn poll(&mut self, timeout: Duration) -> Option<InputEvent>;
}

/// Parse a command line like "o", "space", "q"
pub fn parse_command(line: &str) -> Option<InputEvent> {
    let command = line.trim().to_lowercase();
    match command.as_str() {
        "" | "o" | "ocr" | "space" | "read" => Some(InputEvent::OcrTrigger),
        "q" | "quit" | "exit" | "esc" | "escape" => Some(InputEvent::Quit),
        _ => None,
    }
}

/// Line-based input from stdin
pub struct StdinInput {
    events: Receiver<InputEvent>,
    closed: bool,
}

impl StdinInput {
    /// Start the reader thread
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        std::thread::Builder::new().name("stdin-input".into()).spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to read input: {}", e);
                        break;
                    }
                };
                match parse_command(&line) {
                    Some(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    None => info!("Unknown command {:?} (Enter = read text, q = quit)", line.trim()),
                }
            }
            debug!("Input reader finished");
        })?;

        Ok(Self {
            events: rx,
            closed: false,
        })
    }
}

impl InputSource for StdinInput {
    fn poll(&mut self, timeout: Duration) -> Option<InputEvent> {
        if self.closed {
            return None;
        }
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // stdin reached EOF; keep running without input
                debug!("Input closed");
                self.closed = true;
                None
            }
        }
    }
}
