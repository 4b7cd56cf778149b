//! Spoken feedback through an external TTS program.
//!
//! A single worker thread speaks queued messages one at a time and exits
//! after sitting idle; the next announcement starts a fresh worker.

use roster_core::Announcer;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SpeechSettings {
    /// Program invoked as `{program} -s {rate} {message}`.
    pub program: String,
    pub rate: u32,
    pub idle_timeout: Duration,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            program: "espeak-ng".to_string(),
            rate: 170,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

pub struct SpeechQueue {
    settings: Arc<SpeechSettings>,
    worker: Arc<Mutex<Option<Sender<String>>>>,
}

impl SpeechQueue {
    pub fn new(settings: SpeechSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.worker.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

impl Announcer for SpeechQueue {
    fn announce(&self, message: &str) {
        let Ok(mut slot) = self.worker.lock() else {
            tracing::warn!("speech queue poisoned, dropping announcement");
            return;
        };

        let message = match slot.as_ref() {
            Some(tx) => match tx.send(message.to_string()) {
                Ok(()) => return,
                Err(mpsc::SendError(message)) => message,
            },
            None => message.to_string(),
        };

        let (tx, rx) = mpsc::channel();
        let settings = Arc::clone(&self.settings);
        let shared = Arc::clone(&self.worker);
        let spawned = std::thread::Builder::new()
            .name("roster-speech".into())
            .spawn(move || run_worker(&settings, &rx, &shared));
        match spawned {
            Ok(_) => {
                let _ = tx.send(message);
                *slot = Some(tx);
            }
            Err(e) => tracing::warn!(error = %e, "failed to start speech worker"),
        }
    }
}

fn run_worker(settings: &SpeechSettings, rx: &mpsc::Receiver<String>, shared: &Mutex<Option<Sender<String>>>) {
    tracing::debug!("speech worker started");
    loop {
        match rx.recv_timeout(settings.idle_timeout) {
            Ok(message) => speak(settings, &message),
            Err(RecvTimeoutError::Timeout) => {
                // Senders only push while holding the lock, so nothing can
                // arrive once the slot is cleared.
                let Ok(mut slot) = shared.lock() else {
                    return;
                };
                match rx.try_recv() {
                    Ok(message) => {
                        drop(slot);
                        speak(settings, &message);
                    }
                    Err(_) => {
                        *slot = None;
                        tracing::debug!("speech worker idle, exiting");
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn speech_command(settings: &SpeechSettings, message: &str) -> Command {
    let mut cmd = Command::new(&settings.program);
    cmd.arg("-s").arg(settings.rate.to_string()).arg(message);
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    cmd
}

fn speak(settings: &SpeechSettings, message: &str) {
    tracing::debug!(message, "speaking");
    match speech_command(settings, message).status() {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(program = %settings.program, %status, "speech program failed"),
        Err(e) => tracing::warn!(program = %settings.program, error = %e, "failed to run speech program"),
    }
}
