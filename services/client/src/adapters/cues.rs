//! services/client/src/adapters/cues.rs
//!
//! `SessionCues` sinks. The service has no speaker, so cues are logged; tests record
//! them to assert which transitions fired.

use std::sync::Mutex;
use study_sync_core::ports::SessionCues;
use tracing::debug;

/// Logs each cue at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCues;

impl SessionCues for TracingCues {
    fn play_start(&self) {
        debug!(cue = "start", "Session cue.");
    }

    fn play_tick(&self) {
        debug!(cue = "tick", "Session cue.");
    }

    fn play_notification(&self) {
        debug!(cue = "notification", "Session cue.");
    }

    fn play_complete(&self) {
        debug!(cue = "complete", "Session cue.");
    }

    fn play_break(&self, long: bool) {
        debug!(cue = "break", long, "Session cue.");
    }

    fn stop(&self) {
        debug!(cue = "stop", "Session cue.");
    }
}

/// Keeps every cue name in call order.
#[derive(Debug, Default)]
pub struct RecordingCues {
    played: Mutex<Vec<&'static str>>,
}

impl RecordingCues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn played(&self) -> Vec<&'static str> {
        self.played.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn count(&self, cue: &str) -> usize {
        self.played().iter().filter(|c| **c == cue).count()
    }

    fn record(&self, cue: &'static str) {
        if let Ok(mut played) = self.played.lock() {
            played.push(cue);
        }
    }
}

impl SessionCues for RecordingCues {
    fn play_start(&self) {
        self.record("start");
    }

    fn play_tick(&self) {
        self.record("tick");
    }

    fn play_notification(&self) {
        self.record("notification");
    }

    fn play_complete(&self) {
        self.record("complete");
    }

    fn play_break(&self, long: bool) {
        self.record(if long { "long-break" } else { "break" });
    }

    fn stop(&self) {
        self.record("stop");
    }
}
