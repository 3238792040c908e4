//! Playback scheduler
//!
//! Inbound speech arrives as a stream of short buffers. Each buffer is started
//! on the output device's timeline exactly where the previous one ends, so
//! consecutive buffers play without gaps or overlap, in arrival order. The
//! scheduler also owns the set of in-flight voices so an interruption can cut
//! all of them at once.

use crate::audio::{AudioOutput, VoiceId};
use crate::codec::AudioBuffer;
use crate::error::Result;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default time the active set must stay empty before the agent counts as
/// silent.
pub const DEFAULT_SPEAKING_GRACE: Duration = Duration::from_millis(200);

/// One scheduled or playing buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackHandle {
    pub id: VoiceId,
    /// Start time on the output timeline, in seconds
    pub start_at: f64,
    /// Duration in seconds
    pub duration: f64,
    active: bool,
}

impl PlaybackHandle {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    next_start_time: f64,
    active: BTreeMap<VoiceId, PlaybackHandle>,
    next_voice: VoiceId,
    grace: Duration,
    silence_deadline: Option<Instant>,
    speaking: watch::Sender<bool>,
    released: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>, grace: Duration) -> Self {
        let (speaking, _) = watch::channel(false);
        Self {
            output,
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_voice: 0,
            grace,
            silence_deadline: None,
            speaking,
            released: false,
        }
    }

    /// Schedule `buffer` right after everything already scheduled.
    pub fn enqueue(&mut self, buffer: AudioBuffer) -> Result<PlaybackHandle> {
        let now = self.output.current_time();
        if self.next_start_time < now {
            // Playback drained (or never started); don't schedule into the past.
            self.next_start_time = now;
        }

        let id = self.next_voice;
        self.next_voice += 1;
        let start_at = self.next_start_time;
        let duration = buffer.duration();

        self.output.start(id, buffer, start_at)?;
        self.next_start_time = start_at + duration;

        let handle = PlaybackHandle {
            id,
            start_at,
            duration,
            active: true,
        };
        self.active.insert(id, handle);
        self.silence_deadline = None;
        self.set_speaking(true);

        debug!(
            "Scheduled voice {} at {:.3}s for {:.3}s ({} active)",
            id,
            start_at,
            duration,
            self.active.len()
        );
        Ok(handle)
    }

    /// A voice finished playing on its own.
    pub fn on_ended(&mut self, id: VoiceId, now: Instant) {
        if self.active.remove(&id).is_none() {
            // Already cancelled by an interruption
            return;
        }
        if self.active.is_empty() {
            self.silence_deadline = Some(now + self.grace);
        }
    }

    /// The agent finished its utterance. Speaking turns off once the active
    /// set has stayed empty for the grace window.
    pub fn turn_complete(&mut self, now: Instant) {
        if self.active.is_empty() && self.is_speaking() && self.silence_deadline.is_none() {
            self.silence_deadline = Some(now + self.grace);
        }
    }

    /// When the pending silence check is due, if any.
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    /// Run the pending silence check. Returns true when speaking turned off.
    pub fn settle(&mut self, now: Instant) -> bool {
        match self.silence_deadline {
            Some(deadline) if now >= deadline => {
                self.silence_deadline = None;
                if self.active.is_empty() && self.is_speaking() {
                    self.set_speaking(false);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Stop every active voice, clear the active set and reset the timeline
    /// pointer. Speaking turns off immediately. Returns how many voices were
    /// cut.
    pub fn cancel_all(&mut self) -> usize {
        let ids: Vec<VoiceId> = self.active.keys().copied().collect();
        if !ids.is_empty() {
            self.output.stop(&ids);
        }
        for handle in self.active.values_mut() {
            handle.active = false;
        }
        self.active.clear();
        self.next_start_time = 0.0;
        self.silence_deadline = None;
        self.set_speaking(false);
        ids.len()
    }

    /// Cancel everything and release the output device. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.cancel_all();
        self.output.release();
        self.released = true;
        info!("Playback device released");
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self) -> impl Iterator<Item = &PlaybackHandle> {
        self.active.values()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn set_speaking(&self, speaking: bool) {
        self.speaking.send_if_modified(|current| {
            if *current != speaking {
                *current = speaking;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.release();
    }
}
