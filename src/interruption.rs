//! Remote interruption handling.
//!
//! When the service reports `interrupted`, the user has barged in and the
//! agent's current utterance is void. Everything queued on the speaker is cut
//! and the timeline pointer resets so the next reply starts immediately.

use crate::playback::PlaybackScheduler;
use tracing::info;

#[derive(Debug, Default)]
pub struct InterruptionHandler {
    interruptions: u64,
}

impl InterruptionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut all playback. Goes through the scheduler's cancellation entry point
    /// and holds `&mut` for the whole clear, so no buffer can be scheduled in
    /// between. Returns the number of voices stopped.
    pub fn interrupt(&mut self, scheduler: &mut PlaybackScheduler) -> usize {
        self.interruptions += 1;
        let cut = scheduler.cancel_all();
        info!("Interrupted by remote: cut {} voice(s)", cut);
        cut
    }

    pub fn count(&self) -> u64 {
        self.interruptions
    }
}
