//! Audio device seams
//!
//! A session owns exactly one microphone and one output device. Both are
//! opened through an [`AudioBackend`] so the session logic does not depend on
//! PulseAudio being present.

pub mod devices;
pub mod pulse;

use crate::codec::AudioBuffer;
use crate::error::Result;
use tokio::sync::mpsc;

pub use pulse::PulseBackend;

/// Identifier of one scheduled playback buffer on an output device.
pub type VoiceId = u64;

/// Opens the devices a session needs.
pub trait AudioBackend: Send + Sync {
    /// Open the microphone, delivering windows of `window` mono f32 samples at
    /// `sample_rate`. Refusal maps to `SessionError::PermissionDenied`.
    fn open_microphone(&self, sample_rate: u32, window: usize) -> Result<Microphone>;

    /// Open the speaker. The device reports every voice that finishes playing
    /// naturally on `ended`.
    fn open_speaker(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<VoiceId>,
    ) -> Result<Box<dyn AudioOutput>>;
}

/// An output device with its own monotonic playback clock.
pub trait AudioOutput: Send {
    /// Current position of the output timeline in seconds.
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `at` on the output timeline.
    fn start(&mut self, voice: VoiceId, buffer: AudioBuffer, at: f64) -> Result<()>;

    /// Stop the given voices immediately, whether playing or still queued.
    /// Stopped voices are not reported as ended.
    fn stop(&mut self, voices: &[VoiceId]);

    /// Release the device. Called once per session.
    fn release(&mut self);
}

/// Releases a capture device exactly once, on demand or on drop.
pub struct DeviceGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// An open microphone: the stream of captured windows plus the guard that
/// shuts the device down.
pub struct Microphone {
    pub windows: mpsc::Receiver<Vec<f32>>,
    pub device: DeviceGuard,
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory devices for session tests.

    use super::*;
    use crate::error::SessionError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// What a [`FakeOutput`] has been asked to do.
    #[derive(Debug, Default)]
    pub struct OutputLog {
        pub now: f64,
        pub started: Vec<(VoiceId, f64, f64)>,
        pub stopped: Vec<VoiceId>,
        pub released: usize,
    }

    pub struct FakeOutput {
        log: Arc<Mutex<OutputLog>>,
        started_tx: Option<mpsc::UnboundedSender<(VoiceId, f64)>>,
    }

    impl FakeOutput {
        pub fn new() -> (Self, Arc<Mutex<OutputLog>>) {
            let log = Arc::new(Mutex::new(OutputLog::default()));
            (
                Self {
                    log: log.clone(),
                    started_tx: None,
                },
                log,
            )
        }
    }

    impl AudioOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            self.log.lock().unwrap().now
        }

        fn start(&mut self, voice: VoiceId, buffer: AudioBuffer, at: f64) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .started
                .push((voice, at, buffer.duration()));
            if let Some(tx) = &self.started_tx {
                let _ = tx.send((voice, at));
            }
            Ok(())
        }

        fn stop(&mut self, voices: &[VoiceId]) {
            self.log.lock().unwrap().stopped.extend_from_slice(voices);
        }

        fn release(&mut self) {
            self.log.lock().unwrap().released += 1;
        }
    }

    /// Test-side ends of a [`FakeBackend`].
    pub struct FakeDevices {
        pub windows: mpsc::Sender<Vec<f32>>,
        pub started: mpsc::UnboundedReceiver<(VoiceId, f64)>,
        pub output: Arc<Mutex<OutputLog>>,
        pub mic_released: Arc<AtomicUsize>,
        pub ended: Arc<Mutex<Option<mpsc::UnboundedSender<VoiceId>>>>,
    }

    impl FakeDevices {
        pub fn mic_releases(&self) -> usize {
            self.mic_released.load(Ordering::SeqCst)
        }

        pub fn speaker_releases(&self) -> usize {
            self.output.lock().unwrap().released
        }

        /// Drop the window sender, as an unplugged microphone would.
        pub fn disconnect_microphone(&mut self) {
            self.windows = mpsc::channel(1).0;
        }

        /// Report a voice as finished, as a device would.
        pub fn finish(&self, voice: VoiceId) {
            if let Some(tx) = self.ended.lock().unwrap().as_ref() {
                let _ = tx.send(voice);
            }
        }
    }

    pub struct FakeBackend {
        deny_microphone: bool,
        windows: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
        started_tx: mpsc::UnboundedSender<(VoiceId, f64)>,
        output: Arc<Mutex<OutputLog>>,
        mic_released: Arc<AtomicUsize>,
        ended: Arc<Mutex<Option<mpsc::UnboundedSender<VoiceId>>>>,
    }

    impl FakeBackend {
        pub fn new() -> (Self, FakeDevices) {
            let (windows_tx, windows_rx) = mpsc::channel(64);
            let (started_tx, started_rx) = mpsc::unbounded_channel();
            let output = Arc::new(Mutex::new(OutputLog::default()));
            let mic_released = Arc::new(AtomicUsize::new(0));
            let ended = Arc::new(Mutex::new(None));

            let backend = Self {
                deny_microphone: false,
                windows: Mutex::new(Some(windows_rx)),
                started_tx,
                output: output.clone(),
                mic_released: mic_released.clone(),
                ended: ended.clone(),
            };
            let devices = FakeDevices {
                windows: windows_tx,
                started: started_rx,
                output,
                mic_released,
                ended,
            };
            (backend, devices)
        }

        pub fn denying_microphone() -> (Self, FakeDevices) {
            let (mut backend, devices) = Self::new();
            backend.deny_microphone = true;
            (backend, devices)
        }
    }

    impl AudioBackend for FakeBackend {
        fn open_microphone(&self, _sample_rate: u32, _window: usize) -> Result<Microphone> {
            if self.deny_microphone {
                return Err(SessionError::PermissionDenied("denied by test".into()));
            }
            let windows = self
                .windows
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| SessionError::PermissionDenied("microphone busy".into()))?;
            let released = self.mic_released.clone();
            Ok(Microphone {
                windows,
                device: DeviceGuard::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }),
            })
        }

        fn open_speaker(
            &self,
            _sample_rate: u32,
            ended: mpsc::UnboundedSender<VoiceId>,
        ) -> Result<Box<dyn AudioOutput>> {
            *self.ended.lock().unwrap() = Some(ended);
            Ok(Box::new(FakeOutput {
                log: self.output.clone(),
                started_tx: Some(self.started_tx.clone()),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_device_guard_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut guard = DeviceGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        guard.release();
        guard.release();
        assert!(guard.is_released());
        drop(guard);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_guard_releases_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        drop(DeviceGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
