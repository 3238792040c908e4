//! Microphone capture input
//!
//! Turns the microphone's stream of fixed-size sample windows into outbound
//! PCM16 frames. While muted, windows are dropped on the floor: nothing is
//! buffered, so unmuting resumes with the next live window.

use crate::codec::{encode_pcm16, AudioFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default capture window: 4096 samples, about 256 ms at 16 kHz.
pub const DEFAULT_CAPTURE_WINDOW: usize = 4096;

/// Largest accepted capture window: one second at 16 kHz.
pub const MAX_CAPTURE_WINDOW: usize = 16_000;

/// Local mute flag shared between the controller and the capture task.
#[derive(Debug, Clone, Default)]
pub struct MuteSwitch(Arc<AtomicBool>);

impl MuteSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_muted(&self, muted: bool) {
        self.0.store(muted, Ordering::SeqCst);
    }

    /// Flip the flag, returning the new state.
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::SeqCst)
    }
}

pub struct CaptureInput {
    mute: MuteSwitch,
    windows_seen: u64,
    frames_emitted: u64,
}

impl CaptureInput {
    pub fn new(mute: MuteSwitch) -> Self {
        Self {
            mute,
            windows_seen: 0,
            frames_emitted: 0,
        }
    }

    /// Gate and encode one capture window.
    pub fn process_window(&mut self, samples: &[f32]) -> Option<AudioFrame> {
        let seq = self.windows_seen;
        self.windows_seen += 1;

        if self.mute.is_muted() {
            return None;
        }

        self.frames_emitted += 1;
        Some(AudioFrame {
            seq,
            pcm: encode_pcm16(samples),
        })
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Run capture on its own task until the microphone stream ends, the
    /// frame receiver goes away, or the returned handle is stopped.
    pub fn spawn(
        mut self,
        mut windows: mpsc::Receiver<Vec<f32>>,
        frames: mpsc::Sender<AudioFrame>,
    ) -> CaptureHandle {
        let task = tokio::spawn(async move {
            info!("Capture task started");
            while let Some(window) = windows.recv().await {
                let Some(frame) = self.process_window(&window) else {
                    continue;
                };
                if frames.send(frame).await.is_err() {
                    debug!("Frame receiver closed");
                    break;
                }
            }
            info!(
                "Capture task finished ({} windows, {} frames)",
                self.windows_seen, self.frames_emitted
            );
        });
        CaptureHandle { task: Some(task) }
    }
}

/// Owns the running capture task.
pub struct CaptureHandle {
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capturing. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_muted_windows_are_dropped_not_buffered() {
        let mute = MuteSwitch::new();
        let mut capture = CaptureInput::new(mute.clone());

        assert_eq!(capture.process_window(&[0.1; 8]).unwrap().seq, 0);

        mute.set_muted(true);
        for _ in 0..10 {
            assert!(capture.process_window(&[0.2; 8]).is_none());
        }

        mute.set_muted(false);
        let frame = capture.process_window(&[0.3; 8]).unwrap();
        assert_eq!(frame.seq, 11);
        assert_eq!(frame.pcm, encode_pcm16(&[0.3; 8]));
        assert_eq!(capture.frames_emitted(), 2);
    }

    #[test]
    fn test_toggle_returns_new_state() {
        let mute = MuteSwitch::new();
        assert!(mute.toggle());
        assert!(mute.is_muted());
        assert!(!mute.toggle());
        assert!(!mute.is_muted());
    }

    #[tokio::test]
    async fn test_spawned_capture_keeps_order() {
        let (window_tx, window_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        let _handle = CaptureInput::new(MuteSwitch::new()).spawn(window_rx, frame_tx);

        for value in [0.1f32, 0.2, 0.3] {
            window_tx.send(vec![value; 16]).await.unwrap();
        }
        drop(window_tx);

        let mut frames = Vec::new();
        while let Some(frame) = frame_rx.recv().await {
            frames.push(frame);
        }
        let seqs: Vec<u64> = frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(frames[2].pcm, encode_pcm16(&[0.3; 16]));
    }

    #[tokio::test]
    async fn test_spawned_capture_emits_nothing_while_muted() {
        let (window_tx, window_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        let mute = MuteSwitch::new();
        mute.set_muted(true);
        let _handle = CaptureInput::new(mute).spawn(window_rx, frame_tx);

        for _ in 0..5 {
            window_tx.send(vec![0.5; 16]).await.unwrap();
        }
        drop(window_tx);

        assert!(frame_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_ends_capture() {
        let (window_tx, window_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        let mut handle = CaptureInput::new(MuteSwitch::new()).spawn(window_rx, frame_tx);

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());

        // The aborted task drops its frame sender
        assert!(frame_rx.recv().await.is_none());
        drop(window_tx);
    }
}
