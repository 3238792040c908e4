//! PulseAudio devices
//!
//! Each device runs on its own OS thread around a blocking `Simple` stream.
//! The thread opens the stream itself and reports the result back before the
//! open call returns, so a refused device surfaces as an error at open time.

use super::{AudioBackend, AudioOutput, DeviceGuard, Microphone, VoiceId};
use crate::codec::AudioBuffer;
use crate::error::{Result, SessionError};
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Granularity of speaker writes. Cancellation takes effect between chunks.
const WRITE_CHUNK: Duration = Duration::from_millis(20);
const SPEAKER_POLL: Duration = Duration::from_millis(20);
/// Audio kept queued on the sound server ahead of the play position.
const PLAYBACK_TARGET: Duration = Duration::from_millis(100);

/// Opens the default (or named) PulseAudio source and sink.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    input_device: Option<String>,
    output_device: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            input_device: None,
            output_device: None,
        }
    }

    pub fn with_devices(mut self, input: Option<String>, output: Option<String>) -> Self {
        self.input_device = input;
        self.output_device = output;
        self
    }
}

fn mono_f32(rate: u32) -> Spec {
    Spec {
        format: Format::F32le,
        channels: 1,
        rate,
    }
}

impl AudioBackend for PulseBackend {
    fn open_microphone(&self, sample_rate: u32, window: usize) -> Result<Microphone> {
        let (tx, rx) = mpsc::channel::<Vec<f32>>(32);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let app_name = self.app_name.clone();
        let device = self.input_device.clone();
        let stop = shutdown.clone();
        std::thread::spawn(move || {
            let spec = mono_f32(sample_rate);
            let simple = match Simple::new(
                None,
                &app_name,
                Direction::Record,
                device.as_deref(),
                "microphone",
                &spec,
                None,
                None,
            ) {
                Ok(simple) => simple,
                Err(e) => {
                    let _ = ready_tx.send(Err(SessionError::PermissionDenied(ToString::to_string(&e))));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            info!(
                "Microphone open ({} Hz, device {})",
                sample_rate,
                device.as_deref().unwrap_or("default")
            );
            run_microphone(simple, window, tx, stop);
        });

        ready_rx
            .recv()
            .map_err(|_| SessionError::PermissionDenied("capture thread exited".to_string()))??;

        Ok(Microphone {
            windows: rx,
            device: DeviceGuard::new(move || {
                shutdown.store(true, Ordering::SeqCst);
                info!("Microphone released");
            }),
        })
    }

    fn open_speaker(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<VoiceId>,
    ) -> Result<Box<dyn AudioOutput>> {
        let app_name = self.app_name.clone();
        let device = self.output_device.clone();
        let speaker = PulseSpeaker::spawn(sample_rate, ended, move || {
            let spec = mono_f32(sample_rate);
            let attr = playback_buffer(sample_rate);
            Simple::new(
                None,
                &app_name,
                Direction::Playback,
                device.as_deref(),
                "tutor voice",
                &spec,
                None,
                Some(&attr),
            )
            .map_err(|e| SessionError::Device(ToString::to_string(&e)))
        })?;
        info!("Speaker open ({} Hz)", sample_rate);
        Ok(Box::new(speaker))
    }
}

/// Keep only about `PLAYBACK_TARGET` of audio queued on the server, so writes
/// block close to real time and a flush has little to discard.
fn playback_buffer(rate: u32) -> BufferAttr {
    let target_samples = (rate as f64 * PLAYBACK_TARGET.as_secs_f64()) as u32;
    BufferAttr {
        maxlength: u32::MAX,
        tlength: target_samples * 4,
        prebuf: u32::MAX,
        minreq: u32::MAX,
        fragsize: u32::MAX,
    }
}

fn run_microphone(
    simple: Simple,
    window: usize,
    tx: mpsc::Sender<Vec<f32>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut bytes = vec![0u8; window * 4];
    while !shutdown.load(Ordering::SeqCst) {
        if let Err(e) = simple.read(&mut bytes) {
            error!("Microphone read failed: {}", e);
            break;
        }
        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if tx.blocking_send(samples).is_err() {
            debug!("Window receiver dropped");
            break;
        }
    }
    info!("Microphone thread finished");
}

enum SpeakerCommand {
    Play {
        voice: VoiceId,
        samples: Vec<f32>,
        start_at: f64,
        generation: u64,
    },
    /// Discard everything already handed to the sound server
    Flush,
    Close,
}

/// Where the playback thread writes samples.
trait PcmSink {
    fn write_samples(&mut self, samples: &[f32]) -> std::result::Result<(), String>;
    /// Drop queued audio that has not been played yet.
    fn discard(&mut self) -> std::result::Result<(), String>;
}

impl PcmSink for Simple {
    fn write_samples(&mut self, samples: &[f32]) -> std::result::Result<(), String> {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Simple::write(self, &bytes).map_err(|e| ToString::to_string(&e))
    }

    fn discard(&mut self) -> std::result::Result<(), String> {
        Simple::flush(self).map_err(|e| ToString::to_string(&e))
    }
}

/// Handle to the playback thread.
///
/// Voices play in sequence on a single stream, so `stop` cuts everything
/// queued before the call rather than individual voices.
pub struct PulseSpeaker {
    commands: std_mpsc::Sender<SpeakerCommand>,
    generation: Arc<AtomicU64>,
    origin: Instant,
    thread: Option<JoinHandle<()>>,
}

impl PulseSpeaker {
    /// Start the playback thread around the sink built by `open`, waiting
    /// until it is open.
    fn spawn<S, F>(sample_rate: u32, ended: mpsc::UnboundedSender<VoiceId>, open: F) -> Result<Self>
    where
        S: PcmSink,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (commands_tx, commands_rx) = std_mpsc::channel::<SpeakerCommand>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);
        let generation = Arc::new(AtomicU64::new(0));
        let origin = Instant::now();

        let current = generation.clone();
        let thread = std::thread::spawn(move || {
            let sink = match open() {
                Ok(sink) => sink,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            SpeakerThread {
                sink,
                sample_rate,
                origin,
                generation: current,
                ended,
                cursor: 0.0,
                pending_ends: Vec::new(),
            }
            .run(commands_rx);
        });

        ready_rx
            .recv()
            .map_err(|_| SessionError::Device("playback thread exited".to_string()))??;

        Ok(Self {
            commands: commands_tx,
            generation,
            origin,
            thread: Some(thread),
        })
    }
}

impl AudioOutput for PulseSpeaker {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start(&mut self, voice: VoiceId, buffer: AudioBuffer, at: f64) -> Result<()> {
        self.commands
            .send(SpeakerCommand::Play {
                voice,
                samples: buffer.samples,
                start_at: at,
                generation: self.generation.load(Ordering::SeqCst),
            })
            .map_err(|_| SessionError::Device("playback thread stopped".to_string()))
    }

    fn stop(&mut self, voices: &[VoiceId]) {
        // Bumping the generation stops a write in progress; the flush drops
        // what the server already holds.
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.commands.send(SpeakerCommand::Flush);
        debug!("Cut {} voice(s)", voices.len());
    }

    fn release(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.commands.send(SpeakerCommand::Close);
        if thread.join().is_err() {
            warn!("Playback thread panicked");
        }
        info!("Speaker released");
    }
}

impl Drop for PulseSpeaker {
    fn drop(&mut self) {
        self.release();
    }
}

struct SpeakerThread<S> {
    sink: S,
    sample_rate: u32,
    origin: Instant,
    generation: Arc<AtomicU64>,
    ended: mpsc::UnboundedSender<VoiceId>,
    /// Timeline position (seconds) up to which audio has been written
    cursor: f64,
    pending_ends: Vec<(VoiceId, f64, u64)>,
}

impl<S: PcmSink> SpeakerThread<S> {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn run(mut self, commands: std_mpsc::Receiver<SpeakerCommand>) {
        loop {
            self.report_ended();
            let result = match commands.recv_timeout(SPEAKER_POLL) {
                Ok(SpeakerCommand::Play {
                    voice,
                    samples,
                    start_at,
                    generation,
                }) => self.play(voice, &samples, start_at, generation),
                Ok(SpeakerCommand::Flush) => self.flush(),
                Ok(SpeakerCommand::Close) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = self.sink.discard();
                    break;
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(()),
            };
            if let Err(e) = result {
                error!("Speaker write failed: {}", e);
                break;
            }
        }
        info!("Playback thread finished");
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn flush(&mut self) -> std::result::Result<(), String> {
        self.sink.discard()?;
        self.cursor = self.now();
        self.pending_ends.clear();
        debug!("Playback flushed");
        Ok(())
    }

    fn play(
        &mut self,
        voice: VoiceId,
        samples: &[f32],
        start_at: f64,
        generation: u64,
    ) -> std::result::Result<(), String> {
        if !self.is_current(generation) {
            return Ok(());
        }

        let rate = self.sample_rate as f64;
        self.cursor = self.cursor.max(self.now());
        if start_at > self.cursor {
            let gap = ((start_at - self.cursor) * rate) as usize;
            self.sink.write_samples(&vec![0.0; gap])?;
            self.cursor = start_at;
        }

        let chunk = ((WRITE_CHUNK.as_secs_f64() * rate) as usize).max(1);
        for part in samples.chunks(chunk) {
            if !self.is_current(generation) {
                // The Flush queued by `stop` follows
                return Ok(());
            }
            self.sink.write_samples(part)?;
            self.cursor += part.len() as f64 / rate;
            self.report_ended();
        }
        self.pending_ends.push((voice, self.cursor, generation));
        Ok(())
    }

    fn report_ended(&mut self) {
        let now = self.now();
        let current = self.generation.load(Ordering::SeqCst);
        let ended = &self.ended;
        self.pending_ends.retain(|&(voice, end_at, generation)| {
            if generation != current {
                return false;
            }
            if end_at <= now {
                let _ = ended.send(voice);
                return false;
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum SinkOp {
        Write(usize),
        Discard,
    }

    /// Accepts writes instantly, like a server with room in its buffer.
    struct RecordingSink(Arc<Mutex<Vec<SinkOp>>>);

    impl PcmSink for RecordingSink {
        fn write_samples(&mut self, samples: &[f32]) -> std::result::Result<(), String> {
            self.0.lock().unwrap().push(SinkOp::Write(samples.len()));
            Ok(())
        }

        fn discard(&mut self) -> std::result::Result<(), String> {
            self.0.lock().unwrap().push(SinkOp::Discard);
            Ok(())
        }
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn written_since_discard(ops: &[SinkOp]) -> usize {
        ops.iter()
            .rev()
            .take_while(|op| **op != SinkOp::Discard)
            .map(|op| match op {
                SinkOp::Write(n) => *n,
                SinkOp::Discard => 0,
            })
            .sum()
    }

    fn speaker() -> (PulseSpeaker, Arc<Mutex<Vec<SinkOp>>>, mpsc::UnboundedReceiver<VoiceId>) {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let sink_ops = ops.clone();
        let speaker =
            PulseSpeaker::spawn(24_000, ended_tx, move || Ok(RecordingSink(sink_ops))).unwrap();
        (speaker, ops, ended_rx)
    }

    #[test]
    fn test_stop_discards_audio_already_written() {
        let (mut speaker, ops, mut ended) = speaker();

        // Three 0.5s voices, all accepted by the sink straight away
        for voice in 0..3u64 {
            let at = voice as f64 * 0.5;
            speaker
                .start(voice, AudioBuffer::new(vec![0.1; 12_000], 24_000), at)
                .unwrap();
        }
        wait_until("all voices written", || {
            written_since_discard(&ops.lock().unwrap()) >= 36_000
        });

        // The thread is idle now; the cut must still reach the server
        speaker.stop(&[0, 1, 2]);
        wait_until("flush", || ops.lock().unwrap().last() == Some(&SinkOp::Discard));

        // The next reply starts now instead of behind the cut audio
        let now = speaker.current_time();
        speaker
            .start(3, AudioBuffer::new(vec![0.1; 2_400], 24_000), now)
            .unwrap();
        wait_until("reply written", || {
            written_since_discard(&ops.lock().unwrap()) >= 2_400
        });
        assert!(written_since_discard(&ops.lock().unwrap()) < 2_400 + 2_400);

        speaker.release();
        let mut reported = Vec::new();
        while let Ok(voice) = ended.try_recv() {
            reported.push(voice);
        }
        assert!(!reported.iter().any(|voice| *voice < 3));
    }

    #[test]
    fn test_voices_report_ended_in_order() {
        let (mut speaker, _ops, mut ended) = speaker();
        speaker
            .start(0, AudioBuffer::new(vec![0.0; 240], 24_000), 0.0)
            .unwrap();
        speaker
            .start(1, AudioBuffer::new(vec![0.0; 240], 24_000), 0.01)
            .unwrap();

        let mut reported = Vec::new();
        wait_until("both voices ended", || {
            while let Ok(voice) = ended.try_recv() {
                reported.push(voice);
            }
            reported.len() == 2
        });
        assert_eq!(reported, vec![0, 1]);
        speaker.release();
    }

    #[test]
    fn test_failed_open_is_reported() {
        let (ended_tx, _ended_rx) = mpsc::unbounded_channel();
        let result = PulseSpeaker::spawn(24_000, ended_tx, || {
            Err::<RecordingSink, _>(SessionError::Device("no sink".into()))
        });
        assert!(matches!(result, Err(SessionError::Device(_))));
    }
}
