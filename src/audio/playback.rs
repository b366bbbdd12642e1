//! Playback sink backed by a cpal output stream
//!
//! The cpal stream lives on its own thread and drains a sample queue the
//! receiver fills. The queue length doubles as the latency measurement
//! the resampler steers on.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::sink::AudioSink;
use crate::error::AudioError;

/// Upper bound on queued audio; older samples are dropped beyond it
const MAX_QUEUE_MS: u64 = 200;

/// Name fragments of virtual audio cables (VB-Cable, BlackHole)
const VIRTUAL_CABLE_NAMES: &[&str] = &["cable input", "blackhole"];

/// True when an output device routes into a virtual microphone
pub fn is_virtual_cable(device_name: &str) -> bool {
    let name = device_name.to_lowercase();
    VIRTUAL_CABLE_NAMES.iter().any(|cable| name.contains(cable))
}

/// Whether received audio reaches the device or is replaced by silence.
///
/// A virtual cable always gets the audio; speakers only while monitoring.
pub fn passes_audio(monitoring: bool, using_cable: bool) -> bool {
    monitoring || using_cable
}

/// Find an output device by name. Without a name a virtual cable is
/// preferred, falling back to the host default.
pub fn find_output_device(device_id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    match device_id {
        None => {
            let cable = host.output_devices().ok().and_then(|mut devices| {
                devices.find(|d| d.name().map(|n| is_virtual_cable(&n)).unwrap_or(false))
            });
            match cable {
                Some(device) => Ok(device),
                None => host
                    .default_output_device()
                    .ok_or_else(|| AudioError::DeviceNotFound("No default output device".into())),
            }
        }
        Some(id) => host
            .output_devices()
            .map_err(|e| AudioError::CpalError(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(id.to_string())),
    }
}

/// Running output stream thread
struct StreamThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// [`AudioSink`] that plays through a cpal output device
pub struct CpalSink {
    device_id: Option<String>,
    /// When off, speakers get silence in place of the audio
    monitoring: AtomicBool,
    /// Set once the opened device is a virtual cable
    using_cable: AtomicBool,
    queue: Arc<Mutex<VecDeque<i16>>>,
    format: Mutex<Option<(u32, u8)>>,
    stream: Mutex<Option<StreamThread>>,
    error_tx: Sender<AudioError>,
    error_rx: Receiver<AudioError>,
    underruns: Arc<AtomicU64>,
    overflows: AtomicU64,
}

impl CpalSink {
    pub fn new(device_id: Option<String>, monitoring: bool) -> Self {
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        Self {
            device_id,
            monitoring: AtomicBool::new(monitoring),
            using_cable: AtomicBool::new(false),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            format: Mutex::new(None),
            stream: Mutex::new(None),
            error_tx,
            error_rx,
            underruns: Arc::new(AtomicU64::new(0)),
            overflows: AtomicU64::new(0),
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Relaxed)
    }

    /// True when the opened device is a virtual cable
    pub fn is_using_cable(&self) -> bool {
        self.using_cable.load(Ordering::Relaxed)
    }

    /// Output callbacks that found the queue empty
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Samples discarded because the queue was full
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Check for stream errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    fn start_stream(&self, sample_rate: u32, channels: u8) -> Result<StreamThread, AudioError> {
        let device = find_output_device(self.device_id.as_deref())?;
        let device_name = device.name().unwrap_or_default();
        self.using_cable
            .store(is_virtual_cable(&device_name), Ordering::Relaxed);
        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let queue = self.queue.clone();
        let underruns = self.underruns.clone();
        let error_tx = self.error_tx.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut queue = queue.lock();
                        let mut starved = false;
                        for out in data.iter_mut() {
                            *out = match queue.pop_front() {
                                Some(sample) => sample as f32 / 32768.0,
                                None => {
                                    starved = true;
                                    0.0
                                }
                            };
                        }
                        if starved {
                            underruns.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let mut thread = StreamThread {
            running,
            handle: Some(handle),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(thread),
            Ok(Err(e)) => {
                thread.stop();
                Err(e)
            }
            Err(_) => {
                thread.stop();
                Err(AudioError::StreamError("Playback thread exited".into()))
            }
        }
    }

    fn queue_capacity(&self) -> usize {
        match *self.format.lock() {
            Some((rate, channels)) => (rate as u64 * channels as u64 * MAX_QUEUE_MS / 1000) as usize,
            None => 0,
        }
    }
}

impl CpalSink {
    fn restart(&self, sample_rate: u32, channels: u8) -> Result<(), AudioError> {
        let mut stream = self.stream.lock();
        if stream.is_some() && *self.format.lock() == Some((sample_rate, channels)) {
            return Ok(());
        }

        if let Some(mut old) = stream.take() {
            old.stop();
        }
        self.queue.lock().clear();

        let started = self.start_stream(sample_rate, channels)?;
        *stream = Some(started);
        *self.format.lock() = Some((sample_rate, channels));

        tracing::info!(
            "Playback started: {}Hz, {} channel(s), device {}{}",
            sample_rate,
            channels,
            self.device_id.as_deref().unwrap_or("default"),
            if self.is_using_cable() { " (virtual cable)" } else { "" }
        );
        Ok(())
    }
}

impl AudioSink for CpalSink {
    fn prepare(&self, sample_rate: u32, channels: u8) -> Result<(), AudioError> {
        // Reopening joins the old stream thread and waits for the new one
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.restart(sample_rate, channels))
            }
            _ => self.restart(sample_rate, channels),
        }
    }

    fn write(&self, pcm: &[u8]) {
        let capacity = self.queue_capacity();
        if capacity == 0 {
            return;
        }
        let audible = passes_audio(self.is_monitoring(), self.is_using_cable());

        let mut queue = self.queue.lock();
        for chunk in pcm.chunks_exact(2) {
            let sample = if audible {
                i16::from_le_bytes([chunk[0], chunk[1]])
            } else {
                0
            };
            queue.push_back(sample);
        }

        if queue.len() > capacity {
            let excess = queue.len() - capacity;
            queue.drain(..excess);
            self.overflows.fetch_add(excess as u64, Ordering::Relaxed);
        }
    }

    fn queued_duration_ms(&self) -> u64 {
        let Some((rate, channels)) = *self.format.lock() else {
            return 0;
        };
        let per_second = (rate as u64 * channels as u64).max(1);
        self.queue.lock().len() as u64 * 1000 / per_second
    }

    fn flush(&self) {
        self.queue.lock().clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.lock().take() {
            stream.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unprepared_sink_reports_empty() {
        let sink = CpalSink::new(None, true);
        sink.write(&[0, 1, 2, 3]);
        assert_eq!(sink.queued_duration_ms(), 0);
        assert!(sink.check_errors().is_none());
    }

    #[test]
    fn test_virtual_cable_names() {
        assert!(is_virtual_cable("CABLE Input (VB-Audio Virtual Cable)"));
        assert!(is_virtual_cable("cable input"));
        assert!(is_virtual_cable("BlackHole 2ch"));
        assert!(!is_virtual_cable("Speakers (Realtek High Definition Audio)"));
        assert!(!is_virtual_cable("CABLE Output (VB-Audio Virtual Cable)"));
    }

    #[test]
    fn test_cable_receives_audio_without_monitoring() {
        assert!(passes_audio(false, true));
        assert!(passes_audio(true, true));
        assert!(passes_audio(true, false));
        // speakers stay silent unless monitoring
        assert!(!passes_audio(false, false));
    }

    #[test]
    fn test_playback_creation() {
        // Only meaningful on machines with an output device
        let sink = CpalSink::new(None, false);
        if find_output_device(None).is_ok() {
            let _ = sink.prepare(48000, 2);
        }
        sink.flush();
        assert!(!sink.is_monitoring());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prepare_on_runtime_worker() {
        let sink = CpalSink::new(Some("no such device".into()), true);
        let result = sink.prepare(48000, 1);
        assert!(matches!(result, Err(AudioError::DeviceNotFound(_)) | Err(AudioError::CpalError(_))));
    }

    #[tokio::test]
    async fn test_prepare_on_current_thread_runtime() {
        let sink = CpalSink::new(Some("no such device".into()), true);
        assert!(sink.prepare(48000, 1).is_err());
        assert_eq!(sink.queued_duration_ms(), 0);
    }
}
