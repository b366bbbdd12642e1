//! Microphone capture for the sending side
//!
//! The cpal input stream runs on a dedicated thread and turns each
//! callback buffer into an [`AudioPacket`] on a shared packet queue.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::buffer::SharedPacketQueue;
use crate::codec::pcm::float_to_i16;
use crate::constants::DEFAULT_SAMPLE_RATE;
use crate::error::AudioError;
use crate::protocol::{AudioFormat, AudioPacket};

/// Find an input device by name, or the host default
pub fn find_input_device(device_id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    match device_id {
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".into())),
        Some(id) => host
            .input_devices()
            .map_err(|e| AudioError::CpalError(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(id.to_string())),
    }
}

/// Convert a float callback buffer into a 16-bit packet
fn pcm16_packet(data: &[f32], sample_rate: u32, channels: u8) -> AudioPacket {
    let mut buffer = Vec::with_capacity(data.len() * 2);
    for &sample in data {
        buffer.extend_from_slice(&float_to_i16(sample).to_le_bytes());
    }
    AudioPacket::new(buffer, sample_rate, channels, AudioFormat::Pcm16)
}

/// Audio capture from a single input device
pub struct AudioCapture {
    device_id: Option<String>,

    running: Arc<AtomicBool>,

    output: SharedPacketQueue,

    thread_handle: Option<JoinHandle<()>>,

    error_rx: Option<Receiver<AudioError>>,

    /// Packets produced since start
    packets_captured: Arc<AtomicU64>,

    config: StreamConfig,
}

impl AudioCapture {
    /// Create a capture for the named device (or the default one)
    pub fn new(
        device_id: Option<&str>,
        sample_rate: Option<u32>,
        channels: Option<u8>,
        output: SharedPacketQueue,
    ) -> Result<Self, AudioError> {
        let device = find_input_device(device_id)?;
        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::CpalError(e.to_string()))?;

        let channels = channels
            .map(u16::from)
            .unwrap_or_else(|| default_config.channels().min(2));
        if !(1..=2).contains(&channels) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} capture channels",
                channels
            )));
        }

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self::with_config(device_id.map(str::to_string), config, output))
    }

    fn with_config(device_id: Option<String>, config: StreamConfig, output: SharedPacketQueue) -> Self {
        Self {
            device_id,
            running: Arc::new(AtomicBool::new(false)),
            output,
            thread_handle: None,
            error_rx: None,
            packets_captured: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Start capturing audio
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = find_input_device(self.device_id.as_deref())?;
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let output = self.output.clone();
        let packets_captured = self.packets_captured.clone();
        let config = self.config.clone();
        let sample_rate = self.config.sample_rate.0;
        let channels = self.config.channels as u8;

        self.packets_captured.store(0, Ordering::SeqCst);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) || data.is_empty() {
                            return;
                        }
                        packets_captured.fetch_add(1, Ordering::Relaxed);
                        // A full queue drops the packet
                        let _ = output.push(pcm16_packet(data, sample_rate, channels));
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
                    thread::sleep(std::time::Duration::from_millis(10));
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::StreamError(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("Capture thread exited".into())));
        self.settle_start(ready)
    }

    /// Keep the stream on success, otherwise wind the thread down
    fn settle_start(&mut self, ready: Result<(), AudioError>) -> Result<(), AudioError> {
        if let Err(e) = ready {
            tracing::error!("Failed to start capture stream: {}", e);
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn packets_captured(&self) -> u64 {
        self.packets_captured.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    pub fn channels(&self) -> u8 {
        self.config.channels as u8
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_queue;

    #[test]
    fn test_pcm16_packet_layout() {
        let packet = pcm16_packet(&[0.5, -1.0], 44100, 2);
        assert_eq!(packet.format, AudioFormat::Pcm16);
        assert_eq!(packet.buffer.len(), 4);
        assert_eq!(&packet.buffer[2..], &(-32767i16).to_le_bytes());
        assert_eq!(packet.sample_rate, 44100);
        assert_eq!(packet.frames(), 1);
    }

    #[test]
    fn test_failed_start_clears_running() {
        let config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(48000),
            buffer_size: cpal::BufferSize::Default,
        };
        let mut capture = AudioCapture::with_config(None, config, create_shared_queue(4));
        capture.running.store(true, Ordering::SeqCst);
        capture.thread_handle = Some(thread::spawn(|| {}));

        let result = capture.settle_start(Err(AudioError::StreamError("unsupported config".into())));
        assert!(matches!(result, Err(AudioError::StreamError(_))));
        assert!(!capture.is_running());
        assert!(capture.thread_handle.is_none());
    }

    #[test]
    fn test_capture_creation() {
        // May fail on CI/systems without audio devices
        if find_input_device(None).is_err() {
            return;
        }
        let capture = AudioCapture::new(None, Some(48000), Some(1), create_shared_queue(64));
        if let Ok(capture) = capture {
            assert_eq!(capture.channels(), 1);
            assert!(!capture.is_running());
        }
    }
}
