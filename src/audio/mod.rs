pub mod capture;
pub mod mock;
pub mod playback;
pub mod queue;
pub mod resample;

pub use capture::BlockAssembler;
pub use mock::MockAudioBackend;
pub use playback::{CpalPlayback, PlaybackSink};
pub use queue::{BlockConsumer, BlockProducer, OutboundQueue};
pub use resample::StreamResampler;

use cpal::traits::{DeviceTrait, HostTrait};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Resampling error: {0}")]
    Resampling(String),

    #[error("Audio device is closed")]
    Closed,
}

impl From<cpal::DevicesError> for AudioError {
    fn from(err: cpal::DevicesError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::Stream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AudioError::Stream(err.to_string())
    }
}

/// Wire audio format: mono, signed 16-bit little-endian PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    /// Samples per captured block.
    pub block_size: usize,
}

impl AudioFormat {
    pub const CHANNELS: u16 = 1;

    /// Duration of one block at this sample rate.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            block_size: 1024,
        }
    }
}

/// One block of mono samples, produced in a single capture tick.
///
/// Blocks are moved, never shared: the capture callback gives up ownership
/// when it pushes into the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlock {
    samples: Vec<i16>,
}

impl AudioBlock {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Decode a little-endian PCM payload. A trailing odd byte is ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self { samples }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Local audio hardware, as seen by a session.
///
/// Both devices are opened when a connection becomes active and released
/// before the session leaves that state.
pub trait AudioBackend: Send + Sync + 'static {
    /// Start capturing; every completed block is pushed into `producer`.
    fn open_capture(
        &self,
        format: &AudioFormat,
        producer: BlockProducer,
    ) -> Result<DeviceHandle, AudioError>;

    fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn PlaybackSink>, AudioError>;
}

/// Scoped ownership of an open device. Releases it on `close` or drop.
pub struct DeviceHandle {
    label: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceHandle {
    pub fn new(label: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn close(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            log::debug!("{}: releasing device", self.label);
            release();
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("label", &self.label)
            .field("open", &self.release.is_some())
            .finish()
    }
}

/// Run a cpal stream on its own thread.
///
/// cpal streams are not `Send`, so the stream is built, played and dropped on
/// a dedicated thread. `build` returns the stream plus whatever the caller
/// needs back (e.g. the producer half of a ring buffer). The returned handle
/// stops the thread and joins it.
pub(crate) fn spawn_device_thread<T, F>(label: &str, build: F) -> Result<(DeviceHandle, T), AudioError>
where
    F: FnOnce() -> Result<(cpal::Stream, T), AudioError> + Send + 'static,
    T: Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let thread_label = label.to_string();

    let thread = thread::Builder::new()
        .name(format!("{}-device", label))
        .spawn(move || {
            let stream = match build() {
                Ok((stream, value)) => {
                    if ready_tx.send(Ok(value)).is_err() {
                        return;
                    }
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Returns on an explicit stop or when the handle is dropped.
            let _ = stop_rx.recv();
            drop(stream);
            log::debug!("{}: device thread exiting", thread_label);
        })
        .map_err(|e| AudioError::Device(format!("Failed to spawn {} thread: {}", label, e)))?;

    match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
        Ok(Ok(value)) => {
            let thread_label = label.to_string();
            let handle = DeviceHandle::new(label, move || {
                let _ = stop_tx.send(());
                if thread.join().is_err() {
                    log::error!("{}: device thread panicked", thread_label);
                }
            });
            Ok((handle, value))
        }
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => Err(AudioError::Device(format!(
            "Timed out opening {} device",
            label
        ))),
    }
}

pub(crate) fn find_input_device(
    host: &cpal::Host,
    name: Option<&str>,
) -> Result<cpal::Device, AudioError> {
    match name {
        Some(name) => host
            .input_devices()?
            .find(|dev| dev.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::Device(format!("Input device '{}' not found", name))),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::Device("No default input device available".to_string())),
    }
}

pub(crate) fn find_output_device(
    host: &cpal::Host,
    name: Option<&str>,
) -> Result<cpal::Device, AudioError> {
    match name {
        Some(name) => host
            .output_devices()?
            .find(|dev| dev.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::Device(format!("Output device '{}' not found", name))),
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::Device("No default output device available".to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// Enumerate input and output devices on the default host.
pub fn list_devices() -> Result<(Vec<AudioDeviceInfo>, Vec<AudioDeviceInfo>), AudioError> {
    let host = cpal::default_host();
    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let collect = |devices: Vec<cpal::Device>, default: &Option<String>| {
        devices
            .into_iter()
            .filter_map(|d| d.name().ok())
            .map(|name| AudioDeviceInfo {
                is_default: default.as_deref() == Some(name.as_str()),
                name,
            })
            .collect::<Vec<_>>()
    };

    let inputs = collect(host.input_devices()?.collect(), &default_input);
    let outputs = collect(host.output_devices()?.collect(), &default_output);
    Ok((inputs, outputs))
}

/// Backend for the host's real audio devices.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub playback_buffer_ms: u32,
}

impl AudioBackend for CpalBackend {
    fn open_capture(
        &self,
        format: &AudioFormat,
        producer: BlockProducer,
    ) -> Result<DeviceHandle, AudioError> {
        capture::open_cpal_capture(self.input_device.clone(), *format, producer)
    }

    fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn PlaybackSink>, AudioError> {
        let sink = CpalPlayback::open(
            self.output_device.clone(),
            *format,
            self.playback_buffer_ms,
        )?;
        Ok(Box::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_block_byte_conversion() {
        let block = AudioBlock::new(vec![i16::MIN, -1, 0, 1, i16::MAX]);
        let bytes = block.to_le_bytes();
        assert_eq!(bytes.len(), 10);
        assert_eq!(AudioBlock::from_le_bytes(&bytes), block);
    }

    #[test]
    fn test_from_le_bytes_ignores_trailing_byte() {
        let block = AudioBlock::from_le_bytes(&[0x01, 0x00, 0xff]);
        assert_eq!(block.samples(), &[1]);
    }

    #[test]
    fn test_default_format() {
        let format = AudioFormat::default();
        assert_eq!(format.sample_rate, 24_000);
        assert_eq!(format.block_size, 1024);
        let ms = format.block_duration().as_secs_f64() * 1000.0;
        assert!((ms - 42.666).abs() < 0.01);
    }

    #[test]
    fn test_device_handle_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let handle = DeviceHandle::new("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        handle.close();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_handle_releases_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&released);
            let _handle = DeviceHandle::new("test", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
