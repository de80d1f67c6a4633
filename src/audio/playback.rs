use super::resample::{i16_to_f32, StreamResampler};
use super::{find_output_device, spawn_device_thread, AudioError, AudioFormat, DeviceHandle};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};

/// Destination for inbound audio, written in arrival order.
///
/// `write` must not block on the device: underruns are the device layer's
/// problem and are filled with silence there.
pub trait PlaybackSink: Send {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError>;
}

/// Output device fed through a lock-free ring buffer.
pub struct CpalPlayback {
    producer: HeapProd<f32>,
    resampler: StreamResampler,
    channels: usize,
    mono: Vec<f32>,
    resampled: Vec<f32>,
    dropped_samples: u64,
    // Stops the output stream when the sink is dropped.
    _device: DeviceHandle,
}

struct OutputInfo {
    producer: HeapProd<f32>,
    sample_rate: u32,
    channels: usize,
}

impl CpalPlayback {
    pub fn open(
        device_name: Option<String>,
        format: AudioFormat,
        buffer_ms: u32,
    ) -> Result<Self, AudioError> {
        let (device, info) = spawn_device_thread("playback", move || {
            let host = cpal::default_host();
            let device = find_output_device(&host, device_name.as_deref())?;
            log::info!(
                "🔊 Playback device: {}",
                device.name().unwrap_or_else(|_| "unknown".to_string())
            );

            let supported = device.default_output_config()?;
            let sample_format = supported.sample_format();
            let config = supported.config();
            let channels = config.channels.max(1) as usize;
            let sample_rate = config.sample_rate.0;

            log::info!(
                "Playback config: {:?}, {} channels @ {}Hz (wire: {}Hz mono)",
                sample_format,
                channels,
                sample_rate,
                format.sample_rate
            );

            let capacity = ((sample_rate as usize * channels * buffer_ms.max(100) as usize) / 1000)
                .max(channels);
            let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

            let stream = match sample_format {
                SampleFormat::I16 => build_playback_stream::<i16>(&device, &config, consumer)?,
                SampleFormat::U16 => build_playback_stream::<u16>(&device, &config, consumer)?,
                SampleFormat::I32 => build_playback_stream::<i32>(&device, &config, consumer)?,
                SampleFormat::F32 => build_playback_stream::<f32>(&device, &config, consumer)?,
                other => {
                    return Err(AudioError::UnsupportedFormat(format!(
                        "Playback sample format {:?}",
                        other
                    )))
                }
            };
            stream.play()?;

            Ok((
                stream,
                OutputInfo {
                    producer,
                    sample_rate,
                    channels,
                },
            ))
        })?;

        Ok(Self {
            producer: info.producer,
            resampler: StreamResampler::new(format.sample_rate, info.sample_rate)?,
            channels: info.channels,
            mono: Vec::with_capacity(format.block_size),
            resampled: Vec::new(),
            dropped_samples: 0,
            _device: device,
        })
    }
}

impl PlaybackSink for CpalPlayback {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        self.mono.clear();
        self.mono.extend(samples.iter().map(|&s| i16_to_f32(s)));
        self.resampled.clear();
        self.resampler.process(&self.mono, &mut self.resampled);

        let channels = self.channels;
        let mut pushed = 0usize;
        'frames: for &sample in &self.resampled {
            if self.producer.vacant_len() < channels {
                break 'frames;
            }
            for _ in 0..channels {
                if self.producer.try_push(sample).is_err() {
                    break 'frames;
                }
            }
            pushed += 1;
        }

        let dropped = self.resampled.len() - pushed;
        if dropped > 0 {
            self.dropped_samples += dropped as u64;
            log::warn!(
                "Playback buffer full, dropped {} samples ({} total)",
                dropped,
                self.dropped_samples
            );
        }
        Ok(())
    }
}

fn build_playback_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: ringbuf::HeapCons<f32>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // Silence on underrun.
            for out in data.iter_mut() {
                *out = T::from_sample(consumer.try_pop().unwrap_or(0.0));
            }
        },
        |err| log::warn!("Playback device error (continuing): {}", err),
        None,
    )?;
    Ok(stream)
}
