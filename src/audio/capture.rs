use super::resample::{f32_to_i16, StreamResampler};
use super::{
    find_input_device, spawn_device_thread, AudioBlock, AudioError, AudioFormat, BlockProducer,
    DeviceHandle,
};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig, SupportedStreamConfig};

/// Cuts a continuous sample stream into fixed-size blocks.
pub struct BlockAssembler {
    block_size: usize,
    pending: Vec<i16>,
}

impl BlockAssembler {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Append samples, calling `emit` once per completed block.
    ///
    /// `emit` may hand back an emptied buffer to fill next; otherwise a new
    /// one is allocated.
    pub fn push(
        &mut self,
        samples: impl IntoIterator<Item = i16>,
        mut emit: impl FnMut(AudioBlock) -> Option<Vec<i16>>,
    ) {
        for sample in samples {
            self.pending.push(sample);
            if self.pending.len() == self.block_size {
                let full = std::mem::take(&mut self.pending);
                self.pending = match emit(AudioBlock::new(full)) {
                    Some(mut reused) => {
                        reused.clear();
                        reused.reserve(self.block_size);
                        reused
                    }
                    None => Vec::with_capacity(self.block_size),
                };
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Open the input device and stream blocks into `producer` until the handle is released.
pub(crate) fn open_cpal_capture(
    device_name: Option<String>,
    format: AudioFormat,
    producer: BlockProducer,
) -> Result<DeviceHandle, AudioError> {
    let (handle, ()) = spawn_device_thread("capture", move || {
        let host = cpal::default_host();
        let device = find_input_device(&host, device_name.as_deref())?;
        log::info!(
            "🎙️  Capture device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        let supported = select_input_config(&device, format.sample_rate)?;
        let sample_format = supported.sample_format();
        let stream_config = supported.config();

        log::info!(
            "Capture config: {:?}, {} channels @ {}Hz (wire: {}Hz mono, {} samples/block)",
            sample_format,
            stream_config.channels,
            stream_config.sample_rate.0,
            format.sample_rate,
            format.block_size
        );

        let stream = match sample_format {
            SampleFormat::I16 => build_capture_stream::<i16>(&device, &stream_config, format, producer)?,
            SampleFormat::U16 => build_capture_stream::<u16>(&device, &stream_config, format, producer)?,
            SampleFormat::I32 => build_capture_stream::<i32>(&device, &stream_config, format, producer)?,
            SampleFormat::F32 => build_capture_stream::<f32>(&device, &stream_config, format, producer)?,
            other => {
                return Err(AudioError::UnsupportedFormat(format!(
                    "Capture sample format {:?}",
                    other
                )))
            }
        };

        stream.play()?;
        Ok((stream, ()))
    })?;

    Ok(handle)
}

/// Prefer a config that runs natively at the wire rate; otherwise take the
/// device default and resample in the callback.
fn select_input_config(
    device: &cpal::Device,
    sample_rate: u32,
) -> Result<SupportedStreamConfig, AudioError> {
    let native = device.supported_input_configs()?.find(|range| {
        range.min_sample_rate().0 <= sample_rate && range.max_sample_rate().0 >= sample_rate
    });

    match native {
        Some(range) => Ok(range.with_sample_rate(cpal::SampleRate(sample_rate))),
        None => Ok(device.default_input_config()?),
    }
}

fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    format: AudioFormat,
    producer: BlockProducer,
) -> Result<cpal::Stream, AudioError>
where
    T: Sample + SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut resampler = StreamResampler::new(config.sample_rate.0, format.sample_rate)?;
    let mut assembler = BlockAssembler::new(format.block_size);
    let mut mono = Vec::new();
    let mut resampled = Vec::new();
    let mut closed_logged = false;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if producer.is_closed() {
                if !closed_logged {
                    log::debug!("Capture: queue closed, discarding input");
                    closed_logged = true;
                }
                return;
            }

            // First channel only; the wire format is mono.
            mono.clear();
            mono.extend(
                data.chunks(channels)
                    .filter_map(|frame| frame.first())
                    .map(|&s| f32::from_sample(s)),
            );

            resampled.clear();
            resampler.process(&mono, &mut resampled);

            assembler.push(resampled.iter().map(|&s| f32_to_i16(s)), |block| {
                producer.push(block);
                producer.recycled()
            });
        },
        |err| log::warn!("Capture device error (continuing): {}", err),
        None,
    )?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_block_emitted_once() {
        let mut assembler = BlockAssembler::new(1024);
        let mut blocks = Vec::new();
        assembler.push(vec![7i16; 1024], |b| {
            blocks.push(b);
            None
        });
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 1024);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_partial_blocks_carry_over() {
        let mut assembler = BlockAssembler::new(4);
        let mut blocks = Vec::new();
        assembler.push([1, 2, 3], |b| {
            blocks.push(b);
            None
        });
        assert!(blocks.is_empty());
        assembler.push([4, 5, 6, 7, 8, 9], |b| {
            blocks.push(b);
            None
        });

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].samples(), &[1, 2, 3, 4]);
        assert_eq!(blocks[1].samples(), &[5, 6, 7, 8]);
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn test_blocks_flow_into_queue_in_order() {
        let (producer, consumer) = crate::audio::OutboundQueue::with_capacity(8).split();
        let mut assembler = BlockAssembler::new(2);
        assembler.push([1, 2, 3, 4, 5, 6], |b| {
            producer.push(b);
            producer.recycled()
        });

        let tags: Vec<i16> = std::iter::from_fn(|| consumer.pop())
            .map(|b| b.samples()[0])
            .collect();
        assert_eq!(tags, vec![1, 3, 5]);
    }

    #[test]
    fn test_assembler_refills_recycled_buffer() {
        let (producer, consumer) = crate::audio::OutboundQueue::with_capacity(4).split();
        let mut assembler = BlockAssembler::new(4);

        assembler.push([1, 2, 3, 4], |b| {
            producer.push(b);
            producer.recycled()
        });
        let first = consumer.pop().unwrap();
        let first_ptr = first.samples().as_ptr();
        consumer.recycle(first);

        // The next completed block hands the recycled buffer to the assembler,
        // and the block after that is written into it.
        assembler.push([5, 6, 7, 8], |b| {
            producer.push(b);
            producer.recycled()
        });
        assembler.push([9, 10, 11, 12], |b| {
            producer.push(b);
            producer.recycled()
        });

        assert_eq!(consumer.pop().unwrap().samples(), &[5, 6, 7, 8]);
        let third = consumer.pop().unwrap();
        assert_eq!(third.samples(), &[9, 10, 11, 12]);
        assert_eq!(third.samples().as_ptr(), first_ptr);
    }
}
