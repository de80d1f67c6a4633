use super::AudioError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Input frames handed to the sinc resampler per call (10 ms at 48 kHz).
pub const RESAMPLE_CHUNK: usize = 480;

/// Mono sample-rate converter fed with arbitrarily sized buffers.
///
/// Input is buffered up to the fixed chunk size `SincFixedIn` requires; the
/// band-limited sinc filter keeps content above the output Nyquist rate from
/// folding back into the signal. Equal rates pass samples straight through.
pub struct StreamResampler {
    inner: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
    output: Vec<Vec<f32>>,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, AudioError> {
        if input_rate == output_rate {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
                output: Vec::new(),
            });
        }

        let ratio = output_rate as f64 / input_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
            .map_err(|e| AudioError::Resampling(e.to_string()))?;

        log::debug!(
            "🔄 Resampler: {}Hz → {}Hz (ratio: {:.3})",
            input_rate,
            output_rate,
            ratio
        );

        let output = vec![vec![0.0; resampler.output_frames_max()]];
        Ok(Self {
            inner: Some(resampler),
            pending: Vec::with_capacity(RESAMPLE_CHUNK * 2),
            output,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Resample `input`, appending whatever complete chunks produce to `output`.
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        let Some(resampler) = self.inner.as_mut() else {
            output.extend_from_slice(input);
            return;
        };

        self.pending.extend_from_slice(input);
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            match resampler.process_into_buffer(&[&self.pending[..needed]], &mut self.output, None) {
                Ok((read, written)) => {
                    output.extend_from_slice(&self.output[0][..written]);
                    self.pending.drain(..read);
                }
                Err(e) => {
                    log::warn!("Resampling error, dropping {} samples: {}", self.pending.len(), e);
                    self.pending.clear();
                    break;
                }
            }
        }
    }
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}
