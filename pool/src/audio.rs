//! Audio decoding for recognizer backends.
//!
//! Reads WAV input and converts it to 16kHz mono f32, the format speech models expect.

use anyhow::{Context, Result};
use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler};
use std::path::Path;

/// Target sample rate for speech recognition models.
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Input chunk size used when resampling whole files.
const RESAMPLE_CHUNK: usize = 1024;

/// Audio buffer containing mono f32 samples at a known sample rate.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Create a new audio buffer.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration of the buffer in seconds.
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Convert multi-channel interleaved samples to mono by averaging all channels.
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resampler for converting audio between sample rates.
pub struct AudioResampler {
    resampler: Fft<f32>,
    chunk_size_in: usize,
}

impl AudioResampler {
    /// Create a new resampler.
    ///
    /// # Arguments
    /// * `input_rate` - Input sample rate in Hz
    /// * `output_rate` - Output sample rate in Hz
    /// * `chunk_size` - Number of input samples per processing chunk
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        let resampler = Fft::new(
            input_rate as usize,
            output_rate as usize,
            chunk_size,
            1, // sub_chunks
            1, // channels
            FixedSync::Input,
        )
        .context("Failed to create resampler")?;

        Ok(Self {
            resampler,
            chunk_size_in: chunk_size,
        })
    }

    /// Resample audio data. Input length must be a multiple of chunk_size.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let mut output = Vec::new();

        for chunk in input.chunks_exact(self.chunk_size_in) {
            let input_vecs = vec![chunk.to_vec()];
            let input_adapter = SequentialSliceOfVecs::new(&input_vecs, 1, chunk.len())
                .ok()
                .context("Invalid resampler input")?;
            let resampled = self
                .resampler
                .process(&input_adapter, 0, None)
                .context("Resampling failed")?;

            for frame_idx in 0..resampled.frames() {
                output.push(resampled.read_sample(0, frame_idx).unwrap_or(0.0));
            }
        }

        Ok(output)
    }
}

/// Read a WAV file as mono f32 at its native sample rate.
pub fn load_wav(path: impl AsRef<Path>) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .context("Failed to decode float samples")?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .context("Failed to decode integer samples")?
        }
    };

    Ok(AudioBuffer::new(
        to_mono(&interleaved, spec.channels),
        spec.sample_rate,
    ))
}

/// Read a WAV file and convert it to 16kHz mono.
pub fn load_for_recognition(path: impl AsRef<Path>) -> Result<AudioBuffer> {
    let buffer = load_wav(path)?;
    if buffer.sample_rate == TARGET_SAMPLE_RATE || buffer.samples.is_empty() {
        return Ok(AudioBuffer::new(buffer.samples, TARGET_SAMPLE_RATE));
    }

    let mut resampler = AudioResampler::new(buffer.sample_rate, TARGET_SAMPLE_RATE, RESAMPLE_CHUNK)?;
    let mut samples = buffer.samples;
    let remainder = samples.len() % RESAMPLE_CHUNK;
    if remainder != 0 {
        samples.resize(samples.len() + RESAMPLE_CHUNK - remainder, 0.0);
    }
    let resampled = resampler.process(&samples)?;
    Ok(AudioBuffer::new(resampled, TARGET_SAMPLE_RATE))
}

#[cfg(test)]
#[path = "audio_test.rs"]
mod tests;
