use std::path::Path;
use std::time::Duration;

use hound::{SampleFormat, WavReader};
use tracing::debug;

use crate::error::{EmotagError, Result};

use super::{AudioDecoder, DecodedAudio};

/// WAV decoder backed by `hound`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavDecoder;

impl WavDecoder {
    pub fn new() -> Self {
        Self
    }
}

fn open(path: &Path) -> Result<WavReader<std::io::BufReader<std::fs::File>>> {
    WavReader::open(path)
        .map_err(|e| EmotagError::Decode(format!("{}: {}", path.display(), e)))
}

impl AudioDecoder for WavDecoder {
    fn duration(&self, path: &Path) -> Result<Duration> {
        let reader = open(path)?;
        let spec = reader.spec();
        if spec.sample_rate == 0 {
            return Err(EmotagError::Decode(format!(
                "{}: zero sample rate",
                path.display()
            )));
        }

        // `duration()` counts frames, independent of the channel count.
        let frames = reader.duration();
        Ok(Duration::from_secs_f64(
            frames as f64 / spec.sample_rate as f64,
        ))
    }

    fn load(&self, path: &Path) -> Result<DecodedAudio> {
        let reader = open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        debug!(
            "Decoding {}: {} Hz, {} channels, {} bits",
            path.display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        );

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1) as u32)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
            }
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>(),
        }
        .map_err(|e| EmotagError::Decode(format!("{}: {}", path.display(), e)))?;

        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        };

        Ok(DecodedAudio {
            samples,
            sample_rate: spec.sample_rate,
        })
    }
}

/// Linear-interpolation resampler.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};
    use tempfile::TempDir;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for _ in 0..channels {
                writer.write_sample(((i % 100) as i16) * 100).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_duration_mono_and_stereo() {
        let dir = TempDir::new().unwrap();
        let mono = dir.path().join("mono.wav");
        let stereo = dir.path().join("stereo.wav");
        write_wav(&mono, 8000, 1, 8000 * 2);
        write_wav(&stereo, 8000, 2, 8000 * 3);

        let decoder = WavDecoder::new();
        assert_eq!(decoder.duration(&mono).unwrap(), Duration::from_secs(2));
        assert_eq!(decoder.duration(&stereo).unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_load_downmixes_and_normalizes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 8000, 2, 800);

        let audio = WavDecoder::new().load(&path).unwrap();
        assert_eq!(audio.sample_rate, 8000);
        assert_eq!(audio.samples.len(), 800);
        assert!(audio.samples.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"definitely not a riff file").unwrap();

        let result = WavDecoder::new().load(&path);
        assert!(matches!(result, Err(EmotagError::Decode(_))));
        assert!(WavDecoder::new().duration(&path).is_err());
    }

    #[test]
    fn test_resample_length_and_identity() {
        let samples: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        assert_eq!(resample(&samples, 48000, 48000), samples);
        assert_eq!(resample(&samples, 48000, 16000).len(), 160);
        assert_eq!(resample(&samples, 8000, 16000).len(), 960);
        assert!(resample(&[], 8000, 16000).is_empty());
    }

    #[test]
    fn test_resample_interpolates() {
        let out = resample(&[0.0, 1.0], 1, 2);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert_eq!(out[3], 1.0);
    }
}
