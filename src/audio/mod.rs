pub mod collect;
pub mod decode;

pub use collect::{collect_audio_files, collect_files_with_extension, has_extension};
pub use decode::{resample, WavDecoder};

use crate::error::Result;
use std::path::Path;
use std::time::Duration;

/// Extension of the clips handled by every stage.
pub const AUDIO_EXTENSION: &str = "wav";

/// Mono PCM samples normalized to `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Resample to `target_rate`, returning `self` unchanged when rates match.
    pub fn resampled(self, target_rate: u32) -> Self {
        if self.sample_rate == target_rate {
            return self;
        }
        Self {
            samples: resample(&self.samples, self.sample_rate, target_rate),
            sample_rate: target_rate,
        }
    }
}

/// Source of decoded audio for the filter and recognition stages.
pub trait AudioDecoder: Send + Sync {
    /// Duration of the clip, reading as little of the file as possible.
    fn duration(&self, path: &Path) -> Result<Duration>;

    /// Fully decode the clip at its native sample rate.
    fn load(&self, path: &Path) -> Result<DecodedAudio>;
}
