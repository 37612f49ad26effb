//! Sound - the immutable sample buffer all analyses read from.
//!
//! A `Sound` holds one or more channels of PCM samples at a common sample
//! rate. It is immutable once constructed and carries a process-unique
//! identity, which is what the track cache keys on. Sounds are shared behind
//! `Arc` between the annotation that is bound to them and any number of
//! concurrent analysis invocations; analyses only ever take `&Sound`, so
//! "no algorithm mutates audio" holds structurally.
//!
//! # Sample format
//!
//! Samples are stored as 64-bit floats. Integer WAV formats are normalized
//! to [-1.0, 1.0] on load by dividing by 2^(bits-1); float formats are
//! loaded as-is.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use ndarray::Array1;

use crate::error::{Error, Result};

static NEXT_SOUND_ID: AtomicU64 = AtomicU64::new(1);

/// Immutable multichannel PCM signal with a sample rate.
///
/// # Example
///
/// ```no_run
/// use phonolab::Sound;
///
/// let sound = Sound::from_file("speech.wav").unwrap();
/// println!("{} channels, {:.3}s", sound.channel_count(), sound.duration());
/// ```
#[derive(Debug)]
pub struct Sound {
    /// One sample array per channel; all channels have equal length.
    channels: Vec<Array1<f64>>,
    /// Sample rate in Hz.
    sample_rate: f64,
    /// Process-unique identity, assigned at construction.
    id: u64,
    /// Channel average for analysis, computed on first use.
    mixdown: OnceLock<Array1<f64>>,
}

impl Sound {
    /// Create a Sound from per-channel sample arrays.
    ///
    /// # Errors
    ///
    /// `Parameter` if there are no channels, the channels have unequal
    /// lengths, or the sample rate is not a positive finite number.
    pub fn new(channels: Vec<Array1<f64>>, sample_rate: f64) -> Result<Self> {
        if channels.is_empty() {
            return Err(Error::Parameter("sound must have at least one channel".into()));
        }
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(Error::Parameter("all channels must have the same length".into()));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(Error::Parameter(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        Ok(Self {
            channels,
            sample_rate,
            id: NEXT_SOUND_ID.fetch_add(1, Ordering::Relaxed),
            mixdown: OnceLock::new(),
        })
    }

    /// Create a mono Sound from a slice of samples.
    pub fn from_mono(samples: &[f64], sample_rate: f64) -> Result<Self> {
        Self::new(vec![Array1::from_vec(samples.to_vec())], sample_rate)
    }

    /// Load all channels from a WAV file.
    ///
    /// WAV files store interleaved samples `[L0, R0, L1, R1, ...]`; they are
    /// de-interleaved into per-channel arrays here.
    ///
    /// # Errors
    ///
    /// `AudioRead` if the file cannot be read or is not a valid WAV file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let n_channels = spec.channels as usize;
        let sample_rate = spec.sample_rate as f64;

        let interleaved: Vec<f64> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .map(|s| s.map(|v| v as f64))
                .collect::<std::result::Result<Vec<f64>, _>>()?,
            hound::SampleFormat::Int => {
                // max_val = 2^(bits-1), e.g. 32768 for 16-bit audio
                let bits = spec.bits_per_sample;
                let max_val = (1i64 << (bits - 1)) as f64;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f64 / max_val))
                    .collect::<std::result::Result<Vec<f64>, _>>()?
            }
        };

        let frames = interleaved.len() / n_channels;
        let mut channels = vec![Vec::with_capacity(frames); n_channels];
        for (i, &sample) in interleaved.iter().enumerate() {
            channels[i % n_channels].push(sample);
        }

        Self::new(channels.into_iter().map(Array1::from_vec).collect(), sample_rate)
    }

    /// Process-unique identity of this buffer.
    ///
    /// Two loads of the same file get distinct identities; the cache treats
    /// them as distinct sounds.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sample rate in Hz.
    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Number of channels.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of samples per channel.
    #[inline]
    pub fn n_frames(&self) -> usize {
        self.channels[0].len()
    }

    /// Total duration in seconds: `n_frames / sample_rate`.
    #[inline]
    pub fn duration(&self) -> f64 {
        self.n_frames() as f64 / self.sample_rate
    }

    /// Sample period in seconds (1 / sample_rate).
    #[inline]
    pub fn dx(&self) -> f64 {
        1.0 / self.sample_rate
    }

    /// Samples of one channel.
    pub fn channel(&self, index: usize) -> Result<&Array1<f64>> {
        self.channels.get(index).ok_or_else(|| {
            Error::Parameter(format!(
                "channel {index} does not exist, sound has {} channels",
                self.channels.len()
            ))
        })
    }

    /// The mono analysis view as a contiguous slice.
    pub(crate) fn analysis_slice(&self) -> &[f64] {
        self.analysis_samples()
            .as_slice()
            .expect("sample storage is contiguous")
    }

    /// The mono view the analysis algorithms read.
    ///
    /// Channel 0 for mono sounds; for multichannel sounds, the per-sample
    /// channel average, computed once on first use. The buffer is immutable,
    /// so the cached mixdown never goes stale.
    pub fn analysis_samples(&self) -> &Array1<f64> {
        if self.channels.len() == 1 {
            return &self.channels[0];
        }
        self.mixdown.get_or_init(|| {
            let n = self.n_frames();
            let scale = 1.0 / self.channels.len() as f64;
            let mut mix = vec![0.0; n];
            for channel in &self.channels {
                for (acc, &s) in mix.iter_mut().zip(channel.iter()) {
                    *acc += s;
                }
            }
            for v in mix.iter_mut() {
                *v *= scale;
            }
            Array1::from_vec(mix)
        })
    }
}

impl std::fmt::Display for Sound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sound#{}({} ch, {} samples, {} Hz, {:.3}s)",
            self.id,
            self.channel_count(),
            self.n_frames(),
            self.sample_rate,
            self.duration()
        )
    }
}
