//! Pitch - fundamental frequency estimation by normalized autocorrelation.
//!
//! Documentation sources:
//! - Boersma (1993): "Accurate short-term analysis of the fundamental
//!   frequency and the harmonics-to-noise ratio of a sampled sound"
//!   (autocorrelation normalization, Eq. 9)
//!
//! Each frame is analyzed independently: the frame is Hann-windowed, its
//! autocorrelation is divided by the window's own autocorrelation, and the
//! strongest peak inside the admissible lag range wins. A frame whose peak
//! strength falls below `voicing_threshold` is reported as undefined
//! (unvoiced) rather than as a low-confidence frequency. No cross-frame
//! smoothing or octave-jump correction is applied; ambiguous periodicity is
//! resolved per frame only, with a small constant bias toward the
//! higher-frequency candidate when subharmonic peaks tie.

use crate::error::{Error, Result};
use crate::sound::Sound;
use crate::track::{check_domain, CancelToken, FrameGrid, Track, TrackKind, TrackSample};

/// Analysis window length in periods of `minimum_pitch`.
const PERIODS_PER_WINDOW: f64 = 3.0;

/// Within-frame tie-break (Boersma Eq. 24): a periodic signal peaks equally
/// at every multiple of its period, so candidate selection slightly favors
/// the higher-frequency candidate. Voicing is still judged on the raw
/// strength.
const OCTAVE_BIAS: f64 = 0.01;

/// Parameters for pitch analysis.
///
/// Unsupplied parameters take the documented defaults via `Default`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchParams {
    /// Time step between frames in seconds; 0 = auto (0.75 / minimum_pitch).
    pub time_step: f64,
    /// Lowest admissible frequency in Hz. Also sets the window length.
    pub minimum_pitch: f64,
    /// Highest admissible frequency in Hz.
    pub maximum_pitch: f64,
    /// Peaks weaker than this are reported as unvoiced (0-1].
    pub voicing_threshold: f64,
}

impl Default for PitchParams {
    fn default() -> Self {
        Self {
            time_step: 0.0,
            minimum_pitch: 75.0,
            maximum_pitch: 600.0,
            voicing_threshold: 0.45,
        }
    }
}

impl PitchParams {
    /// Validate against a sound, before any frame is processed.
    pub fn validate(&self, sound: &Sound) -> Result<()> {
        let nyquist = sound.sample_rate() / 2.0;
        if !self.time_step.is_finite() || self.time_step < 0.0 {
            return Err(Error::Parameter(format!(
                "time_step must be >= 0, got {}",
                self.time_step
            )));
        }
        if !self.minimum_pitch.is_finite() || self.minimum_pitch <= 0.0 {
            return Err(Error::Parameter(format!(
                "minimum_pitch must be positive, got {}",
                self.minimum_pitch
            )));
        }
        if !self.maximum_pitch.is_finite() || self.minimum_pitch >= self.maximum_pitch {
            return Err(Error::Parameter(format!(
                "minimum_pitch ({}) must be below maximum_pitch ({})",
                self.minimum_pitch, self.maximum_pitch
            )));
        }
        if self.maximum_pitch > nyquist {
            return Err(Error::Parameter(format!(
                "maximum_pitch ({}) exceeds the Nyquist frequency ({nyquist})",
                self.maximum_pitch
            )));
        }
        if !self.voicing_threshold.is_finite()
            || self.voicing_threshold <= 0.0
            || self.voicing_threshold > 1.0
        {
            return Err(Error::Parameter(format!(
                "voicing_threshold must be in (0, 1], got {}",
                self.voicing_threshold
            )));
        }
        Ok(())
    }

    /// The time step actually used, resolving 0 to the documented default.
    pub fn effective_time_step(&self) -> f64 {
        if self.time_step <= 0.0 {
            0.75 / self.minimum_pitch
        } else {
            self.time_step
        }
    }
}

/// Per-sound analysis setup shared by batch and point queries.
struct PitchAnalyzer<'a> {
    samples: &'a [f64],
    sample_rate: f64,
    grid: FrameGrid,
    window: Vec<f64>,
    /// Autocorrelation of the window itself, for Boersma normalization.
    window_ac: Vec<f64>,
    min_lag: usize,
    max_lag: usize,
    minimum_pitch: f64,
    voicing_threshold: f64,
}

impl<'a> PitchAnalyzer<'a> {
    fn new(sound: &'a Sound, params: &PitchParams) -> Self {
        let sample_rate = sound.sample_rate();
        let window_duration = PERIODS_PER_WINDOW / params.minimum_pitch;

        let min_lag = (sample_rate / params.maximum_pitch).ceil() as usize;
        let max_lag = (sample_rate / params.minimum_pitch).floor() as usize;

        let mut window_samples = (window_duration * sample_rate).round() as usize;
        if window_samples % 2 == 0 {
            window_samples += 1;
        }

        let window = hann_window(window_samples);
        let window_ac = autocorrelation(&window, max_lag);

        Self {
            samples: sound.analysis_slice(),
            sample_rate,
            grid: FrameGrid::new(sound.duration(), window_duration, params.effective_time_step()),
            window,
            window_ac,
            min_lag,
            max_lag,
            minimum_pitch: params.minimum_pitch,
            voicing_threshold: params.voicing_threshold,
        }
    }

    /// Estimate the frequency at grid frame `k`; `None` means unvoiced.
    fn frame(&self, k: usize) -> Option<f64> {
        let t = self.grid.time(k);
        let frame = extract_frame(self.samples, t, self.sample_rate, self.window.len());

        let windowed: Vec<f64> = frame
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| s * w)
            .collect();
        let r = autocorrelation(&windowed, self.max_lag);
        if r[0] <= 0.0 {
            return None; // silent frame
        }

        // Boersma Eq. 9: divide the signal autocorrelation by the window's.
        let mut r_norm = vec![0.0; self.max_lag + 1];
        for lag in 0..=self.max_lag {
            if self.window_ac[lag] > 0.0 {
                r_norm[lag] = (r[lag] / r[0]) / (self.window_ac[lag] / self.window_ac[0]);
            }
        }

        // (frequency, raw strength, biased strength)
        let mut best: Option<(f64, f64, f64)> = None;
        for lag in self.min_lag.max(1)..self.max_lag.min(r_norm.len() - 1) {
            if r_norm[lag] > r_norm[lag - 1] && r_norm[lag] > r_norm[lag + 1] {
                let (freq, strength) = refine_peak(&r_norm, lag, self.sample_rate);
                let biased = strength + OCTAVE_BIAS * (freq / self.minimum_pitch).log2();
                if best.map_or(true, |(_, _, b)| biased > b) {
                    best = Some((freq, strength, biased));
                }
            }
        }

        match best {
            Some((freq, strength, _)) if strength >= self.voicing_threshold => Some(freq),
            _ => None,
        }
    }
}

/// Compute a pitch track over the half-open range `[t0, t1)`.
///
/// Frames lie on the sound-anchored grid, so tracks computed over
/// overlapping ranges agree exactly on their shared frames, as does
/// [`pitch_at`].
pub fn pitch_track(sound: &Sound, t0: f64, t1: f64, params: &PitchParams) -> Result<Track> {
    pitch_track_cancellable(sound, t0, t1, params, &CancelToken::new())
}

/// [`pitch_track`] with a cooperative cancellation check between frames.
pub fn pitch_track_cancellable(
    sound: &Sound,
    t0: f64,
    t1: f64,
    params: &PitchParams,
    cancel: &CancelToken,
) -> Result<Track> {
    params.validate(sound)?;
    check_domain(t0, t1, sound.duration())?;

    let analyzer = PitchAnalyzer::new(sound, params);
    let indices = analyzer.grid.indices_in(t0, t1);

    let mut samples = Vec::with_capacity(indices.len());
    for k in indices {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        samples.push(TrackSample {
            time: analyzer.grid.time(k),
            values: vec![analyzer.frame(k)],
        });
    }

    Ok(Track::new(
        TrackKind::Pitch,
        (t0, t1),
        analyzer.grid.time_step(),
        samples,
    ))
}

/// Pitch at a single time: the frequency of the nearest grid frame, or
/// `None` if that frame is unvoiced or no frame covers the time.
///
/// Agrees bit-for-bit with [`pitch_track`] for the same parameter set.
pub fn pitch_at(sound: &Sound, time: f64, params: &PitchParams) -> Result<Option<f64>> {
    params.validate(sound)?;
    if !time.is_finite() || time < 0.0 || time > sound.duration() {
        return Err(Error::Range(format!(
            "time {time} outside sound [0, {}]",
            sound.duration()
        )));
    }

    let analyzer = PitchAnalyzer::new(sound, params);
    Ok(analyzer.grid.nearest(time).and_then(|k| analyzer.frame(k)))
}

/// Hann window of length `n`.
fn hann_window(n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Autocorrelation of `samples` for lags 0..=max_lag.
fn autocorrelation(samples: &[f64], max_lag: usize) -> Vec<f64> {
    let n = samples.len();
    let mut r = vec![0.0; max_lag + 1];
    for lag in 0..=max_lag.min(n.saturating_sub(1)) {
        r[lag] = samples[..n - lag]
            .iter()
            .zip(samples[lag..].iter())
            .map(|(&a, &b)| a * b)
            .sum();
    }
    r
}

/// Parabolic interpolation around a local maximum for sub-sample lag
/// precision. The raw (uninterpolated) peak height is kept as the strength
/// to avoid overshoot.
fn refine_peak(r: &[f64], lag: usize, sample_rate: f64) -> (f64, f64) {
    let r_prev = r[lag - 1];
    let r_curr = r[lag];
    let r_next = r[lag + 1];

    let denom = r_prev - 2.0 * r_curr + r_next;
    if denom.abs() > 1e-10 {
        let delta = 0.5 * (r_prev - r_next) / denom;
        if delta.abs() < 1.0 {
            return (sample_rate / (lag as f64 + delta), r_curr);
        }
    }
    (sample_rate / lag as f64, r_curr)
}

/// Extract `len` samples centered on time `t`, zero-padding past the edges.
pub(crate) fn extract_frame(samples: &[f64], t: f64, sample_rate: f64, len: usize) -> Vec<f64> {
    let n = samples.len();
    let center = (t * sample_rate).round() as isize;
    let start = center - (len / 2) as isize;

    let mut frame = vec![0.0; len];
    let src_start = start.max(0) as usize;
    let src_end = ((start + len as isize).min(n as isize)).max(0) as usize;
    if src_start < src_end {
        let dst_start = (src_start as isize - start) as usize;
        frame[dst_start..dst_start + (src_end - src_start)]
            .copy_from_slice(&samples[src_start..src_end]);
    }
    frame
}
