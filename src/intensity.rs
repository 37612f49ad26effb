//! Intensity - windowed energy contour in dB.
//!
//! Short-time weighted mean-square amplitude per frame, converted to
//! decibels against the standard auditory reference pressure squared
//! (4 x 10^-10 Pa^2), so values are comparable in absolute terms across
//! sounds digitized at the same scale.
//!
//! The analysis window is Gaussian; its length is tied to `minimum_pitch`
//! so that at least a few periods of the lowest expected voice frequency
//! fall inside every frame (lower minimum_pitch = longer window = smoother
//! contour). The frame mean is subtracted before windowing so a DC offset
//! cannot inflate the measurement.
//!
//! A frame with no energy after DC removal has no meaningful level on a dB
//! scale and is reported as undefined.

use crate::error::{Error, Result};
use crate::pitch::extract_frame;
use crate::sound::Sound;
use crate::track::{check_domain, CancelToken, FrameGrid, Track, TrackKind, TrackSample};

/// Reference pressure squared: (2 x 10^-5 Pa)^2, the SPL reference in air.
const REFERENCE_POWER: f64 = 4e-10;

/// Gaussian window shape parameter.
const WINDOW_ALPHA: f64 = 13.2;

/// Physical window duration in periods of `minimum_pitch`.
const PERIODS_PER_WINDOW: f64 = 7.2;

/// Parameters for intensity analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityParams {
    /// Time step between frames in seconds; 0 = auto (0.8 / minimum_pitch).
    pub time_step: f64,
    /// Lowest expected voice frequency in Hz; sets the window length.
    pub minimum_pitch: f64,
}

impl Default for IntensityParams {
    fn default() -> Self {
        Self {
            time_step: 0.0,
            minimum_pitch: 100.0,
        }
    }
}

impl IntensityParams {
    /// Validate before any frame is processed.
    pub fn validate(&self) -> Result<()> {
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
        Ok(())
    }

    /// The time step actually used, resolving 0 to the documented default.
    pub fn effective_time_step(&self) -> f64 {
        if self.time_step <= 0.0 {
            0.8 / self.minimum_pitch
        } else {
            self.time_step
        }
    }
}

struct IntensityAnalyzer<'a> {
    samples: &'a [f64],
    sample_rate: f64,
    grid: FrameGrid,
    window: Vec<f64>,
    window_sum: f64,
}

impl<'a> IntensityAnalyzer<'a> {
    fn new(sound: &'a Sound, params: &IntensityParams) -> Self {
        let sample_rate = sound.sample_rate();
        let window_duration = PERIODS_PER_WINDOW / params.minimum_pitch;

        let mut window_samples = (window_duration * sample_rate).round() as usize;
        if window_samples % 2 == 0 {
            window_samples += 1;
        }

        let window = gauss_window(window_samples, WINDOW_ALPHA);
        let window_sum = window.iter().sum();

        Self {
            samples: sound.analysis_slice(),
            sample_rate,
            grid: FrameGrid::new(sound.duration(), window_duration, params.effective_time_step()),
            window,
            window_sum,
        }
    }

    /// Level in dB at grid frame `k`; `None` for a frame with no energy.
    fn frame(&self, k: usize) -> Option<f64> {
        let t = self.grid.time(k);
        let mut frame = extract_frame(self.samples, t, self.sample_rate, self.window.len());

        // DC removal: measure only the varying component.
        let mean: f64 = frame.iter().sum::<f64>() / frame.len() as f64;
        for s in frame.iter_mut() {
            *s -= mean;
        }

        let mean_square: f64 = frame
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| s * s * w)
            .sum::<f64>()
            / self.window_sum;

        if mean_square <= 0.0 {
            None
        } else {
            Some(10.0 * (mean_square / REFERENCE_POWER).log10())
        }
    }
}

/// Compute an intensity track over the half-open range `[t0, t1)`.
pub fn intensity_track(
    sound: &Sound,
    t0: f64,
    t1: f64,
    params: &IntensityParams,
) -> Result<Track> {
    intensity_track_cancellable(sound, t0, t1, params, &CancelToken::new())
}

/// [`intensity_track`] with a cooperative cancellation check between frames.
pub fn intensity_track_cancellable(
    sound: &Sound,
    t0: f64,
    t1: f64,
    params: &IntensityParams,
    cancel: &CancelToken,
) -> Result<Track> {
    params.validate()?;
    check_domain(t0, t1, sound.duration())?;

    let analyzer = IntensityAnalyzer::new(sound, params);
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
        TrackKind::Intensity,
        (t0, t1),
        analyzer.grid.time_step(),
        samples,
    ))
}

/// Intensity at a single time: the nearest grid frame's level in dB.
///
/// Agrees bit-for-bit with [`intensity_track`] for the same parameter set.
pub fn intensity_at(sound: &Sound, time: f64, params: &IntensityParams) -> Result<Option<f64>> {
    params.validate()?;
    if !time.is_finite() || time < 0.0 || time > sound.duration() {
        return Err(Error::Range(format!(
            "time {time} outside sound [0, {}]",
            sound.duration()
        )));
    }

    let analyzer = IntensityAnalyzer::new(sound, params);
    Ok(analyzer.grid.nearest(time).and_then(|k| analyzer.frame(k)))
}

/// Gaussian window with edge subtraction, zero at the edges and one at the
/// center:
///
/// ```text
/// w(x) = (exp(-a x^2) - exp(-a)) / (1 - exp(-a)),  x in [-1, 1]
/// ```
fn gauss_window(n: usize, alpha: f64) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0];
    }
    let mid = (n - 1) as f64 / 2.0;
    let edge = (-alpha).exp();
    let norm = 1.0 - edge;
    (0..n)
        .map(|i| {
            let x = (i as f64 - mid) / mid;
            ((-alpha * x * x).exp() - edge) / norm
        })
        .collect()
}
