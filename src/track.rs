//! Track - time-indexed measurement sequences and the shared frame grid.
//!
//! A [`Track`] is what every analysis algorithm produces: an ordered sequence
//! of `(time, values)` samples over a half-open time domain. A value of
//! `None` is the *undefined marker*, "no reliable estimate" (an unvoiced
//! pitch frame, a missing formant slot, a silent intensity frame). Undefined
//! is a normal result, not an error.
//!
//! # Frame grid
//!
//! All algorithms place their analysis frames on a grid anchored to the
//! *sound*: centers at `half_window + k * time_step`, `k = 0, 1, ...`, as far
//! as a full window fits. A range query selects the grid frames whose center
//! lies inside the half-open range; a point query evaluates the nearest grid
//! frame with the same per-frame routine. Frames of overlapping queries
//! therefore coincide exactly, which is what makes point and batch accessors
//! agree bit-for-bit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// The kind of measurement a track holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Fundamental frequency contour (one value per frame, Hz).
    Pitch,
    /// Formant frequency/bandwidth pairs (2 × nformant values per frame).
    Formants,
    /// Windowed energy contour (one value per frame, dB).
    Intensity,
}

/// One analysis frame of a track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSample {
    /// Frame center time in seconds.
    pub time: f64,
    /// Measured values; `None` marks an undefined slot.
    pub values: Vec<Option<f64>>,
}

/// A time-indexed sequence of computed acoustic measurements.
#[derive(Debug, Clone)]
pub struct Track {
    kind: TrackKind,
    /// Requested half-open domain `[start, end)` in seconds.
    domain: (f64, f64),
    /// Time step between frames.
    time_step: f64,
    samples: Vec<TrackSample>,
}

impl Track {
    pub(crate) fn new(
        kind: TrackKind,
        domain: (f64, f64),
        time_step: f64,
        samples: Vec<TrackSample>,
    ) -> Self {
        Self {
            kind,
            domain,
            time_step,
            samples,
        }
    }

    #[inline]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// The half-open time domain this track was computed over.
    #[inline]
    pub fn domain(&self) -> (f64, f64) {
        self.domain
    }

    #[inline]
    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    #[inline]
    pub fn samples(&self) -> &[TrackSample] {
        &self.samples
    }

    /// Number of frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frame center time of frame `i`.
    pub fn time(&self, i: usize) -> f64 {
        self.samples[i].time
    }

    /// First value of frame `i`; the whole story for pitch and intensity.
    pub fn scalar(&self, i: usize) -> Option<f64> {
        self.samples[i].values.first().copied().flatten()
    }

    /// Formant `n` (1-based) of frame `i` as a (frequency, bandwidth) pair.
    ///
    /// Formant tracks interleave values as `[F1, B1, F2, B2, ...]`; a slot
    /// the algorithm could not fill is undefined.
    pub fn formant(&self, i: usize, n: usize) -> Option<(f64, f64)> {
        if n == 0 {
            return None;
        }
        let values = &self.samples[i].values;
        let freq = values.get(2 * (n - 1)).copied().flatten()?;
        let bw = values.get(2 * (n - 1) + 1).copied().flatten()?;
        Some((freq, bw))
    }

    /// Index of the frame whose center is nearest to `time`, within half a
    /// time step of the track's frames.
    pub fn nearest_index(&self, time: f64) -> Option<usize> {
        if self.samples.is_empty() {
            return None;
        }
        let idx_float = (time - self.samples[0].time) / self.time_step;
        if idx_float < -0.5 || idx_float > self.samples.len() as f64 - 0.5 {
            return None;
        }
        Some((idx_float.round() as usize).min(self.samples.len() - 1))
    }
}

/// Cooperative cancellation flag for long-running analyses.
///
/// Algorithms check the token between frames; a set token makes the call
/// fail with [`Error::Cancelled`](crate::error::Error::Cancelled) without
/// producing a partial track. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every analysis holding a clone of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Validate a half-open analysis domain against a sound's duration.
pub(crate) fn check_domain(t0: f64, t1: f64, duration: f64) -> Result<()> {
    if !t0.is_finite() || !t1.is_finite() || t0 < 0.0 || t1 > duration || t0 >= t1 {
        return Err(Error::Range(format!(
            "analysis range [{t0}, {t1}) invalid for sound of duration {duration}"
        )));
    }
    Ok(())
}

/// The sound-anchored frame grid shared by all analysis algorithms.
///
/// Centers sit at `half_window + k * time_step` for `k >= 0`, as long as the
/// full analysis window fits inside the signal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameGrid {
    /// Center time of frame 0.
    first: f64,
    /// Spacing between frame centers.
    time_step: f64,
    /// Total frames that fit in the sound.
    total: usize,
}

impl FrameGrid {
    pub(crate) fn new(duration: f64, window_duration: f64, time_step: f64) -> Self {
        let total = if window_duration > duration {
            0
        } else {
            ((duration - window_duration) / time_step + 1e-9).floor() as usize + 1
        };
        Self {
            first: window_duration / 2.0,
            time_step,
            total,
        }
    }

    #[inline]
    pub(crate) fn time_step(&self) -> f64 {
        self.time_step
    }

    #[inline]
    pub(crate) fn time(&self, k: usize) -> f64 {
        self.first + k as f64 * self.time_step
    }

    /// Grid indices whose center lies in the half-open range `[t0, t1)`.
    pub(crate) fn indices_in(&self, t0: f64, t1: f64) -> std::ops::Range<usize> {
        if self.total == 0 {
            return 0..0;
        }
        let lo = ((t0 - self.first) / self.time_step - 1e-9).ceil().max(0.0) as usize;
        let hi = ((t1 - self.first) / self.time_step - 1e-9).ceil().max(0.0) as usize;
        lo.min(self.total)..hi.min(self.total)
    }

    /// Grid index nearest to `time`, within half a step of the grid.
    pub(crate) fn nearest(&self, time: f64) -> Option<usize> {
        if self.total == 0 {
            return None;
        }
        let idx_float = (time - self.first) / self.time_step;
        if idx_float < -0.5 || idx_float > self.total as f64 - 0.5 {
            return None;
        }
        Some((idx_float.round().max(0.0) as usize).min(self.total - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_fits_frames_inside_signal() {
        // 1s signal, 0.1s window: centers from 0.05 to 0.95 every 0.01
        let grid = FrameGrid::new(1.0, 0.1, 0.01);
        assert_eq!(grid.time(0), 0.05);
        let last = grid.indices_in(0.0, 1.0).end - 1;
        assert!(grid.time(last) <= 0.95 + 1e-9);
    }

    #[test]
    fn grid_empty_when_window_exceeds_signal() {
        let grid = FrameGrid::new(0.05, 0.1, 0.01);
        assert_eq!(grid.indices_in(0.0, 0.05).len(), 0);
        assert!(grid.nearest(0.02).is_none());
    }

    #[test]
    fn range_selection_is_half_open() {
        let grid = FrameGrid::new(1.0, 0.1, 0.01);
        // Frame centers are 0.05 + k*0.01; [0.05, 0.07) holds exactly two.
        let r = grid.indices_in(0.05, 0.07);
        assert_eq!(r.len(), 2);
        assert!((grid.time(r.start) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn overlapping_ranges_share_grid_indices() {
        let grid = FrameGrid::new(2.0, 0.04, 0.01);
        let a = grid.indices_in(0.5, 1.5);
        let b = grid.indices_in(1.0, 2.0);
        // Common span must map to the same indices (hence same frames).
        assert!(a.end > b.start);
        for k in b.start..a.end {
            assert!(a.contains(&k) && b.contains(&k));
        }
    }

    #[test]
    fn nearest_clamps_and_bounds() {
        let grid = FrameGrid::new(1.0, 0.1, 0.01);
        assert_eq!(grid.nearest(0.05), Some(0));
        assert_eq!(grid.nearest(0.0501), Some(0));
        assert_eq!(grid.nearest(0.046), Some(0));
        assert!(grid.nearest(-1.0).is_none());
        assert!(grid.nearest(5.0).is_none());
    }

    #[test]
    fn formant_accessor_reads_interleaved_pairs() {
        let track = Track::new(
            TrackKind::Formants,
            (0.0, 1.0),
            0.01,
            vec![TrackSample {
                time: 0.05,
                values: vec![Some(500.0), Some(80.0), None, None],
            }],
        );
        assert_eq!(track.formant(0, 1), Some((500.0, 80.0)));
        assert_eq!(track.formant(0, 2), None);
        assert_eq!(track.formant(0, 0), None);
    }

    #[test]
    fn cancel_token_is_shared() {
        let t = CancelToken::new();
        let u = t.clone();
        assert!(!u.is_cancelled());
        t.cancel();
        assert!(u.is_cancelled());
    }
}
