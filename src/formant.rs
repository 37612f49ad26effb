//! Formant - vocal-tract resonance estimation by linear prediction.
//!
//! Documentation sources:
//! - Childers (1978): "Modern Spectrum Analysis", pp. 252-255 (Burg's method)
//! - Numerical Recipes ch. 9.5 (root polishing)
//! - Markel & Gray (1976): root-to-formant conversion
//!
//! Pipeline per frame: fit an LPC model of order `lpc_order` to the
//! Gaussian-windowed, pre-emphasized signal with Burg's recursion; factor
//! the prediction-error polynomial via companion-matrix QR iteration; keep
//! each root with positive imaginary part whose frequency is inside the
//! admissible band and whose bandwidth is below the plausibility ceiling;
//! report the `nformant` lowest-frequency (frequency, bandwidth) pairs in
//! ascending order. Slots with fewer admissible roots than requested are
//! undefined.
//!
//! The signal is first resampled to twice `maximum_frequency`, which puts
//! the highest formant of interest at the Nyquist frequency of the analyzed
//! signal.

use num_complex::Complex64;
use rubato::{FftFixedIn, Resampler};

use crate::error::{Error, Result};
use crate::pitch::extract_frame;
use crate::sound::Sound;
use crate::track::{check_domain, CancelToken, FrameGrid, Track, TrackKind, TrackSample};

/// Gaussian window shape parameter for formant frames.
const WINDOW_ALPHA: f64 = 12.0;

/// Roots closer than this to 0 Hz or to `maximum_frequency` are discarded
/// as pre-emphasis and resampling artifacts.
const FREQUENCY_MARGIN: f64 = 50.0;

/// Parameters for formant analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct FormantParams {
    /// Time step between frames in seconds; 0 = auto (window_length / 4).
    pub time_step: f64,
    /// Number of formant slots to report per frame.
    pub nformant: usize,
    /// Order of the linear-prediction model.
    pub lpc_order: usize,
    /// Window length parameter in seconds; the physical window is twice this.
    pub window_length: f64,
    /// Highest formant frequency of interest in Hz; the signal is resampled
    /// to twice this value.
    pub maximum_frequency: f64,
    /// Roots with a larger bandwidth are rejected as implausible formants.
    pub maximum_bandwidth: f64,
    /// Pre-emphasis onset frequency in Hz, compensating the glottal
    /// spectral roll-off; 0 disables pre-emphasis.
    pub pre_emphasis_from: f64,
}

impl Default for FormantParams {
    fn default() -> Self {
        Self {
            time_step: 0.0,
            nformant: 5,
            lpc_order: 10,
            window_length: 0.025,
            maximum_frequency: 5500.0,
            maximum_bandwidth: 400.0,
            pre_emphasis_from: 50.0,
        }
    }
}

impl FormantParams {
    /// Validate before any frame is processed.
    pub fn validate(&self) -> Result<()> {
        if !self.time_step.is_finite() || self.time_step < 0.0 {
            return Err(Error::Parameter(format!(
                "time_step must be >= 0, got {}",
                self.time_step
            )));
        }
        if self.nformant == 0 {
            return Err(Error::Parameter("nformant must be at least 1".into()));
        }
        if self.lpc_order == 0 {
            return Err(Error::Parameter("lpc_order must be positive".into()));
        }
        if !self.window_length.is_finite() || self.window_length <= 0.0 {
            return Err(Error::Parameter(format!(
                "window_length must be positive, got {}",
                self.window_length
            )));
        }
        if !self.maximum_frequency.is_finite() || self.maximum_frequency <= 2.0 * FREQUENCY_MARGIN {
            return Err(Error::Parameter(format!(
                "maximum_frequency must exceed {} Hz, got {}",
                2.0 * FREQUENCY_MARGIN,
                self.maximum_frequency
            )));
        }
        if !self.maximum_bandwidth.is_finite() || self.maximum_bandwidth <= 0.0 {
            return Err(Error::Parameter(format!(
                "maximum_bandwidth must be positive, got {}",
                self.maximum_bandwidth
            )));
        }
        if !self.pre_emphasis_from.is_finite() || self.pre_emphasis_from < 0.0 {
            return Err(Error::Parameter(format!(
                "pre_emphasis_from must be >= 0, got {}",
                self.pre_emphasis_from
            )));
        }
        Ok(())
    }

    /// The time step actually used, resolving 0 to the documented default.
    pub fn effective_time_step(&self) -> f64 {
        if self.time_step <= 0.0 {
            self.window_length / 4.0
        } else {
            self.time_step
        }
    }
}

/// Per-sound setup: resampled, pre-emphasized signal plus the frame grid.
struct FormantAnalyzer {
    samples: Vec<f64>,
    sample_rate: f64,
    grid: FrameGrid,
    window: Vec<f64>,
    nformant: usize,
    lpc_order: usize,
    maximum_frequency: f64,
    maximum_bandwidth: f64,
}

impl FormantAnalyzer {
    fn new(sound: &Sound, params: &FormantParams) -> Self {
        let original_rate = sound.sample_rate();

        // Resample so maximum_frequency sits at the analyzed Nyquist.
        let target_rate = 2.0 * params.maximum_frequency;
        let (mut samples, sample_rate) = if target_rate < original_rate {
            (
                resample(sound.analysis_slice(), original_rate, target_rate),
                target_rate,
            )
        } else {
            (sound.analysis_slice().to_vec(), original_rate)
        };

        // Pre-emphasis: x'[i] = x[i] - a x[i-1], a = exp(-2 pi F dt).
        if params.pre_emphasis_from > 0.0 {
            let alpha =
                (-2.0 * std::f64::consts::PI * params.pre_emphasis_from / sample_rate).exp();
            for i in (1..samples.len()).rev() {
                samples[i] -= alpha * samples[i - 1];
            }
        }

        let physical_window = 2.0 * params.window_length;
        let mut window_samples = (physical_window * sample_rate).round() as usize;
        if window_samples % 2 == 0 {
            window_samples += 1;
        }

        Self {
            samples,
            sample_rate,
            grid: FrameGrid::new(sound.duration(), physical_window, params.effective_time_step()),
            window: gauss_window(window_samples, WINDOW_ALPHA),
            nformant: params.nformant,
            lpc_order: params.lpc_order,
            maximum_frequency: params.maximum_frequency,
            maximum_bandwidth: params.maximum_bandwidth,
        }
    }

    /// Formant slots for grid frame `k`, interleaved `[F1, B1, F2, B2, ...]`.
    fn frame(&self, k: usize) -> Vec<Option<f64>> {
        let t = self.grid.time(k);
        let frame = extract_frame(&self.samples, t, self.sample_rate, self.window.len());

        let windowed: Vec<f64> = frame
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| s * w)
            .collect();

        let coeffs = burg_lpc(&windowed, self.lpc_order);
        let roots = lpc_roots(&coeffs);
        let pairs = roots_to_formants(
            &roots,
            self.sample_rate,
            FREQUENCY_MARGIN,
            self.maximum_frequency - FREQUENCY_MARGIN,
            self.maximum_bandwidth,
        );

        let mut values = Vec::with_capacity(2 * self.nformant);
        for n in 0..self.nformant {
            match pairs.get(n) {
                Some(&(freq, bw)) => {
                    values.push(Some(freq));
                    values.push(Some(bw));
                }
                None => {
                    values.push(None);
                    values.push(None);
                }
            }
        }
        values
    }
}

/// Compute a formant track over the half-open range `[t0, t1)`.
///
/// Each frame holds `2 * nformant` values, interleaved
/// `[F1, B1, F2, B2, ...]`; use [`Track::formant`] to read pairs.
pub fn formant_track(sound: &Sound, t0: f64, t1: f64, params: &FormantParams) -> Result<Track> {
    formant_track_cancellable(sound, t0, t1, params, &CancelToken::new())
}

/// [`formant_track`] with a cooperative cancellation check between frames.
pub fn formant_track_cancellable(
    sound: &Sound,
    t0: f64,
    t1: f64,
    params: &FormantParams,
    cancel: &CancelToken,
) -> Result<Track> {
    params.validate()?;
    check_domain(t0, t1, sound.duration())?;

    let analyzer = FormantAnalyzer::new(sound, params);
    let indices = analyzer.grid.indices_in(t0, t1);

    let mut samples = Vec::with_capacity(indices.len());
    for k in indices {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        samples.push(TrackSample {
            time: analyzer.grid.time(k),
            values: analyzer.frame(k),
        });
    }

    Ok(Track::new(
        TrackKind::Formants,
        (t0, t1),
        analyzer.grid.time_step(),
        samples,
    ))
}

/// Formants at a single time: the nearest grid frame's slots as
/// `nformant` optional (frequency, bandwidth) pairs.
///
/// Agrees bit-for-bit with [`formant_track`] for the same parameter set.
pub fn formants_at(
    sound: &Sound,
    time: f64,
    params: &FormantParams,
) -> Result<Vec<Option<(f64, f64)>>> {
    params.validate()?;
    if !time.is_finite() || time < 0.0 || time > sound.duration() {
        return Err(Error::Range(format!(
            "time {time} outside sound [0, {}]",
            sound.duration()
        )));
    }

    let analyzer = FormantAnalyzer::new(sound, params);
    let values = match analyzer.grid.nearest(time) {
        Some(k) => analyzer.frame(k),
        None => vec![None; 2 * params.nformant],
    };
    Ok(values
        .chunks(2)
        .map(|pair| match (pair[0], pair[1]) {
            (Some(f), Some(b)) => Some((f, b)),
            _ => None,
        })
        .collect())
}

/// Gaussian window for formant frames.
fn gauss_window(n: usize, alpha: f64) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0];
    }
    let mid = (n - 1) as f64 / 2.0;
    (0..n)
        .map(|i| {
            let x = (i as f64 - mid) / mid;
            (-alpha * x * x).exp()
        })
        .collect()
}

/// LPC coefficients by Burg's recursion; returns `a[0..=order]`, `a[0] = 1`.
fn burg_lpc(samples: &[f64], order: usize) -> Vec<f64> {
    let n = samples.len();
    if n <= order {
        return vec![0.0; order + 1];
    }

    let mut a = vec![0.0; order + 1];
    a[0] = 1.0;

    // Forward and backward prediction errors.
    let mut ef: Vec<f64> = samples.to_vec();
    let mut eb: Vec<f64> = samples.to_vec();

    for k in 1..=order {
        let mut num = 0.0;
        let mut den = 0.0;
        for i in k..n {
            num += ef[i] * eb[i - 1];
            den += ef[i] * ef[i] + eb[i - 1] * eb[i - 1];
        }
        if den < 1e-30 {
            break;
        }
        let reflection = -2.0 * num / den;

        let mut ef_new = vec![0.0; n];
        let mut eb_new = vec![0.0; n];
        for i in k..n {
            ef_new[i] = ef[i] + reflection * eb[i - 1];
            eb_new[i] = eb[i - 1] + reflection * ef[i];
        }
        ef = ef_new;
        eb = eb_new;

        // Levinson update of the coefficient vector.
        let mut a_new = vec![0.0; order + 1];
        a_new[0] = 1.0;
        for i in 1..k {
            a_new[i] = a[i] + reflection * a[k - i];
        }
        a_new[k] = reflection;
        a = a_new;
    }

    a
}

/// Evaluate the prediction polynomial and its derivative at `z`
/// (Horner's method). The polynomial is `z^p + a[1] z^(p-1) + ... + a[p]`.
fn eval_polynomial(a: &[f64], z: Complex64) -> (Complex64, Complex64) {
    let mut p = Complex64::new(1.0, 0.0);
    let mut dp = Complex64::new(0.0, 0.0);
    for &coeff in a.iter().skip(1) {
        dp = p + z * dp;
        p = p * z + Complex64::new(coeff, 0.0);
    }
    (p, dp)
}

/// Newton-Raphson polish of one root.
fn polish_root(a: &[f64], mut z: Complex64, max_iter: usize, tol: f64) -> Complex64 {
    for _ in 0..max_iter {
        let (p, dp) = eval_polynomial(a, z);
        if dp.norm() < 1e-30 {
            break;
        }
        let delta = p / dp;
        z -= delta;
        if delta.norm() < tol * z.norm() {
            break;
        }
    }
    z
}

/// Roots of the prediction polynomial via companion-matrix QR iteration,
/// reflected inside the unit circle and Newton-polished.
fn lpc_roots(a: &[f64]) -> Vec<Complex64> {
    let order = a.len() - 1;
    if order < 1 {
        return Vec::new();
    }

    // Companion matrix: negated coefficients in the first row, ones on the
    // subdiagonal.
    let mut companion = ndarray::Array2::<f64>::zeros((order, order));
    for i in 0..order {
        companion[[0, i]] = -a[i + 1];
    }
    for i in 1..order {
        companion[[i, i - 1]] = 1.0;
    }

    let mut roots = eigenvalues(&companion);

    // A root outside the unit circle describes an unstable filter; its
    // reflection 1/conj(z) has the same frequency with positive bandwidth.
    for root in roots.iter_mut() {
        let r = root.norm();
        if r > 1.0 {
            *root = root.conj() / (r * r);
        }
    }

    for root in roots.iter_mut() {
        *root = polish_root(a, *root, 10, 1e-10);
    }

    roots
}

/// Eigenvalues of a small real matrix by unshifted QR iteration, reading
/// complex pairs off the 2x2 diagonal blocks.
fn eigenvalues(matrix: &ndarray::Array2<f64>) -> Vec<Complex64> {
    let n = matrix.nrows();
    if n == 0 {
        return Vec::new();
    }

    let mut h = matrix.clone();
    let max_iter = 100;
    let tol = 1e-10;

    for _ in 0..max_iter {
        let (q, r) = qr_decompose(&h);
        h = r.dot(&q);

        let mut converged = true;
        for i in 1..n {
            if h[[i, i - 1]].abs() > tol {
                converged = false;
                break;
            }
        }
        if converged {
            break;
        }
    }

    let mut eigs = Vec::with_capacity(n);
    let mut i = 0;
    while i < n {
        if i == n - 1 || h[[i + 1, i]].abs() < tol {
            eigs.push(Complex64::new(h[[i, i]], 0.0));
            i += 1;
        } else {
            // 2x2 block: complex conjugate pair (or two reals).
            let a = h[[i, i]];
            let b = h[[i, i + 1]];
            let c = h[[i + 1, i]];
            let d = h[[i + 1, i + 1]];

            let trace = a + d;
            let det = a * d - b * c;
            let disc = trace * trace - 4.0 * det;

            if disc < 0.0 {
                let re = trace / 2.0;
                let im = (-disc).sqrt() / 2.0;
                eigs.push(Complex64::new(re, im));
                eigs.push(Complex64::new(re, -im));
            } else {
                let s = disc.sqrt();
                eigs.push(Complex64::new((trace + s) / 2.0, 0.0));
                eigs.push(Complex64::new((trace - s) / 2.0, 0.0));
            }
            i += 2;
        }
    }

    eigs
}

/// QR decomposition by Householder reflections.
fn qr_decompose(a: &ndarray::Array2<f64>) -> (ndarray::Array2<f64>, ndarray::Array2<f64>) {
    let n = a.nrows();
    let mut q = ndarray::Array2::<f64>::eye(n);
    let mut r = a.clone();

    for k in 0..n.saturating_sub(1) {
        let mut x = Vec::with_capacity(n - k);
        for i in k..n {
            x.push(r[[i, k]]);
        }

        let norm_x: f64 = x.iter().map(|&v| v * v).sum::<f64>().sqrt();
        if norm_x < 1e-30 {
            continue;
        }
        let sign = if x[0] >= 0.0 { 1.0 } else { -1.0 };
        x[0] += sign * norm_x;

        let norm_v: f64 = x.iter().map(|&v| v * v).sum::<f64>().sqrt();
        if norm_v < 1e-30 {
            continue;
        }
        for v in x.iter_mut() {
            *v /= norm_v;
        }

        for j in k..n {
            let mut dot = 0.0;
            for i in 0..(n - k) {
                dot += x[i] * r[[k + i, j]];
            }
            for i in 0..(n - k) {
                r[[k + i, j]] -= 2.0 * dot * x[i];
            }
        }
        for j in 0..n {
            let mut dot = 0.0;
            for i in 0..(n - k) {
                dot += x[i] * q[[j, k + i]];
            }
            for i in 0..(n - k) {
                q[[j, k + i]] -= 2.0 * dot * x[i];
            }
        }
    }

    (q, r)
}

/// Convert roots to (frequency, bandwidth) pairs, keep the admissible ones,
/// ascending by frequency.
///
/// For a root `z = r e^(i theta)`: frequency = theta Fs / 2 pi,
/// bandwidth = -ln(r) Fs / pi.
fn roots_to_formants(
    roots: &[Complex64],
    sample_rate: f64,
    min_freq: f64,
    max_freq: f64,
    max_bandwidth: f64,
) -> Vec<(f64, f64)> {
    let mut pairs = Vec::new();
    for root in roots {
        if root.im <= 0.0 {
            continue;
        }
        let r = root.norm();
        if r <= 0.0 {
            continue;
        }
        let freq = root.arg() * sample_rate / (2.0 * std::f64::consts::PI);
        let bandwidth = -r.ln() * sample_rate / std::f64::consts::PI;

        if freq >= min_freq && freq <= max_freq && bandwidth > 0.0 && bandwidth <= max_bandwidth {
            pairs.push((freq, bandwidth));
        }
    }
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    pairs
}

/// FFT-based resampling via rubato, with a linear fallback for signals the
/// resampler cannot be configured for.
fn resample(samples: &[f64], old_rate: f64, new_rate: f64) -> Vec<f64> {
    if (old_rate - new_rate).abs() < 1e-6 {
        return samples.to_vec();
    }

    let ratio = new_rate / old_rate;
    let new_length = (samples.len() as f64 * ratio).round() as usize;
    if new_length == 0 {
        return Vec::new();
    }

    let chunk_size = 1024.min(samples.len());
    let mut resampler =
        match FftFixedIn::<f64>::new(old_rate as usize, new_rate as usize, chunk_size, 2, 1) {
            Ok(r) => r,
            Err(_) => return linear_resample(samples, new_length),
        };

    let mut output = Vec::with_capacity(new_length);
    let mut pos = 0;
    while pos < samples.len() {
        let end = (pos + chunk_size).min(samples.len());
        let mut chunk = samples[pos..end].to_vec();
        chunk.resize(chunk_size, 0.0);

        match resampler.process(&[chunk], None) {
            Ok(result) => {
                if !result.is_empty() {
                    output.extend(&result[0]);
                }
            }
            Err(_) => break,
        }
        pos += chunk_size;
    }

    output.truncate(new_length);
    output
}

fn linear_resample(samples: &[f64], new_length: usize) -> Vec<f64> {
    if samples.is_empty() || new_length == 0 {
        return Vec::new();
    }
    let ratio = (samples.len() - 1) as f64 / (new_length - 1).max(1) as f64;
    (0..new_length)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            if idx >= samples.len() - 1 {
                samples[samples.len() - 1]
            } else {
                let frac = pos - idx as f64;
                samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
            }
        })
        .collect()
}
