//! FFT correlation surface and sub-pixel peak refinement.
//!
//! The normalized cross-correlation between a whitened patch and a
//! whitened search window is evaluated for every integer offset at once:
//! forward transforms of the two sample buffers and the two weight
//! buffers, a conjugate multiply per pair, and inverse transforms yield
//! the correlation numerator and the per-offset valid-pixel count. The
//! count normalizes each offset so partially masked placements compete
//! fairly, and gates offsets whose support is too small.

use rustfft::num_complex::Complex;

use crate::corr::patch::Patch;
use crate::fft::FftEngine;

/// Best offset of a correlation surface, sub-pixel refined.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SurfacePeak {
    /// Displacement of the patch relative to the window center, x.
    pub dx: f32,
    /// Displacement of the patch relative to the window center, y.
    pub dy: f32,
    /// Correlation value at the integer peak.
    pub corr: f32,
    /// Ratio of the peak to the strongest peak outside its neighborhood.
    pub ratio: f32,
}

/// Estimates the sub-sample peak offset from samples at `x = -1, 0, +1`.
///
/// Fits a parabola through `(fm, f0, fp)` and returns the extremum offset
/// in `[-1, 1]`, or `None` when the fit is non-concave or ill-conditioned.
fn quadratic_peak_offset(fm: f32, f0: f32, fp: f32) -> Option<f32> {
    if !fm.is_finite() || !f0.is_finite() || !fp.is_finite() {
        return None;
    }
    let denom = fm - 2.0 * f0 + fp;
    if denom.abs() < 1e-6 || denom >= 0.0 {
        return None;
    }
    let dx = 0.5 * (fm - fp) / denom;
    if dx.is_finite() && dx.abs() <= 1.0 {
        Some(dx)
    } else {
        None
    }
}

fn cross_spectrum(a: &[Complex<f32>], b: &[Complex<f32>], out: &mut [Complex<f32>]) {
    for ((dst, &fa), &fb) in out.iter_mut().zip(a.iter()).zip(b.iter()) {
        *dst = fa.conj() * fb;
    }
}

/// Correlates `patch` against `window` and picks the constrained peak.
///
/// The window side must be `patch.size + 2 * radius`. Offsets are
/// restricted to the Euclidean disc of `radius` around the window center
/// and to placements overlapping at least `min_count` mutually valid
/// pixels. Returns `None` when no admissible offset exists.
pub(crate) fn correlate(
    patch: &Patch,
    window: &Patch,
    radius: usize,
    min_count: f32,
    exclusion: usize,
    engine: &dyn FftEngine,
) -> Option<SurfacePeak> {
    debug_assert_eq!(window.size, patch.size + 2 * radius);
    let span = 2 * radius + 1;
    let n = window.size.next_power_of_two();
    let forward = engine.plan_r2c(n);
    let inverse = engine.plan_c2r(n);

    let embed = |src: &[f32], size: usize| -> Vec<f32> {
        let mut out = vec![0f32; n * n];
        for y in 0..size {
            out[y * n..y * n + size].copy_from_slice(&src[y * size..(y + 1) * size]);
        }
        out
    };

    let mut spec_patch = vec![Complex::new(0.0, 0.0); n * n];
    let mut spec_window = vec![Complex::new(0.0, 0.0); n * n];
    let mut spec_pmask = vec![Complex::new(0.0, 0.0); n * n];
    let mut spec_wmask = vec![Complex::new(0.0, 0.0); n * n];

    forward.execute(&mut embed(&patch.values, patch.size), &mut spec_patch);
    forward.execute(&mut embed(&window.values, window.size), &mut spec_window);
    forward.execute(&mut embed(&patch.weights, patch.size), &mut spec_pmask);
    forward.execute(&mut embed(&window.weights, window.size), &mut spec_wmask);

    let mut product = vec![Complex::new(0.0, 0.0); n * n];
    let mut numerator = vec![0f32; n * n];
    cross_spectrum(&spec_patch, &spec_window, &mut product);
    inverse.execute(&mut numerator, &mut product);

    let mut counts = vec![0f32; n * n];
    cross_spectrum(&spec_pmask, &spec_wmask, &mut product);
    inverse.execute(&mut counts, &mut product);

    // Normalized score per admissible offset; inadmissible offsets stay NaN.
    let r = radius as f32;
    let mut scores = vec![f32::NAN; span * span];
    let mut best: Option<(usize, usize, f32)> = None;
    for oy in 0..span {
        for ox in 0..span {
            let ux = ox as f32 - r;
            let uy = oy as f32 - r;
            if ux * ux + uy * uy > r * r + 1e-3 {
                continue;
            }
            let count = counts[oy * n + ox];
            if count < min_count {
                continue;
            }
            let score = numerator[oy * n + ox] / count;
            scores[oy * span + ox] = score;
            match best {
                Some((_, _, s)) if s >= score => {}
                _ => best = Some((ox, oy, score)),
            }
        }
    }
    let (bx, by, peak) = best?;

    // Strongest rival outside the Chebyshev exclusion zone of the peak.
    let mut second = f32::NEG_INFINITY;
    for oy in 0..span {
        for ox in 0..span {
            let score = scores[oy * span + ox];
            if score.is_nan() {
                continue;
            }
            let cheb = ox.abs_diff(bx).max(oy.abs_diff(by));
            if cheb > exclusion && score > second {
                second = score;
            }
        }
    }
    let ratio = if second > 0.0 {
        peak / second
    } else {
        f32::INFINITY
    };

    let sample = |ox: i64, oy: i64| -> f32 {
        if ox < 0 || oy < 0 || ox >= span as i64 || oy >= span as i64 {
            return f32::NAN;
        }
        scores[oy as usize * span + ox as usize]
    };
    let sub_dx = quadratic_peak_offset(
        sample(bx as i64 - 1, by as i64),
        peak,
        sample(bx as i64 + 1, by as i64),
    )
    .unwrap_or(0.0);
    let sub_dy = quadratic_peak_offset(
        sample(bx as i64, by as i64 - 1),
        peak,
        sample(bx as i64, by as i64 + 1),
    )
    .unwrap_or(0.0);

    Some(SurfacePeak {
        dx: bx as f32 + sub_dx - r,
        dy: by as f32 + sub_dy - r,
        corr: peak,
        ratio,
    })
}
