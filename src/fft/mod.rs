//! FFT engine seam for the correspondence surface.
//!
//! The correlation surface needs forward real-to-complex and inverse
//! complex-to-real 2-D transforms over square power-of-two buffers. The
//! engine is injected behind [`FftEngine`] so any implementation can back
//! it; [`RustFftEngine`] is the production engine built on `rustfft` with
//! cached per-length plans. 2-D transforms use row-column decomposition
//! with an in-place square transpose.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// A planned 2-D transform over an `n x n` buffer.
///
/// Forward plans read `real` and fill `spectrum`; inverse plans read
/// `spectrum` (destroying it) and fill `real`, normalized by `1 / n^2`.
pub trait FftPlan: Send + Sync {
    /// Edge length of the square transform.
    fn size(&self) -> usize;
    /// Executes the planned transform between the two buffers.
    fn execute(&self, real: &mut [f32], spectrum: &mut [Complex<f32>]);
}

/// Planner for forward and inverse 2-D transforms.
pub trait FftEngine: Send + Sync {
    /// Plans a forward real-to-complex transform of size `n x n`.
    fn plan_r2c(&self, n: usize) -> Arc<dyn FftPlan>;
    /// Plans an inverse complex-to-real transform of size `n x n`.
    fn plan_c2r(&self, n: usize) -> Arc<dyn FftPlan>;
}

/// In-place transpose of a square `n x n` complex matrix.
fn transpose_inplace(data: &mut [Complex<f32>], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

fn pass_2d(fft: &dyn Fft<f32>, data: &mut [Complex<f32>], n: usize) {
    for row in 0..n {
        fft.process(&mut data[row * n..(row + 1) * n]);
    }
    transpose_inplace(data, n);
    for row in 0..n {
        fft.process(&mut data[row * n..(row + 1) * n]);
    }
    transpose_inplace(data, n);
}

struct RustFftForward {
    n: usize,
    fft: Arc<dyn Fft<f32>>,
}

impl FftPlan for RustFftForward {
    fn size(&self) -> usize {
        self.n
    }

    fn execute(&self, real: &mut [f32], spectrum: &mut [Complex<f32>]) {
        let n = self.n;
        debug_assert!(real.len() == n * n && spectrum.len() == n * n);
        for (dst, &src) in spectrum.iter_mut().zip(real.iter()) {
            *dst = Complex::new(src, 0.0);
        }
        pass_2d(self.fft.as_ref(), spectrum, n);
    }
}

struct RustFftInverse {
    n: usize,
    fft: Arc<dyn Fft<f32>>,
}

impl FftPlan for RustFftInverse {
    fn size(&self) -> usize {
        self.n
    }

    fn execute(&self, real: &mut [f32], spectrum: &mut [Complex<f32>]) {
        let n = self.n;
        debug_assert!(real.len() == n * n && spectrum.len() == n * n);
        pass_2d(self.fft.as_ref(), spectrum, n);
        let norm = 1.0 / (n * n) as f32;
        for (dst, src) in real.iter_mut().zip(spectrum.iter()) {
            *dst = src.re * norm;
        }
    }
}

/// Production FFT engine backed by `rustfft`.
///
/// Plans are cached per (length, direction) so repeated patch sizes reuse
/// twiddle tables across cells and levels.
#[derive(Default)]
pub struct RustFftEngine {
    plans: Mutex<HashMap<(usize, bool), Arc<dyn Fft<f32>>>>,
}

impl RustFftEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, n: usize, forward: bool) -> Arc<dyn Fft<f32>> {
        let mut plans = self.plans.lock().expect("fft plan lock");
        plans
            .entry((n, forward))
            .or_insert_with(|| {
                let mut planner = FftPlanner::new();
                if forward {
                    planner.plan_fft_forward(n)
                } else {
                    planner.plan_fft_inverse(n)
                }
            })
            .clone()
    }
}

impl FftEngine for RustFftEngine {
    fn plan_r2c(&self, n: usize) -> Arc<dyn FftPlan> {
        Arc::new(RustFftForward {
            n,
            fft: self.cached(n, true),
        })
    }

    fn plan_c2r(&self, n: usize) -> Arc<dyn FftPlan> {
        Arc::new(RustFftInverse {
            n,
            fft: self.cached(n, false),
        })
    }
}
