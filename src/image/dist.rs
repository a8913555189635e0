//! Euclidean distance transforms over validity masks.
//!
//! `distance_transform` returns, for every pixel, the exact Euclidean
//! distance to the nearest cleared mask bit. Pixels one step outside the
//! image border count as cleared, so the result is finite even for a fully
//! valid mask. The correspondence engine uses the transform to keep
//! accepted matches away from mask boundaries, and the local-map solver to
//! reject vertices whose support sits in invalid territory.
//!
//! The computation is the two-pass separable squared-distance transform:
//! each pass takes the lower envelope of parabolas rooted at the source
//! costs, giving exact distances in O(W*H).

use crate::image::Bitmap;

/// Computes the 1-D squared-distance transform of `f` into `d`.
///
/// `d[x] = min_q ((x - q)^2 + f[q])`. Entries of `f` may be infinite;
/// those parabolas never enter the envelope. At least one entry must be
/// finite. `hull` and `bounds` are scratch buffers of `f.len()` and
/// `f.len() + 1` elements.
fn envelope_pass(f: &[f32], d: &mut [f32], hull: &mut [usize], bounds: &mut [f32]) {
    let n = f.len();
    debug_assert!(d.len() >= n && hull.len() >= n && bounds.len() >= n + 1);

    let intersect = |q: usize, p: usize| -> f32 {
        let qf = q as f32;
        let pf = p as f32;
        ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2.0 * qf - 2.0 * pf)
    };

    let mut k = 0usize;
    let mut started = false;
    for q in 0..n {
        if !f[q].is_finite() {
            continue;
        }
        if !started {
            hull[0] = q;
            bounds[0] = f32::NEG_INFINITY;
            bounds[1] = f32::INFINITY;
            started = true;
            continue;
        }
        let mut s = intersect(q, hull[k]);
        while s <= bounds[k] {
            k -= 1;
            s = intersect(q, hull[k]);
        }
        k += 1;
        hull[k] = q;
        bounds[k] = s;
        bounds[k + 1] = f32::INFINITY;
    }
    debug_assert!(started, "envelope pass needs a finite source");

    let mut j = 0usize;
    for (x, out) in d.iter_mut().enumerate().take(n) {
        while bounds[j + 1] < x as f32 {
            j += 1;
        }
        let p = hull[j];
        let dx = x as f32 - p as f32;
        *out = dx * dx + f[p];
    }
}

/// Exact Euclidean distance from each pixel to the nearest cleared bit.
///
/// `out[y * W + x] == 0` iff the bit at `(x, y)` is cleared, and the field
/// is 1-Lipschitz under the Euclidean metric.
pub fn distance_transform(mask: &Bitmap) -> Vec<f32> {
    let w = mask.width();
    let h = mask.height();
    let ext = w.max(h) + 2;

    let mut f = vec![0f32; ext];
    let mut d = vec![0f32; ext];
    let mut hull = vec![0usize; ext];
    let mut bounds = vec![0f32; ext + 1];

    // Column pass: squared distance to the nearest cleared row, with
    // virtual cleared samples just above and below the image.
    let mut colsq = vec![0f32; w * h];
    for x in 0..w {
        f[0] = 0.0;
        for y in 0..h {
            f[y + 1] = if mask.get(x, y) { f32::INFINITY } else { 0.0 };
        }
        f[h + 1] = 0.0;
        envelope_pass(&f[..h + 2], &mut d, &mut hull, &mut bounds);
        for y in 0..h {
            colsq[y * w + x] = d[y + 1];
        }
    }

    // Row pass over the column costs, with virtual cleared samples just
    // left and right of the image.
    let mut out = vec![0f32; w * h];
    for y in 0..h {
        f[0] = 0.0;
        f[1..=w].copy_from_slice(&colsq[y * w..y * w + w]);
        f[w + 1] = 0.0;
        envelope_pass(&f[..w + 2], &mut d, &mut hull, &mut bounds);
        for x in 0..w {
            out[y * w + x] = d[x + 1].sqrt();
        }
    }
    out
}
