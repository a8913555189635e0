//! Mathematical helpers shared across the solvers.

/// Bilinear sample of a scalar field stored row-major.
///
/// Out-of-bounds taps clamp to the nearest edge pixel, so samples inside
/// `[0, w-1] x [0, h-1]` interpolate and samples outside extrapolate flat.
pub(crate) fn bilinear(data: &[f32], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let clamp_x = |v: i64| v.clamp(0, width as i64 - 1) as usize;
    let clamp_y = |v: i64| v.clamp(0, height as i64 - 1) as usize;
    let x0i = clamp_x(x0 as i64);
    let x1i = clamp_x(x0 as i64 + 1);
    let y0i = clamp_y(y0 as i64);
    let y1i = clamp_y(y0 as i64 + 1);

    let p00 = data[y0i * width + x0i];
    let p10 = data[y0i * width + x1i];
    let p01 = data[y1i * width + x0i];
    let p11 = data[y1i * width + x1i];

    let top = p00 + fx * (p10 - p00);
    let bottom = p01 + fx * (p11 - p01);
    top + fy * (bottom - top)
}

/// Huber weight for a residual magnitude `r` with threshold `k`.
pub(crate) fn huber_weight(r: f32, k: f32) -> f32 {
    if r <= k {
        1.0
    } else {
        k / r
    }
}

#[cfg(test)]
mod tests {
    use super::{bilinear, huber_weight};

    #[test]
    fn bilinear_interpolates_between_samples() {
        let data = [0.0, 1.0, 2.0, 3.0];
        let v = bilinear(&data, 2, 2, 0.5, 0.5);
        assert!((v - 1.5).abs() < 1e-6);
    }

    #[test]
    fn bilinear_clamps_outside_extent() {
        let data = [0.0, 1.0, 2.0, 3.0];
        assert!((bilinear(&data, 2, 2, -1.0, -1.0) - 0.0).abs() < 1e-6);
        assert!((bilinear(&data, 2, 2, 5.0, 5.0) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn huber_weight_flat_inside_threshold() {
        assert!((huber_weight(0.5, 1.0) - 1.0).abs() < 1e-6);
        assert!((huber_weight(2.0, 1.0) - 0.5).abs() < 1e-6);
    }
}
