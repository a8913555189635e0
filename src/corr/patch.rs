//! Patch extraction and whitening for the correlation surface.

use crate::image::{Bitmap, ImageView};

/// A square patch of whitened samples with per-pixel validity weights.
///
/// Samples come out zero-mean and unit-variance over the valid pixels;
/// invalid pixels hold zero in both `values` and `weights`, so they drop
/// out of every correlation sum.
pub(crate) struct Patch {
    pub size: usize,
    pub values: Vec<f32>,
    pub weights: Vec<f32>,
    pub valid: usize,
}

/// Extracts and whitens a `size x size` patch centered at `(cx, cy)`.
///
/// Pixels falling outside the image or under a cleared mask bit are
/// invalid. Returns `None` when no pixel is valid or the intensity
/// variance over the valid pixels falls below `eps_std` squared, which
/// marks the cell as degenerate for this level.
pub(crate) fn extract_whitened(
    image: ImageView<'_, u8>,
    mask: &Bitmap,
    cx: f32,
    cy: f32,
    size: usize,
    eps_std: f32,
) -> Option<Patch> {
    let half = (size / 2) as i64;
    let x0 = cx.round() as i64 - half;
    let y0 = cy.round() as i64 - half;

    let mut values = vec![0f32; size * size];
    let mut weights = vec![0f32; size * size];
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    let mut valid = 0usize;

    for py in 0..size {
        let sy = y0 + py as i64;
        if sy < 0 || sy >= image.height() as i64 {
            continue;
        }
        let row = image.row(sy as usize)?;
        for px in 0..size {
            let sx = x0 + px as i64;
            if sx < 0 || sx >= image.width() as i64 {
                continue;
            }
            if !mask.get(sx as usize, sy as usize) {
                continue;
            }
            let v = f64::from(row[sx as usize]);
            values[py * size + px] = v as f32;
            weights[py * size + px] = 1.0;
            sum += v;
            sum_sq += v * v;
            valid += 1;
        }
    }

    if valid == 0 {
        return None;
    }
    let count = valid as f64;
    let mean = sum / count;
    let variance = (sum_sq / count - mean * mean).max(0.0);
    if variance < f64::from(eps_std) * f64::from(eps_std) {
        return None;
    }

    let mean = mean as f32;
    let inv_std = (1.0 / variance.sqrt()) as f32;
    for (value, weight) in values.iter_mut().zip(weights.iter()) {
        if *weight > 0.0 {
            *value = (*value - mean) * inv_std;
        }
    }

    Some(Patch {
        size,
        values,
        weights,
        valid,
    })
}

#[cfg(test)]
mod tests {
    use super::extract_whitened;
    use crate::image::{Bitmap, ImageView};

    #[test]
    fn whitened_patch_has_zero_mean_unit_variance() {
        let data: Vec<u8> = (0..64).map(|i| (i * 3 % 251) as u8).collect();
        let view = ImageView::from_slice(&data, 8, 8).unwrap();
        let mask = Bitmap::new_filled(8, 8, true).unwrap();
        let patch = extract_whitened(view, &mask, 4.0, 4.0, 8, 1e-3).unwrap();

        let n = patch.valid as f32;
        let mean: f32 = patch.values.iter().sum::<f32>() / n;
        let var: f32 = patch.values.iter().map(|v| v * v).sum::<f32>() / n;
        assert!(mean.abs() < 1e-4);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn flat_patch_is_rejected() {
        let data = vec![128u8; 64];
        let view = ImageView::from_slice(&data, 8, 8).unwrap();
        let mask = Bitmap::new_filled(8, 8, true).unwrap();
        assert!(extract_whitened(view, &mask, 4.0, 4.0, 8, 1e-3).is_none());
    }

    #[test]
    fn fully_masked_patch_is_rejected() {
        let data: Vec<u8> = (0..64).collect();
        let view = ImageView::from_slice(&data, 8, 8).unwrap();
        let mask = Bitmap::new_filled(8, 8, false).unwrap();
        assert!(extract_whitened(view, &mask, 4.0, 4.0, 8, 1e-3).is_none());
    }

    #[test]
    fn out_of_bounds_pixels_carry_zero_weight() {
        let data: Vec<u8> = (0..16).map(|i| (i * 17) as u8).collect();
        let view = ImageView::from_slice(&data, 4, 4).unwrap();
        let mask = Bitmap::new_filled(4, 4, true).unwrap();
        // Centered on the corner: three quadrants fall outside.
        let patch = extract_whitened(view, &mask, 0.0, 0.0, 8, 1e-3).unwrap();
        assert!(patch.valid < 16);
        assert_eq!(patch.weights[0], 0.0);
    }
}
