//! Local-map solver: sparse correspondences to a dense deformation grid.
//!
//! The solve runs in three stages. A robust global transform (rigid or
//! affine) is fitted to the accepted correspondences with iteratively
//! reweighted least squares under Huber weights. The per-cell residuals
//! against that transform are then spread over the full grid by
//! minimizing `sum_i c_i |r_i - s_i|^2 + lambda |L s|^2` with conjugate
//! gradients, where `L` is the 5-point grid Laplacian (the penalty
//! operator is therefore the Laplacian squared). The final vertex
//! position recomposes the transform and the smoothed residual, and each
//! vertex's confidence is the distance-weighted average of the accepted
//! confidences around it.

use nalgebra::{Matrix3, Vector3};

use crate::corr::{CellMatch, DisplacementField, Pair};
use crate::map::{Map, MapElement};
use crate::trace::trace_event;
use crate::util::math::huber_weight;
use crate::util::{GridAlignError, GridAlignResult};

/// Global transform model fitted before residual interpolation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformModel {
    /// Translation plus rotation.
    Rigid,
    /// Full 2x2 linear part plus translation.
    Affine,
}

/// Parameters of the local solve.
#[derive(Clone, Debug)]
pub struct SolveConfig {
    pub model: TransformModel,
    /// Residual smoothness weight (`lambda`).
    pub smoothness: f32,
    /// Huber threshold in pixels at the field's level.
    pub huber_k: f32,
    /// IRLS refinement iterations for the global transform.
    pub irls_iters: usize,
    /// Conjugate-gradient iteration cap for the residual solve.
    pub cg_iters: usize,
    /// Relative residual tolerance for the conjugate-gradient solve.
    pub cg_tol: f32,
    /// Chebyshev radius (in cells) of the confidence average.
    pub confidence_radius: usize,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            model: TransformModel::Affine,
            smoothness: 4.0,
            huber_k: 1.0,
            irls_iters: 8,
            cg_iters: 200,
            cg_tol: 1e-5,
            confidence_radius: 3,
        }
    }
}

/// Affine transform `p -> M p + t` over image coordinates.
#[derive(Clone, Copy, Debug)]
pub struct Affine2 {
    pub m: [[f32; 2]; 2],
    pub t: [f32; 2],
}

impl Affine2 {
    pub fn identity() -> Self {
        Self {
            m: [[1.0, 0.0], [0.0, 1.0]],
            t: [0.0, 0.0],
        }
    }

    #[inline]
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.m[0][0] * x + self.m[0][1] * y + self.t[0],
            self.m[1][0] * x + self.m[1][1] * y + self.t[1],
        )
    }

    /// Rotation angle of the linear part in degrees.
    pub fn rotation_deg(&self) -> f32 {
        self.m[1][0].atan2(self.m[0][0]).to_degrees()
    }
}

fn fit_once(cells: &[CellMatch], weights: &[f32], model: TransformModel) -> Option<Affine2> {
    match model {
        TransformModel::Affine => {
            // Weighted normal equations for x' and y' over [x y 1].
            let mut m = Matrix3::zeros();
            let mut bx = Vector3::zeros();
            let mut by = Vector3::zeros();
            for (cell, &w) in cells.iter().zip(weights.iter()) {
                if w <= 0.0 {
                    continue;
                }
                let w = f64::from(w);
                let row = [f64::from(cell.mx), f64::from(cell.my), 1.0];
                for r in 0..3 {
                    for c in 0..3 {
                        m[(r, c)] += w * row[r] * row[c];
                    }
                    bx[r] += w * row[r] * f64::from(cell.rx);
                    by[r] += w * row[r] * f64::from(cell.ry);
                }
            }
            let lu: nalgebra::LU<f64, nalgebra::Const<3>, nalgebra::Const<3>> = m.lu();
            let px = lu.solve(&bx)?;
            let py = lu.solve(&by)?;
            Some(Affine2 {
                m: [
                    [px[0] as f32, px[1] as f32],
                    [py[0] as f32, py[1] as f32],
                ],
                t: [px[2] as f32, py[2] as f32],
            })
        }
        TransformModel::Rigid => {
            // Weighted 2-D Procrustes: rotation from the cross terms of
            // the centered covariance, then the matching translation.
            let total: f64 = weights.iter().map(|&w| f64::from(w)).sum();
            if total <= 0.0 {
                return None;
            }
            let mut mean = [0f64; 4];
            for (cell, &w) in cells.iter().zip(weights.iter()) {
                let w = f64::from(w);
                mean[0] += w * f64::from(cell.mx);
                mean[1] += w * f64::from(cell.my);
                mean[2] += w * f64::from(cell.rx);
                mean[3] += w * f64::from(cell.ry);
            }
            for m in &mut mean {
                *m /= total;
            }
            let mut sin_sum = 0f64;
            let mut cos_sum = 0f64;
            for (cell, &w) in cells.iter().zip(weights.iter()) {
                let w = f64::from(w);
                let ax = f64::from(cell.mx) - mean[0];
                let ay = f64::from(cell.my) - mean[1];
                let bx = f64::from(cell.rx) - mean[2];
                let by = f64::from(cell.ry) - mean[3];
                sin_sum += w * (ax * by - ay * bx);
                cos_sum += w * (ax * bx + ay * by);
            }
            if sin_sum == 0.0 && cos_sum == 0.0 {
                return None;
            }
            let theta = sin_sum.atan2(cos_sum);
            let (sin, cos) = theta.sin_cos();
            let tx = mean[2] - (cos * mean[0] - sin * mean[1]);
            let ty = mean[3] - (sin * mean[0] + cos * mean[1]);
            Some(Affine2 {
                m: [
                    [cos as f32, -sin as f32],
                    [sin as f32, cos as f32],
                ],
                t: [tx as f32, ty as f32],
            })
        }
    }
}

/// Fits the global transform with IRLS under Huber weights.
///
/// Initial weights are the correspondence confidences; each iteration
/// refits with weights damped by the Huber function of the residual
/// magnitude.
pub fn fit_transform(
    cells: &[CellMatch],
    model: TransformModel,
    huber_k: f32,
    iters: usize,
) -> GridAlignResult<Affine2> {
    let accepted: Vec<CellMatch> = cells.iter().filter(|c| c.c > 0.0).copied().collect();
    let needed = match model {
        TransformModel::Rigid => 2,
        TransformModel::Affine => 3,
    };
    if accepted.len() < needed {
        return Err(GridAlignError::Degenerate {
            reason: format!(
                "{} accepted correspondences, need {needed} for the initial fit",
                accepted.len()
            ),
        });
    }

    let mut weights: Vec<f32> = accepted.iter().map(|c| c.c).collect();
    let mut transform = Affine2::identity();
    for _ in 0..iters.max(1) {
        transform = fit_once(&accepted, &weights, model).ok_or_else(|| {
            GridAlignError::Degenerate {
                reason: "singular system in global transform fit".into(),
            }
        })?;
        for (cell, weight) in accepted.iter().zip(weights.iter_mut()) {
            let (px, py) = transform.apply(cell.mx, cell.my);
            let r = ((cell.rx - px).powi(2) + (cell.ry - py).powi(2)).sqrt();
            *weight = cell.c * huber_weight(r, huber_k);
        }
    }
    Ok(transform)
}

/// Applies the 5-point Laplacian `(L x)_i = deg_i x_i - sum_n x_n`.
fn apply_laplacian(x: &[f32], out: &mut [f32], w: usize, h: usize) {
    for j in 0..h {
        for i in 0..w {
            let idx = j * w + i;
            let mut acc = 0.0f32;
            let mut deg = 0.0f32;
            if i > 0 {
                acc += x[idx - 1];
                deg += 1.0;
            }
            if i + 1 < w {
                acc += x[idx + 1];
                deg += 1.0;
            }
            if j > 0 {
                acc += x[idx - w];
                deg += 1.0;
            }
            if j + 1 < h {
                acc += x[idx + w];
                deg += 1.0;
            }
            out[idx] = deg * x[idx] - acc;
        }
    }
}

/// Conjugate gradients on `(diag(w) + lambda L^T L) x = diag(w) b`.
fn cg_solve(
    b: &[f32],
    conf: &[f32],
    seed: &[f32],
    w: usize,
    h: usize,
    lambda: f32,
    iters: usize,
    tol: f32,
) -> Vec<f32> {
    let n = w * h;
    let mut x = seed.to_vec();
    let mut tmp1 = vec![0f32; n];
    let mut tmp2 = vec![0f32; n];

    let matvec = |x: &[f32], out: &mut [f32], tmp: &mut [f32]| {
        apply_laplacian(x, tmp, w, h);
        apply_laplacian(tmp, out, w, h);
        for i in 0..n {
            out[i] = conf[i] * x[i] + lambda * out[i];
        }
    };

    let mut r = vec![0f32; n];
    matvec(&x, &mut tmp2, &mut tmp1);
    let mut rhs_norm = 0f32;
    for i in 0..n {
        let rhs = conf[i] * b[i];
        r[i] = rhs - tmp2[i];
        rhs_norm += rhs * rhs;
    }
    if rhs_norm <= 0.0 {
        return x;
    }
    let mut p = r.clone();
    let mut rr: f32 = r.iter().map(|v| v * v).sum();

    for _ in 0..iters {
        if rr <= tol * tol * rhs_norm {
            break;
        }
        matvec(&p, &mut tmp2, &mut tmp1);
        let pap: f32 = p.iter().zip(tmp2.iter()).map(|(a, b)| a * b).sum();
        if pap.abs() < f32::MIN_POSITIVE {
            break;
        }
        let alpha = rr / pap;
        for i in 0..n {
            x[i] += alpha * p[i];
            r[i] -= alpha * tmp2[i];
        }
        let rr_next: f32 = r.iter().map(|v| v * v).sum();
        let beta = rr_next / rr;
        rr = rr_next;
        for i in 0..n {
            p[i] = r[i] + beta * p[i];
        }
    }
    x
}

/// Multi-source BFS fill: every cell takes the value of its nearest
/// accepted cell, seeding the conjugate-gradient solve.
fn nearest_fill(values: &[f32], accepted: &[bool], w: usize, h: usize) -> Vec<f32> {
    let n = w * h;
    let mut out = vec![0f32; n];
    let mut visited = vec![false; n];
    let mut queue = std::collections::VecDeque::new();
    for i in 0..n {
        if accepted[i] {
            out[i] = values[i];
            visited[i] = true;
            queue.push_back(i);
        }
    }
    while let Some(idx) = queue.pop_front() {
        let (i, j) = (idx % w, idx / w);
        for (ni, nj) in [
            (i.wrapping_sub(1), j),
            (i + 1, j),
            (i, j.wrapping_sub(1)),
            (i, j + 1),
        ] {
            if ni >= w || nj >= h {
                continue;
            }
            let nidx = nj * w + ni;
            if !visited[nidx] {
                visited[nidx] = true;
                out[nidx] = out[idx];
                queue.push_back(nidx);
            }
        }
    }
    out
}

/// Solves the dense map for one pair from its displacement field.
///
/// The output map lives at `field.level + log2(field.spacing)`, one
/// vertex per grid cell, with positions expressed in map-level pixels of
/// the reference frame. `ref_dims` is the reference extent at the
/// field's level; vertices landing outside it have their confidence
/// zeroed so the map invariant holds.
pub fn solve_local(
    field: &DisplacementField,
    pair: &Pair,
    ref_dims: (usize, usize),
    cfg: &SolveConfig,
) -> GridAlignResult<Map> {
    let (w, h) = (field.grid_w, field.grid_h);
    if field.cells.len() != w * h {
        return Err(GridAlignError::InvalidDimensions { width: w, height: h });
    }
    let transform = fit_transform(&field.cells, cfg.model, cfg.huber_k, cfg.irls_iters)?;
    trace_event!("local_fit", rotation_deg = f64::from(transform.rotation_deg()));

    // Residuals of the accepted correspondences against the fit.
    let n = w * h;
    let mut res_x = vec![0f32; n];
    let mut res_y = vec![0f32; n];
    let mut conf = vec![0f32; n];
    let mut accepted = vec![false; n];
    for (idx, cell) in field.cells.iter().enumerate() {
        if cell.c > 0.0 {
            let (px, py) = transform.apply(cell.mx, cell.my);
            res_x[idx] = cell.rx - px;
            res_y[idx] = cell.ry - py;
            conf[idx] = cell.c;
            accepted[idx] = true;
        }
    }

    let seed_x = nearest_fill(&res_x, &accepted, w, h);
    let seed_y = nearest_fill(&res_y, &accepted, w, h);
    let smooth_x = cg_solve(
        &res_x,
        &conf,
        &seed_x,
        w,
        h,
        cfg.smoothness,
        cfg.cg_iters,
        cfg.cg_tol,
    );
    let smooth_y = cg_solve(
        &res_y,
        &conf,
        &seed_y,
        w,
        h,
        cfg.smoothness,
        cfg.cg_iters,
        cfg.cg_tol,
    );

    let spacing = field.spacing as f32;
    let map_level = field.level + field.spacing.trailing_zeros();
    let ref_w = ref_dims.0 as f32 / spacing;
    let ref_h = ref_dims.1 as f32 / spacing;

    let mut elements = Vec::with_capacity(n);
    for j in 0..h {
        for i in 0..w {
            let idx = j * w + i;
            let cell = field.cells[idx];
            let (px, py) = transform.apply(cell.mx, cell.my);
            let x = (px + smooth_x[idx]) / spacing;
            let y = (py + smooth_y[idx]) / spacing;

            let mut c = if accepted[idx] {
                conf[idx]
            } else {
                weighted_confidence(&conf, &accepted, w, h, i, j, cfg.confidence_radius)
            };
            if x < 0.0 || y < 0.0 || x > ref_w || y > ref_h {
                c = 0.0;
            }
            elements.push(MapElement {
                x,
                y,
                c: c.clamp(0.0, 1.0),
            });
        }
    }

    let map = Map {
        level: map_level,
        width: w,
        height: h,
        x_min: 0,
        y_min: 0,
        image: pair.image.clone(),
        reference: pair.reference.clone(),
        elements,
    };
    map.validate()?;
    Ok(map)
}

/// Distance-weighted average of accepted confidences around `(i, j)`.
fn weighted_confidence(
    conf: &[f32],
    accepted: &[bool],
    w: usize,
    h: usize,
    i: usize,
    j: usize,
    radius: usize,
) -> f32 {
    let mut num = 0f32;
    let mut den = 0f32;
    let r = radius as i64;
    for dj in -r..=r {
        for di in -r..=r {
            if di == 0 && dj == 0 {
                continue;
            }
            let ni = i as i64 + di;
            let nj = j as i64 + dj;
            if ni < 0 || nj < 0 || ni >= w as i64 || nj >= h as i64 {
                continue;
            }
            let idx = nj as usize * w + ni as usize;
            if accepted[idx] {
                let d = ((di * di + dj * dj) as f32).sqrt();
                let weight = 1.0 / (1.0 + d);
                num += weight * conf[idx];
                den += weight;
            }
        }
    }
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}
