//! Patch correspondence engine.
//!
//! For an ordered (moving, reference) pair, the engine walks pyramid
//! levels from the coarsest in its search-radius schedule down to the
//! target level. At each level every grid cell extracts a patch from the
//! moving image, correlates it against a search window in the reference
//! (see [`surface`]), and updates its estimated reference position.
//! Rejected cells inherit their neighbors' displacement through one
//! Laplacian fill step before the next level. Per-cell failures are never
//! fatal; a level whose accepted fraction drops below the configured
//! floor fails the whole pair as degenerate.

mod patch;
mod surface;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::fft::FftEngine;
use crate::image::pyramid::PyramidStore;
use crate::trace::{trace_event, trace_span};
use crate::util::{GridAlignError, GridAlignResult};

/// An ordered (moving, reference) pair with its expected placement.
#[derive(Clone, Debug)]
pub struct Pair {
    /// Name of the moving image in the pyramid store.
    pub image: String,
    /// Name of the reference image in the pyramid store.
    pub reference: String,
    /// Expected translation of the moving image within the reference
    /// frame, in level-0 pixels.
    pub offset: (f32, f32),
}

/// Parameters of the correspondence search.
#[derive(Clone, Debug)]
pub struct RegisterConfig {
    /// Side of the square moving patch, in pixels at every level.
    pub patch_size: usize,
    /// Cell spacing of the correspondence grid at the target level.
    pub grid_spacing: usize,
    /// Finest pyramid level the search descends to.
    pub target_level: u32,
    /// Search radius per level, listed coarse to fine; must be
    /// non-increasing. Its length fixes how many levels are walked.
    pub radius_schedule: Vec<usize>,
    /// Minimum accepted correlation peak.
    pub min_corr: f32,
    /// Minimum peak-to-second-peak ratio.
    pub min_ratio: f32,
    /// Minimum reference distance-transform value at the matched
    /// position, in level-0 pixels.
    pub dt_min: f32,
    /// Minimum valid-overlap fraction of the patch area per offset.
    pub min_area: f32,
    /// Minimum fraction of eligible cells that must be accepted at every
    /// level; below it the pair fails as degenerate.
    pub min_accept: f32,
    /// Whitening floor: patches with intensity stdev below this are
    /// invalid cells.
    pub eps_std: f32,
    /// Chebyshev radius excluded around the peak when hunting the
    /// second-best peak.
    pub peak_exclusion: usize,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            patch_size: 32,
            grid_spacing: 8,
            target_level: 0,
            radius_schedule: vec![8, 4],
            min_corr: 0.5,
            min_ratio: 1.1,
            dt_min: 1.5,
            min_area: 0.4,
            min_accept: 0.1,
            eps_std: 1e-3,
            peak_exclusion: 2,
        }
    }
}

impl RegisterConfig {
    /// Checks internal consistency; the search assumes these invariants.
    pub fn validate(&self) -> GridAlignResult<()> {
        if self.patch_size < 4 {
            return Err(GridAlignError::InvalidConfig {
                reason: format!("patch_size {} too small", self.patch_size),
            });
        }
        if self.grid_spacing == 0 || !self.grid_spacing.is_power_of_two() {
            return Err(GridAlignError::InvalidConfig {
                reason: format!("grid_spacing {} must be a power of two", self.grid_spacing),
            });
        }
        if self.radius_schedule.is_empty() {
            return Err(GridAlignError::InvalidConfig {
                reason: "radius_schedule is empty".into(),
            });
        }
        if self.radius_schedule.windows(2).any(|w| w[1] > w[0]) {
            return Err(GridAlignError::InvalidConfig {
                reason: "radius_schedule must be non-increasing coarse to fine".into(),
            });
        }
        if self.radius_schedule.iter().any(|&r| r == 0) {
            return Err(GridAlignError::InvalidConfig {
                reason: "search radius must be positive".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_accept) || !(0.0..=1.0).contains(&self.min_area) {
            return Err(GridAlignError::InvalidConfig {
                reason: "min_accept and min_area must lie in [0, 1]".into(),
            });
        }
        Ok(())
    }

    /// Coarsest pyramid level the schedule starts at.
    pub fn coarsest_level(&self) -> u32 {
        self.target_level + (self.radius_schedule.len() as u32 - 1)
    }
}

/// One grid cell of the output field, in target-level coordinates.
#[derive(Clone, Copy, Debug)]
pub struct CellMatch {
    /// Cell center in the moving image.
    pub mx: f32,
    /// Cell center in the moving image.
    pub my: f32,
    /// Matched position in the reference frame.
    pub rx: f32,
    /// Matched position in the reference frame.
    pub ry: f32,
    /// Accepted correlation peak, or zero for rejected cells.
    pub c: f32,
}

/// Sparse displacement field over the correspondence grid.
#[derive(Debug)]
pub struct DisplacementField {
    pub grid_w: usize,
    pub grid_h: usize,
    /// Cell spacing at `level`, in pixels.
    pub spacing: usize,
    /// Pyramid level the field is expressed at.
    pub level: u32,
    /// Row-major cells, `grid_w * grid_h` of them.
    pub cells: Vec<CellMatch>,
}

impl DisplacementField {
    /// Fraction of cells carrying a nonzero confidence.
    pub fn accepted_fraction(&self) -> f32 {
        if self.cells.is_empty() {
            return 0.0;
        }
        let accepted = self.cells.iter().filter(|c| c.c > 0.0).count();
        accepted as f32 / self.cells.len() as f32
    }
}

struct CellState {
    // Estimated reference position at the current level.
    rx: f32,
    ry: f32,
    c: f32,
    eligible: bool,
    accepted: bool,
}

/// Runs the hierarchical correspondence search for one pair.
pub fn register_pair(
    store: &PyramidStore,
    pair: &Pair,
    cfg: &RegisterConfig,
    engine: &dyn FftEngine,
) -> GridAlignResult<DisplacementField> {
    cfg.validate()?;
    let coarsest = cfg.coarsest_level();
    let _span = trace_span!("register_pair", levels = cfg.radius_schedule.len()).entered();

    let target = store.level(&pair.image, cfg.target_level)?;
    let (tw, th) = target.dims();
    // Cells sit on the map vertex lattice: cell (i, j) is the source
    // pixel (i * spacing, j * spacing) at the target level.
    let grid_w = tw.div_ceil(cfg.grid_spacing);
    let grid_h = th.div_ceil(cfg.grid_spacing);
    let center = |i: usize| (i * cfg.grid_spacing) as f32;

    // Seed estimates at the coarsest level from the expected placement.
    let coarse_scale = (1u32 << (coarsest - cfg.target_level)) as f32;
    let level0_scale = (1u32 << coarsest) as f32;
    let mut states: Vec<CellState> = (0..grid_w * grid_h)
        .map(|idx| {
            let (gx, gy) = (idx % grid_w, idx / grid_w);
            CellState {
                rx: (center(gx) / coarse_scale) + pair.offset.0 / level0_scale,
                ry: (center(gy) / coarse_scale) + pair.offset.1 / level0_scale,
                c: 0.0,
                eligible: false,
                accepted: false,
            }
        })
        .collect();

    for (idx, &radius) in cfg.radius_schedule.iter().enumerate() {
        let level = coarsest - idx as u32;
        let moving = store.level(&pair.image, level)?;
        let reference = store.level(&pair.reference, level)?;
        let ref_dist = store.distance(&pair.reference, level)?;
        let scale = (1u32 << (level - cfg.target_level)) as f32;
        let dt_floor = cfg.dt_min / (1u32 << level) as f32;
        let min_count = cfg.min_area * (cfg.patch_size * cfg.patch_size) as f32;

        let step = |idx: usize, state: &CellState| -> CellState {
            let (gx, gy) = (idx % grid_w, idx / grid_w);
            let mx = center(gx) / scale;
            let my = center(gy) / scale;
            let patch = patch::extract_whitened(
                moving.image.view(),
                &moving.mask,
                mx,
                my,
                cfg.patch_size,
                cfg.eps_std,
            );
            let Some(patch) = patch else {
                return CellState {
                    rx: state.rx,
                    ry: state.ry,
                    c: 0.0,
                    eligible: false,
                    accepted: false,
                };
            };
            let window = patch::extract_whitened(
                reference.image.view(),
                &reference.mask,
                state.rx,
                state.ry,
                cfg.patch_size + 2 * radius,
                cfg.eps_std,
            );
            let peak = window.as_ref().and_then(|window| {
                surface::correlate(
                    &patch,
                    window,
                    radius,
                    min_count,
                    cfg.peak_exclusion,
                    engine,
                )
            });
            let Some(peak) = peak else {
                return CellState {
                    rx: state.rx,
                    ry: state.ry,
                    c: 0.0,
                    eligible: true,
                    accepted: false,
                };
            };

            let rx = state.rx + peak.dx;
            let ry = state.ry + peak.dy;
            let (rw, rh) = reference.dims();
            let dx_idx = (rx.round().clamp(0.0, rw as f32 - 1.0)) as usize;
            let dy_idx = (ry.round().clamp(0.0, rh as f32 - 1.0)) as usize;
            let dt_ok = ref_dist[dy_idx * rw + dx_idx] >= dt_floor;

            if peak.corr > cfg.min_corr && peak.ratio > cfg.min_ratio && dt_ok {
                CellState {
                    rx,
                    ry,
                    c: peak.corr,
                    eligible: true,
                    accepted: true,
                }
            } else {
                CellState {
                    rx: state.rx,
                    ry: state.ry,
                    c: 0.0,
                    eligible: true,
                    accepted: false,
                }
            }
        };

        #[cfg(feature = "rayon")]
        let next: Vec<CellState> = states
            .par_iter()
            .enumerate()
            .map(|(idx, state)| step(idx, state))
            .collect();
        #[cfg(not(feature = "rayon"))]
        let next: Vec<CellState> = states
            .iter()
            .enumerate()
            .map(|(idx, state)| step(idx, state))
            .collect();
        states = next;

        let eligible = states.iter().filter(|s| s.eligible).count();
        let accepted = states.iter().filter(|s| s.accepted).count();
        trace_event!("register_level", level = level, accepted = accepted);
        if eligible == 0 {
            return Err(GridAlignError::Degenerate {
                reason: format!("level {level}: no cell has valid mask support"),
            });
        }
        let fraction = accepted as f32 / eligible as f32;
        if fraction < cfg.min_accept {
            return Err(GridAlignError::Degenerate {
                reason: format!(
                    "level {level}: accepted fraction {fraction:.3} below {:.3}",
                    cfg.min_accept
                ),
            });
        }

        laplacian_fill(&mut states, grid_w, grid_h, |gx, gy| {
            (center(gx) / scale, center(gy) / scale)
        });

        // Transition to the next finer level.
        if idx + 1 < cfg.radius_schedule.len() {
            for state in &mut states {
                state.rx *= 2.0;
                state.ry *= 2.0;
            }
        }
    }

    let cells = states
        .iter()
        .enumerate()
        .map(|(idx, state)| {
            let (gx, gy) = (idx % grid_w, idx / grid_w);
            CellMatch {
                mx: center(gx),
                my: center(gy),
                rx: state.rx,
                ry: state.ry,
                c: if state.accepted { state.c } else { 0.0 },
            }
        })
        .collect();

    Ok(DisplacementField {
        grid_w,
        grid_h,
        spacing: cfg.grid_spacing,
        level: cfg.target_level,
        cells,
    })
}

/// One Laplacian fill step: rejected cells take the mean displacement of
/// their accepted 4-neighbors, keeping their own estimate when isolated.
fn laplacian_fill<F>(states: &mut [CellState], grid_w: usize, grid_h: usize, moving_pos: F)
where
    F: Fn(usize, usize) -> (f32, f32),
{
    let disp: Vec<(f32, f32, bool)> = states
        .iter()
        .enumerate()
        .map(|(idx, s)| {
            let (gx, gy) = (idx % grid_w, idx / grid_w);
            let (mx, my) = moving_pos(gx, gy);
            (s.rx - mx, s.ry - my, s.accepted)
        })
        .collect();

    for idx in 0..states.len() {
        if states[idx].accepted {
            continue;
        }
        let (gx, gy) = (idx % grid_w, idx / grid_w);
        let mut sum = (0f32, 0f32);
        let mut count = 0usize;
        let mut push = |nx: i64, ny: i64| {
            if nx < 0 || ny < 0 || nx >= grid_w as i64 || ny >= grid_h as i64 {
                return;
            }
            let n = ny as usize * grid_w + nx as usize;
            if disp[n].2 {
                sum.0 += disp[n].0;
                sum.1 += disp[n].1;
                count += 1;
            }
        };
        push(gx as i64 - 1, gy as i64);
        push(gx as i64 + 1, gy as i64);
        push(gx as i64, gy as i64 - 1);
        push(gx as i64, gy as i64 + 1);
        if count > 0 {
            let (mx, my) = moving_pos(gx, gy);
            states[idx].rx = mx + sum.0 / count as f32;
            states[idx].ry = my + sum.1 / count as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{register_pair, Pair, RegisterConfig};
    use crate::fft::RustFftEngine;
    use crate::image::pyramid::{PyramidStore, StoreConfig};
    use crate::image::{Bitmap, OwnedImage};

    fn smooth_texture(width: usize, height: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let smooth = 128.0
                    + 55.0 * ((x as f32) * 0.31).sin() * ((y as f32) * 0.27).cos()
                    + 35.0 * ((x as f32) * 0.05 + (y as f32) * 0.083).sin();
                let grain = (((x * 13) ^ (y * 7) ^ (x * y)) & 0x1F) as f32 - 16.0;
                data.push((smooth + grain).clamp(0.0, 255.0) as u8);
            }
        }
        data
    }

    fn store_with(name: &str, data: Vec<u8>, w: usize, h: usize, store: &PyramidStore) {
        let image = OwnedImage::new(data, w, h).unwrap();
        let mask = Bitmap::new_filled(w, h, true).unwrap();
        store.insert_base(name, image, mask).unwrap();
    }

    #[test]
    fn identical_images_register_at_identity() {
        let store = PyramidStore::new(StoreConfig::default());
        let data = smooth_texture(128, 128);
        store_with("a", data.clone(), 128, 128, &store);
        store_with("b", data, 128, 128, &store);

        let cfg = RegisterConfig {
            patch_size: 16,
            grid_spacing: 16,
            radius_schedule: vec![4, 4],
            dt_min: 0.0,
            ..RegisterConfig::default()
        };
        let engine = RustFftEngine::new();
        let pair = Pair {
            image: "a".into(),
            reference: "b".into(),
            offset: (0.0, 0.0),
        };
        let field = register_pair(&store, &pair, &cfg, &engine).unwrap();

        assert!(field.accepted_fraction() > 0.8);
        for cell in field.cells.iter().filter(|c| c.c > 0.0) {
            assert!((cell.rx - cell.mx).abs() < 0.5, "cell drifted in x");
            assert!((cell.ry - cell.my).abs() < 0.5, "cell drifted in y");
        }
    }

    #[test]
    fn fully_masked_image_fails_degenerate() {
        let store = PyramidStore::new(StoreConfig::default());
        let data = smooth_texture(64, 64);
        let image = OwnedImage::new(data.clone(), 64, 64).unwrap();
        let mask = Bitmap::new_filled(64, 64, false).unwrap();
        store.insert_base("dead", image, mask).unwrap();
        store_with("ref", data, 64, 64, &store);

        let cfg = RegisterConfig {
            patch_size: 16,
            grid_spacing: 16,
            radius_schedule: vec![4],
            ..RegisterConfig::default()
        };
        let engine = RustFftEngine::new();
        let pair = Pair {
            image: "dead".into(),
            reference: "ref".into(),
            offset: (0.0, 0.0),
        };
        let err = register_pair(&store, &pair, &cfg, &engine).unwrap_err();
        assert!(matches!(
            err,
            crate::util::GridAlignError::Degenerate { .. }
        ));
    }

    #[test]
    fn schedule_must_be_non_increasing() {
        let cfg = RegisterConfig {
            radius_schedule: vec![4, 8],
            ..RegisterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
