//! Coarse-to-fine alignment driver.
//!
//! `align_set` runs the full pipeline for a set of images joined by pair
//! records: hierarchical correspondence search per pair, local map
//! solves, then global relaxation — first on a coarse vertex lattice,
//! then on successively finer ones. Each refinement bilinearly upsamples
//! the relaxed grids to seed the next resolution, re-solves the pair
//! maps there, and relaxes again until the finest lattice converges.
//!
//! Pairs that fail registration (degenerate overlap, too few accepted
//! correspondences) are dropped from the adjacency graph and reported in
//! the outcome; the remaining edges still constrain the solve.

use crate::corr::{register_pair, DisplacementField, Pair, RegisterConfig};
use crate::fft::FftEngine;
use crate::image::pyramid::PyramidStore;
use crate::map::solve::{solve_local, SolveConfig};
use crate::map::{Map, MapElement};
use crate::relax::{relax, Edge, RelaxConfig};
use crate::trace::{trace_event, trace_span};
use crate::util::{GridAlignError, GridAlignResult};

/// Parameters of the full alignment run.
#[derive(Clone, Debug)]
pub struct AlignConfig {
    pub register: RegisterConfig,
    pub solve: SolveConfig,
    pub relax: RelaxConfig,
    /// Number of vertex-lattice resolutions the multigrid loop walks;
    /// the coarsest lattice is `2^(grid_levels - 1)` times sparser than
    /// the correspondence grid.
    pub grid_levels: u32,
    /// Name recorded as the reference frame of the output maps.
    pub global_frame: String,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            register: RegisterConfig::default(),
            solve: SolveConfig::default(),
            relax: RelaxConfig::default(),
            grid_levels: 2,
            global_frame: "global".to_string(),
        }
    }
}

/// A pair that dropped out of the solve, with its single-line reason.
#[derive(Clone, Debug)]
pub struct PairFailure {
    pub image: String,
    pub reference: String,
    pub reason: String,
}

/// Result of an alignment run: one map per image plus the failed pairs.
pub struct AlignOutcome {
    pub maps: Vec<Map>,
    pub failures: Vec<PairFailure>,
}

/// Aligns a set of images into one global frame.
pub fn align_set(
    store: &PyramidStore,
    images: &[String],
    pairs: &[Pair],
    cfg: &AlignConfig,
    engine: &dyn FftEngine,
) -> GridAlignResult<AlignOutcome> {
    if images.is_empty() {
        return Err(GridAlignError::InvalidConfig {
            reason: "no images to align".into(),
        });
    }
    if cfg.grid_levels == 0 {
        return Err(GridAlignError::InvalidConfig {
            reason: "grid_levels must be at least 1".into(),
        });
    }
    let index_of = |name: &str| -> GridAlignResult<usize> {
        images
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| GridAlignError::InvalidConfig {
                reason: format!("pair references unregistered image {name}"),
            })
    };
    for pair in pairs {
        index_of(&pair.image)?;
        index_of(&pair.reference)?;
    }
    let _span = trace_span!("align_set", images = images.len(), pairs = pairs.len()).entered();

    // Stage 1: correspondence search per pair. Failures drop the edge.
    let mut fields: Vec<(usize, DisplacementField)> = Vec::new();
    let mut failures = Vec::new();
    for (pidx, pair) in pairs.iter().enumerate() {
        match register_pair(store, pair, &cfg.register, engine) {
            Ok(field) => fields.push((pidx, field)),
            Err(err) => failures.push(PairFailure {
                image: pair.image.clone(),
                reference: pair.reference.clone(),
                reason: err.to_string(),
            }),
        }
    }
    if fields.is_empty() {
        return Err(GridAlignError::Degenerate {
            reason: "every pair failed registration".into(),
        });
    }
    trace_event!("pairs_registered", ok = fields.len(), failed = failures.len());

    let offsets = seed_offsets(images.len(), pairs, &index_of)?;
    let target = cfg.register.target_level;
    let base_spacing = cfg.register.grid_spacing;

    // Stage 2: multigrid over the vertex lattice, coarse to fine.
    let mut grids: Vec<Map> = Vec::new();
    for m in (0..cfg.grid_levels).rev() {
        let stride = 1usize << m;
        let spacing = base_spacing * stride;
        let level = target + spacing.trailing_zeros();

        let mut edges = Vec::new();
        for (pidx, field) in &fields {
            let pair = &pairs[*pidx];
            let coarse = subsample_field(field, stride);
            let reference = store.level(&pair.reference, target)?;
            let map = solve_local(&coarse, pair, reference.dims(), &cfg.solve)?;
            edges.push(Edge {
                from: index_of(&pair.image)?,
                to: index_of(&pair.reference)?,
                map,
            });
        }

        grids = if grids.is_empty() {
            images
                .iter()
                .enumerate()
                .map(|(i, name)| seed_grid(store, name, target, spacing, level, offsets[i]))
                .collect::<GridAlignResult<Vec<Map>>>()?
        } else {
            images
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    refine_grid(&grids[i], store, name, target, spacing, level)
                })
                .collect::<GridAlignResult<Vec<Map>>>()?
        };

        let stats = relax(&mut grids, &edges, &cfg.relax)?;
        trace_event!("relax_done", lattice = stride, sweeps = stats.sweeps);
    }

    for (i, grid) in grids.iter_mut().enumerate() {
        grid.image = images[i].clone();
        grid.reference = cfg.global_frame.clone();
    }
    Ok(AlignOutcome {
        maps: grids,
        failures,
    })
}

/// Chains the expected pair offsets from image 0 through the graph so
/// relaxation starts near the configured layout.
fn seed_offsets<F>(count: usize, pairs: &[Pair], index_of: &F) -> GridAlignResult<Vec<(f32, f32)>>
where
    F: Fn(&str) -> GridAlignResult<usize>,
{
    let mut offsets = vec![(0f32, 0f32); count];
    let mut known = vec![false; count];
    known[0] = true;
    let mut queue = std::collections::VecDeque::from([0usize]);
    while let Some(at) = queue.pop_front() {
        for pair in pairs {
            let from = index_of(&pair.image)?;
            let to = index_of(&pair.reference)?;
            if to == at && !known[from] {
                known[from] = true;
                offsets[from] = (offsets[to].0 + pair.offset.0, offsets[to].1 + pair.offset.1);
                queue.push_back(from);
            } else if from == at && !known[to] {
                known[to] = true;
                offsets[to] = (offsets[from].0 - pair.offset.0, offsets[from].1 - pair.offset.1);
                queue.push_back(to);
            }
        }
    }
    Ok(offsets)
}

/// Keeps every `stride`-th cell of a field, preserving the lattice origin.
fn subsample_field(field: &DisplacementField, stride: usize) -> DisplacementField {
    if stride == 1 {
        return DisplacementField {
            grid_w: field.grid_w,
            grid_h: field.grid_h,
            spacing: field.spacing,
            level: field.level,
            cells: field.cells.clone(),
        };
    }
    let grid_w = (field.grid_w - 1) / stride + 1;
    let grid_h = (field.grid_h - 1) / stride + 1;
    let mut cells = Vec::with_capacity(grid_w * grid_h);
    for j in 0..grid_h {
        for i in 0..grid_w {
            cells.push(field.cells[j * stride * field.grid_w + i * stride]);
        }
    }
    DisplacementField {
        grid_w,
        grid_h,
        spacing: field.spacing * stride,
        level: field.level,
        cells,
    }
}

/// Identity grid for one image, shifted by its seeded layout offset.
fn seed_grid(
    store: &PyramidStore,
    name: &str,
    target: u32,
    spacing: usize,
    level: u32,
    offset: (f32, f32),
) -> GridAlignResult<Map> {
    let (w, h) = store.level(name, target)?.dims();
    let width = w.div_ceil(spacing);
    let height = h.div_ceil(spacing);
    let scale = (1u64 << level) as f32;
    let mut map = Map::identity(level, width, height, name, "global")?;
    for element in &mut map.elements {
        element.x += offset.0 / scale;
        element.y += offset.1 / scale;
    }
    Ok(map)
}

/// Upsamples a relaxed grid to the next finer lattice.
fn refine_grid(
    old: &Map,
    store: &PyramidStore,
    name: &str,
    target: u32,
    spacing: usize,
    level: u32,
) -> GridAlignResult<Map> {
    debug_assert_eq!(old.level, level + 1);
    let (w, h) = store.level(name, target)?.dims();
    let width = w.div_ceil(spacing);
    let height = h.div_ceil(spacing);

    let sample_clamped = |gx: f32, gy: f32| -> (f32, f32) {
        let i0 = (gx.floor() as usize).min(old.width.saturating_sub(1));
        let j0 = (gy.floor() as usize).min(old.height.saturating_sub(1));
        let i1 = (i0 + 1).min(old.width - 1);
        let j1 = (j0 + 1).min(old.height - 1);
        let fx = (gx - i0 as f32).clamp(0.0, 1.0);
        let fy = (gy - j0 as f32).clamp(0.0, 1.0);
        let e00 = old.get(i0, j0);
        let e10 = old.get(i1, j0);
        let e01 = old.get(i0, j1);
        let e11 = old.get(i1, j1);
        let lerp = |a: f32, b: f32, c: f32, d: f32| {
            let top = a + fx * (b - a);
            let bottom = c + fx * (d - c);
            top + fy * (bottom - top)
        };
        (
            lerp(e00.x, e10.x, e01.x, e11.x),
            lerp(e00.y, e10.y, e01.y, e11.y),
        )
    };

    let mut elements = Vec::with_capacity(width * height);
    for j in 0..height {
        for i in 0..width {
            let (x, y) = sample_clamped(i as f32 / 2.0, j as f32 / 2.0);
            elements.push(MapElement {
                x: x * 2.0,
                y: y * 2.0,
                c: 1.0,
            });
        }
    }
    Ok(Map {
        level,
        width,
        height,
        x_min: 0,
        y_min: 0,
        image: name.to_string(),
        reference: "global".to_string(),
        elements,
    })
}
