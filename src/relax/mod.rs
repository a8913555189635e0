//! Global relaxation of per-image deformation grids.
//!
//! Every image carries a grid mapping its source lattice into a shared
//! global frame. Pair maps tie the grids together: for a pair (moving,
//! reference), each moving vertex should land where the reference grid
//! puts its matched position. Relaxation runs Gauss-Seidel sweeps that
//! move each vertex to the weighted average of the positions demanded by
//! its pair constraints, a Laplacian smoothing stencil, and a stretch
//! penalty against the grid's rest shape (the shape the grids were
//! seeded with). Sweeps stop when the largest vertex movement falls
//! below the tolerance scaled to the grid level, or fail with a
//! convergence error at the sweep cap.
//!
//! Images are partitioned into color classes so no two images sharing an
//! edge update concurrently; classes run sequentially, images within a
//! class in parallel, vertices in raster order per image.

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::map::Map;
use crate::trace::{trace_event, trace_span};
use crate::util::{GridAlignError, GridAlignResult};

/// One pair edge of the adjacency graph.
pub struct Edge {
    /// Index of the moving image.
    pub from: usize,
    /// Index of the reference image.
    pub to: usize,
    /// Pair map from the moving image's lattice into the reference
    /// image's source frame, at the grids' level.
    pub map: Map,
}

/// Parameters of the global relaxation.
#[derive(Clone, Debug)]
pub struct RelaxConfig {
    /// Laplacian smoothing weight per neighbor (`mu`).
    pub smoothness: f32,
    /// Stretch/shear penalty weight per neighbor (`nu`).
    pub rigidity: f32,
    /// Convergence threshold in level-0 pixels.
    pub relax_tol: f32,
    /// Sweep cap; exceeding it is a convergence error.
    pub max_sweeps: usize,
    /// Pin the first image's grid to remove the global translation.
    pub anchor_first: bool,
}

impl Default for RelaxConfig {
    fn default() -> Self {
        Self {
            smoothness: 0.5,
            rigidity: 0.25,
            relax_tol: 0.01,
            max_sweeps: 500,
            anchor_first: true,
        }
    }
}

/// Outcome of a converged relaxation.
#[derive(Clone, Copy, Debug)]
pub struct RelaxStats {
    /// Sweeps executed until convergence.
    pub sweeps: usize,
    /// Largest vertex movement of the final sweep, in level pixels.
    pub max_move: f32,
}

/// Greedy coloring of the image graph; no edge joins two images of the
/// same color. Images are visited in registered order, so the assignment
/// is deterministic.
pub(crate) fn color_images(count: usize, edges: &[Edge]) -> Vec<Vec<usize>> {
    let mut neighbors: Vec<Vec<usize>> = vec![Vec::new(); count];
    for edge in edges {
        if edge.from != edge.to {
            neighbors[edge.from].push(edge.to);
            neighbors[edge.to].push(edge.from);
        }
    }
    let mut color = vec![usize::MAX; count];
    let mut classes: Vec<Vec<usize>> = Vec::new();
    for i in 0..count {
        let mut used = vec![false; classes.len() + 1];
        for &n in &neighbors[i] {
            if color[n] != usize::MAX && color[n] < used.len() {
                used[color[n]] = true;
            }
        }
        let c = used.iter().position(|&u| !u).expect("one color is free");
        color[i] = c;
        if c == classes.len() {
            classes.push(Vec::new());
        }
        classes[c].push(i);
    }
    classes
}

struct Incoming {
    // Continuous attachment point in this image's source frame.
    px: f32,
    py: f32,
    // The constraining image and the attachment in its source frame.
    source: usize,
    ux: f32,
    uy: f32,
    weight: f32,
}

/// Relaxes the grids in place until converged.
///
/// All grids and edge maps must live at the same level. Returns the
/// sweep statistics, or a convergence error if the sweep cap is reached.
pub fn relax(grids: &mut [Map], edges: &[Edge], cfg: &RelaxConfig) -> GridAlignResult<RelaxStats> {
    if grids.is_empty() {
        return Ok(RelaxStats {
            sweeps: 0,
            max_move: 0.0,
        });
    }
    let level = grids[0].level;
    for grid in grids.iter() {
        if grid.level != level {
            return Err(GridAlignError::InvalidConfig {
                reason: "relaxation grids must share one level".into(),
            });
        }
    }
    for edge in edges {
        if edge.from >= grids.len() || edge.to >= grids.len() {
            return Err(GridAlignError::IndexOutOfBounds {
                index: edge.from.max(edge.to),
                len: grids.len(),
                context: "edge image",
            });
        }
        if edge.map.level != level {
            return Err(GridAlignError::InvalidConfig {
                reason: format!(
                    "edge {} -> {} map at level {}, grids at {}",
                    edge.from, edge.to, edge.map.level, level
                ),
            });
        }
    }
    let _span = trace_span!("relax", images = grids.len(), level = level).entered();

    // Rest shape: the seeded geometry of each grid.
    let rests: Vec<Map> = grids.iter().cloned().collect();

    // Scatter constraints onto the reference side of each edge. The
    // geometry is fixed during relaxation, so this happens once.
    let mut incoming: Vec<Vec<Incoming>> = (0..grids.len()).map(|_| Vec::new()).collect();
    for edge in edges {
        for j in 0..edge.map.height {
            for i in 0..edge.map.width {
                let e = edge.map.get(i, j);
                if e.c <= 0.0 {
                    continue;
                }
                let (ux, uy) = edge.map.source_pos(i, j);
                incoming[edge.to].push(Incoming {
                    px: e.x,
                    py: e.y,
                    source: edge.from,
                    ux,
                    uy,
                    weight: e.c,
                });
            }
        }
    }

    let classes = color_images(grids.len(), edges);
    let threshold = cfg.relax_tol / (1u32 << level) as f32;

    for sweep in 0..cfg.max_sweeps {
        let mut max_move = 0f32;
        for class in &classes {
            let updatable: Vec<usize> = class
                .iter()
                .copied()
                .filter(|&i| !(cfg.anchor_first && i == 0))
                .collect();
            let snapshot: &[Map] = grids;

            #[cfg(feature = "rayon")]
            let updates: Vec<(usize, Map, f32)> = updatable
                .par_iter()
                .map(|&i| {
                    let (grid, moved) =
                        sweep_image(i, snapshot, edges, &rests[i], &incoming[i], cfg);
                    (i, grid, moved)
                })
                .collect();
            #[cfg(not(feature = "rayon"))]
            let updates: Vec<(usize, Map, f32)> = updatable
                .iter()
                .map(|&i| {
                    let (grid, moved) =
                        sweep_image(i, snapshot, edges, &rests[i], &incoming[i], cfg);
                    (i, grid, moved)
                })
                .collect();

            for (i, grid, moved) in updates {
                grids[i] = grid;
                max_move = max_move.max(moved);
            }
        }
        if max_move < threshold {
            trace_event!("relax_converged", sweeps = sweep + 1);
            return Ok(RelaxStats {
                sweeps: sweep + 1,
                max_move,
            });
        }
    }
    Err(GridAlignError::Convergence {
        sweeps: cfg.max_sweeps,
    })
}

/// One Gauss-Seidel sweep over a single image's grid.
///
/// Reads the other images' grids as they stood at the start of the
/// class, its own grid in place (raster order), and returns the updated
/// grid plus the largest vertex movement.
fn sweep_image(
    index: usize,
    grids: &[Map],
    edges: &[Edge],
    rest: &Map,
    incoming: &[Incoming],
    cfg: &RelaxConfig,
) -> (Map, f32) {
    let mut grid = grids[index].clone();
    let (w, h) = (grid.width, grid.height);
    let n = w * h;

    // Incoming springs attach at continuous points; distribute each pull
    // onto the four surrounding vertices with its bilinear coefficients.
    let mut acc = vec![(0f32, 0f32, 0f32); n];
    for spring in incoming {
        let Some((tx, ty, tc)) = grids[spring.source].sample(spring.ux, spring.uy) else {
            continue;
        };
        let Some((cx, cy, _)) = grid.sample(spring.px, spring.py) else {
            continue;
        };
        let fx = tx - cx;
        let fy = ty - cy;
        let weight = spring.weight * tc;

        let gx = spring.px - grid.x_min as f32;
        let gy = spring.py - grid.y_min as f32;
        let i0 = (gx.floor() as usize).min(w.saturating_sub(2));
        let j0 = (gy.floor() as usize).min(h.saturating_sub(2));
        let bx = gx - i0 as f32;
        let by = gy - j0 as f32;
        for (di, dj, beta) in [
            (0usize, 0usize, (1.0 - bx) * (1.0 - by)),
            (1, 0, bx * (1.0 - by)),
            (0, 1, (1.0 - bx) * by),
            (1, 1, bx * by),
        ] {
            let i = (i0 + di).min(w - 1);
            let j = (j0 + dj).min(h - 1);
            let idx = j * w + i;
            let e = grid.get(i, j);
            let wb = weight * beta;
            acc[idx].0 += wb * (e.x + fx);
            acc[idx].1 += wb * (e.y + fy);
            acc[idx].2 += wb;
        }
    }

    let outgoing: Vec<&Edge> = edges.iter().filter(|e| e.from == index).collect();
    let mut max_move = 0f32;

    for j in 0..h {
        for i in 0..w {
            let idx = j * w + i;
            let element = grid.get(i, j);
            if element.c <= 0.0 {
                continue;
            }
            let (sx, sy) = grid.source_pos(i, j);
            let mut tx = acc[idx].0;
            let mut ty = acc[idx].1;
            let mut tw = acc[idx].2;

            // Pair constraints this image originates.
            for edge in &outgoing {
                let Some((mx, my, mc)) = edge.map.sample(sx, sy) else {
                    continue;
                };
                let Some((gx, gy, gc)) = grids[edge.to].sample(mx, my) else {
                    continue;
                };
                let weight = mc * gc;
                tx += weight * gx;
                ty += weight * gy;
                tw += weight;
            }

            // Smoothing: neighbors shifted by the rest-shape offsets.
            let rest_v = rest.get(i, j);
            let mut neighbor = |ni: i64, nj: i64, weight: f32, preserve_length: bool| {
                if ni < 0 || nj < 0 || ni >= w as i64 || nj >= h as i64 {
                    return;
                }
                let (ni, nj) = (ni as usize, nj as usize);
                let e = grid.get(ni, nj);
                if e.c <= 0.0 {
                    return;
                }
                let rest_n = rest.get(ni, nj);
                let rho = (rest_v.x - rest_n.x, rest_v.y - rest_n.y);
                if preserve_length {
                    // Pull toward the rest edge length along the current
                    // direction.
                    let cur = (element.x - e.x, element.y - e.y);
                    let len = (cur.0 * cur.0 + cur.1 * cur.1).sqrt();
                    let rest_len = (rho.0 * rho.0 + rho.1 * rho.1).sqrt();
                    if len > 1e-9 {
                        let s = rest_len / len;
                        tx += weight * (e.x + cur.0 * s);
                        ty += weight * (e.y + cur.1 * s);
                        tw += weight;
                    }
                } else {
                    tx += weight * (e.x + rho.0);
                    ty += weight * (e.y + rho.1);
                    tw += weight;
                }
            };
            let (il, jl) = (i as i64, j as i64);
            neighbor(il - 1, jl, cfg.smoothness, false);
            neighbor(il + 1, jl, cfg.smoothness, false);
            neighbor(il, jl - 1, cfg.smoothness, false);
            neighbor(il, jl + 1, cfg.smoothness, false);
            neighbor(il - 1, jl - 1, cfg.rigidity, true);
            neighbor(il + 1, jl - 1, cfg.rigidity, true);
            neighbor(il - 1, jl + 1, cfg.rigidity, true);
            neighbor(il + 1, jl + 1, cfg.rigidity, true);

            if tw <= 0.0 {
                continue;
            }
            let nx = tx / tw;
            let ny = ty / tw;
            let moved = ((nx - element.x).powi(2) + (ny - element.y).powi(2)).sqrt();
            max_move = max_move.max(moved);
            grid.elements[idx].x = nx;
            grid.elements[idx].y = ny;
        }
    }
    (grid, max_move)
}

#[cfg(test)]
mod tests {
    use super::{color_images, relax, Edge, RelaxConfig};
    use crate::map::Map;

    fn translated_pair_map(w: usize, h: usize, dx: f32, dy: f32) -> Map {
        let mut map = Map::identity(0, w, h, "a", "b").unwrap();
        for e in &mut map.elements {
            e.x += dx;
            e.y += dy;
        }
        map
    }

    #[test]
    fn coloring_separates_edge_endpoints() {
        let edges = vec![
            Edge {
                from: 0,
                to: 1,
                map: Map::identity(0, 2, 2, "a", "b").unwrap(),
            },
            Edge {
                from: 1,
                to: 2,
                map: Map::identity(0, 2, 2, "b", "c").unwrap(),
            },
        ];
        let classes = color_images(3, &edges);
        let color_of = |i: usize| classes.iter().position(|c| c.contains(&i)).unwrap();
        assert_ne!(color_of(0), color_of(1));
        assert_ne!(color_of(1), color_of(2));
    }

    #[test]
    fn two_images_converge_to_the_pair_offset() {
        // Image 1 overlaps image 0 shifted by (3, 1); with image 0
        // anchored at identity, image 1's grid must settle at (3, 1).
        let grid0 = Map::identity(0, 8, 8, "a", "global").unwrap();
        let grid1 = Map::identity(0, 8, 8, "b", "global").unwrap();
        let mut grids = vec![grid0, grid1];
        let edges = vec![Edge {
            from: 1,
            to: 0,
            map: translated_pair_map(8, 8, 3.0, 1.0),
        }];

        let cfg = RelaxConfig {
            relax_tol: 0.001,
            max_sweeps: 2000,
            ..RelaxConfig::default()
        };
        let stats = relax(&mut grids, &edges, &cfg).unwrap();
        assert!(stats.sweeps > 0);

        // Interior vertices of image 1 that stay inside image 0's grid
        // after the shift are fully constrained.
        for j in 1..4 {
            for i in 1..4 {
                let e = grids[1].get(i, j);
                assert!(
                    (e.x - (i as f32 + 3.0)).abs() < 0.05,
                    "vertex ({i},{j}) at x {}",
                    e.x
                );
                assert!((e.y - (j as f32 + 1.0)).abs() < 0.05);
            }
        }
        // The anchor never moves.
        let a = grids[0].get(4, 4);
        assert_eq!((a.x, a.y), (4.0, 4.0));
    }

    #[test]
    fn sweep_cap_yields_convergence_error() {
        let grid0 = Map::identity(0, 6, 6, "a", "global").unwrap();
        let grid1 = Map::identity(0, 6, 6, "b", "global").unwrap();
        let mut grids = vec![grid0, grid1];
        let edges = vec![Edge {
            from: 1,
            to: 0,
            map: translated_pair_map(6, 6, 2.0, 0.0),
        }];
        let cfg = RelaxConfig {
            relax_tol: 1e-9,
            max_sweeps: 1,
            ..RelaxConfig::default()
        };
        let err = relax(&mut grids, &edges, &cfg).unwrap_err();
        assert!(matches!(
            err,
            crate::util::GridAlignError::Convergence { .. }
        ));
    }
}
