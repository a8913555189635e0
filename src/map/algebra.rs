//! Composition and inversion of deformation maps.
//!
//! Both operations treat a map as a piecewise-bilinear function from its
//! source grid to the reference frame. Composition chains two maps
//! through bilinear sampling; inversion rasterizes each forward quad and
//! assigns source coordinates to the reference-grid vertices it covers.
//! For a smooth invertible map, `compose(m, invert(m))` is the identity
//! to within interpolation error.

use crate::map::{Map, MapElement};
use crate::util::{GridAlignError, GridAlignResult};

/// Composes two maps: `out(v) = b(a(v))`.
///
/// `a` must be expressed in the frame `b` warps (`a.reference ==
/// b.image`) and both must live at the same level. Vertices of `a` whose
/// image falls outside `b`'s constrained region come out with zero
/// confidence.
pub fn compose(a: &Map, b: &Map) -> GridAlignResult<Map> {
    if a.level != b.level {
        return Err(GridAlignError::InvalidConfig {
            reason: format!("compose level mismatch: {} vs {}", a.level, b.level),
        });
    }
    if a.reference != b.image {
        return Err(GridAlignError::InvalidConfig {
            reason: format!(
                "compose frame mismatch: {} warps into {}, not {}",
                a.image, a.reference, b.image
            ),
        });
    }

    let mut elements = Vec::with_capacity(a.elements.len());
    for element in &a.elements {
        if element.c <= 0.0 {
            elements.push(MapElement {
                x: 0.0,
                y: 0.0,
                c: 0.0,
            });
            continue;
        }
        match b.sample(element.x, element.y) {
            Some((x, y, c)) => elements.push(MapElement {
                x,
                y,
                c: element.c.min(c),
            }),
            None => elements.push(MapElement {
                x: 0.0,
                y: 0.0,
                c: 0.0,
            }),
        }
    }

    Ok(Map {
        level: a.level,
        width: a.width,
        height: a.height,
        x_min: a.x_min,
        y_min: a.y_min,
        image: a.image.clone(),
        reference: b.reference.clone(),
        elements,
    })
}

/// Inverts a map over a reference extent of `width x height` vertices.
///
/// Each forward quad with four confident corners is split into two
/// triangles; every integer reference position inside a triangle gets
/// the barycentric combination of the corners' source coordinates.
/// Reference vertices covered by no quad stay at zero confidence. The
/// map is assumed invertible over its confident region; where forward
/// quads fold over, the later quad in raster order wins.
pub fn invert(map: &Map, width: usize, height: usize) -> GridAlignResult<Map> {
    if width == 0 || height == 0 {
        return Err(GridAlignError::InvalidDimensions { width, height });
    }
    let mut out = Map {
        level: map.level,
        width,
        height,
        x_min: 0,
        y_min: 0,
        image: map.reference.clone(),
        reference: map.image.clone(),
        elements: vec![
            MapElement {
                x: 0.0,
                y: 0.0,
                c: 0.0,
            };
            width * height
        ],
    };

    for j in 0..map.height.saturating_sub(1) {
        for i in 0..map.width.saturating_sub(1) {
            let e00 = map.get(i, j);
            let e10 = map.get(i + 1, j);
            let e01 = map.get(i, j + 1);
            let e11 = map.get(i + 1, j + 1);
            if e00.c <= 0.0 || e10.c <= 0.0 || e01.c <= 0.0 || e11.c <= 0.0 {
                continue;
            }
            let s00 = map.source_pos(i, j);
            let s10 = map.source_pos(i + 1, j);
            let s01 = map.source_pos(i, j + 1);
            let s11 = map.source_pos(i + 1, j + 1);
            let c_min = e00.c.min(e10.c).min(e01.c).min(e11.c);

            scan_triangle(&mut out, (e00, s00), (e10, s10), (e11, s11), c_min);
            scan_triangle(&mut out, (e00, s00), (e11, s11), (e01, s01), c_min);
        }
    }
    Ok(out)
}

type Corner = (MapElement, (f32, f32));

fn scan_triangle(out: &mut Map, a: Corner, b: Corner, c: Corner, conf: f32) {
    let (pa, sa) = a;
    let (pb, sb) = b;
    let (pc, sc) = c;

    let cross = |ox: f32, oy: f32, px: f32, py: f32| ox * py - oy * px;
    let denom = cross(pb.x - pa.x, pb.y - pa.y, pc.x - pa.x, pc.y - pa.y);
    if denom.abs() < 1e-12 {
        return;
    }

    let min_x = pa.x.min(pb.x).min(pc.x).floor().max(0.0) as usize;
    let min_y = pa.y.min(pb.y).min(pc.y).floor().max(0.0) as usize;
    let max_x = (pa.x.max(pb.x).max(pc.x).ceil() as usize).min(out.width - 1);
    let max_y = (pa.y.max(pb.y).max(pc.y).ceil() as usize).min(out.height - 1);

    const EPS: f32 = 1e-4;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let px = x as f32;
            let py = y as f32;
            let u = cross(px - pa.x, py - pa.y, pc.x - pa.x, pc.y - pa.y) / denom;
            let v = cross(pb.x - pa.x, pb.y - pa.y, px - pa.x, py - pa.y) / denom;
            if u < -EPS || v < -EPS || u + v > 1.0 + EPS {
                continue;
            }
            let sx = sa.0 + u * (sb.0 - sa.0) + v * (sc.0 - sa.0);
            let sy = sa.1 + u * (sb.1 - sa.1) + v * (sc.1 - sa.1);
            out.elements[y * out.width + x] = MapElement {
                x: sx,
                y: sy,
                c: conf,
            };
        }
    }
}
