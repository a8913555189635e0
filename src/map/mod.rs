//! Deformation maps.
//!
//! A map is a regular grid of vertices covering one image at a pyramid
//! level. Vertex `(i, j)` corresponds to source pixel `(x_min + i,
//! y_min + j)` at the map's level and stores `(x, y, c)`: its current
//! position in the reference frame at the same level, plus a confidence
//! weight in `[0, 1]`. Vertices with zero confidence carry no constraint.

pub mod algebra;
pub mod io;
pub mod solve;

use crate::util::{GridAlignError, GridAlignResult};

/// One map vertex: reference-frame position and confidence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapElement {
    pub x: f32,
    pub y: f32,
    pub c: f32,
}

/// Dense deformation grid for one image.
#[derive(Clone, Debug)]
pub struct Map {
    /// Pyramid level the grid and its positions are expressed at.
    pub level: u32,
    /// Grid width in vertices.
    pub width: usize,
    /// Grid height in vertices.
    pub height: usize,
    /// Source coordinate of vertex (0, 0), in level pixels.
    pub x_min: i32,
    /// Source coordinate of vertex (0, 0), in level pixels.
    pub y_min: i32,
    /// Name of the image this map warps.
    pub image: String,
    /// Name of the frame positions are expressed in.
    pub reference: String,
    /// Row-major vertex array, `width * height` elements.
    pub elements: Vec<MapElement>,
}

impl Map {
    /// Builds an identity map: every vertex at its own source position
    /// with full confidence.
    pub fn identity(
        level: u32,
        width: usize,
        height: usize,
        image: &str,
        reference: &str,
    ) -> GridAlignResult<Self> {
        if width == 0 || height == 0 {
            return Err(GridAlignError::InvalidDimensions { width, height });
        }
        let mut elements = Vec::with_capacity(width * height);
        for j in 0..height {
            for i in 0..width {
                elements.push(MapElement {
                    x: i as f32,
                    y: j as f32,
                    c: 1.0,
                });
            }
        }
        Ok(Self {
            level,
            width,
            height,
            x_min: 0,
            y_min: 0,
            image: image.to_string(),
            reference: reference.to_string(),
            elements,
        })
    }

    /// Checks the structural invariants: element count matches the grid
    /// and names survive the single-line header format.
    pub fn validate(&self) -> GridAlignResult<()> {
        if self.elements.len() != self.width * self.height {
            return Err(GridAlignError::Format {
                reason: format!(
                    "map {}: {} elements for {}x{} grid",
                    self.image,
                    self.elements.len(),
                    self.width,
                    self.height
                ),
            });
        }
        for name in [&self.image, &self.reference] {
            if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
                return Err(GridAlignError::Format {
                    reason: format!("map name {name:?} is not header-safe"),
                });
            }
        }
        Ok(())
    }

    /// Returns the vertex at grid coordinates `(i, j)`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> MapElement {
        debug_assert!(i < self.width && j < self.height);
        self.elements[j * self.width + i]
    }

    /// Source position of vertex `(i, j)` in level pixels.
    #[inline]
    pub fn source_pos(&self, i: usize, j: usize) -> (f32, f32) {
        (self.x_min as f32 + i as f32, self.y_min as f32 + j as f32)
    }

    /// Bilinear sample of the map at a source position in level pixels.
    ///
    /// Returns the interpolated `(x, y, c)`, or `None` when the position
    /// falls outside the grid or any supporting vertex has zero
    /// confidence.
    pub fn sample(&self, sx: f32, sy: f32) -> Option<(f32, f32, f32)> {
        let gx = sx - self.x_min as f32;
        let gy = sy - self.y_min as f32;
        if gx < 0.0 || gy < 0.0 || gx > (self.width - 1) as f32 || gy > (self.height - 1) as f32 {
            return None;
        }
        // Clamp so sampling exactly on the last vertex line interpolates
        // from the final cell; 1-wide grids degenerate to their only column.
        let i = (gx.floor() as usize).min(self.width.saturating_sub(2));
        let j = (gy.floor() as usize).min(self.height.saturating_sub(2));
        let i1 = (i + 1).min(self.width - 1);
        let j1 = (j + 1).min(self.height - 1);
        let fx = gx - i as f32;
        let fy = gy - j as f32;
        let e00 = self.get(i, j);
        let e10 = self.get(i1, j);
        let e01 = self.get(i, j1);
        let e11 = self.get(i1, j1);
        if e00.c <= 0.0 || e10.c <= 0.0 || e01.c <= 0.0 || e11.c <= 0.0 {
            return None;
        }
        let lerp2 = |a: f32, b: f32, c: f32, d: f32| {
            let top = a + fx * (b - a);
            let bottom = c + fx * (d - c);
            top + fy * (bottom - top)
        };
        Some((
            lerp2(e00.x, e10.x, e01.x, e11.x),
            lerp2(e00.y, e10.y, e01.y, e11.y),
            lerp2(e00.c, e10.c, e01.c, e11.c),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::Map;

    #[test]
    fn identity_map_samples_identity() {
        let map = Map::identity(2, 5, 4, "img", "ref").unwrap();
        map.validate().unwrap();
        let (x, y, c) = map.sample(1.5, 2.25).unwrap();
        assert!((x - 1.5).abs() < 1e-6);
        assert!((y - 2.25).abs() < 1e-6);
        assert!((c - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sample_outside_grid_is_none() {
        let map = Map::identity(0, 3, 3, "img", "ref").unwrap();
        assert!(map.sample(-0.5, 1.0).is_none());
        assert!(map.sample(2.5, 1.0).is_none());
    }

    #[test]
    fn sample_through_zero_confidence_is_none() {
        let mut map = Map::identity(0, 3, 3, "img", "ref").unwrap();
        map.elements[4].c = 0.0;
        assert!(map.sample(0.5, 0.5).is_none());
        assert!(map.sample(0.2, 1.8).is_none());
    }

    #[test]
    fn validate_rejects_bad_element_count_and_names() {
        let mut map = Map::identity(0, 3, 3, "img", "ref").unwrap();
        map.elements.pop();
        assert!(map.validate().is_err());

        let map = Map::identity(0, 2, 2, "has space", "ref").unwrap();
        assert!(map.validate().is_err());
    }
}
