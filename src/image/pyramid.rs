//! Mask-aware image pyramids and the shared level store.
//!
//! Downsampling halves each dimension with a 2x2 box filter over valid
//! pixels only: the output pixel is the rounded mean of its up to four
//! valid contributors and the output mask bit is the OR of the contributor
//! bits. Level k has dimensions `ceil(W / 2^k) x ceil(H / 2^k)`; partial
//! 1x2 and 2x1 blocks at odd edges average over the pixels that exist.
//! Level building stops once either dimension reaches 1.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::image::dist::distance_transform;
use crate::image::io::{read_pbm, read_pgm, write_pbm, write_pgm};
use crate::image::{Bitmap, OwnedImage};
use crate::trace::trace_event;
use crate::util::{GridAlignError, GridAlignResult};

/// One pyramid level: pixels plus the validity mask at the same resolution.
pub struct PyramidLevel {
    pub image: OwnedImage,
    pub mask: Bitmap,
}

impl PyramidLevel {
    /// Returns the level dimensions.
    pub fn dims(&self) -> (usize, usize) {
        (self.image.width(), self.image.height())
    }
}

/// Reduces one level to the next by the mask-aware 2x2 box filter.
pub fn reduce_level(level: &PyramidLevel) -> GridAlignResult<PyramidLevel> {
    let src = &level.image;
    let mask = &level.mask;
    let (sw, sh) = (src.width(), src.height());
    if sw <= 1 && sh <= 1 {
        return Err(GridAlignError::Degenerate {
            reason: "cannot reduce a 1x1 level".into(),
        });
    }
    let dw = sw.div_ceil(2);
    let dh = sh.div_ceil(2);

    let mut pixels = vec![0u8; dw * dh];
    let mut out_mask = Bitmap::new_filled(dw, dh, false)?;
    let data = src.data();

    for y in 0..dh {
        for x in 0..dw {
            let mut sum = 0u32;
            let mut count = 0u32;
            for (sx, sy) in [
                (2 * x, 2 * y),
                (2 * x + 1, 2 * y),
                (2 * x, 2 * y + 1),
                (2 * x + 1, 2 * y + 1),
            ] {
                if sx < sw && sy < sh && mask.get(sx, sy) {
                    sum += u32::from(data[sy * sw + sx]);
                    count += 1;
                }
            }
            if count > 0 {
                pixels[y * dw + x] = ((sum + count / 2) / count) as u8;
                out_mask.set(x, y, true);
            }
        }
    }

    Ok(PyramidLevel {
        image: OwnedImage::new(pixels, dw, dh)?,
        mask: out_mask,
    })
}

/// Returns the number of levels available for a base resolution.
///
/// Level 0 always exists; reduction stops once either dimension reaches 1.
pub fn level_count(mut width: usize, mut height: usize) -> usize {
    let mut levels = 1;
    while width > 1 && height > 1 {
        width = width.div_ceil(2);
        height = height.div_ceil(2);
        levels += 1;
    }
    levels
}

/// Configuration for the shared pyramid store.
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    /// Directory for persisted levels and distance transforms; `None`
    /// disables disk caching.
    pub cache_dir: Option<PathBuf>,
    /// In-memory budget in bytes; zero means unbounded.
    pub memory_budget: usize,
}

struct CacheEntry {
    level: Arc<PyramidLevel>,
    bytes: usize,
    last_use: u64,
}

struct StoreState {
    levels: HashMap<(String, u32), CacheEntry>,
    dists: HashMap<(String, u32), Arc<Vec<f32>>>,
    clock: u64,
}

/// Shared store of pyramid levels and mask distance transforms.
///
/// Levels are built lazily from level 0 upward, kept in an LRU-bounded
/// memory cache, and optionally persisted so parallel workers can share.
/// Disk writes go to a temporary path and are renamed into place, giving
/// concurrent readers an all-or-nothing view.
pub struct PyramidStore {
    cfg: StoreConfig,
    state: Mutex<StoreState>,
}

impl PyramidStore {
    pub fn new(cfg: StoreConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(StoreState {
                levels: HashMap::new(),
                dists: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Registers the full-resolution raster and mask for `name`.
    pub fn insert_base(&self, name: &str, image: OwnedImage, mask: Bitmap) -> GridAlignResult<()> {
        if (image.width(), image.height()) != (mask.width(), mask.height()) {
            return Err(GridAlignError::InvalidDimensions {
                width: mask.width(),
                height: mask.height(),
            });
        }
        let bytes = image.data().len() + mask.bytes().len();
        let level = Arc::new(PyramidLevel { image, mask });
        let mut state = self.state.lock().expect("store lock");
        state.clock += 1;
        let tick = state.clock;
        state.levels.insert(
            (name.to_string(), 0),
            CacheEntry {
                level,
                bytes,
                last_use: tick,
            },
        );
        self.evict_over_budget(&mut state);
        Ok(())
    }

    /// Returns level `k` for `name`, building intermediate levels on demand.
    pub fn level(&self, name: &str, k: u32) -> GridAlignResult<Arc<PyramidLevel>> {
        {
            let mut state = self.state.lock().expect("store lock");
            state.clock += 1;
            let tick = state.clock;
            if let Some(entry) = state.levels.get_mut(&(name.to_string(), k)) {
                entry.last_use = tick;
                return Ok(entry.level.clone());
            }
        }

        if let Some(level) = self.load_cached(name, k)? {
            return Ok(self.remember(name, k, level));
        }

        if k == 0 {
            return Err(GridAlignError::InputMissing {
                path: format!("{name} (level 0 not registered)"),
            });
        }

        let below = self.level(name, k - 1)?;
        let (w, h) = below.dims();
        if w <= 1 || h <= 1 {
            return Err(GridAlignError::IndexOutOfBounds {
                index: k as usize,
                len: k as usize,
                context: "pyramid level",
            });
        }
        let level = reduce_level(&below)?;
        trace_event!("pyramid_reduce", level = k, width = level.image.width());
        self.persist(name, k, &level)?;
        Ok(self.remember(name, k, level))
    }

    /// Returns the Euclidean distance transform of the level-`k` mask.
    pub fn distance(&self, name: &str, k: u32) -> GridAlignResult<Arc<Vec<f32>>> {
        {
            let state = self.state.lock().expect("store lock");
            if let Some(dist) = state.dists.get(&(name.to_string(), k)) {
                return Ok(dist.clone());
            }
        }
        let level = self.level(name, k)?;
        let dist = Arc::new(distance_transform(&level.mask));
        let mut state = self.state.lock().expect("store lock");
        state
            .dists
            .insert((name.to_string(), k), dist.clone());
        Ok(dist)
    }

    fn remember(&self, name: &str, k: u32, level: PyramidLevel) -> Arc<PyramidLevel> {
        let bytes = level.image.data().len() + level.mask.bytes().len();
        let level = Arc::new(level);
        let mut state = self.state.lock().expect("store lock");
        state.clock += 1;
        let tick = state.clock;
        state.levels.insert(
            (name.to_string(), k),
            CacheEntry {
                level: level.clone(),
                bytes,
                last_use: tick,
            },
        );
        self.evict_over_budget(&mut state);
        level
    }

    fn evict_over_budget(&self, state: &mut StoreState) {
        if self.cfg.memory_budget == 0 {
            return;
        }
        let mut total: usize = state.levels.values().map(|e| e.bytes).sum();
        while total > self.cfg.memory_budget && state.levels.len() > 1 {
            let oldest = state
                .levels
                .iter()
                .min_by_key(|(_, e)| e.last_use)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    if let Some(entry) = state.levels.remove(&key) {
                        total -= entry.bytes;
                    }
                }
                None => break,
            }
        }
    }

    fn cache_paths(&self, name: &str, k: u32) -> Option<(PathBuf, PathBuf)> {
        let dir = self.cfg.cache_dir.as_ref()?;
        let tag = name.replace(['/', '\\'], "~");
        Some((
            dir.join(format!("{tag}.l{k}.pgm")),
            dir.join(format!("{tag}.l{k}.pbm")),
        ))
    }

    fn load_cached(&self, name: &str, k: u32) -> GridAlignResult<Option<PyramidLevel>> {
        let Some((img_path, mask_path)) = self.cache_paths(name, k) else {
            return Ok(None);
        };
        if !img_path.exists() || !mask_path.exists() {
            return Ok(None);
        }
        let image = read_pgm(&img_path)?;
        let mask = read_pbm(&mask_path)?;
        Ok(Some(PyramidLevel { image, mask }))
    }

    fn persist(&self, name: &str, k: u32, level: &PyramidLevel) -> GridAlignResult<()> {
        let Some((img_path, mask_path)) = self.cache_paths(name, k) else {
            return Ok(());
        };
        atomic_write(&img_path, |tmp| write_pgm(tmp, &level.image))?;
        atomic_write(&mask_path, |tmp| write_pbm(tmp, &level.mask))?;
        Ok(())
    }
}

/// Writes through a temporary sibling path, then renames into place.
fn atomic_write<F>(path: &std::path::Path, write: F) -> GridAlignResult<()>
where
    F: FnOnce(&std::path::Path) -> GridAlignResult<()>,
{
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp{}", std::process::id()));
    let tmp = PathBuf::from(tmp);
    write(&tmp)?;
    std::fs::rename(&tmp, path).map_err(|err| GridAlignError::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::{level_count, reduce_level, PyramidLevel, PyramidStore, StoreConfig};
    use crate::image::{Bitmap, OwnedImage};

    fn level_from(pixels: Vec<u8>, w: usize, h: usize) -> PyramidLevel {
        PyramidLevel {
            image: OwnedImage::new(pixels, w, h).unwrap(),
            mask: Bitmap::new_filled(w, h, true).unwrap(),
        }
    }

    #[test]
    fn reduce_halves_with_ceil_dims() {
        let level = level_from(vec![10; 5 * 3], 5, 3);
        let out = reduce_level(&level).unwrap();
        assert_eq!(out.dims(), (3, 2));
        assert!(out.image.data().iter().all(|&p| p == 10));
        assert_eq!(out.mask.count_set(), 6);
    }

    #[test]
    fn reduce_averages_only_valid_contributors() {
        let mut level = level_from(vec![100, 200, 60, 80], 2, 2);
        level.mask.set(1, 0, false);
        level.mask.set(1, 1, false);
        let out = reduce_level(&level).unwrap();
        assert_eq!(out.dims(), (1, 1));
        // Mean of the two valid pixels 100 and 60.
        assert_eq!(out.image.data()[0], 80);
        assert!(out.mask.get(0, 0));
    }

    #[test]
    fn reduce_clears_mask_when_no_contributor_valid() {
        let mut level = level_from(vec![50; 4], 2, 2);
        for y in 0..2 {
            for x in 0..2 {
                level.mask.set(x, y, false);
            }
        }
        let out = reduce_level(&level).unwrap();
        assert!(!out.mask.get(0, 0));
        assert_eq!(out.image.data()[0], 0);
    }

    #[test]
    fn level_count_stops_at_dimension_one() {
        assert_eq!(level_count(1, 1), 1);
        assert_eq!(level_count(512, 512), 10);
        assert_eq!(level_count(5, 17), 4);
    }

    #[test]
    fn store_builds_levels_lazily_and_reports_missing_base() {
        let store = PyramidStore::new(StoreConfig::default());
        assert!(store.level("absent", 0).is_err());

        let image = OwnedImage::new((0..64).map(|v| v as u8).collect(), 8, 8).unwrap();
        let mask = Bitmap::new_filled(8, 8, true).unwrap();
        store.insert_base("tile", image, mask).unwrap();

        let l2 = store.level("tile", 2).unwrap();
        assert_eq!(l2.dims(), (2, 2));
        // Second request hits the cache and agrees.
        let again = store.level("tile", 2).unwrap();
        assert_eq!(again.image.data(), l2.image.data());
    }

    #[test]
    fn store_distance_is_zero_only_off_mask() {
        let image = OwnedImage::new(vec![7; 16], 4, 4).unwrap();
        let mut mask = Bitmap::new_filled(4, 4, true).unwrap();
        mask.set(0, 0, false);
        let store = PyramidStore::new(StoreConfig::default());
        store.insert_base("t", image, mask).unwrap();
        let dist = store.distance("t", 0).unwrap();
        assert_eq!(dist[0], 0.0);
        assert!(dist[5] > 0.0);
    }
}
