//! gridalign aligns large collections of 2-D grayscale rasters into a
//! mutually consistent frame, producing a dense deformation map per
//! image.
//!
//! The pipeline for one pair runs pyramid construction, mask distance
//! transforms, a hierarchical FFT-correlation correspondence search, and
//! a local map solve; a global relaxation then reconciles all pair maps
//! over the image adjacency graph. The `par` module distributes any of
//! these stages as work units across a master/worker mesh.

pub mod align;
pub mod corr;
pub mod fft;
pub mod image;
pub mod map;
pub mod par;
pub mod relax;
pub mod util;

pub(crate) mod trace;

pub use align::{align_set, AlignConfig, AlignOutcome};
pub use corr::{register_pair, DisplacementField, Pair, RegisterConfig};
pub use fft::{FftEngine, RustFftEngine};
pub use image::pyramid::{PyramidStore, StoreConfig};
pub use image::{Bitmap, ImageView, OwnedImage};
pub use map::{Map, MapElement};
pub use util::{GridAlignError, GridAlignResult};
