//! Error types for gridalign.

use thiserror::Error;

/// Result alias for gridalign operations.
pub type GridAlignResult<T> = std::result::Result<T, GridAlignError>;

/// Errors that can occur when running gridalign operations.
///
/// Per-cell and per-pair failures stay local to their work unit; only
/// `Transport` is fatal to a dispatcher loop. All messages render as a
/// single ASCII line.
#[derive(Debug, Error)]
pub enum GridAlignError {
    /// A required file path does not exist or is unreadable.
    #[error("input missing: {path}")]
    InputMissing { path: String },
    /// A file header was rejected or the body was truncated.
    #[error("format error: {reason}")]
    Format { reason: String },
    /// An allocation failed; the current unit is aborted.
    #[error("out of memory: {context}")]
    OutOfMemory { context: &'static str },
    /// Insufficient valid mask area, zero-variance patch, or too few
    /// accepted correspondences.
    #[error("degenerate input: {reason}")]
    Degenerate { reason: String },
    /// Relaxation exceeded its iteration cap without meeting tolerance.
    #[error("relaxation did not converge after {sweeps} sweeps")]
    Convergence { sweeps: usize },
    /// Message-passing failure between master and worker.
    #[error("transport error: {reason}")]
    Transport { reason: String },
    /// The input dimensions are invalid (zero or overflowing).
    #[error("invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },
    /// A buffer was smaller than the view it should back.
    #[error("buffer too small: needed {needed}, got {got}")]
    BufferTooSmall { needed: usize, got: usize },
    /// The row stride is smaller than the row width.
    #[error("invalid stride {stride} for width {width}")]
    InvalidStride { width: usize, stride: usize },
    /// A requested ROI does not fit inside the image.
    #[error("roi {width}x{height}+{x}+{y} out of bounds for {img_width}x{img_height} image")]
    RoiOutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        img_width: usize,
        img_height: usize,
    },
    /// An index exceeded the valid range for its context.
    #[error("{context} index {index} out of bounds (len {len})")]
    IndexOutOfBounds {
        index: usize,
        len: usize,
        context: &'static str,
    },
    /// A configuration value is out of range or inconsistent.
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
    /// An I/O operation failed.
    #[error("io error on {path}: {reason}")]
    Io { path: String, reason: String },
    /// Decoding through the `image` crate failed.
    #[error("image decode failed: {reason}")]
    ImageIo { reason: String },
}

impl GridAlignError {
    /// Wraps an I/O error with its path, mapping missing files to
    /// `InputMissing`.
    pub fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            GridAlignError::InputMissing {
                path: path.display().to_string(),
            }
        } else {
            GridAlignError::Io {
                path: path.display().to_string(),
                reason: err.to_string(),
            }
        }
    }
}
