//! Raster and mask codecs.
//!
//! PGM (P5) and PBM (P4, optionally gzip-compressed) have native readers
//! and writers because masks, cache files, and test fixtures round-trip
//! through them bit-exactly. Every other supported format (TIFF, JPEG,
//! BMP, PNG) is delegated to the `image` crate and forced to 8-bit
//! grayscale on load (`image-io` feature).
//!
//! When a path carries no extension, the known extensions are probed
//! against the filesystem in a fixed order. The index of the last
//! successful probe is cached in [`FormatProbe`] and tried first on the
//! next lookup, so a homogeneous data set probes once.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::image::{Bitmap, OwnedImage};
use crate::util::{GridAlignError, GridAlignResult};

const IMAGE_EXTENSIONS: &[&str] = &[
    ".tif", ".tiff", ".TIF", ".TIFF", ".pgm", ".PGM", ".ppm", ".PPM", ".jpg", ".JPG", ".jpeg",
    ".JPEG", ".bmp", ".BMP",
];
const BITMAP_EXTENSIONS: &[&str] = &[".pbm", ".pbm.gz"];

/// Cached extension lookup for paths given without an extension.
#[derive(Clone, Debug, Default)]
pub struct FormatProbe {
    image_idx: usize,
    bitmap_idx: usize,
}

impl FormatProbe {
    /// Resolves an image path, probing known extensions when absent.
    pub fn resolve_image(&mut self, path: &Path) -> GridAlignResult<PathBuf> {
        resolve(path, IMAGE_EXTENSIONS, &mut self.image_idx)
    }

    /// Resolves a bitmap path, probing `.pbm` and `.pbm.gz` when absent.
    pub fn resolve_bitmap(&mut self, path: &Path) -> GridAlignResult<PathBuf> {
        resolve(path, BITMAP_EXTENSIONS, &mut self.bitmap_idx)
    }
}

fn has_extension(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.contains('.'))
        .unwrap_or(false)
}

fn resolve(path: &Path, extensions: &[&str], cached: &mut usize) -> GridAlignResult<PathBuf> {
    if has_extension(path) {
        return Ok(path.to_path_buf());
    }
    let base = path.as_os_str().to_owned();
    for probe in 0..extensions.len() {
        let k = (*cached + probe) % extensions.len();
        let mut candidate = base.clone();
        candidate.push(extensions[k]);
        let candidate = PathBuf::from(candidate);
        if candidate.exists() {
            *cached = k;
            return Ok(candidate);
        }
    }
    Err(GridAlignError::InputMissing {
        path: path.display().to_string(),
    })
}

fn format_err(path: &Path, reason: &str) -> GridAlignError {
    GridAlignError::Format {
        reason: format!("{}: {reason}", path.display()),
    }
}

/// Reads one ASCII token from a netpbm header, skipping `#` comments.
fn read_token(reader: &mut impl Read, path: &Path) -> GridAlignResult<String> {
    let mut token = String::new();
    let mut in_comment = false;
    loop {
        let mut byte = [0u8; 1];
        let n = reader
            .read(&mut byte)
            .map_err(|err| GridAlignError::io(path, err))?;
        if n == 0 {
            if token.is_empty() {
                return Err(format_err(path, "truncated header"));
            }
            return Ok(token);
        }
        let c = byte[0];
        if in_comment {
            if c == b'\n' {
                in_comment = false;
            }
            continue;
        }
        match c {
            b'#' => in_comment = true,
            b' ' | b'\t' | b'\r' | b'\n' => {
                if !token.is_empty() {
                    return Ok(token);
                }
            }
            _ => token.push(c as char),
        }
    }
}

fn parse_dim(token: &str, path: &Path) -> GridAlignResult<usize> {
    token
        .parse::<usize>()
        .map_err(|_| format_err(path, "bad dimension in header"))
}

/// Reads a binary PGM (P5) image.
pub fn read_pgm(path: &Path) -> GridAlignResult<OwnedImage> {
    let file = File::open(path).map_err(|err| GridAlignError::io(path, err))?;
    let mut reader = BufReader::new(file);

    let magic = read_token(&mut reader, path)?;
    if magic != "P5" {
        return Err(format_err(path, "not a P5 pgm"));
    }
    let width = parse_dim(&read_token(&mut reader, path)?, path)?;
    let height = parse_dim(&read_token(&mut reader, path)?, path)?;
    let maxval = parse_dim(&read_token(&mut reader, path)?, path)?;
    if maxval != 255 {
        return Err(format_err(path, "only maxval 255 supported"));
    }

    let mut data = vec![0u8; width.checked_mul(height).ok_or_else(|| {
        format_err(path, "dimensions overflow")
    })?];
    reader
        .read_exact(&mut data)
        .map_err(|_| format_err(path, "truncated pixel data"))?;
    OwnedImage::new(data, width, height)
}

/// Writes a binary PGM (P5) image.
pub fn write_pgm(path: &Path, image: &OwnedImage) -> GridAlignResult<()> {
    let file = File::create(path).map_err(|err| GridAlignError::io(path, err))?;
    let mut writer = BufWriter::new(file);
    write!(writer, "P5\n{} {}\n255\n", image.width(), image.height())
        .and_then(|_| writer.write_all(image.data()))
        .and_then(|_| writer.flush())
        .map_err(|err| GridAlignError::io(path, err))
}

fn is_gz(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

/// Reads a binary PBM (P4) bitmap, transparently gunzipping `.pbm.gz`.
pub fn read_pbm(path: &Path) -> GridAlignResult<Bitmap> {
    let file = File::open(path).map_err(|err| GridAlignError::io(path, err))?;
    if is_gz(path) {
        read_pbm_stream(&mut BufReader::new(GzDecoder::new(file)), path)
    } else {
        read_pbm_stream(&mut BufReader::new(file), path)
    }
}

fn read_pbm_stream(reader: &mut impl Read, path: &Path) -> GridAlignResult<Bitmap> {
    let magic = read_token(reader, path)?;
    if magic != "P4" {
        return Err(format_err(path, "not a P4 pbm"));
    }
    let width = parse_dim(&read_token(reader, path)?, path)?;
    let height = parse_dim(&read_token(reader, path)?, path)?;
    let stride = width.div_ceil(8);
    let mut data = vec![0u8; stride.checked_mul(height).ok_or_else(|| {
        format_err(path, "dimensions overflow")
    })?];
    reader
        .read_exact(&mut data)
        .map_err(|_| format_err(path, "truncated bitmap data"))?;
    Bitmap::from_bytes(data, width, height)
}

/// Writes a binary PBM (P4) bitmap, gzipping when the path ends in `.gz`.
pub fn write_pbm(path: &Path, mask: &Bitmap) -> GridAlignResult<()> {
    let file = File::create(path).map_err(|err| GridAlignError::io(path, err))?;
    let result = if is_gz(path) {
        let mut writer = GzEncoder::new(BufWriter::new(file), flate2::Compression::default());
        write_pbm_stream(&mut writer, mask).and_then(|_| writer.finish().map(|_| ()))
    } else {
        let mut writer = BufWriter::new(file);
        write_pbm_stream(&mut writer, mask).and_then(|_| writer.flush())
    };
    result.map_err(|err| GridAlignError::io(path, err))
}

fn write_pbm_stream(writer: &mut impl Write, mask: &Bitmap) -> std::io::Result<()> {
    write!(writer, "P4\n{} {}\n", mask.width(), mask.height())?;
    writer.write_all(mask.bytes())
}

/// Loads a grayscale image, dispatching on the resolved extension.
pub fn load_image(path: &Path, probe: &mut FormatProbe) -> GridAlignResult<OwnedImage> {
    let resolved = probe.resolve_image(path)?;
    let ext = resolved
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pgm" => read_pgm(&resolved),
        _ => load_gray_dynamic(&resolved),
    }
}

/// Loads a mask bitmap, probing `.pbm` / `.pbm.gz` when needed.
pub fn load_mask(path: &Path, probe: &mut FormatProbe) -> GridAlignResult<Bitmap> {
    let resolved = probe.resolve_bitmap(path)?;
    read_pbm(&resolved)
}

#[cfg(feature = "image-io")]
fn load_gray_dynamic(path: &Path) -> GridAlignResult<OwnedImage> {
    let img = image::open(path).map_err(|err| GridAlignError::ImageIo {
        reason: err.to_string(),
    })?;
    let gray = img.to_luma8();
    let width = gray.width() as usize;
    let height = gray.height() as usize;
    OwnedImage::new(gray.into_raw(), width, height)
}

#[cfg(not(feature = "image-io"))]
fn load_gray_dynamic(path: &Path) -> GridAlignResult<OwnedImage> {
    Err(format_err(path, "built without image-io support"))
}

#[cfg(test)]
mod tests {
    use super::{read_pbm, read_pgm, write_pbm, write_pgm, FormatProbe};
    use crate::image::{Bitmap, OwnedImage};
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("gridalign-io-{}-{name}", std::process::id()));
        path
    }

    #[test]
    fn pgm_roundtrip_is_bit_exact() {
        let image = OwnedImage::new((0..=255).collect(), 16, 16).unwrap();
        let path = scratch("a.pgm");
        write_pgm(&path, &image).unwrap();
        let back = read_pgm(&path).unwrap();
        assert_eq!(back.width(), 16);
        assert_eq!(back.data(), image.data());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn pbm_roundtrip_is_bit_exact_plain_and_gz() {
        let mut mask = Bitmap::new_filled(13, 5, false).unwrap();
        mask.set(0, 0, true);
        mask.set(12, 4, true);
        mask.set(6, 2, true);
        for name in ["m.pbm", "m.pbm.gz"] {
            let path = scratch(name);
            write_pbm(&path, &mask).unwrap();
            let back = read_pbm(&path).unwrap();
            assert_eq!(back.bytes(), mask.bytes());
            assert_eq!((back.width(), back.height()), (13, 5));
            std::fs::remove_file(&path).ok();
        }
    }

    #[test]
    fn pgm_header_comments_are_skipped() {
        let path = scratch("c.pgm");
        std::fs::write(&path, b"P5\n# made by hand\n2 2\n255\n\x01\x02\x03\x04").unwrap();
        let image = read_pgm(&path).unwrap();
        assert_eq!(image.data(), &[1, 2, 3, 4]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn truncated_pgm_reports_format_error() {
        let path = scratch("t.pgm");
        std::fs::write(&path, b"P5\n4 4\n255\n\x01\x02").unwrap();
        let err = read_pgm(&path).unwrap_err();
        assert!(err.to_string().contains("truncated"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn probe_finds_and_caches_extension() {
        let image = OwnedImage::new(vec![9; 4], 2, 2).unwrap();
        let base = scratch("probe");
        let mut full = base.as_os_str().to_owned();
        full.push(".pgm");
        write_pgm(std::path::Path::new(&full), &image).unwrap();

        let mut probe = FormatProbe::default();
        let first = probe.resolve_image(&base).unwrap();
        assert_eq!(first, PathBuf::from(&full));
        // Second lookup starts at the cached index and hits immediately.
        let second = probe.resolve_image(&base).unwrap();
        assert_eq!(second, PathBuf::from(&full));
        std::fs::remove_file(PathBuf::from(full)).ok();
    }

    #[test]
    fn probe_reports_missing_when_nothing_matches() {
        let mut probe = FormatProbe::default();
        assert!(probe.resolve_image(&scratch("nope")).is_err());
    }
}
