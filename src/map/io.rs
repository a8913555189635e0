//! The "M1" map file format.
//!
//! ASCII header followed by the raw vertex array:
//!
//! ```text
//! M1\n
//! <level>\n
//! <mapWidth> <mapHeight>\n
//! <xMin> <yMin>\n
//! <imageName> <referenceName>\n
//! <mapWidth * mapHeight MapElements, row-major>
//! ```
//!
//! Elements are `{x, y, c}` as `f32` in the byte order of the producing
//! host; files are not portable across endiannesses and readers must
//! match. The body length must agree with the header exactly.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::map::{Map, MapElement};
use crate::util::{GridAlignError, GridAlignResult};

fn format_err(path: &Path, reason: &str) -> GridAlignError {
    GridAlignError::Format {
        reason: format!("{}: {reason}", path.display()),
    }
}

/// Writes a map in the M1 format.
pub fn write_map(path: &Path, map: &Map) -> GridAlignResult<()> {
    map.validate()?;
    let file = File::create(path).map_err(|err| GridAlignError::io(path, err))?;
    let mut writer = BufWriter::new(file);

    let header = format!(
        "M1\n{}\n{} {}\n{} {}\n{} {}\n",
        map.level, map.width, map.height, map.x_min, map.y_min, map.image, map.reference
    );
    let mut body = Vec::with_capacity(map.elements.len() * 12);
    for element in &map.elements {
        body.extend_from_slice(&element.x.to_ne_bytes());
        body.extend_from_slice(&element.y.to_ne_bytes());
        body.extend_from_slice(&element.c.to_ne_bytes());
    }
    writer
        .write_all(header.as_bytes())
        .and_then(|_| writer.write_all(&body))
        .and_then(|_| writer.flush())
        .map_err(|err| GridAlignError::io(path, err))
}

fn read_line(reader: &mut impl BufRead, path: &Path) -> GridAlignResult<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|err| GridAlignError::io(path, err))?;
    if n == 0 || !line.ends_with('\n') {
        return Err(format_err(path, "truncated header"));
    }
    line.pop();
    Ok(line)
}

fn two_fields(line: &str, path: &Path, what: &str) -> GridAlignResult<(String, String)> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => Ok((a.to_string(), b.to_string())),
        _ => Err(format_err(path, &format!("bad {what} line"))),
    }
}

/// Reads a map in the M1 format.
pub fn read_map(path: &Path) -> GridAlignResult<Map> {
    let file = File::open(path).map_err(|err| GridAlignError::io(path, err))?;
    let mut reader = BufReader::new(file);

    if read_line(&mut reader, path)? != "M1" {
        return Err(format_err(path, "bad magic"));
    }
    let level: u32 = read_line(&mut reader, path)?
        .parse()
        .map_err(|_| format_err(path, "bad level"))?;
    let (w, h) = two_fields(&read_line(&mut reader, path)?, path, "size")?;
    let width: usize = w.parse().map_err(|_| format_err(path, "bad width"))?;
    let height: usize = h.parse().map_err(|_| format_err(path, "bad height"))?;
    let (x, y) = two_fields(&read_line(&mut reader, path)?, path, "origin")?;
    let x_min: i32 = x.parse().map_err(|_| format_err(path, "bad x origin"))?;
    let y_min: i32 = y.parse().map_err(|_| format_err(path, "bad y origin"))?;
    let (image, reference) = two_fields(&read_line(&mut reader, path)?, path, "name")?;

    let count = width
        .checked_mul(height)
        .ok_or_else(|| format_err(path, "grid size overflow"))?;
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .map_err(|err| GridAlignError::io(path, err))?;
    if body.len() != count * 12 {
        return Err(format_err(
            path,
            &format!("body is {} bytes, expected {}", body.len(), count * 12),
        ));
    }

    let mut elements = Vec::with_capacity(count);
    for chunk in body.chunks_exact(12) {
        let x = f32::from_ne_bytes(chunk[0..4].try_into().expect("4-byte chunk"));
        let y = f32::from_ne_bytes(chunk[4..8].try_into().expect("4-byte chunk"));
        let c = f32::from_ne_bytes(chunk[8..12].try_into().expect("4-byte chunk"));
        elements.push(MapElement { x, y, c });
    }

    let map = Map {
        level,
        width,
        height,
        x_min,
        y_min,
        image,
        reference,
        elements,
    };
    map.validate()?;
    Ok(map)
}
