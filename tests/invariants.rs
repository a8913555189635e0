//! Structural invariants: pyramid geometry, distance transforms, and
//! file-format round trips.

use gridalign::image::dist::distance_transform;
use gridalign::image::io::{read_pbm, read_pgm, write_pbm, write_pgm};
use gridalign::image::pyramid::{PyramidStore, StoreConfig};
use gridalign::map::io::{read_map, write_map};
use gridalign::{Bitmap, Map, OwnedImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

fn scratch(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("gridalign-inv-{}-{name}", std::process::id()));
    path
}

fn random_image(rng: &mut StdRng, w: usize, h: usize) -> (OwnedImage, Bitmap) {
    let data: Vec<u8> = (0..w * h).map(|_| rng.gen()).collect();
    let mut mask = Bitmap::new_filled(w, h, false).unwrap();
    for y in 0..h {
        for x in 0..w {
            mask.set(x, y, rng.gen_bool(0.85));
        }
    }
    (OwnedImage::new(data, w, h).unwrap(), mask)
}

#[test]
fn pyramid_levels_have_ceil_dimensions() {
    let mut rng = StdRng::seed_from_u64(2);
    let (w0, h0) = (37, 101);
    let (image, mask) = random_image(&mut rng, w0, h0);
    let store = PyramidStore::new(StoreConfig::default());
    store.insert_base("t", image, mask).unwrap();

    let mut w = w0;
    let mut h = h0;
    let mut k = 0;
    while w > 1 && h > 1 {
        w = w.div_ceil(2);
        h = h.div_ceil(2);
        k += 1;
        let level = store.level("t", k).unwrap();
        assert_eq!(level.dims(), (w, h), "level {k}");
    }
}

#[test]
fn pyramid_mask_or_property_holds_per_pixel() {
    let mut rng = StdRng::seed_from_u64(3);
    let (image, mask) = random_image(&mut rng, 23, 17);
    let store = PyramidStore::new(StoreConfig::default());
    store.insert_base("t", image, mask.clone()).unwrap();

    let reduced = store.level("t", 1).unwrap();
    for y in 0..reduced.mask.height() {
        for x in 0..reduced.mask.width() {
            let any_valid = mask.get(2 * x, 2 * y)
                || mask.get(2 * x + 1, 2 * y)
                || mask.get(2 * x, 2 * y + 1)
                || mask.get(2 * x + 1, 2 * y + 1);
            assert_eq!(reduced.mask.get(x, y), any_valid, "pixel ({x},{y})");
        }
    }
}

#[test]
fn one_pixel_wide_and_tall_images_survive() {
    let store = PyramidStore::new(StoreConfig::default());
    let image = OwnedImage::new(vec![9u8; 7], 1, 7).unwrap();
    let mask = Bitmap::new_filled(1, 7, true).unwrap();
    store.insert_base("thin", image, mask).unwrap();
    // Level 0 works; reduction below a 1-wide level is refused, not a crash.
    assert_eq!(store.level("thin", 0).unwrap().dims(), (1, 7));
    assert!(store.level("thin", 1).is_err());

    let image = OwnedImage::new(vec![9u8; 5], 5, 1).unwrap();
    let mask = Bitmap::new_filled(5, 1, true).unwrap();
    store.insert_base("flat", image, mask).unwrap();
    assert_eq!(store.level("flat", 0).unwrap().dims(), (5, 1));
    assert!(store.level("flat", 1).is_err());
}

#[test]
fn distance_transform_zero_iff_cleared_and_lipschitz() {
    let mut rng = StdRng::seed_from_u64(4);
    let (w, h) = (41, 29);
    let mut mask = Bitmap::new_filled(w, h, false).unwrap();
    for y in 0..h {
        for x in 0..w {
            mask.set(x, y, rng.gen_bool(0.9));
        }
    }
    let dist = distance_transform(&mask);
    for y in 0..h {
        for x in 0..w {
            let d = dist[y * w + x];
            assert_eq!(d == 0.0, !mask.get(x, y), "pixel ({x},{y})");
            if x + 1 < w {
                assert!((d - dist[y * w + x + 1]).abs() <= 1.0 + 1e-5);
            }
            if y + 1 < h {
                assert!((d - dist[(y + 1) * w + x]).abs() <= 1.0 + 1e-5);
            }
        }
    }
}

#[test]
fn lossless_image_formats_roundtrip_bit_exactly() {
    let mut rng = StdRng::seed_from_u64(5);
    let (image, mask) = random_image(&mut rng, 33, 21);

    let pgm = scratch("rt.pgm");
    write_pgm(&pgm, &image).unwrap();
    let image_back = read_pgm(&pgm).unwrap();
    assert_eq!(image_back.data(), image.data());
    std::fs::remove_file(&pgm).ok();

    for name in ["rt.pbm", "rt.pbm.gz"] {
        let path = scratch(name);
        write_pbm(&path, &mask).unwrap();
        let mask_back = read_pbm(&path).unwrap();
        assert_eq!(mask_back.bytes(), mask.bytes());
        std::fs::remove_file(&path).ok();
    }
}

#[test]
fn maps_roundtrip_every_vertex_bit_exactly() {
    let mut rng = StdRng::seed_from_u64(6);
    let mut map = Map::identity(2, 31, 19, "slice_0041", "slice_0042").unwrap();
    map.x_min = -4;
    map.y_min = 7;
    for e in &mut map.elements {
        e.x += rng.gen_range(-3.0f32..3.0);
        e.y += rng.gen_range(-3.0f32..3.0);
        e.c = rng.gen_range(0.0f32..1.0);
    }

    let path = scratch("rt.map");
    write_map(&path, &map).unwrap();
    let back = read_map(&path).unwrap();
    assert_eq!(back.elements.len(), map.elements.len());
    for (a, b) in back.elements.iter().zip(map.elements.iter()) {
        assert_eq!(a.x.to_bits(), b.x.to_bits());
        assert_eq!(a.y.to_bits(), b.y.to_bits());
        assert_eq!(a.c.to_bits(), b.c.to_bits());
    }
    assert_eq!(back.image, "slice_0041");
    assert_eq!((back.x_min, back.y_min), (-4, 7));
    std::fs::remove_file(&path).ok();
}
