//! Global relaxation over a 2x2 mosaic with known tile placement.

use gridalign::align::{align_set, AlignConfig};
use gridalign::corr::Pair;
use gridalign::{Bitmap, Map, OwnedImage, PyramidStore, RustFftEngine, StoreConfig};

/// Scene texture shared by all tiles, evaluated in mosaic coordinates.
fn scene_at(x: f32, y: f32) -> f32 {
    let smooth = 128.0
        + 50.0 * (x * 0.29).sin() * (y * 0.23).cos()
        + 36.0 * (x * 0.047 + y * 0.071).sin()
        + 16.0 * (x * 0.137).cos() * (y * 0.103).sin();
    let xi = x.floor() as i64;
    let yi = y.floor() as i64;
    let grain = (((xi * 13) ^ (yi * 7) ^ (xi * yi)) & 0x0F) as f32 - 8.0;
    smooth + grain
}

fn cut_tile(store: &PyramidStore, name: &str, ox: f32, oy: f32, size: usize) {
    let mut data = Vec::with_capacity(size * size);
    for y in 0..size {
        for x in 0..size {
            let v = scene_at(x as f32 + ox, y as f32 + oy);
            data.push(v.clamp(0.0, 255.0) as u8);
        }
    }
    let image = OwnedImage::new(data, size, size).unwrap();
    let mask = Bitmap::new_filled(size, size, true).unwrap();
    store.insert_base(name, image, mask).unwrap();
}

/// RMS of the inter-tile residual over the overlap, in level-0 pixels.
fn overlap_rms(moving: &Map, reference: &Map, offset: (f32, f32)) -> f32 {
    let scale = (1u32 << moving.level) as f32;
    let (ox, oy) = (offset.0 / scale, offset.1 / scale);
    let mut sum = 0f64;
    let mut count = 0usize;
    for j in 0..moving.height {
        for i in 0..moving.width {
            let e = moving.get(i, j);
            if e.c <= 0.0 {
                continue;
            }
            let (sx, sy) = moving.source_pos(i, j);
            let Some((rx, ry, rc)) = reference.sample(sx + ox, sy + oy) else {
                continue;
            };
            if rc <= 0.0 {
                continue;
            }
            let dx = (e.x - rx) * scale;
            let dy = (e.y - ry) * scale;
            sum += f64::from(dx * dx + dy * dy);
            count += 1;
        }
    }
    assert!(count > 4, "overlap too small: {count} samples");
    ((sum / count as f64) as f32).sqrt()
}

#[test]
fn four_tile_mosaic_relaxes_to_consistent_overlaps() {
    // 512x512 tiles on a 400-pixel pitch: about 20% overlap per side.
    let size = 512;
    let shifts = [(0.0, 0.0), (400.0, 0.0), (0.0, 400.0), (400.0, 400.0)];
    let names = ["t00", "t10", "t01", "t11"];

    let store = PyramidStore::new(StoreConfig::default());
    for (name, &(ox, oy)) in names.iter().zip(shifts.iter()) {
        cut_tile(&store, name, ox, oy, size);
    }

    // Each pair's offset is where the moving tile sits in the reference
    // tile's frame.
    let edge = |image: &str, reference: &str, dx: f32, dy: f32| Pair {
        image: image.into(),
        reference: reference.into(),
        offset: (dx, dy),
    };
    let pairs = vec![
        edge("t10", "t00", 400.0, 0.0),
        edge("t01", "t00", 0.0, 400.0),
        edge("t11", "t10", 0.0, 400.0),
        edge("t11", "t01", 400.0, 0.0),
    ];
    let images: Vec<String> = names.iter().map(|n| n.to_string()).collect();

    let mut cfg = AlignConfig {
        grid_levels: 2,
        ..AlignConfig::default()
    };
    cfg.register.patch_size = 16;
    cfg.register.grid_spacing = 16;
    cfg.register.radius_schedule = vec![6, 4];
    cfg.register.min_corr = 0.4;
    cfg.register.min_accept = 0.02;
    cfg.register.min_area = 0.3;
    cfg.register.dt_min = 0.0;
    cfg.relax.relax_tol = 0.005;
    cfg.relax.max_sweeps = 5000;

    let engine = RustFftEngine::new();
    let outcome = align_set(&store, &images, &pairs, &cfg, &engine).unwrap();
    assert!(outcome.failures.is_empty(), "{:?}", outcome.failures);
    assert_eq!(outcome.maps.len(), 4);

    for pair in &pairs {
        let moving = outcome
            .maps
            .iter()
            .find(|m| m.image == pair.image)
            .expect("map per image");
        let reference = outcome
            .maps
            .iter()
            .find(|m| m.image == pair.reference)
            .expect("map per image");
        let rms = overlap_rms(moving, reference, pair.offset);
        assert!(
            rms <= 0.2,
            "pair {} -> {}: overlap rms {rms} px",
            pair.image,
            pair.reference
        );
    }

    // The anchored tile stays at its seeded placement and the far tile
    // lands near its ground-truth shift.
    let anchor = &outcome.maps[0];
    let e = anchor.get(8, 8);
    let (sx, sy) = anchor.source_pos(8, 8);
    assert!((e.x - sx).abs() < 1e-3 && (e.y - sy).abs() < 1e-3);

    let far = &outcome.maps[3];
    let scale = (1u32 << far.level) as f32;
    let f = far.get(8, 8);
    let (fx, fy) = far.source_pos(8, 8);
    assert!(((f.x - fx) * scale - 400.0).abs() < 1.0);
    assert!(((f.y - fy) * scale - 400.0).abs() < 1.0);
}
