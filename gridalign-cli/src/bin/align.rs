//! Aligns a set of images into one global frame and writes final maps.

use std::path::PathBuf;

use clap::Parser;
use gridalign::align::{align_set, AlignConfig};
use gridalign::corr::{Pair, RegisterConfig};
use gridalign::image::io::{load_image, load_mask, FormatProbe};
use gridalign::map::io::write_map;
use gridalign::map::solve::TransformModel;
use gridalign::{Bitmap, GridAlignError, GridAlignResult, PyramidStore, RustFftEngine, StoreConfig};
use gridalign_cli::{fail, init_tracing};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(author, version, about = "Globally align a set of images (JSON task driven)")]
struct Cli {
    /// Path to the JSON task description.
    #[arg(short, long, default_value = "align.json")]
    tasks: PathBuf,
    /// Enable tracing output.
    #[arg(long)]
    trace: bool,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    name: String,
    path: PathBuf,
    #[serde(default)]
    mask: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct PairEntry {
    image: String,
    reference: String,
    #[serde(default)]
    offset: (f32, f32),
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RegisterJson {
    patch: usize,
    spacing: usize,
    target_level: u32,
    radii: Vec<usize>,
    min_corr: f32,
    min_accept: f32,
}

impl Default for RegisterJson {
    fn default() -> Self {
        let cfg = RegisterConfig::default();
        Self {
            patch: cfg.patch_size,
            spacing: cfg.grid_spacing,
            target_level: cfg.target_level,
            radii: cfg.radius_schedule,
            min_corr: cfg.min_corr,
            min_accept: cfg.min_accept,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Tasks {
    images: Vec<ImageEntry>,
    pairs: Vec<PairEntry>,
    output_dir: PathBuf,
    #[serde(default)]
    register: RegisterJson,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_grid_levels")]
    grid_levels: u32,
    #[serde(default)]
    cache_dir: Option<PathBuf>,
}

fn default_model() -> String {
    "affine".to_string()
}

fn default_grid_levels() -> u32 {
    2
}

fn run(cli: &Cli) -> GridAlignResult<i32> {
    let text = std::fs::read_to_string(&cli.tasks)
        .map_err(|err| GridAlignError::io(cli.tasks.as_path(), err))?;
    let tasks: Tasks = serde_json::from_str(&text).map_err(|err| GridAlignError::InvalidConfig {
        reason: format!("{}: {err}", cli.tasks.display()),
    })?;
    if tasks.images.is_empty() {
        return Err(GridAlignError::InvalidConfig {
            reason: "task list has no images".into(),
        });
    }

    let store = PyramidStore::new(StoreConfig {
        cache_dir: tasks.cache_dir.clone(),
        memory_budget: 0,
    });
    let mut probe = FormatProbe::default();
    let mut names = Vec::with_capacity(tasks.images.len());
    for entry in &tasks.images {
        let image = load_image(&entry.path, &mut probe)?;
        let mask = match &entry.mask {
            Some(path) => load_mask(path, &mut probe)?,
            None => Bitmap::new_filled(image.width(), image.height(), true)?,
        };
        store.insert_base(&entry.name, image, mask)?;
        names.push(entry.name.clone());
    }

    let pairs: Vec<Pair> = tasks
        .pairs
        .iter()
        .map(|p| Pair {
            image: p.image.clone(),
            reference: p.reference.clone(),
            offset: p.offset,
        })
        .collect();

    let model = match tasks.model.as_str() {
        "affine" => TransformModel::Affine,
        "rigid" => TransformModel::Rigid,
        other => {
            return Err(GridAlignError::InvalidConfig {
                reason: format!("unknown model {other:?}"),
            })
        }
    };
    let mut cfg = AlignConfig {
        grid_levels: tasks.grid_levels,
        ..AlignConfig::default()
    };
    cfg.register.patch_size = tasks.register.patch;
    cfg.register.grid_spacing = tasks.register.spacing;
    cfg.register.target_level = tasks.register.target_level;
    cfg.register.radius_schedule = tasks.register.radii.clone();
    cfg.register.min_corr = tasks.register.min_corr;
    cfg.register.min_accept = tasks.register.min_accept;
    cfg.solve.model = model;

    let engine = RustFftEngine::new();
    let outcome = align_set(&store, &names, &pairs, &cfg, &engine)?;

    std::fs::create_dir_all(&tasks.output_dir)
        .map_err(|err| GridAlignError::io(tasks.output_dir.as_path(), err))?;
    for map in &outcome.maps {
        let path = tasks.output_dir.join(format!("{}.map", map.image));
        write_map(&path, map)?;
    }

    for failure in &outcome.failures {
        eprintln!(
            "pair {} -> {} failed: {}",
            failure.image, failure.reference, failure.reason
        );
    }
    Ok(if outcome.failures.is_empty() { 0 } else { 1 })
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.trace);
    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => fail(err),
    }
}
