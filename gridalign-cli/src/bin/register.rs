//! Registers one (moving, reference) pair and writes its deformation map.

use std::path::PathBuf;

use clap::Parser;
use gridalign::corr::{register_pair, Pair, RegisterConfig};
use gridalign::image::io::{load_image, load_mask, FormatProbe};
use gridalign::map::io::write_map;
use gridalign::map::solve::{solve_local, SolveConfig, TransformModel};
use gridalign::{Bitmap, GridAlignResult, PyramidStore, RustFftEngine, StoreConfig};
use gridalign_cli::{fail, init_tracing, parse_offset, parse_radii};

#[derive(Parser, Debug)]
#[command(author, version, about = "Register a pair of grayscale images")]
struct Cli {
    /// Moving image path (extension optional, probed when missing).
    #[arg(long)]
    image: PathBuf,
    /// Reference image path.
    #[arg(long)]
    reference: PathBuf,
    /// Mask for the moving image (PBM); full-valid when absent.
    #[arg(long)]
    image_mask: Option<PathBuf>,
    /// Mask for the reference image (PBM); full-valid when absent.
    #[arg(long)]
    reference_mask: Option<PathBuf>,
    /// Output map path.
    #[arg(short, long)]
    output: PathBuf,
    /// Expected placement of the moving image, level-0 pixels.
    #[arg(long, default_value = "0,0", value_parser = parse_offset)]
    offset: (f32, f32),
    /// Patch side in pixels.
    #[arg(long, default_value_t = 32)]
    patch: usize,
    /// Correspondence grid spacing at the target level (power of two).
    #[arg(long, default_value_t = 8)]
    spacing: usize,
    /// Finest pyramid level searched.
    #[arg(long, default_value_t = 0)]
    target_level: u32,
    /// Search radii per level, coarse to fine (comma-separated).
    #[arg(long, default_value = "8,4")]
    radii: String,
    /// Minimum accepted correlation peak.
    #[arg(long, default_value_t = 0.5)]
    min_corr: f32,
    /// Minimum fraction of cells that must be accepted per level.
    #[arg(long, default_value_t = 0.1)]
    min_accept: f32,
    /// Global transform model fitted before residual interpolation.
    #[arg(long, default_value = "affine")]
    model: String,
    /// Directory for cached pyramid levels, shared across workers.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Enable tracing output.
    #[arg(long)]
    trace: bool,
}

fn run(cli: &Cli) -> GridAlignResult<()> {
    let model = match cli.model.as_str() {
        "affine" => TransformModel::Affine,
        "rigid" => TransformModel::Rigid,
        other => {
            return Err(gridalign::GridAlignError::InvalidConfig {
                reason: format!("unknown model {other:?}"),
            })
        }
    };

    let mut probe = FormatProbe::default();
    let store = PyramidStore::new(StoreConfig {
        cache_dir: cli.cache_dir.clone(),
        memory_budget: 0,
    });

    let mut load = |path: &PathBuf, mask: &Option<PathBuf>| -> GridAlignResult<String> {
        let image = load_image(path, &mut probe)?;
        let mask = match mask {
            Some(mask_path) => load_mask(mask_path, &mut probe)?,
            None => Bitmap::new_filled(image.width(), image.height(), true)?,
        };
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image")
            .to_string();
        store.insert_base(&name, image, mask)?;
        Ok(name)
    };
    let image_name = load(&cli.image, &cli.image_mask)?;
    let reference_name = load(&cli.reference, &cli.reference_mask)?;

    let radii = parse_radii(&cli.radii)
        .map_err(|reason| gridalign::GridAlignError::InvalidConfig { reason })?;
    let cfg = RegisterConfig {
        patch_size: cli.patch,
        grid_spacing: cli.spacing,
        target_level: cli.target_level,
        radius_schedule: radii,
        min_corr: cli.min_corr,
        min_accept: cli.min_accept,
        ..RegisterConfig::default()
    };
    let pair = Pair {
        image: image_name,
        reference: reference_name.clone(),
        offset: cli.offset,
    };

    let engine = RustFftEngine::new();
    let field = register_pair(&store, &pair, &cfg, &engine)?;
    let ref_dims = store.level(&reference_name, cli.target_level)?.dims();
    let solve_cfg = SolveConfig {
        model,
        ..SolveConfig::default()
    };
    let map = solve_local(&field, &pair, ref_dims, &solve_cfg)?;
    write_map(&cli.output, &map)
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.trace);
    if let Err(err) = run(&cli) {
        fail(err);
    }
}
