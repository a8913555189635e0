//! Shared plumbing for the gridalign executables.

use gridalign::GridAlignError;

/// Process exit code for an error: 2 for configuration problems, 3 for
/// missing or unreadable files, 1 for everything that failed inside a
/// unit of work.
pub fn exit_code(err: &GridAlignError) -> i32 {
    match err {
        GridAlignError::InvalidConfig { .. }
        | GridAlignError::InvalidDimensions { .. }
        | GridAlignError::InvalidStride { .. }
        | GridAlignError::BufferTooSmall { .. }
        | GridAlignError::RoiOutOfBounds { .. }
        | GridAlignError::IndexOutOfBounds { .. } => 2,
        GridAlignError::InputMissing { .. }
        | GridAlignError::Io { .. }
        | GridAlignError::ImageIo { .. }
        | GridAlignError::Format { .. } => 3,
        GridAlignError::OutOfMemory { .. }
        | GridAlignError::Degenerate { .. }
        | GridAlignError::Convergence { .. }
        | GridAlignError::Transport { .. } => 1,
    }
}

/// Prints the single-line error and exits with its mapped code.
pub fn fail(err: GridAlignError) -> ! {
    eprintln!("{err}");
    std::process::exit(exit_code(&err));
}

/// Installs the tracing subscriber when `--trace` was given.
pub fn init_tracing(enabled: bool) {
    if enabled {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("gridalign=info".parse().expect("static directive")),
            )
            .with_target(false)
            .init();
    }
}

/// Parses a comma-separated list of search radii.
pub fn parse_radii(spec: &str) -> Result<Vec<usize>, String> {
    spec.split(',')
        .map(|tok| {
            tok.trim()
                .parse::<usize>()
                .map_err(|_| format!("bad radius {tok:?}"))
        })
        .collect()
}

/// Parses an `x,y` offset.
pub fn parse_offset(spec: &str) -> Result<(f32, f32), String> {
    let parts: Vec<&str> = spec.split(',').collect();
    if parts.len() != 2 {
        return Err(format!("expected dx,dy, got {spec:?}"));
    }
    let dx = parts[0].trim().parse().map_err(|_| format!("bad dx {:?}", parts[0]))?;
    let dy = parts[1].trim().parse().map_err(|_| format!("bad dy {:?}", parts[1]))?;
    Ok((dx, dy))
}
