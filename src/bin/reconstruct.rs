//! biref-reconstruct: reconstruct a birefringent volume from polarized
//! light-field images.
//!
//! Usage:
//!   biref-reconstruct --iteration iter.json --optical optics.json
//!   biref-reconstruct --from-config runs/20250101_1200_shell

use anyhow::{Context, Result};
use biref_recon::config::{IterationConfig, OpticalConfig, ReconstructionSettings};
use biref_recon::core::{BirefringentVolume, VolumeShape, VolumeView};
use biref_recon::io::ReconstructionConfig;
use biref_recon::optim::{prepare_model, MeasuredImages, Reconstructor};
use biref_recon::render::{ForwardModel, ImageSet, OutputMode, RayGeometry, WeakBirefringenceTracer};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "biref-reconstruct", version)]
#[command(about = "Reconstruct volumetric birefringence from polarized light-field images", long_about = None)]
struct Cli {
    /// Optical configuration (JSON). Defaults are used when omitted.
    #[arg(long)]
    optical: Option<PathBuf>,

    /// Iteration parameters (JSON). Defaults are used when omitted.
    #[arg(long)]
    iteration: Option<PathBuf>,

    /// Restart from a saved run directory containing `config_parameters/`.
    #[arg(long, conflicts_with_all = ["optical", "iteration"])]
    from_config: Option<PathBuf>,

    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Seed for the synthetic ground truth, initial guess and optimizer
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Δn of the synthetic ellipsoidal shell
    #[arg(long, default_value = "0.01")]
    delta_n: f32,

    /// Parent directory of run directories
    #[arg(long, default_value = "runs")]
    out_root: PathBuf,

    /// Label appended to the run directory name
    #[arg(long, default_value = "shell")]
    name: String,

    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

/// Create a unique timestamped run directory under `root`.
fn create_run_directory(root: &Path, label: &str) -> std::io::Result<PathBuf> {
    let now = time::OffsetDateTime::now_utc();
    let sanitized = label.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
    let dir_name = format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}_{}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        sanitized
    );

    let base = root.join(&dir_name);
    let mut path = base.clone();
    let mut counter = 1;
    while path.exists() {
        path = root.join(format!("{dir_name}.{counter}"));
        counter += 1;
    }
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Ellipsoidal shell filling most of the volume, radial optic axes.
fn synthetic_ground_truth(optical: &OpticalConfig, delta_n: f32) -> BirefringentVolume {
    let shape = VolumeShape::from_array(optical.volume_shape);
    let radii = [
        (shape.z as f32 / 2.0 - 0.5).max(1.0),
        (shape.y as f32 / 2.0 - 1.0).max(1.0),
        (shape.x as f32 / 2.0 - 1.0).max(1.0),
    ];
    BirefringentVolume::ellipsoid_shell(shape, optical.voxel_size_um, radii, 0.3, delta_n)
}

/// Render the measurements a ground-truth volume would produce.
fn simulate_measurements(
    optical: &OpticalConfig,
    iteration: &IterationConfig,
    gt: &BirefringentVolume,
) -> Result<MeasuredImages> {
    let geometry = RayGeometry::compute(optical).context("Failed to compute ray geometry")?;
    let tracer = WeakBirefringenceTracer::new(geometry, optical.wavelength, &optical.analyzer_angles_deg);
    let images = tracer.forward(VolumeView::Full(gt), OutputMode::RetardanceAzimuth)?;
    let mut measured = MeasuredImages::from_images(images, tracer.image_shape());
    if iteration.datafidelity.starts_with("intensity") {
        if let ImageSet::Intensity(frames) = tracer.forward(VolumeView::Full(gt), OutputMode::IntensityStack)? {
            measured.intensity = Some(frames);
        }
    }
    Ok(measured)
}

fn load_json<T: serde::de::DeserializeOwned + Default>(path: Option<&PathBuf>, what: &str) -> Result<T> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("Failed to read {what} {p:?}"))?;
            serde_json::from_str(&text).with_context(|| format!("Failed to parse {what} {p:?}"))
        }
        None => Ok(T::default()),
    }
}

fn build_config(cli: &Cli) -> Result<ReconstructionConfig> {
    if let Some(dir) = &cli.from_config {
        let mut config = ReconstructionConfig::load(dir)
            .with_context(|| format!("Failed to load reconstruction config from {dir:?}"))?;
        if let Some(epochs) = cli.epochs {
            config.iteration.n_epochs = epochs;
        }
        return Ok(config);
    }

    let optical: OpticalConfig = load_json(cli.optical.as_ref(), "optical config")?;
    let mut iteration: IterationConfig = load_json(cli.iteration.as_ref(), "iteration config")?;
    if let Some(epochs) = cli.epochs {
        iteration.n_epochs = epochs;
    }
    if iteration.seed.is_none() {
        iteration.seed = Some(cli.seed);
    }
    optical.validate()?;

    let gt = synthetic_ground_truth(&optical, cli.delta_n);
    let measured = simulate_measurements(&optical, &iteration, &gt)?;

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let initial = BirefringentVolume::random(
        gt.shape,
        optical.voxel_size_um,
        (-cli.delta_n, cli.delta_n),
        &mut rng,
    );

    Ok(ReconstructionConfig {
        optical,
        iteration,
        measured,
        initial_volume: initial,
        gt_volume: Some(gt),
    })
}

fn birefringence_rmse(a: &BirefringentVolume, b: &BirefringentVolume) -> f32 {
    let n = a.birefringence.len().max(1) as f32;
    let sq: f32 = a
        .birefringence
        .iter()
        .zip(&b.birefringence)
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    (sq / n).sqrt()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::info!(version = biref_recon::VERSION, "biref-reconstruct");

    let config = build_config(&cli)?;
    let settings = ReconstructionSettings::from_config(&config.iteration).context("Invalid iteration parameters")?;

    let run_dir = create_run_directory(&cli.out_root, &cli.name).context("Failed to create run directory")?;
    config.save(&run_dir).context("Failed to save reconstruction config")?;

    let prepared = prepare_model(&config.optical, &settings, &config.measured, &run_dir)
        .context("Failed to prepare the forward model")?;
    let active = prepared.mask.count_active();
    let recon = Reconstructor::from_prepared(settings, prepared, config.measured.clone(), &run_dir)?;
    let output = recon.run(&config.initial_volume).context("Reconstruction failed")?;

    println!();
    println!("Run directory:   {}", output.run_dir.display());
    println!("Active voxels:   {active} / {}", output.volume.voxel_count());
    println!("Epochs:          {}", output.history.len());
    if let (Some(first), Some(last)) = (output.history.first(), output.history.last()) {
        println!("Loss:            {:.6e} -> {:.6e}", first.total, last.total);
    }
    if let Some(gt) = &config.gt_volume {
        println!("Δn RMSE vs GT:   {:.6e}", birefringence_rmse(&output.volume, gt));
    }
    Ok(())
}
