use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::info;

use romcarve::DETECTORS;
use romcarve::rom::detect::detect_regions;
use romcarve::rom::region::Region;

#[derive(Subcommand)]
enum Command {
    /// Split a flash image into a layout directory
    Extract {
        /// Flash image to read
        rom_path: PathBuf,
        /// Directory to write the layout to
        layout_dir: PathBuf,
    },
    /// Rebuild a flash image from a layout directory
    Build {
        /// Directory holding a previously extracted layout
        layout_dir: PathBuf,
        /// Flash image to write
        rom_path: PathBuf,
    },
}

/// Firmware image dissector and reconstructor
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Command to run
    #[command(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    // Default to log level "info". Otherwise, you get no "regular" logs.
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env).init();

    match Cli::parse().cmd {
        Command::Extract {
            rom_path,
            layout_dir,
        } => extract(&rom_path, &layout_dir),
        Command::Build {
            layout_dir,
            rom_path,
        } => build(&layout_dir, &rom_path),
    }
}

fn extract(rom_path: &Path, layout_dir: &Path) -> Result<()> {
    let data = fs::read(rom_path)
        .with_context(|| format!("cannot read image {}", rom_path.display()))?;
    info!("extract: {} ({} bytes)", rom_path.display(), data.len());
    let size = u32::try_from(data.len())
        .ok()
        .filter(|s| *s > 0)
        .context("image must be between 1 byte and 4 GiB")?;

    let mut tree = detect_regions(DETECTORS, &data, Region::full_image(size));
    tree.fill_raw(&data);
    tree.save(layout_dir)?;

    // The layout must reproduce the input bit for bit, or it is worthless.
    let rebuilt = tree.reassemble()?;
    if rebuilt != data {
        bail!(
            "round-trip mismatch: layout in {} does not rebuild {}",
            layout_dir.display(),
            rom_path.display()
        );
    }
    info!("extract: layout written to {}", layout_dir.display());
    Ok(())
}

fn build(layout_dir: &Path, rom_path: &Path) -> Result<()> {
    let tree = Region::load(layout_dir)
        .with_context(|| format!("cannot load layout {}", layout_dir.display()))?;
    let data = tree.reassemble()?;
    fs::write(rom_path, &data)
        .with_context(|| format!("cannot write image {}", rom_path.display()))?;
    info!("build: wrote {} ({} bytes)", rom_path.display(), data.len());
    Ok(())
}
