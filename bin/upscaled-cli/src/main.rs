//! upscaled-cli – upscale a single image file without running the server.
//!
//! ```text
//! upscaled-cli input.png output.png --model generator.pth --device cpu
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use image::ImageFormat;
use tracing::info;
use upscaled_core::engine::DEFAULT_MAX_INPUT_PIXELS;
use upscaled_core::engine::candle::{self, DevicePreference, ModelConfig};

#[derive(Debug, Parser)]
#[command(version, about = "Upscale an image 4x with the super-resolution generator")]
struct Args {
    /// Image to upscale (PNG or JPEG).
    input: PathBuf,

    /// Where to write the result; the extension picks the output format.
    output: PathBuf,

    /// Generator weights, `.pth` or `.safetensors`.
    #[arg(long, default_value = "generator.pth")]
    model: PathBuf,

    /// `auto`, `cpu`, `cuda` or `metal`.
    #[arg(long, default_value = "auto")]
    device: DevicePreference,

    /// Refuse inputs with more pixels than this.
    #[arg(long, default_value_t = DEFAULT_MAX_INPUT_PIXELS)]
    max_input_pixels: u64,
}

fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    let format = ImageFormat::from_path(&args.output)
        .with_context(|| format!("cannot infer image format from {}", args.output.display()))?;

    let config = ModelConfig {
        weights_path: args.model,
        device: args.device,
        max_input_pixels: args.max_input_pixels,
        ..ModelConfig::default()
    };
    let engine = candle::load_generator(&config, 0).context("failed to load the generator")?;

    let input = std::fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let started = Instant::now();
    let output = engine
        .upscale_as(&input, format)
        .with_context(|| format!("failed to upscale {}", args.input.display()))?;
    std::fs::write(&args.output, output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        elapsed_ms = started.elapsed().as_millis(),
        "upscaled"
    );
    Ok(())
}
