//! Weight loading and device selection for the candle-backed generator.

mod generator;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use strum::{Display, EnumString};
use tracing::info;

use crate::engine::{DEFAULT_MAX_INPUT_PIXELS, EngineError, EngineLoader, InferenceEngine};

pub use generator::{Generator, GeneratorConfig};

/// Which compute device to run the generator on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DevicePreference {
    /// CUDA if available, else Metal if available, else CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// `.safetensors` files are memory-mapped; anything else is read as a
    /// PyTorch pickle (`torch.save(model.state_dict())`).
    pub weights_path: PathBuf,
    pub device: DevicePreference,
    pub scale_factor: usize,
    pub num_residuals: usize,
    pub channels: usize,
    /// Inputs with more pixels than this fail with a decode error instead of
    /// being run through the generator.
    pub max_input_pixels: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let generator = GeneratorConfig::default();
        Self {
            weights_path: PathBuf::from("generator.pth"),
            device: DevicePreference::Auto,
            scale_factor: generator.scale_factor,
            num_residuals: generator.num_residuals,
            channels: generator.channels,
            max_input_pixels: DEFAULT_MAX_INPUT_PIXELS,
        }
    }
}

impl ModelConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            scale_factor: self.scale_factor,
            num_residuals: self.num_residuals,
            channels: self.channels,
        }
    }
}

pub fn select_device(preference: DevicePreference) -> Result<Device, EngineError> {
    let device_err = |source| EngineError::Device {
        requested: preference.to_string(),
        source,
    };
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => Device::new_cuda(0).map_err(device_err),
        DevicePreference::Metal => Device::new_metal(0).map_err(device_err),
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0).map_err(device_err)
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0).map_err(device_err)
            } else {
                Ok(Device::Cpu)
            }
        }
    }
}

fn weights_var_builder(path: &Path, device: &Device) -> Result<VarBuilder<'static>, EngineError> {
    let load_err = |source| EngineError::LoadWeights {
        path: path.to_path_buf(),
        source,
    };
    let is_safetensors = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("safetensors"));

    if is_safetensors {
        // SAFETY: the weights file is opened read-only and must not be
        // modified while the engine is alive.
        unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
            .map_err(load_err)
    } else {
        VarBuilder::from_pth(path, DType::F32, device).map_err(load_err)
    }
}

/// Build one engine instance: pick the device, read the weights, assemble the
/// generator.
pub fn load_generator(config: &ModelConfig, instance: usize) -> Result<InferenceEngine, EngineError> {
    let generator_config = config.generator_config();
    if generator_config.upsample_stages().is_none() {
        return Err(EngineError::UnsupportedScale(config.scale_factor));
    }
    if !config.weights_path.is_file() {
        return Err(EngineError::Unavailable {
            reason: format!("weights file not found: {}", config.weights_path.display()),
        });
    }

    let device = select_device(config.device)?;
    info!(
        instance,
        device = ?device.location(),
        weights = %config.weights_path.display(),
        "loading generator"
    );

    let vb = weights_var_builder(&config.weights_path, &device)?;
    let generator = Generator::new(generator_config, vb).map_err(|source| EngineError::LoadWeights {
        path: config.weights_path.clone(),
        source,
    })?;
    Ok(InferenceEngine::new(generator).with_max_input_pixels(config.max_input_pixels))
}

/// Loader for [`Engine`](crate::engine::Engine) pools backed by the generator.
pub fn loader(config: ModelConfig) -> EngineLoader {
    Arc::new(move |instance| load_generator(&config, instance))
}
