//! Inference engine: bytes in, 4x-upscaled bytes out.
//!
//! [`InferenceEngine`] wraps one [`Transform`] instance and performs the
//! decode → normalize → forward → clamp → encode sequence synchronously.
//! [`Engine`] owns a pool of them, each on its own OS thread, fed by a bounded
//! queue; callers only ever talk to an [`EngineHandle`].

pub mod candle;
mod codec;
mod pool;

use std::path::PathBuf;

use ::candle_core::{Device, Tensor};
use image::{DynamicImage, ImageFormat, RgbImage};
use thiserror::Error;

use crate::runtime::types::{RuntimeError, error_chain};

pub use codec::{decode_image, decode_image_bounded, encode_image, image_to_tensor, tensor_to_image};

/// Largest input accepted by default, in pixels. Peak activation memory of
/// the generator grows linearly with this (about 1 GiB on CPU at 512x512).
pub const DEFAULT_MAX_INPUT_PIXELS: u64 = 512 * 512;
pub use pool::{Engine, EngineHandle, EngineLoader};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine never loaded (or its last reload failed).
    #[error("inference engine unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("failed to decode input image")]
    Decode {
        #[source]
        source: image::ImageError,
    },

    #[error("input image {width}x{height} exceeds the limit of {max_pixels} pixels")]
    InputTooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },

    #[error("failed to encode output image")]
    Encode {
        #[source]
        source: image::ImageError,
    },

    #[error("transform failed")]
    Inference {
        #[source]
        source: ::candle_core::Error,
    },

    #[error("failed to load weights from {path}")]
    LoadWeights {
        path: PathBuf,
        #[source]
        source: ::candle_core::Error,
    },

    #[error("compute device `{requested}` is not available")]
    Device {
        requested: String,
        #[source]
        source: ::candle_core::Error,
    },

    #[error("unsupported scale factor {0}: must be a power of two >= 2")]
    UnsupportedScale(usize),

    #[error("transform produced shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("failed to spawn engine worker thread")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    /// The request's task was cancelled before a worker picked it up.
    #[error("request cancelled before execution")]
    Cancelled,

    #[error("engine worker shut down")]
    Shutdown,
}

impl From<EngineError> for RuntimeError {
    fn from(err: EngineError) -> Self {
        let message = error_chain(&err);
        match err {
            EngineError::Unavailable { reason } => RuntimeError::EngineUnavailable { reason },
            EngineError::Decode { .. } | EngineError::InputTooLarge { .. } => {
                RuntimeError::Decode { message }
            }
            _ => RuntimeError::Inference { message },
        }
    }
}

/// The super-resolution function: `(1, 3, H, W)` in `[0, 1]` to
/// `(1, 3, H * scale, W * scale)`.
///
/// Implementations are not required to be reentrant; each instance is only
/// ever driven by one engine worker thread.
pub trait Transform: Send {
    fn scale_factor(&self) -> usize;

    /// Device the transform's weights live on; inputs are moved there.
    fn device(&self) -> &Device;

    fn forward(&self, input: &Tensor) -> ::candle_core::Result<Tensor>;
}

/// One loaded transform plus the image codec around it.
pub struct InferenceEngine {
    transform: Box<dyn Transform>,
    max_input_pixels: u64,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("scale_factor", &self.transform.scale_factor())
            .field("device", &self.transform.device().location())
            .field("max_input_pixels", &self.max_input_pixels)
            .finish()
    }
}

impl InferenceEngine {
    pub fn new(transform: impl Transform + 'static) -> Self {
        Self {
            transform: Box::new(transform),
            max_input_pixels: DEFAULT_MAX_INPUT_PIXELS,
        }
    }

    /// Reject inputs with more than `max_pixels` pixels.
    pub fn with_max_input_pixels(mut self, max_pixels: u64) -> Self {
        self.max_input_pixels = max_pixels;
        self
    }

    pub fn max_input_pixels(&self) -> u64 {
        self.max_input_pixels
    }

    pub fn scale_factor(&self) -> usize {
        self.transform.scale_factor()
    }

    /// Upscale encoded image bytes, re-encoding in the input's own format.
    pub fn upscale(&self, bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
        let format = image::guess_format(bytes).map_err(|source| EngineError::Decode { source })?;
        self.upscale_as(bytes, format)
    }

    /// Upscale encoded image bytes and encode the result as `format`.
    pub fn upscale_as(&self, bytes: &[u8], format: ImageFormat) -> Result<Vec<u8>, EngineError> {
        let image = decode_image_bounded(bytes, self.max_input_pixels)?;
        let upscaled = self.upscale_image(&image)?;
        encode_image(&upscaled, format)
    }

    pub fn upscale_image(&self, image: &DynamicImage) -> Result<RgbImage, EngineError> {
        let scale = self.transform.scale_factor();
        let inference = |source| EngineError::Inference { source };
        codec::check_pixels(image.width(), image.height(), self.max_input_pixels)?;

        let input = image_to_tensor(image, self.transform.device()).map_err(inference)?;
        let (_, _, h, w) = input.dims4().map_err(inference)?;
        // Weights loaded from disk are plain tensors, so no autograd graph is
        // recorded; detach anyway in case a caller built the transform from
        // trainable variables.
        let output = self.transform.forward(&input).map_err(inference)?.detach();

        let expected = vec![1, 3, h * scale, w * scale];
        if output.dims() != expected.as_slice() {
            return Err(EngineError::ShapeMismatch {
                expected,
                actual: output.dims().to_vec(),
            });
        }
        tensor_to_image(&output)
    }
}
