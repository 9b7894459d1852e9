//! Conversions between encoded images, `image` buffers and `(1, 3, H, W)`
//! tensors in `[0, 1]`.

use std::io::Cursor;

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, ImageError, ImageFormat, ImageReader, RgbImage};

use super::EngineError;

/// Decode PNG/JPEG bytes. Alpha and palettes are dropped later by
/// [`image_to_tensor`], which always works on RGB.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, EngineError> {
    image::load_from_memory(bytes).map_err(|source| EngineError::Decode { source })
}

/// Like [`decode_image`], but reads only the header first and refuses images
/// with more than `max_pixels` pixels before any pixel buffer is allocated.
pub fn decode_image_bounded(bytes: &[u8], max_pixels: u64) -> Result<DynamicImage, EngineError> {
    let decode = |source| EngineError::Decode { source };
    let (width, height) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| decode(ImageError::IoError(e)))?
        .into_dimensions()
        .map_err(decode)?;
    check_pixels(width, height, max_pixels)?;
    decode_image(bytes)
}

pub(super) fn check_pixels(width: u32, height: u32, max_pixels: u64) -> Result<(), EngineError> {
    if u64::from(width) * u64::from(height) > max_pixels {
        return Err(EngineError::InputTooLarge {
            width,
            height,
            max_pixels,
        });
    }
    Ok(())
}

pub fn encode_image(image: &RgbImage, format: ImageFormat) -> Result<Vec<u8>, EngineError> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, format)
        .map_err(|source| EngineError::Encode { source })?;
    Ok(out.into_inner())
}

/// RGB pixels → `(1, 3, H, W)` f32 on `device`, scaled to `[0, 1]`.
pub fn image_to_tensor(image: &DynamicImage, device: &Device) -> candle_core::Result<Tensor> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    Tensor::from_vec(rgb.into_raw(), (height as usize, width as usize, 3), &Device::Cpu)?
        .to_device(device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)?
        .unsqueeze(0)?
        .contiguous()
}

/// `(1, 3, H, W)` → RGB pixels, clamped to `[0, 1]` and rounded to `u8`.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage, EngineError> {
    let inference = |source| EngineError::Inference { source };

    let chw = tensor.squeeze(0).map_err(inference)?;
    let (channels, height, width) = chw.dims3().map_err(inference)?;
    if channels != 3 {
        return Err(EngineError::ShapeMismatch {
            expected: vec![3, height, width],
            actual: chw.dims().to_vec(),
        });
    }

    let pixels = chw
        .to_dtype(DType::F32)
        .and_then(|t| t.clamp(0f32, 1f32))
        .and_then(|t| t.affine(255.0, 0.5))
        .and_then(|t| t.to_dtype(DType::U8))
        .and_then(|t| t.permute((1, 2, 0)))
        .and_then(|t| t.to_device(&Device::Cpu))
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<u8>())
        .map_err(inference)?;

    RgbImage::from_raw(width as u32, height as u32, pixels).ok_or(EngineError::ShapeMismatch {
        expected: vec![height, width, 3],
        actual: chw.dims().to_vec(),
    })
}
