//! SRResNet-style generator.
//!
//! ```text
//! x ─ conv9x9 ─ PReLU ─┬─ N × residual ─ conv3x3 ─ BN ─(+)─ log2(s) × [conv ─ shuffle×2 ─ PReLU] ─ conv9x9 ─ y
//!                      └──────────────────────────────────┘
//! ```
//!
//! Tensor names follow the PyTorch state dict the weights are exported from,
//! e.g. `block1.0.weight`, `residual_blocks.3.block.1.running_mean`,
//! `upsample.3.weight`, `block3.bias`.

use candle_core::{Device, Module, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, PReLU, VarBuilder};

use crate::engine::Transform;

const BN_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub scale_factor: usize,
    pub num_residuals: usize,
    pub channels: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            scale_factor: 4,
            num_residuals: 16,
            channels: 64,
        }
    }
}

impl GeneratorConfig {
    /// Number of ×2 pixel-shuffle stages, or `None` if the scale factor is not
    /// a power of two ≥ 2.
    pub fn upsample_stages(&self) -> Option<usize> {
        let s = self.scale_factor;
        (s >= 2 && s.is_power_of_two()).then(|| s.trailing_zeros() as usize)
    }
}

fn conv(in_c: usize, out_c: usize, kernel: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: kernel / 2,
        ..Default::default()
    };
    candle_nn::conv2d(in_c, out_c, kernel, cfg, vb)
}

#[derive(Debug)]
struct ResidualBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    prelu: PReLU,
    conv2: Conv2d,
    bn2: BatchNorm,
}

impl ResidualBlock {
    fn new(channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let vb = vb.pp("block");
        Ok(Self {
            conv1: conv(channels, channels, 3, vb.pp("0"))?,
            bn1: candle_nn::batch_norm(channels, BN_EPS, vb.pp("1"))?,
            prelu: candle_nn::prelu(None, vb.pp("2"))?,
            conv2: conv(channels, channels, 3, vb.pp("3"))?,
            bn2: candle_nn::batch_norm(channels, BN_EPS, vb.pp("4"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = xs
            .apply(&self.conv1)?
            .apply_t(&self.bn1, false)?
            .apply(&self.prelu)?
            .apply(&self.conv2)?
            .apply_t(&self.bn2, false)?;
        xs + ys
    }
}

#[derive(Debug)]
struct UpsampleStage {
    conv: Conv2d,
    prelu: PReLU,
}

impl UpsampleStage {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = xs.apply(&self.conv)?;
        candle_nn::ops::pixel_shuffle(&xs, 2)?.apply(&self.prelu)
    }
}

/// The generator network, always evaluated in inference mode.
#[derive(Debug)]
pub struct Generator {
    config: GeneratorConfig,
    device: Device,
    head: Conv2d,
    head_act: PReLU,
    residuals: Vec<ResidualBlock>,
    trunk_conv: Conv2d,
    trunk_bn: BatchNorm,
    upsample: Vec<UpsampleStage>,
    tail: Conv2d,
}

impl Generator {
    pub fn new(config: GeneratorConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let stages = config.upsample_stages().ok_or_else(|| {
            candle_core::Error::Msg(format!("unsupported scale factor {}", config.scale_factor))
        })?;
        let c = config.channels;

        let residuals = (0..config.num_residuals)
            .map(|i| ResidualBlock::new(c, vb.pp("residual_blocks").pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let vb_up = vb.pp("upsample");
        let upsample = (0..stages)
            .map(|g| {
                Ok(UpsampleStage {
                    conv: conv(c, c * 4, 3, vb_up.pp(3 * g))?,
                    prelu: candle_nn::prelu(None, vb_up.pp(3 * g + 2))?,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            config,
            device: vb.device().clone(),
            head: conv(3, c, 9, vb.pp("block1").pp("0"))?,
            head_act: candle_nn::prelu(None, vb.pp("block1").pp("1"))?,
            residuals,
            trunk_conv: conv(c, c, 3, vb.pp("block2").pp("0"))?,
            trunk_bn: candle_nn::batch_norm(c, BN_EPS, vb.pp("block2").pp("1"))?,
            upsample,
            tail: conv(c, 3, 9, vb.pp("block3"))?,
        })
    }

    pub fn config(&self) -> GeneratorConfig {
        self.config
    }
}

impl Module for Generator {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let x1 = xs.apply(&self.head)?.apply(&self.head_act)?;

        let mut x2 = x1.clone();
        for block in &self.residuals {
            x2 = block.forward(&x2)?;
        }
        let x3 = x2.apply(&self.trunk_conv)?.apply_t(&self.trunk_bn, false)?;

        let mut ys = (x1 + x3)?;
        for stage in &self.upsample {
            ys = stage.forward(&ys)?;
        }
        ys.apply(&self.tail)
    }
}

impl Transform for Generator {
    fn scale_factor(&self) -> usize {
        self.config.scale_factor
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        Module::forward(self, input)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::DType;
    use candle_nn::VarMap;

    use super::*;

    fn tiny() -> GeneratorConfig {
        GeneratorConfig {
            scale_factor: 4,
            num_residuals: 1,
            channels: 4,
        }
    }

    #[test]
    fn upsample_stages_follow_log2() {
        let stages = |scale_factor| {
            GeneratorConfig {
                scale_factor,
                ..GeneratorConfig::default()
            }
            .upsample_stages()
        };
        assert_eq!(stages(2), Some(1));
        assert_eq!(stages(4), Some(2));
        assert_eq!(stages(8), Some(3));
        assert_eq!(stages(1), None);
        assert_eq!(stages(3), None);
    }

    #[test]
    fn forward_scales_spatial_dims_by_four() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let generator = Generator::new(tiny(), vb).unwrap();

        let x = Tensor::rand(0f32, 1f32, (1, 3, 6, 5), &Device::Cpu).unwrap();
        let y = Transform::forward(&generator, &x).unwrap();
        assert_eq!(y.dims(), &[1, 3, 24, 20]);
    }

    #[test]
    fn parameter_names_match_state_dict() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Generator::new(tiny(), vb).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in [
            "block1.0.weight",
            "block1.0.bias",
            "block1.1.weight",
            "residual_blocks.0.block.0.weight",
            "residual_blocks.0.block.1.running_mean",
            "residual_blocks.0.block.1.running_var",
            "residual_blocks.0.block.2.weight",
            "residual_blocks.0.block.4.bias",
            "block2.0.weight",
            "block2.1.weight",
            "upsample.0.weight",
            "upsample.2.weight",
            "upsample.3.weight",
            "upsample.5.weight",
            "block3.weight",
            "block3.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert_eq!(data["upsample.0.weight"].dims(), &[16, 4, 3, 3]);
        assert_eq!(data["block1.1.weight"].dims(), &[1]);
    }

    #[test]
    fn rejects_non_power_of_two_scale() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = GeneratorConfig {
            scale_factor: 3,
            ..tiny()
        };
        assert!(Generator::new(config, vb).is_err());
    }
}
