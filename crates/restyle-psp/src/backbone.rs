//! Feature-extraction bodies for the style encoders.
//!
//! Both bodies reduce the input resolution by 16 and expose three feature
//! maps used by the style heads:
//! - `c1`: input/4, `2 * width` channels
//! - `c2`: input/8, `4 * width` channels
//! - `c3`: input/16, `8 * width` channels

use candle_core::{Module, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, prelu, BatchNorm, Conv2d, Conv2dConfig, PReLU, VarBuilder,
};

/// Multi-scale features produced by a body.
#[derive(Debug, Clone)]
pub struct BodyFeatures {
    pub c1: Tensor,
    pub c2: Tensor,
    pub c3: Tensor,
}

fn conv(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: kernel_size / 2,
        stride,
        ..Default::default()
    };
    conv2d_no_bias(in_channels, out_channels, kernel_size, config, vb)
}

fn bn(x: &Tensor, norm: &BatchNorm) -> Result<Tensor> {
    x.apply_t(norm, false)
}

/// Unit counts per stage for the supported IR-SE depths.
pub fn ir_se_block_counts(num_layers: usize) -> Option<[usize; 4]> {
    match num_layers {
        34 => Some([3, 4, 6, 3]),
        50 => Some([3, 4, 14, 3]),
        100 => Some([3, 13, 30, 3]),
        152 => Some([3, 8, 36, 3]),
        _ => None,
    }
}

/// Squeeze-and-excitation channel gate
struct SeModule {
    fc1: Conv2d,
    fc2: Conv2d,
}

impl SeModule {
    fn new(channels: usize, reduction: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = (channels / reduction).max(1);
        let fc1 = conv(channels, hidden, 1, 1, vb.pp("fc1"))?;
        let fc2 = conv(hidden, channels, 1, 1, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = x.mean_keepdim(3)?.mean_keepdim(2)?;
        let gate = self.fc1.forward(&gate)?.relu()?;
        let gate = candle_nn::ops::sigmoid(&self.fc2.forward(&gate)?)?;
        x.broadcast_mul(&gate)
    }
}

/// Improved-residual unit with SE gating (`bottleneck_IR_SE`)
struct IrSeUnit {
    shortcut: Option<(Conv2d, BatchNorm)>,
    bn_in: BatchNorm,
    conv1: Conv2d,
    prelu: PReLU,
    conv2: Conv2d,
    bn_out: BatchNorm,
    se: SeModule,
    stride: usize,
}

impl IrSeUnit {
    fn new(in_channels: usize, depth: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let shortcut = if in_channels == depth {
            None
        } else {
            let sc = vb.pp("shortcut_layer");
            Some((
                conv(in_channels, depth, 1, stride, sc.pp("0"))?,
                batch_norm(depth, 1e-5, sc.pp("1"))?,
            ))
        };

        let res = vb.pp("res_layer");
        Ok(Self {
            shortcut,
            bn_in: batch_norm(in_channels, 1e-5, res.pp("0"))?,
            conv1: conv(in_channels, depth, 3, 1, res.pp("1"))?,
            prelu: prelu(Some(depth), res.pp("2"))?,
            conv2: conv(depth, depth, 3, stride, res.pp("3"))?,
            bn_out: batch_norm(depth, 1e-5, res.pp("4"))?,
            se: SeModule::new(depth, 16, res.pp("5"))?,
            stride,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let identity = match &self.shortcut {
            Some((conv, norm)) => bn(&conv.forward(x)?, norm)?,
            // MaxPool2d(1, stride) is plain subsampling
            None if self.stride > 1 => x.max_pool2d_with_stride(1, self.stride)?,
            None => x.clone(),
        };

        let out = bn(x, &self.bn_in)?;
        let out = self.conv1.forward(&out)?;
        let out = self.prelu.forward(&out)?;
        let out = self.conv2.forward(&out)?;
        let out = bn(&out, &self.bn_out)?;
        let out = self.se.forward(&out)?;

        out + identity
    }
}

/// IR-SE body (ArcFace-style ResNet with SE units).
///
/// Parameters live under `input_layer.*` and `body.{i}.*`, matching the
/// pretrained `model_ir_se50` weights.
pub struct IrSeBody {
    input_conv: Conv2d,
    input_bn: BatchNorm,
    input_prelu: PReLU,
    units: Vec<IrSeUnit>,
    /// Index of the last unit of stages 2, 3 and 4
    taps: [usize; 3],
}

impl IrSeBody {
    pub fn new(num_layers: usize, input_nc: usize, width: usize, vb: VarBuilder) -> Result<Self> {
        let Some(counts) = ir_se_block_counts(num_layers) else {
            candle_core::bail!("num_layers should be 34, 50, 100 or 152, got {}", num_layers)
        };

        let input = vb.pp("input_layer");
        let input_conv = conv(input_nc, width, 3, 1, input.pp("0"))?;
        let input_bn = batch_norm(width, 1e-5, input.pp("1"))?;
        let input_prelu = prelu(Some(width), input.pp("2"))?;

        let stages = [
            (width, width),
            (width, width * 2),
            (width * 2, width * 4),
            (width * 4, width * 8),
        ];
        let body = vb.pp("body");
        let mut units = Vec::with_capacity(counts.iter().sum());
        let mut taps = [0; 3];
        for (stage, (&(in_c, depth), &n_units)) in stages.iter().zip(counts.iter()).enumerate() {
            for i in 0..n_units {
                let (in_c, stride) = if i == 0 { (in_c, 2) } else { (depth, 1) };
                let idx = units.len();
                units.push(IrSeUnit::new(in_c, depth, stride, body.pp(idx.to_string()))?);
            }
            if stage > 0 {
                taps[stage - 1] = units.len() - 1;
            }
        }

        Ok(Self {
            input_conv,
            input_bn,
            input_prelu,
            units,
            taps,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<BodyFeatures> {
        let x = self.input_conv.forward(x)?;
        let x = bn(&x, &self.input_bn)?;
        let mut x = self.input_prelu.forward(&x)?;

        let mut taps = Vec::with_capacity(3);
        for (i, unit) in self.units.iter().enumerate() {
            x = unit.forward(&x)?;
            if self.taps.contains(&i) {
                taps.push(x.clone());
            }
        }
        let [c1, c2, c3]: [Tensor; 3] = taps
            .try_into()
            .map_err(|_| candle_core::Error::Msg("IR-SE body produced wrong number of taps".into()))?;
        Ok(BodyFeatures { c1, c2, c3 })
    }
}

/// torchvision `BasicBlock`
struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let downsample = if stride != 1 || in_channels != out_channels {
            let ds = vb.pp("downsample");
            Some((
                conv(in_channels, out_channels, 1, stride, ds.pp("0"))?,
                batch_norm(out_channels, 1e-5, ds.pp("1"))?,
            ))
        } else {
            None
        };

        Ok(Self {
            conv1: conv(in_channels, out_channels, 3, stride, vb.pp("conv1"))?,
            bn1: batch_norm(out_channels, 1e-5, vb.pp("bn1"))?,
            conv2: conv(out_channels, out_channels, 3, 1, vb.pp("conv2"))?,
            bn2: batch_norm(out_channels, 1e-5, vb.pp("bn2"))?,
            downsample,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let identity = match &self.downsample {
            Some((conv, norm)) => bn(&conv.forward(x)?, norm)?,
            None => x.clone(),
        };

        let out = bn(&self.conv1.forward(x)?, &self.bn1)?.relu()?;
        let out = bn(&self.conv2.forward(&out)?, &self.bn2)?;
        (out + identity)?.relu()
    }
}

/// ResNet-34 body with a stride-2 stem and no max-pool.
///
/// Parameters live under `conv1`, `bn1`, `relu` (a PReLU) and `body.{i}.*`.
pub struct ResNetBody {
    conv1: Conv2d,
    bn1: BatchNorm,
    relu: PReLU,
    blocks: Vec<BasicBlock>,
    taps: [usize; 3],
}

impl ResNetBody {
    pub const BLOCK_COUNTS: [usize; 4] = [3, 4, 6, 3];

    pub fn new(input_nc: usize, width: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv(input_nc, width, 7, 2, vb.pp("conv1"))?;
        let bn1 = batch_norm(width, 1e-5, vb.pp("bn1"))?;
        let relu = prelu(Some(width), vb.pp("relu"))?;

        let stages = [(width, 1), (width * 2, 2), (width * 4, 2), (width * 8, 2)];
        let body = vb.pp("body");
        let mut blocks = Vec::new();
        let mut taps = [0; 3];
        let mut in_c = width;
        for (stage, (&(out_c, stride), &n_blocks)) in
            stages.iter().zip(Self::BLOCK_COUNTS.iter()).enumerate()
        {
            for i in 0..n_blocks {
                let stride = if i == 0 { stride } else { 1 };
                let idx = blocks.len();
                blocks.push(BasicBlock::new(in_c, out_c, stride, body.pp(idx.to_string()))?);
                in_c = out_c;
            }
            if stage > 0 {
                taps[stage - 1] = blocks.len() - 1;
            }
        }

        Ok(Self {
            conv1,
            bn1,
            relu,
            blocks,
            taps,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<BodyFeatures> {
        let x = self.conv1.forward(x)?;
        let x = bn(&x, &self.bn1)?;
        let mut x = self.relu.forward(&x)?;

        let mut taps = Vec::with_capacity(3);
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(&x)?;
            if self.taps.contains(&i) {
                taps.push(x.clone());
            }
        }
        let [c1, c2, c3]: [Tensor; 3] = taps
            .try_into()
            .map_err(|_| candle_core::Error::Msg("ResNet body produced wrong number of taps".into()))?;
        Ok(BodyFeatures { c1, c2, c3 })
    }
}
