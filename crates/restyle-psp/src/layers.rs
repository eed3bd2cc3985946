//! Building blocks shared by the encoders and generators.
//!
//! Parameter names follow the PyTorch modules the pretrained weights come
//! from, so state dicts can be installed without renaming.

use candle_core::{Device, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder, VarMap};

const SQRT_2: f64 = std::f64::consts::SQRT_2;

/// Leaky ReLU with gain sqrt(2), optionally preceded by a per-channel bias.
pub fn fused_leaky_relu(x: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let x = match bias {
        Some(bias) => {
            let shape = if x.rank() == 4 {
                vec![1, bias.elem_count(), 1, 1]
            } else {
                let mut shape = vec![1; x.rank()];
                shape[x.rank() - 1] = bias.elem_count();
                shape
            };
            x.broadcast_add(&bias.reshape(shape)?)?
        }
        None => x.clone(),
    };
    candle_nn::ops::leaky_relu(&x, 0.2)? * SQRT_2
}

/// Normalize each vector along the last dimension to unit second moment.
pub fn pixel_norm(x: &Tensor) -> Result<Tensor> {
    let norm = (x.sqr()?.mean_keepdim(D::Minus1)? + 1e-8)?.sqrt()?;
    x.broadcast_div(&norm)
}

/// Average pooling to a fixed output size, matching `AdaptiveAvgPool2d`.
///
/// Windows follow the PyTorch convention `[floor(i*H/oh), ceil((i+1)*H/oh))`,
/// which also covers upsampling when the output is larger than the input.
pub fn adaptive_avg_pool2d(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if h == out_h && w == out_w {
        return Ok(x.clone());
    }
    if h % out_h == 0 && w % out_w == 0 {
        return x.avg_pool2d((h / out_h, w / out_w));
    }
    if out_h % h == 0 && out_w % w == 0 {
        return x.upsample_nearest2d(out_h, out_w);
    }
    let x = pool_axis(x, 2, h, out_h)?;
    pool_axis(&x, 3, w, out_w)
}

fn pool_axis(x: &Tensor, dim: usize, size: usize, out: usize) -> Result<Tensor> {
    let mut cells = Vec::with_capacity(out);
    for i in 0..out {
        let start = i * size / out;
        let end = ((i + 1) * size).div_ceil(out);
        cells.push(x.narrow(dim, start, end - start)?.mean_keepdim(dim)?);
    }
    Tensor::cat(&cells, dim)
}

/// Fixed-resolution average-pool post-processor.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveAvgPool2d {
    pub out_h: usize,
    pub out_w: usize,
}

impl AdaptiveAvgPool2d {
    pub fn new(out_h: usize, out_w: usize) -> Self {
        Self { out_h, out_w }
    }
}

impl Module for AdaptiveAvgPool2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        adaptive_avg_pool2d(xs, self.out_h, self.out_w)
    }
}

/// Linear layer with runtime weight scaling (equalized learning rate).
#[derive(Debug, Clone)]
pub struct EqualLinear {
    weight: Tensor,
    bias: Tensor,
    scale: f64,
    lr_mul: f64,
    activate: bool,
}

impl EqualLinear {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        bias_init: f64,
        lr_mul: f64,
        activate: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            Init::Randn {
                mean: 0.,
                stdev: 1. / lr_mul,
            },
        )?;
        let bias = vb.get_with_hints(out_dim, "bias", Init::Const(bias_init))?;

        Ok(Self {
            weight,
            bias,
            scale: lr_mul / (in_dim as f64).sqrt(),
            lr_mul,
            activate,
        })
    }
}

impl Module for EqualLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = (&self.weight * self.scale)?;
        let out = x.broadcast_matmul(&weight.t()?)?;
        let bias = (&self.bias * self.lr_mul)?;
        if self.activate {
            fused_leaky_relu(&out, Some(&bias))
        } else {
            out.broadcast_add(&bias)
        }
    }
}

/// Where a modulated convolution keeps its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLayout {
    /// `weight` of shape `[1, out, in, k, k]`, style affine under `modulation`
    Rosinality,
    /// `weight` of shape `[out, in, k, k]`, style affine under `affine`
    Ada,
}

/// Style-modulated 2D convolution (StyleGAN2).
///
/// The per-sample kernels are applied as a single grouped convolution.
#[derive(Debug, Clone)]
pub struct ModulatedConv2d {
    weight: Tensor,
    modulation: EqualLinear,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    scale: f64,
    demodulate: bool,
    upsample: bool,
}

impl ModulatedConv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        style_dim: usize,
        demodulate: bool,
        upsample: bool,
        layout: ParamLayout,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.,
            stdev: 1.,
        };
        let (weight, modulation) = match layout {
            ParamLayout::Rosinality => (
                vb.get_with_hints(
                    (1, out_channels, in_channels, kernel_size, kernel_size),
                    "weight",
                    init,
                )?,
                EqualLinear::new(style_dim, in_channels, 1.0, 1.0, false, vb.pp("modulation"))?,
            ),
            ParamLayout::Ada => (
                vb.get_with_hints(
                    (out_channels, in_channels, kernel_size, kernel_size),
                    "weight",
                    init,
                )?
                .unsqueeze(0)?,
                EqualLinear::new(style_dim, in_channels, 1.0, 1.0, false, vb.pp("affine"))?,
            ),
        };

        Ok(Self {
            weight,
            modulation,
            in_channels,
            out_channels,
            kernel_size,
            scale: 1. / ((in_channels * kernel_size * kernel_size) as f64).sqrt(),
            demodulate,
            upsample,
        })
    }

    /// # Arguments
    /// * `x` - Feature map `[batch, in, h, w]`
    /// * `style` - Latent code `[batch, style_dim]`
    pub fn forward(&self, x: &Tensor, style: &Tensor) -> Result<Tensor> {
        let (batch, _, h, w) = x.dims4()?;
        let k = self.kernel_size;

        let style = self
            .modulation
            .forward(&style.contiguous()?)?
            .reshape((batch, 1, self.in_channels, 1, 1))?;
        let mut weight = (&self.weight * self.scale)?.broadcast_mul(&style)?;

        if self.demodulate {
            let demod = (weight.sqr()?.sum_keepdim((2, 3, 4))? + 1e-8)?
                .sqrt()?
                .recip()?;
            weight = weight.broadcast_mul(&demod)?;
        }
        let weight = weight.reshape((batch * self.out_channels, self.in_channels, k, k))?;

        let (x, h, w) = if self.upsample {
            (x.upsample_nearest2d(h * 2, w * 2)?, h * 2, w * 2)
        } else {
            (x.clone(), h, w)
        };
        let x = x.reshape((1, batch * self.in_channels, h, w))?;
        let out = x.conv2d(&weight, k / 2, 1, 1, batch)?;
        out.reshape((batch, self.out_channels, h, w))
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

/// Whether per-layer noise is freshly sampled or read from fixed buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseMode {
    Random,
    Const,
}

impl NoiseMode {
    pub fn from_randomize(randomize_noise: bool) -> Self {
        if randomize_noise {
            NoiseMode::Random
        } else {
            NoiseMode::Const
        }
    }
}

/// Add `strength * noise` where noise is `[batch, 1, h, w]` and broadcast over channels.
pub fn inject_noise(
    x: &Tensor,
    strength: &Tensor,
    fixed: &Tensor,
    mode: NoiseMode,
) -> Result<Tensor> {
    let (batch, _, h, w) = x.dims4()?;
    let noise = match mode {
        NoiseMode::Random => Tensor::randn(0f32, 1f32, (batch, 1, h, w), x.device())?
            .to_dtype(x.dtype())?,
        NoiseMode::Const => fixed.reshape((1, 1, h, w))?,
    };
    let strength = strength.reshape((1, 1, 1, 1))?;
    x.broadcast_add(&noise.broadcast_mul(&strength)?)
}

/// Fixed noise buffer, sampled once at construction.
pub fn noise_buffer(shape: &[usize], name: &str, vb: &VarBuilder) -> Result<Tensor> {
    vb.get_with_hints(
        shape,
        name,
        Init::Randn {
            mean: 0.,
            stdev: 1.,
        },
    )
}

/// Taps of the FIR kernel NVLabs generators resample with.
pub const RESAMPLE_TAPS: [f32; 4] = [1., 3., 3., 1.];
pub const RESAMPLE_FILTER: &str = "resample_filter";

/// Normalized 2-D filter: the outer product of `taps`, summing to one.
pub fn setup_filter(taps: &[f32], device: &Device) -> Result<Tensor> {
    let f = Tensor::new(taps, device)?;
    let f = f.unsqueeze(1)?.broadcast_mul(&f.unsqueeze(0)?)?;
    f.broadcast_div(&f.sum_all()?)
}

/// Register a `resample_filter` buffer under `vb`.
///
/// The value is set by [`fill_resample_filters`] once the whole module is built.
pub fn resample_filter_buffer(vb: &VarBuilder) -> Result<Tensor> {
    let n = RESAMPLE_TAPS.len();
    vb.get_with_hints((n, n), RESAMPLE_FILTER, Init::Const(0.))
}

/// Set every registered `resample_filter` buffer in `varmap` to [`RESAMPLE_TAPS`].
pub fn fill_resample_filters(varmap: &VarMap) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("parameter store is poisoned".into()))?;
    for (name, var) in data.iter() {
        if name.ends_with(RESAMPLE_FILTER) {
            let filter = setup_filter(&RESAMPLE_TAPS, var.as_tensor().device())?
                .to_dtype(var.dtype())?;
            var.set(&filter)?;
        }
    }
    Ok(())
}
