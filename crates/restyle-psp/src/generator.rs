//! StyleGAN2 generator (decoder) and the generator capability set.
//!
//! Parameter names follow the rosinality `stylegan2-pytorch` layout so that
//! `g_ema` weights install directly.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use restyle_core::Options;

use crate::generator_ada::{AdaGeneratorConfig, StyleGan2AdaGenerator};
use crate::layers::{
    fused_leaky_relu, inject_noise, noise_buffer, pixel_norm, EqualLinear, ModulatedConv2d,
    NoiseMode, ParamLayout,
};
use crate::state_dict::ParameterModule;

/// Flags accepted by every generator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisFlags {
    /// Codes are already in W space; skip the mapping network
    pub input_is_latent: bool,
    /// Sample fresh per-layer noise instead of the fixed buffers
    pub randomize_noise: bool,
    /// Also return the W-space codes actually used
    pub return_latents: bool,
}

impl Default for SynthesisFlags {
    fn default() -> Self {
        Self {
            input_is_latent: false,
            randomize_noise: true,
            return_latents: false,
        }
    }
}

/// Capability set of a generator collaborator.
pub trait ImageGenerator: ParameterModule {
    /// Synthesize images from a list of style tensors.
    ///
    /// Each entry is either `[batch, latent_dim]` (broadcast to every layer) or
    /// `[batch, n, latent_dim]`. Two entries mix styles at the middle layer.
    ///
    /// # Returns
    /// `(images [batch, 3, size, size], latents)` where `latents` is present
    /// only when `flags.return_latents` is set.
    fn synthesize(&self, styles: &[Tensor], flags: SynthesisFlags) -> Result<(Tensor, Option<Tensor>)>;

    /// Number of style codes the synthesis network consumes.
    fn n_latent(&self) -> usize;

    fn latent_dim(&self) -> usize;

    fn resolution(&self) -> usize;
}

/// Which generator implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    StyleGan2,
    StyleGan2Ada,
}

impl GeneratorKind {
    pub fn from_options(opts: &Options) -> Self {
        if opts.generator_ada {
            GeneratorKind::StyleGan2Ada
        } else {
            GeneratorKind::StyleGan2
        }
    }
}

/// Build the generator variant selected by `opts.generator_ada`.
pub fn build_generator(opts: &Options, device: &Device) -> Result<Box<dyn ImageGenerator>> {
    let generator: Box<dyn ImageGenerator> = match GeneratorKind::from_options(opts) {
        GeneratorKind::StyleGan2 => Box::new(StyleGan2Generator::new(
            StyleGan2Config::from_options(opts),
            device,
        )?),
        GeneratorKind::StyleGan2Ada => Box::new(StyleGan2AdaGenerator::new(
            AdaGeneratorConfig::from_options(opts),
            device,
        )?),
    };
    Ok(generator)
}

/// Combine the style list into one `[batch, n_latent, dim]` tensor.
pub fn assemble_latent(styles: &[Tensor], n_latent: usize) -> Result<Tensor> {
    let expand = |style: &Tensor| -> Result<Tensor> {
        match style.rank() {
            2 => {
                let (batch, dim) = style.dims2()?;
                style.unsqueeze(1)?.broadcast_as((batch, n_latent, dim))?.contiguous()
            }
            3 => Ok(style.clone()),
            rank => candle_core::bail!("style codes must have rank 2 or 3, got {}", rank),
        }
    };

    match styles {
        [style] => expand(style),
        [first, second] => {
            let inject_index = n_latent / 2;
            let first = expand(first)?;
            let second = expand(second)?;
            Tensor::cat(
                &[
                    first.narrow(1, 0, inject_index)?,
                    second.narrow(1, inject_index, second.dim(1)? - inject_index)?,
                ],
                1,
            )
        }
        _ => candle_core::bail!("expected one or two style tensors, got {}", styles.len()),
    }
}

/// StyleGAN2 channel count at `resolution`, capped at `max_channels`.
pub fn stylegan2_channels(resolution: usize, channel_multiplier: usize, max_channels: usize) -> usize {
    let base = match resolution {
        0..=32 => 512,
        64 => 256 * channel_multiplier,
        128 => 128 * channel_multiplier,
        256 => 64 * channel_multiplier,
        512 => 32 * channel_multiplier,
        _ => 16 * channel_multiplier,
    };
    (base * max_channels / 512).max(1)
}

/// StyleGAN2 hyper-parameters
#[derive(Debug, Clone)]
pub struct StyleGan2Config {
    /// Output resolution
    pub size: usize,
    /// Latent code width
    pub style_dim: usize,
    /// Mapping network depth
    pub n_mlp: usize,
    pub channel_multiplier: usize,
    /// Width cap; 512 reproduces the pretrained networks
    pub max_channels: usize,
    /// Mapping network learning-rate multiplier
    pub lr_mlp: f64,
}

impl Default for StyleGan2Config {
    fn default() -> Self {
        Self {
            size: 1024,
            style_dim: 512,
            n_mlp: 8,
            channel_multiplier: 2,
            max_channels: 512,
            lr_mlp: 0.01,
        }
    }
}

impl StyleGan2Config {
    pub fn from_options(opts: &Options) -> Self {
        Self {
            size: opts.output_size,
            style_dim: opts.latent_dim,
            n_mlp: opts.n_mlp,
            channel_multiplier: opts.channel_multiplier,
            max_channels: opts.generator_channels,
            ..Default::default()
        }
    }

    pub fn log_size(&self) -> usize {
        self.size.trailing_zeros() as usize
    }

    pub fn n_latent(&self) -> usize {
        self.log_size() * 2 - 2
    }

    fn channels(&self, resolution: usize) -> usize {
        stylegan2_channels(resolution, self.channel_multiplier, self.max_channels)
    }
}

/// Modulated conv + noise + biased leaky ReLU
struct StyledConv {
    conv: ModulatedConv2d,
    noise_weight: Tensor,
    activate_bias: Tensor,
}

impl StyledConv {
    fn new(
        in_channels: usize,
        out_channels: usize,
        style_dim: usize,
        upsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = ModulatedConv2d::new(
            in_channels,
            out_channels,
            3,
            style_dim,
            true,
            upsample,
            ParamLayout::Rosinality,
            vb.pp("conv"),
        )?;
        let noise_weight = vb.pp("noise").get_with_hints(1, "weight", Init::Const(0.))?;
        let activate_bias = vb
            .pp("activate")
            .get_with_hints(out_channels, "bias", Init::Const(0.))?;

        Ok(Self {
            conv,
            noise_weight,
            activate_bias,
        })
    }

    fn forward(&self, x: &Tensor, style: &Tensor, noise: &Tensor, mode: NoiseMode) -> Result<Tensor> {
        let out = self.conv.forward(x, style)?;
        let out = inject_noise(&out, &self.noise_weight, noise, mode)?;
        fused_leaky_relu(&out, Some(&self.activate_bias))
    }
}

/// Unnormalized 1x1 modulated conv to RGB with an upsampled skip
struct ToRgb {
    conv: ModulatedConv2d,
    bias: Tensor,
}

impl ToRgb {
    fn new(in_channels: usize, style_dim: usize, vb: VarBuilder) -> Result<Self> {
        let conv = ModulatedConv2d::new(
            in_channels,
            3,
            1,
            style_dim,
            false,
            false,
            ParamLayout::Rosinality,
            vb.pp("conv"),
        )?;
        let bias = vb.get_with_hints((1, 3, 1, 1), "bias", Init::Const(0.))?;
        Ok(Self { conv, bias })
    }

    fn forward(&self, x: &Tensor, style: &Tensor, skip: Option<&Tensor>) -> Result<Tensor> {
        let out = self.conv.forward(x, style)?.broadcast_add(&self.bias)?;
        match skip {
            Some(skip) => {
                let (_, _, h, w) = out.dims4()?;
                out + skip.upsample_nearest2d(h, w)?
            }
            None => Ok(out),
        }
    }
}

/// StyleGAN2 generator with mapping and synthesis networks.
pub struct StyleGan2Generator {
    style: Vec<EqualLinear>,
    input: Tensor,
    conv1: StyledConv,
    to_rgb1: ToRgb,
    convs: Vec<StyledConv>,
    to_rgbs: Vec<ToRgb>,
    noises: Vec<Tensor>,
    varmap: VarMap,
    config: StyleGan2Config,
}

impl StyleGan2Generator {
    pub fn new(config: StyleGan2Config, device: &Device) -> Result<Self> {
        if config.size < 4 || !config.size.is_power_of_two() {
            candle_core::bail!("generator size must be a power of two >= 4, got {}", config.size)
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let style_dim = config.style_dim;

        // index 0 of the rosinality Sequential is PixelNorm
        let mut style = Vec::with_capacity(config.n_mlp);
        for i in 0..config.n_mlp {
            style.push(EqualLinear::new(
                style_dim,
                style_dim,
                0.0,
                config.lr_mlp,
                true,
                vb.pp("style").pp((i + 1).to_string()),
            )?);
        }

        let c4 = config.channels(4);
        let input = vb.pp("input").get_with_hints(
            (1, c4, 4, 4),
            "input",
            Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;
        let conv1 = StyledConv::new(c4, c4, style_dim, false, vb.pp("conv1"))?;
        let to_rgb1 = ToRgb::new(c4, style_dim, vb.pp("to_rgb1"))?;

        let log_size = config.log_size();
        let num_layers = (log_size - 2) * 2 + 1;
        let noise_vb = vb.pp("noises");
        let mut noises = Vec::with_capacity(num_layers);
        for layer_idx in 0..num_layers {
            let res = 1 << ((layer_idx + 5) / 2);
            noises.push(noise_buffer(
                &[1, 1, res, res],
                &format!("noise_{}", layer_idx),
                &noise_vb,
            )?);
        }

        let mut convs = Vec::new();
        let mut to_rgbs = Vec::new();
        let mut in_channels = c4;
        for i in 3..=log_size {
            let out_channels = config.channels(1 << i);
            let idx = convs.len();
            convs.push(StyledConv::new(
                in_channels,
                out_channels,
                style_dim,
                true,
                vb.pp("convs").pp(idx.to_string()),
            )?);
            convs.push(StyledConv::new(
                out_channels,
                out_channels,
                style_dim,
                false,
                vb.pp("convs").pp((idx + 1).to_string()),
            )?);
            to_rgbs.push(ToRgb::new(
                out_channels,
                style_dim,
                vb.pp("to_rgbs").pp(to_rgbs.len().to_string()),
            )?);
            in_channels = out_channels;
        }

        Ok(Self {
            style,
            input,
            conv1,
            to_rgb1,
            convs,
            to_rgbs,
            noises,
            varmap,
            config,
        })
    }

    /// Z-space codes to W-space, applied independently to every style slot.
    pub fn map(&self, z: &Tensor) -> Result<Tensor> {
        let mut w = pixel_norm(z)?;
        for layer in &self.style {
            w = layer.forward(&w)?;
        }
        Ok(w)
    }

    pub fn config(&self) -> &StyleGan2Config {
        &self.config
    }

    fn synthesis(&self, latent: &Tensor, mode: NoiseMode) -> Result<Tensor> {
        let batch = latent.dim(0)?;

        let out = self.input.repeat((batch, 1, 1, 1))?;
        let mut out = self
            .conv1
            .forward(&out, &latent.i((.., 0))?, &self.noises[0], mode)?;
        let mut skip = self.to_rgb1.forward(&out, &latent.i((.., 1))?, None)?;

        let mut i = 1;
        for (k, to_rgb) in self.to_rgbs.iter().enumerate() {
            let conv_up = &self.convs[2 * k];
            let conv = &self.convs[2 * k + 1];
            out = conv_up.forward(&out, &latent.i((.., i))?, &self.noises[2 * k + 1], mode)?;
            out = conv.forward(&out, &latent.i((.., i + 1))?, &self.noises[2 * k + 2], mode)?;
            skip = to_rgb.forward(&out, &latent.i((.., i + 2))?, Some(&skip))?;
            i += 2;
        }
        Ok(skip)
    }
}

impl ParameterModule for StyleGan2Generator {
    fn module_name(&self) -> &str {
        "decoder"
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

impl ImageGenerator for StyleGan2Generator {
    fn synthesize(&self, styles: &[Tensor], flags: SynthesisFlags) -> Result<(Tensor, Option<Tensor>)> {
        let n_latent = self.n_latent();
        let latent = assemble_latent(styles, n_latent)?;
        if latent.dim(1)? != n_latent {
            candle_core::bail!(
                "generator expects {} style codes, got {}",
                n_latent,
                latent.dim(1)?
            )
        }
        let latent = if flags.input_is_latent {
            latent
        } else {
            self.map(&latent)?
        };

        let image = self.synthesis(&latent, NoiseMode::from_randomize(flags.randomize_noise))?;
        let latents = flags.return_latents.then_some(latent);
        Ok((image, latents))
    }

    fn n_latent(&self) -> usize {
        self.config.n_latent()
    }

    fn latent_dim(&self) -> usize {
        self.config.style_dim
    }

    fn resolution(&self) -> usize {
        self.config.size
    }
}
