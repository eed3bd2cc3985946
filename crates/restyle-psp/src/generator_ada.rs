//! StyleGAN2-ADA generator.
//!
//! Parameters follow the NVLabs layout (`mapping.fc{i}`, `synthesis.b{res}.*`).
//! The synthesis network consumes `2*log2(size) - 2` W codes; the encoder is
//! sized for two more, which are accepted and ignored.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder, VarMap};
use restyle_core::Options;

use crate::generator::{assemble_latent, ImageGenerator, SynthesisFlags};
use crate::layers::{
    fill_resample_filters, fused_leaky_relu, inject_noise, noise_buffer, resample_filter_buffer,
    EqualLinear, ModulatedConv2d, NoiseMode, ParamLayout,
};
use crate::state_dict::ParameterModule;

/// Extra style slots the encoder produces for the ADA generator.
pub const ADA_STYLE_OFFSET: usize = 2;

#[derive(Debug, Clone)]
pub struct AdaGeneratorConfig {
    pub img_resolution: usize,
    pub z_dim: usize,
    pub w_dim: usize,
    /// Mapping network depth
    pub w_num_layers: usize,
    pub channel_base: usize,
    pub channel_max: usize,
    pub lr_multiplier: f64,
}

impl Default for AdaGeneratorConfig {
    fn default() -> Self {
        Self {
            img_resolution: 1024,
            z_dim: 512,
            w_dim: 512,
            w_num_layers: 8,
            channel_base: 32768,
            channel_max: 512,
            lr_multiplier: 0.01,
        }
    }
}

impl AdaGeneratorConfig {
    pub fn from_options(opts: &Options) -> Self {
        Self {
            img_resolution: opts.output_size,
            z_dim: opts.latent_dim,
            w_dim: opts.latent_dim,
            w_num_layers: opts.n_mlp,
            channel_base: 32768 * opts.generator_channels / 512,
            channel_max: opts.generator_channels,
            ..Default::default()
        }
    }

    pub fn log_size(&self) -> usize {
        self.img_resolution.trailing_zeros() as usize
    }

    /// W codes consumed by the synthesis network.
    pub fn num_ws(&self) -> usize {
        self.log_size() * 2 - 2
    }

    fn channels(&self, resolution: usize) -> usize {
        (self.channel_base / resolution).clamp(1, self.channel_max)
    }
}

/// Modulated conv, scaled noise, biased leaky ReLU
struct SynthesisLayer {
    conv: ModulatedConv2d,
    bias: Tensor,
    noise_strength: Tensor,
    noise_const: Tensor,
}

impl SynthesisLayer {
    fn new(
        in_channels: usize,
        out_channels: usize,
        w_dim: usize,
        resolution: usize,
        up: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = ModulatedConv2d::new(
            in_channels,
            out_channels,
            3,
            w_dim,
            true,
            up,
            ParamLayout::Ada,
            vb.clone(),
        )?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.))?;
        let noise_strength = vb.get_with_hints((), "noise_strength", Init::Const(0.))?;
        let noise_const = noise_buffer(&[resolution, resolution], "noise_const", &vb)?;
        // resampling here is nearest-neighbour; the buffer only mirrors the checkpoint
        resample_filter_buffer(&vb)?;

        Ok(Self {
            conv,
            bias,
            noise_strength,
            noise_const,
        })
    }

    fn forward(&self, x: &Tensor, w: &Tensor, mode: NoiseMode) -> Result<Tensor> {
        let x = self.conv.forward(x, w)?;
        let x = inject_noise(&x, &self.noise_strength, &self.noise_const, mode)?;
        fused_leaky_relu(&x, Some(&self.bias))
    }
}

/// 1x1 modulated conv to RGB without demodulation
struct ToRgbLayer {
    conv: ModulatedConv2d,
    bias: Tensor,
}

impl ToRgbLayer {
    fn new(in_channels: usize, w_dim: usize, vb: VarBuilder) -> Result<Self> {
        let conv = ModulatedConv2d::new(
            in_channels,
            3,
            1,
            w_dim,
            false,
            false,
            ParamLayout::Ada,
            vb.clone(),
        )?;
        let bias = vb.get_with_hints(3, "bias", Init::Const(0.))?;
        Ok(Self { conv, bias })
    }

    fn forward(&self, x: &Tensor, w: &Tensor) -> Result<Tensor> {
        self.conv
            .forward(x, w)?
            .broadcast_add(&self.bias.reshape((1, 3, 1, 1))?)
    }
}

/// One resolution block: optional upsampling conv, conv, to-RGB.
struct SynthesisBlock {
    constant: Option<Tensor>,
    conv0: Option<SynthesisLayer>,
    conv1: SynthesisLayer,
    torgb: ToRgbLayer,
}

impl SynthesisBlock {
    fn num_conv(&self) -> usize {
        if self.conv0.is_some() {
            2
        } else {
            1
        }
    }

    fn forward(
        &self,
        x: Option<&Tensor>,
        img: Option<&Tensor>,
        ws: &[Tensor],
        mode: NoiseMode,
    ) -> Result<(Tensor, Tensor)> {
        let mut ws = ws.iter();
        let mut next_w = || {
            ws.next()
                .ok_or_else(|| candle_core::Error::Msg("synthesis block ran out of W codes".into()))
        };

        let x = match (&self.constant, &self.conv0, x) {
            (Some(constant), _, _) => {
                let w = next_w()?;
                let batch = w.dim(0)?;
                let x = constant.unsqueeze(0)?.repeat((batch, 1, 1, 1))?;
                self.conv1.forward(&x, w, mode)?
            }
            (None, Some(conv0), Some(x)) => {
                let x = conv0.forward(x, next_w()?, mode)?;
                self.conv1.forward(&x, next_w()?, mode)?
            }
            _ => candle_core::bail!("synthesis block is missing its input"),
        };

        let y = self.torgb.forward(&x, next_w()?)?;
        let img = match img {
            Some(img) => {
                let (_, _, h, w) = y.dims4()?;
                (img.upsample_nearest2d(h, w)? + y)?
            }
            None => y,
        };
        Ok((x, img))
    }
}

/// StyleGAN2-ADA generator with mapping and synthesis networks.
pub struct StyleGan2AdaGenerator {
    mapping: Vec<EqualLinear>,
    blocks: Vec<SynthesisBlock>,
    varmap: VarMap,
    config: AdaGeneratorConfig,
}

impl StyleGan2AdaGenerator {
    pub fn new(config: AdaGeneratorConfig, device: &Device) -> Result<Self> {
        if config.img_resolution < 4 || !config.img_resolution.is_power_of_two() {
            candle_core::bail!(
                "img_resolution must be a power of two >= 4, got {}",
                config.img_resolution
            )
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mapping_vb = vb.pp("mapping");
        let mut mapping = Vec::with_capacity(config.w_num_layers);
        for i in 0..config.w_num_layers {
            let in_dim = if i == 0 { config.z_dim } else { config.w_dim };
            mapping.push(EqualLinear::new(
                in_dim,
                config.w_dim,
                0.0,
                config.lr_multiplier,
                true,
                mapping_vb.pp(format!("fc{}", i)),
            )?);
        }
        // tracked W average, kept for checkpoint compatibility
        mapping_vb.get_with_hints(config.w_dim, "w_avg", Init::Const(0.))?;

        let synthesis = vb.pp("synthesis");
        let mut blocks = Vec::new();
        for log_res in 2..=config.log_size() {
            let res = 1 << log_res;
            let out_channels = config.channels(res);
            let block_vb = synthesis.pp(format!("b{}", res));
            resample_filter_buffer(&block_vb)?;

            let block = if res == 4 {
                SynthesisBlock {
                    constant: Some(block_vb.get_with_hints(
                        (out_channels, 4, 4),
                        "const",
                        Init::Randn {
                            mean: 0.,
                            stdev: 1.,
                        },
                    )?),
                    conv0: None,
                    conv1: SynthesisLayer::new(
                        out_channels,
                        out_channels,
                        config.w_dim,
                        res,
                        false,
                        block_vb.pp("conv1"),
                    )?,
                    torgb: ToRgbLayer::new(out_channels, config.w_dim, block_vb.pp("torgb"))?,
                }
            } else {
                let in_channels = config.channels(res / 2);
                SynthesisBlock {
                    constant: None,
                    conv0: Some(SynthesisLayer::new(
                        in_channels,
                        out_channels,
                        config.w_dim,
                        res,
                        true,
                        block_vb.pp("conv0"),
                    )?),
                    conv1: SynthesisLayer::new(
                        out_channels,
                        out_channels,
                        config.w_dim,
                        res,
                        false,
                        block_vb.pp("conv1"),
                    )?,
                    torgb: ToRgbLayer::new(out_channels, config.w_dim, block_vb.pp("torgb"))?,
                }
            };
            blocks.push(block);
        }
        fill_resample_filters(&varmap)?;

        Ok(Self {
            mapping,
            blocks,
            varmap,
            config,
        })
    }

    /// Z to W: second-moment normalization followed by the MLP.
    pub fn map(&self, z: &Tensor) -> Result<Tensor> {
        let norm = (z.sqr()?.mean_keepdim(D::Minus1)? + 1e-8)?.sqrt()?;
        let mut w = z.broadcast_div(&norm)?;
        for layer in &self.mapping {
            w = layer.forward(&w)?;
        }
        Ok(w)
    }

    pub fn config(&self) -> &AdaGeneratorConfig {
        &self.config
    }

    fn synthesis(&self, ws: &Tensor, mode: NoiseMode) -> Result<Tensor> {
        let mut x: Option<Tensor> = None;
        let mut img: Option<Tensor> = None;
        let mut w_idx = 0;
        for block in &self.blocks {
            let n = block.num_conv() + 1;
            let block_ws = (w_idx..w_idx + n)
                .map(|j| ws.i((.., j)))
                .collect::<Result<Vec<_>>>()?;
            let (next_x, next_img) = block.forward(x.as_ref(), img.as_ref(), &block_ws, mode)?;
            x = Some(next_x);
            img = Some(next_img);
            w_idx += block.num_conv();
        }
        img.ok_or_else(|| candle_core::Error::Msg("synthesis network has no blocks".into()))
    }
}

impl ParameterModule for StyleGan2AdaGenerator {
    fn module_name(&self) -> &str {
        "decoder"
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

impl ImageGenerator for StyleGan2AdaGenerator {
    fn synthesize(&self, styles: &[Tensor], flags: SynthesisFlags) -> Result<(Tensor, Option<Tensor>)> {
        let num_ws = self.config.num_ws();
        let latent = assemble_latent(styles, num_ws + ADA_STYLE_OFFSET)?;
        let provided = latent.dim(1)?;
        if provided < num_ws {
            candle_core::bail!("generator expects at least {} W codes, got {}", num_ws, provided)
        }
        let ws = latent.narrow(1, 0, num_ws)?;
        let ws = if flags.input_is_latent {
            ws
        } else {
            self.map(&ws)?
        };

        let image = self.synthesis(&ws, NoiseMode::from_randomize(flags.randomize_noise))?;
        let latents = flags.return_latents.then_some(ws);
        Ok((image, latents))
    }

    fn n_latent(&self) -> usize {
        self.config.num_ws()
    }

    fn latent_dim(&self) -> usize {
        self.config.w_dim
    }

    fn resolution(&self) -> usize {
        self.config.img_resolution
    }
}
